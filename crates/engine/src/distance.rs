//! Distance kernels shared by every backend and the raw scan.
//!
//! Values are returned as-is, no normalization:
//! - L2: squared Euclidean distance, lower is closer
//! - InnerProduct: raw dot product, higher is closer
//!
//! Use `DistanceMetric::compare` (or `rank_neighbors`) to order them.

use tessera_core::DistanceMetric;

/// Distance between two vectors under `metric`
pub fn distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Dimension mismatch in distance computation");

    match metric {
        DistanceMetric::L2 => l2_squared(a, b),
        DistanceMetric::InnerProduct => dot_product(a, b),
    }
}

/// Squared Euclidean distance: sum((a[i] - b[i])^2)
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Dot product: sum(a[i] * b[i])
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
