//! Cooperative cancellation for long-running maintenance.

#[cfg(test)]
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tessera_core::{Error, Result};

/// Shared flag checked by build and merge between units of work.
///
/// Cloning shares the flag. A cancelled operation leaves the previously
/// committed segment state untouched and returns `Error::Cancelled`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    #[cfg(test)]
    trip_after: Option<Arc<AtomicUsize>>,
}

impl CancelToken {
    /// A token that has not been cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Token that cancels itself on the `checks`-th poll
    #[cfg(test)]
    pub(crate) fn cancel_after(checks: usize) -> Self {
        Self {
            flag: Arc::default(),
            trip_after: Some(Arc::new(AtomicUsize::new(checks))),
        }
    }

    /// Check whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        #[cfg(test)]
        if let Some(remaining) = &self.trip_after {
            let left = remaining
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .unwrap_or(0);
            if left <= 1 {
                self.cancel();
            }
        }
        self.flag.load(Ordering::Acquire)
    }

    /// `Err(Cancelled)` once cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flag() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(token.check().is_ok());
        other.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_cancel_after_trips_on_nth_poll() {
        let token = CancelToken::cancel_after(3);
        assert!(token.check().is_ok());
        assert!(token.check().is_ok());
        assert!(token.check().is_err());
        assert!(token.is_cancelled());
    }
}
