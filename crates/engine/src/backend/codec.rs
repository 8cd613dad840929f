//! Little-endian payload encoding shared by the backend variants.

use super::BackendError;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use tessera_core::{BackendKind, VectorId};

pub(crate) struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        PayloadWriter {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn header(&mut self, magic: &[u8; 4], version: u32) {
        self.buf.extend_from_slice(magic);
        self.put_u32(version);
    }

    pub(crate) fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub(crate) fn put_u32(&mut self, v: u32) {
        let mut raw = [0u8; 4];
        LittleEndian::write_u32(&mut raw, v);
        self.buf.extend_from_slice(&raw);
    }

    pub(crate) fn put_u64(&mut self, v: u64) {
        let mut raw = [0u8; 8];
        LittleEndian::write_u64(&mut raw, v);
        self.buf.extend_from_slice(&raw);
    }

    pub(crate) fn put_ids(&mut self, ids: &[VectorId]) {
        for id in ids {
            self.put_u64(id.0);
        }
    }

    pub(crate) fn put_f32s(&mut self, values: &[f32]) {
        let start = self.buf.len();
        self.buf.resize(start + values.len() * 4, 0);
        LittleEndian::write_f32_into(values, &mut self.buf[start..]);
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.buf
    }
}

pub(crate) struct PayloadReader<'a> {
    rest: &'a [u8],
    backend: BackendKind,
}

impl<'a> PayloadReader<'a> {
    pub(crate) fn new(bytes: &'a [u8], backend: BackendKind) -> Self {
        PayloadReader {
            rest: bytes,
            backend,
        }
    }

    fn truncated(&self, what: &str) -> BackendError {
        BackendError::malformed(self.backend, format!("truncated while reading {}", what))
    }

    pub(crate) fn expect_header(&mut self, magic: &[u8; 4], version: u32) -> Result<(), BackendError> {
        if self.rest.len() < 4 || &self.rest[..4] != magic {
            return Err(BackendError::malformed(self.backend, "invalid payload magic"));
        }
        self.rest = &self.rest[4..];
        let found = self.u32("version")?;
        if found != version {
            return Err(BackendError::malformed(
                self.backend,
                format!("unsupported payload version: {}", found),
            ));
        }
        Ok(())
    }

    pub(crate) fn u8(&mut self, what: &str) -> Result<u8, BackendError> {
        self.rest.read_u8().map_err(|_| self.truncated(what))
    }

    pub(crate) fn u32(&mut self, what: &str) -> Result<u32, BackendError> {
        self.rest
            .read_u32::<LittleEndian>()
            .map_err(|_| self.truncated(what))
    }

    pub(crate) fn u64(&mut self, what: &str) -> Result<u64, BackendError> {
        self.rest
            .read_u64::<LittleEndian>()
            .map_err(|_| self.truncated(what))
    }

    fn take(&mut self, count: usize, width: usize, what: &str) -> Result<&'a [u8], BackendError> {
        let bytes = count
            .checked_mul(width)
            .filter(|&n| n <= self.rest.len())
            .ok_or_else(|| self.truncated(what))?;
        let (head, tail) = self.rest.split_at(bytes);
        self.rest = tail;
        Ok(head)
    }

    pub(crate) fn ids(&mut self, count: usize, what: &str) -> Result<Vec<VectorId>, BackendError> {
        let raw = self.take(count, 8, what)?;
        let mut ids = vec![0u64; count];
        LittleEndian::read_u64_into(raw, &mut ids);
        Ok(ids.into_iter().map(VectorId).collect())
    }

    pub(crate) fn f32s(&mut self, count: usize, what: &str) -> Result<Vec<f32>, BackendError> {
        let raw = self.take(count, 4, what)?;
        let mut values = vec![0f32; count];
        LittleEndian::read_f32_into(raw, &mut values);
        Ok(values)
    }

    pub(crate) fn finish(self) -> Result<(), BackendError> {
        if self.rest.is_empty() {
            Ok(())
        } else {
            Err(BackendError::malformed(
                self.backend,
                format!("{} trailing bytes", self.rest.len()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_reader_agree() {
        let mut w = PayloadWriter::with_capacity(64);
        w.header(b"TEST", 1);
        w.put_u8(7);
        w.put_u64(3);
        w.put_ids(&[VectorId(1), VectorId(2)]);
        w.put_f32s(&[0.5, -1.25]);
        let bytes = w.finish();

        let mut r = PayloadReader::new(&bytes, BackendKind::Flat);
        r.expect_header(b"TEST", 1).unwrap();
        assert_eq!(r.u8("tag").unwrap(), 7);
        assert_eq!(r.u64("count").unwrap(), 3);
        assert_eq!(r.ids(2, "ids").unwrap(), vec![VectorId(1), VectorId(2)]);
        assert_eq!(r.f32s(2, "data").unwrap(), vec![0.5, -1.25]);
        r.finish().unwrap();
    }

    #[test]
    fn test_reader_rejects_oversized_count() {
        let bytes = [0u8; 16];
        let mut r = PayloadReader::new(&bytes, BackendKind::Flat);
        assert!(r.ids(usize::MAX / 4, "ids").is_err());
    }

    #[test]
    fn test_reader_rejects_trailing_bytes() {
        let bytes = [0u8; 3];
        let r = PayloadReader::new(&bytes, BackendKind::Flat);
        assert!(r.finish().is_err());
    }
}
