use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{DecodeError, PduType};

/// Rounds a byte count up to the 4-byte wire alignment.
pub(crate) fn padded(len: usize) -> usize {
    (len + 3) & !3
}

/// Accumulates a payload in network byte order.
pub(crate) struct PduWriter {
    buf: BytesMut,
}

impl PduWriter {
    pub(crate) fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(64),
        }
    }

    pub(crate) fn put_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub(crate) fn put_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub(crate) fn put_i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    pub(crate) fn put_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    /// Length-prefixed bytes, zero padded to alignment.
    pub(crate) fn put_opaque(&mut self, data: &[u8]) {
        self.buf.put_i32(data.len() as i32);
        self.put_padded(data);
    }

    /// Raw bytes zero padded to alignment, no prefix.
    pub(crate) fn put_padded(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
        self.buf.put_bytes(0, padded(data.len()) - data.len());
    }

    pub(crate) fn put_string(&mut self, s: &str) {
        self.put_opaque(s.as_bytes());
    }

    /// A string that may be absent, encoded with length -1 when missing.
    pub(crate) fn put_opt_string(&mut self, s: Option<&str>) {
        match s {
            Some(s) => self.put_string(s),
            None => self.buf.put_i32(-1),
        }
    }

    pub(crate) fn finish(self) -> BytesMut {
        self.buf
    }
}

/// Cursor over a payload. Running out of bytes here means the counts
/// inside the payload disagree with the frame length.
pub(crate) struct PduReader {
    buf:  Bytes,
    kind: PduType,
}

impl PduReader {
    pub(crate) fn new(kind: PduType, buf: Bytes) -> Self {
        Self { buf, kind }
    }

    pub(crate) fn mismatch(&self, detail: impl Into<String>) -> DecodeError {
        DecodeError::FieldCountMismatch {
            kind:   self.kind,
            detail: detail.into(),
        }
    }

    fn need(&self, n: usize, what: &str) -> Result<(), DecodeError> {
        if self.buf.remaining() < n {
            return Err(self.mismatch(format!(
                "{what} needs {n} bytes, {} remain",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub(crate) fn get_i32(&mut self, what: &str) -> Result<i32, DecodeError> {
        self.need(4, what)?;
        Ok(self.buf.get_i32())
    }

    pub(crate) fn get_u32(&mut self, what: &str) -> Result<u32, DecodeError> {
        self.need(4, what)?;
        Ok(self.buf.get_u32())
    }

    pub(crate) fn get_i64(&mut self, what: &str) -> Result<i64, DecodeError> {
        self.need(8, what)?;
        Ok(self.buf.get_i64())
    }

    pub(crate) fn get_u64(&mut self, what: &str) -> Result<u64, DecodeError> {
        self.need(8, what)?;
        Ok(self.buf.get_u64())
    }

    /// Reads an element count and checks that `min_elem` bytes per element
    /// can still follow.
    pub(crate) fn get_count(&mut self, what: &str, min_elem: usize) -> Result<usize, DecodeError> {
        let count = self.get_i32(what)?;
        if count < 0 {
            return Err(self.mismatch(format!("negative {what} {count}")));
        }
        let count = count as usize;
        if count.saturating_mul(min_elem) > self.buf.remaining() {
            return Err(self.mismatch(format!(
                "{what} {count} exceeds the {} bytes remaining",
                self.buf.remaining()
            )));
        }
        Ok(count)
    }

    /// Length-prefixed padded bytes, sliced from the frame without copying.
    pub(crate) fn get_opaque(&mut self, what: &str) -> Result<Bytes, DecodeError> {
        let len = self.get_i32(what)?;
        if len < 0 {
            return Err(self.mismatch(format!("negative {what} length {len}")));
        }
        self.get_padded(len as usize, what)
    }

    pub(crate) fn get_padded(&mut self, len: usize, what: &str) -> Result<Bytes, DecodeError> {
        self.need(padded(len), what)?;
        let data = self.buf.slice(..len);
        self.buf.advance(padded(len));
        Ok(data)
    }

    pub(crate) fn get_string(&mut self, what: &str) -> Result<String, DecodeError> {
        let raw = self.get_opaque(what)?;
        String::from_utf8(raw.to_vec()).map_err(|_| self.mismatch(format!("{what} is not UTF-8")))
    }

    pub(crate) fn get_opt_string(&mut self, what: &str) -> Result<Option<String>, DecodeError> {
        let len = self.get_i32(what)?;
        if len == -1 {
            return Ok(None);
        }
        if len < 0 {
            return Err(self.mismatch(format!("negative {what} length {len}")));
        }
        let raw = self.get_padded(len as usize, what)?;
        String::from_utf8(raw.to_vec())
            .map(Some)
            .map_err(|_| self.mismatch(format!("{what} is not UTF-8")))
    }

    /// Splits off everything that is left.
    pub(crate) fn rest(&mut self) -> Bytes {
        self.buf.split_off(0)
    }

    /// Fails if any bytes were left unread.
    pub(crate) fn finish(self) -> Result<(), DecodeError> {
        if self.buf.has_remaining() {
            return Err(self.mismatch(format!("{} trailing bytes", self.buf.remaining())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_are_padded_to_four_bytes() {
        let mut w = PduWriter::new();
        w.put_string("abcde");
        let buf = w.finish();
        assert_eq!(buf.len(), 4 + 8);
        assert_eq!(&buf[4..9], b"abcde");
        assert_eq!(&buf[9..], &[0, 0, 0]);

        let mut r = PduReader::new(PduType::Text, buf.freeze());
        assert_eq!(r.get_string("name").unwrap(), "abcde");
        r.finish().unwrap();
    }

    #[test]
    fn oversized_count_is_a_mismatch() {
        let mut w = PduWriter::new();
        w.put_i32(1000);
        w.put_i32(1);
        let mut r = PduReader::new(PduType::Fetch, w.finish().freeze());
        assert!(matches!(
            r.get_count("numpmid", 4),
            Err(DecodeError::FieldCountMismatch { .. })
        ));
    }

    #[test]
    fn missing_optional_string() {
        let mut w = PduWriter::new();
        w.put_opt_string(None);
        w.put_opt_string(Some(""));
        let mut r = PduReader::new(PduType::Instance, w.finish().freeze());
        assert_eq!(r.get_opt_string("name").unwrap(), None);
        assert_eq!(r.get_opt_string("name").unwrap(), Some(String::new()));
    }
}
