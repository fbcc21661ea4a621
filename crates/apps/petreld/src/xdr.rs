//! Minimal XDR framing for the application API: big-endian u32 words,
//! opaque byte fields padded to the word boundary.

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum XdrError {
    #[error("xdr message truncated")]
    Truncated,

    #[error("xdr string not utf-8")]
    BadString,

    #[error("xdr field too large: {0} bytes")]
    TooLarge(u32),
}

const MAX_OPAQUE: u32 = 64 * 1024 * 1024;

#[derive(Default)]
pub struct XdrWriter {
    buf: Vec<u8>,
}

impl XdrWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn opaque(&mut self, bytes: &[u8]) -> &mut Self {
        self.u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
        self
    }

    pub fn string(&mut self, s: &str) -> &mut Self {
        self.opaque(s.as_bytes())
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

pub struct XdrReader<'a> {
    buf: &'a [u8],
}

impl<'a> XdrReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn u32(&mut self) -> Result<u32, XdrError> {
        if self.buf.len() < 4 {
            return Err(XdrError::Truncated);
        }
        let v = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        self.buf = &self.buf[4..];
        Ok(v)
    }

    pub fn u64(&mut self) -> Result<u64, XdrError> {
        if self.buf.len() < 8 {
            return Err(XdrError::Truncated);
        }
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.buf[..8]);
        self.buf = &self.buf[8..];
        Ok(u64::from_be_bytes(b))
    }

    pub fn opaque(&mut self) -> Result<Vec<u8>, XdrError> {
        let len = self.u32()?;
        if len > MAX_OPAQUE {
            return Err(XdrError::TooLarge(len));
        }
        let padded = (len as usize).div_ceil(4) * 4;
        if self.buf.len() < padded {
            return Err(XdrError::Truncated);
        }
        let out = self.buf[..len as usize].to_vec();
        self.buf = &self.buf[padded..];
        Ok(out)
    }

    pub fn string(&mut self) -> Result<String, XdrError> {
        String::from_utf8(self.opaque()?).map_err(|_| XdrError::BadString)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_mixed_fields() {
        let msg = XdrWriter::new()
            .u32(7)
            .string("dtn://node/app")
            .opaque(b"abc")
            .u64(0xdead_beef_0000_0001)
            .finish();
        assert_eq!(msg.len() % 4, 0);

        let mut r = XdrReader::new(&msg);
        assert_eq!(r.u32().expect("u32"), 7);
        assert_eq!(r.string().expect("string"), "dtn://node/app");
        assert_eq!(r.opaque().expect("opaque"), b"abc");
        assert_eq!(r.u64().expect("u64"), 0xdead_beef_0000_0001);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn padding_is_word_aligned() {
        let msg = XdrWriter::new().opaque(b"12345").finish();
        assert_eq!(msg.len(), 4 + 8);
    }

    #[test]
    fn truncation_detected() {
        let msg = XdrWriter::new().string("hello").finish();
        let mut r = XdrReader::new(&msg[..msg.len() - 2]);
        assert_eq!(r.string(), Err(XdrError::Truncated));
    }
}
