use crate::eid::EndpointId;
use crate::error::BpError;

/// The primary-block dictionary: scheme and SSP strings packed back to back,
/// each NUL-terminated, referenced by byte offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dictionary {
    raw: Vec<u8>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_raw(raw: Vec<u8>) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    fn add_str(&mut self, s: &str) -> u64 {
        if let Some(off) = self.find(s) {
            return off;
        }
        let off = self.raw.len() as u64;
        self.raw.extend_from_slice(s.as_bytes());
        self.raw.push(0);
        off
    }

    fn find(&self, s: &str) -> Option<u64> {
        let mut off = 0;
        while off < self.raw.len() {
            let end = self.raw[off..].iter().position(|&b| b == 0)? + off;
            if &self.raw[off..end] == s.as_bytes() {
                return Some(off as u64);
            }
            off = end + 1;
        }
        None
    }

    /// Insert (or find) the EID's strings, returning (scheme, ssp) offsets.
    pub fn add_eid(&mut self, eid: &EndpointId) -> (u64, u64) {
        (self.add_str(eid.scheme()), self.add_str(eid.ssp()))
    }

    fn get_str(&self, off: u64) -> Result<&str, BpError> {
        let off = off as usize;
        if off >= self.raw.len() {
            return Err(BpError::Malformed("dictionary offset out of range"));
        }
        let end = self.raw[off..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(BpError::Malformed("unterminated dictionary string"))?
            + off;
        std::str::from_utf8(&self.raw[off..end])
            .map_err(|_| BpError::Malformed("dictionary string not utf-8"))
    }

    /// Reconstruct an EID from a (scheme, ssp) offset pair.
    pub fn extract_eid(&self, scheme_off: u64, ssp_off: u64) -> Result<EndpointId, BpError> {
        let scheme = self.get_str(scheme_off)?;
        let ssp = self.get_str(ssp_off)?;
        Ok(EndpointId::parse(&format!("{scheme}:{ssp}"))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupes_shared_strings() {
        let mut dict = Dictionary::new();
        let a = EndpointId::parse("dtn://node/app").expect("parse");
        let b = EndpointId::parse("dtn://peer").expect("parse");
        let (sa, pa) = dict.add_eid(&a);
        let (sb, pb) = dict.add_eid(&b);
        assert_eq!(sa, sb, "scheme string is shared");
        assert_ne!(pa, pb);
        assert_eq!(dict.extract_eid(sa, pa).expect("extract"), a);
        assert_eq!(dict.extract_eid(sb, pb).expect("extract"), b);
    }

    #[test]
    fn bad_offset_rejected() {
        let dict = Dictionary::from_raw(b"dtn\0//node\0".to_vec());
        assert!(dict.extract_eid(0, 4).is_ok());
        assert!(dict.extract_eid(0, 99).is_err());
    }
}
