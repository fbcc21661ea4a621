use crate::dictionary::Dictionary;
use crate::eid::EndpointId;
use crate::error::BpError;

/// Block type codes.
pub mod block_type {
    pub const PRIMARY: u8 = 0x00;
    pub const PAYLOAD: u8 = 0x01;
    pub const BUNDLE_AUTHENTICATION: u8 = 0x02;
    pub const PAYLOAD_INTEGRITY: u8 = 0x03;
    pub const PAYLOAD_CONFIDENTIALITY: u8 = 0x04;
    pub const EXTENSION_SECURITY: u8 = 0x09;
    pub const AGE: u8 = 0x0a;
}

/// Block processing control flags (RFC 5050 §4.3).
pub mod block_flags {
    pub const REPLICATE_IN_EVERY_FRAGMENT: u64 = 1 << 0;
    pub const REPORT_ONERROR: u64 = 1 << 1;
    pub const DELETE_BUNDLE_ONERROR: u64 = 1 << 2;
    pub const LAST_BLOCK: u64 = 1 << 3;
    pub const DISCARD_BLOCK_ONERROR: u64 = 1 << 4;
    pub const FORWARDED_UNPROCESSED: u64 = 1 << 5;
    pub const EID_REFS: u64 = 1 << 6;
}

/// A typed item in a security-parameters or security-result field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityItem {
    pub item_type: u8,
    pub value: Vec<u8>,
}

/// Per-block state attached by the security block processors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityLocals {
    pub ciphersuite: u8,
    pub cs_flags: u64,
    pub correlator: u64,
    pub params: Vec<SecurityItem>,
    pub result: Vec<SecurityItem>,
    pub security_src: Option<EndpointId>,
    pub security_dest: Option<EndpointId>,
    /// Session key material held between prepare and finalize; never
    /// serialized.
    pub session_key: Vec<u8>,
}

/// One block of a bundle: the parsed preamble plus the full wire image.
///
/// `contents` always holds preamble followed by data, so re-walking the
/// original octets (for digests) is a straight slice.
#[derive(Debug, Clone, Default)]
pub struct BlockInfo {
    pub block_type: u8,
    pub flags: u64,
    pub eid_refs: Vec<EndpointId>,
    /// Declared length of the data portion.
    pub data_length: u64,
    /// Offset of the data portion within `contents` (== preamble length).
    pub data_offset: usize,
    pub contents: Vec<u8>,
    pub locals: Option<SecurityLocals>,
    /// Parse bookkeeping: preamble fully decoded.
    pub preamble_done: bool,
    /// Parse bookkeeping: all declared data bytes present.
    pub complete: bool,
}

impl BlockInfo {
    pub fn new(block_type: u8) -> Self {
        Self { block_type, ..Default::default() }
    }

    pub fn data(&self) -> &[u8] {
        &self.contents[self.data_offset.min(self.contents.len())..]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let off = self.data_offset.min(self.contents.len());
        &mut self.contents[off..]
    }

    pub fn last_block(&self) -> bool {
        self.flags & block_flags::LAST_BLOCK != 0
    }

    pub fn set_flag(&mut self, flag: u64) {
        self.flags |= flag;
    }

    pub fn clear_flag(&mut self, flag: u64) {
        self.flags &= !flag;
    }

    /// Total serialized length of this block.
    pub fn full_length(&self) -> u64 {
        self.contents.len() as u64
    }

    /// Write the standard block preamble into `contents` and record the data
    /// offset. EID references present on the block are folded into `dict`
    /// and written as offset pairs.
    pub fn generate_preamble(
        &mut self,
        dict: &mut Dictionary,
        block_type: u8,
        mut flags: u64,
        data_length: u64,
    ) {
        self.block_type = block_type;
        if !self.eid_refs.is_empty() {
            flags |= block_flags::EID_REFS;
        }
        self.flags = flags;
        self.data_length = data_length;

        let mut buf = Vec::with_capacity(16);
        buf.push(block_type);
        petrel_sdnv::append(flags, &mut buf);
        if !self.eid_refs.is_empty() {
            petrel_sdnv::append(self.eid_refs.len() as u64, &mut buf);
            for eid in &self.eid_refs {
                let (scheme_off, ssp_off) = dict.add_eid(eid);
                petrel_sdnv::append(scheme_off, &mut buf);
                petrel_sdnv::append(ssp_off, &mut buf);
            }
        }
        petrel_sdnv::append(data_length, &mut buf);

        self.data_offset = buf.len();
        self.contents = buf;
        self.preamble_done = true;
    }

    /// Replace the data portion, keeping the already written preamble.
    pub fn set_data(&mut self, data: &[u8]) {
        self.contents.truncate(self.data_offset);
        self.contents.extend_from_slice(data);
        self.complete = true;
        debug_assert_eq!(self.data_length as usize, data.len());
    }

    /// Incrementally parse the preamble from accumulated `contents`.
    /// Returns false if more bytes are needed.
    pub fn try_parse_preamble(&mut self, dict: &Dictionary) -> Result<bool, BpError> {
        if self.preamble_done {
            return Ok(true);
        }
        let buf = self.contents.clone();
        if buf.is_empty() {
            return Ok(false);
        }
        let mut cursor = &buf[1..];
        let take = |c: &mut &[u8]| petrel_sdnv::decode_advance(c);

        let flags = match take(&mut cursor) {
            Ok(v) => v,
            Err(e) if matches!(e, petrel_sdnv::SdnvError::Truncated(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let mut eid_refs = Vec::new();
        if flags & block_flags::EID_REFS != 0 {
            let count = match take(&mut cursor) {
                Ok(v) => v,
                Err(e) if matches!(e, petrel_sdnv::SdnvError::Truncated(_)) => return Ok(false),
                Err(e) => return Err(e.into()),
            };
            if count > 16 {
                return Err(BpError::Malformed("unreasonable eid-reference count"));
            }
            for _ in 0..count {
                let scheme_off = match take(&mut cursor) {
                    Ok(v) => v,
                    Err(e) if matches!(e, petrel_sdnv::SdnvError::Truncated(_)) => {
                        return Ok(false)
                    }
                    Err(e) => return Err(e.into()),
                };
                let ssp_off = match take(&mut cursor) {
                    Ok(v) => v,
                    Err(e) if matches!(e, petrel_sdnv::SdnvError::Truncated(_)) => {
                        return Ok(false)
                    }
                    Err(e) => return Err(e.into()),
                };
                eid_refs.push(dict.extract_eid(scheme_off, ssp_off)?);
            }
        }

        let data_length = match take(&mut cursor) {
            Ok(v) => v,
            Err(e) if matches!(e, petrel_sdnv::SdnvError::Truncated(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        self.block_type = buf[0];
        self.flags = flags;
        self.eid_refs = eid_refs;
        self.data_length = data_length;
        self.data_offset = buf.len() - cursor.len();
        self.preamble_done = true;
        Ok(true)
    }
}

/// An ordered block list.
pub type BlockInfoVec = Vec<BlockInfo>;

pub fn find_block(blocks: &BlockInfoVec, block_type: u8) -> Option<&BlockInfo> {
    blocks.iter().find(|b| b.block_type == block_type)
}

pub fn has_block(blocks: &BlockInfoVec, block_type: u8) -> bool {
    find_block(blocks, block_type).is_some()
}

/// The outbound image of a bundle for one link: the block list plus the
/// dictionary its preambles reference.
#[derive(Debug, Clone, Default)]
pub struct XmitBlocks {
    pub blocks: BlockInfoVec,
    pub dict: Dictionary,
    pub link: String,
}

impl XmitBlocks {
    pub fn new(link: &str) -> Self {
        Self { link: link.to_string(), ..Default::default() }
    }

    /// Total wire length of all generated blocks.
    pub fn total_length(&self) -> u64 {
        self.blocks.iter().map(BlockInfo::full_length).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preamble_roundtrip() {
        let mut dict = Dictionary::new();
        let mut block = BlockInfo::new(block_type::AGE);
        block.eid_refs.push(EndpointId::parse("dtn://sec/src").expect("parse"));
        block.generate_preamble(
            &mut dict,
            block_type::AGE,
            block_flags::DELETE_BUNDLE_ONERROR,
            3,
        );
        block.set_data(&[1, 2, 3]);

        let mut parsed = BlockInfo::new(0);
        parsed.contents = block.contents.clone();
        assert!(parsed.try_parse_preamble(&dict).expect("parse"));
        assert_eq!(parsed.block_type, block_type::AGE);
        assert_eq!(parsed.data_length, 3);
        assert_eq!(parsed.eid_refs.len(), 1);
        assert!(parsed.flags & block_flags::EID_REFS != 0);
        assert_eq!(parsed.data_offset, block.data_offset);
    }

    #[test]
    fn partial_preamble_waits_for_more() {
        let mut dict = Dictionary::new();
        let mut block = BlockInfo::new(block_type::PAYLOAD);
        block.generate_preamble(&mut dict, block_type::PAYLOAD, 0, 300);

        let full = block.contents.clone();
        let mut parsed = BlockInfo::new(0);
        parsed.contents = full[..1].to_vec();
        assert!(!parsed.try_parse_preamble(&dict).expect("short parse"));
        parsed.contents = full.clone();
        assert!(parsed.try_parse_preamble(&dict).expect("full parse"));
        assert_eq!(parsed.data_length, 300);
    }
}
