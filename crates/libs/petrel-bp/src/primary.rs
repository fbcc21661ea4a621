use crate::block::{block_type, BlockInfo, XmitBlocks};
use crate::bundle::{Bundle, Priority};
use crate::dictionary::Dictionary;
use crate::error::BpError;
use crate::processor::{BlockListType, BlockProcessor};
use crate::timestamp::BundleTimestamp;

pub const BP_VERSION: u8 = 6;

/// Bundle processing control flags (RFC 5050 §4.2).
mod bundle_flags {
    pub const IS_FRAGMENT: u64 = 1 << 0;
    pub const IS_ADMIN: u64 = 1 << 1;
    pub const DO_NOT_FRAGMENT: u64 = 1 << 2;
    pub const CUSTODY_REQUESTED: u64 = 1 << 3;
    pub const SINGLETON_DEST: u64 = 1 << 4;
    pub const APP_ACK: u64 = 1 << 5;
    pub const COS_SHIFT: u64 = 7;
    pub const RCPT_RECEIVE: u64 = 1 << 14;
    pub const RCPT_CUSTODY: u64 = 1 << 15;
    pub const RCPT_FORWARD: u64 = 1 << 16;
    pub const RCPT_DELIVERY: u64 = 1 << 17;
    pub const RCPT_DELETION: u64 = 1 << 18;
}

fn format_flags(bundle: &Bundle) -> u64 {
    use bundle_flags::*;
    let mut flags = bundle.priority.cos_bits() << COS_SHIFT;
    if bundle.is_fragment {
        flags |= IS_FRAGMENT;
    }
    if bundle.is_admin {
        flags |= IS_ADMIN;
    }
    if bundle.do_not_fragment {
        flags |= DO_NOT_FRAGMENT;
    }
    if bundle.custody_requested {
        flags |= CUSTODY_REQUESTED;
    }
    if bundle.singleton_dest {
        flags |= SINGLETON_DEST;
    }
    if bundle.app_ack_requested {
        flags |= APP_ACK;
    }
    if bundle.receive_rcpt {
        flags |= RCPT_RECEIVE;
    }
    if bundle.custody_rcpt {
        flags |= RCPT_CUSTODY;
    }
    if bundle.forward_rcpt {
        flags |= RCPT_FORWARD;
    }
    if bundle.delivery_rcpt {
        flags |= RCPT_DELIVERY;
    }
    if bundle.deletion_rcpt {
        flags |= RCPT_DELETION;
    }
    flags
}

fn apply_flags(bundle: &mut Bundle, flags: u64) {
    use bundle_flags::*;
    bundle.is_fragment = flags & IS_FRAGMENT != 0;
    bundle.is_admin = flags & IS_ADMIN != 0;
    bundle.do_not_fragment = flags & DO_NOT_FRAGMENT != 0;
    bundle.custody_requested = flags & CUSTODY_REQUESTED != 0;
    bundle.singleton_dest = flags & SINGLETON_DEST != 0;
    bundle.app_ack_requested = flags & APP_ACK != 0;
    bundle.receive_rcpt = flags & RCPT_RECEIVE != 0;
    bundle.custody_rcpt = flags & RCPT_CUSTODY != 0;
    bundle.forward_rcpt = flags & RCPT_FORWARD != 0;
    bundle.delivery_rcpt = flags & RCPT_DELIVERY != 0;
    bundle.deletion_rcpt = flags & RCPT_DELETION != 0;
    bundle.priority = Priority::from_cos_bits(flags >> COS_SHIFT);
}

/// The primary block: version, flags, EID offsets into the dictionary,
/// creation timestamp, lifetime, and fragment coordinates.
pub struct PrimaryBlockProcessor;

impl PrimaryBlockProcessor {
    /// Serialize the primary block for `bundle` into a fresh byte image.
    /// `dict` must already contain every EID the rest of the image
    /// references; this method adds the primary's own four.
    pub fn serialize(bundle: &Bundle, dict: &mut Dictionary) -> Vec<u8> {
        let (dest_s, dest_p) = dict.add_eid(&bundle.dest);
        let (src_s, src_p) = dict.add_eid(&bundle.source);
        let (rep_s, rep_p) = dict.add_eid(&bundle.replyto);
        let custodian = bundle.custodian();
        let (cus_s, cus_p) = dict.add_eid(&custodian);

        let mut body = Vec::with_capacity(64 + dict.len());
        for off in [dest_s, dest_p, src_s, src_p, rep_s, rep_p, cus_s, cus_p] {
            petrel_sdnv::append(off, &mut body);
        }
        petrel_sdnv::append(bundle.creation_ts.secs, &mut body);
        petrel_sdnv::append(bundle.creation_ts.seqno, &mut body);
        petrel_sdnv::append(bundle.lifetime_secs, &mut body);
        petrel_sdnv::append(dict.len() as u64, &mut body);
        body.extend_from_slice(dict.raw());
        if bundle.is_fragment {
            petrel_sdnv::append(bundle.frag_offset, &mut body);
            petrel_sdnv::append(bundle.orig_length, &mut body);
        }

        let mut out = Vec::with_capacity(body.len() + 16);
        out.push(BP_VERSION);
        petrel_sdnv::append(format_flags(bundle), &mut out);
        petrel_sdnv::append(body.len() as u64, &mut out);
        out.extend_from_slice(&body);
        out
    }

    /// Parse a complete primary image, populating `bundle` and `dict`.
    fn parse(bundle: &mut Bundle, dict: &mut Dictionary, image: &[u8]) -> Result<(), BpError> {
        if image.is_empty() {
            return Err(BpError::Truncated);
        }
        if image[0] != BP_VERSION {
            return Err(BpError::BadVersion(image[0]));
        }
        let mut cur = &image[1..];
        let flags = petrel_sdnv::decode_advance(&mut cur)?;
        let block_len = petrel_sdnv::decode_advance(&mut cur)?;
        if (cur.len() as u64) < block_len {
            return Err(BpError::Truncated);
        }

        let mut offs = [0u64; 8];
        for slot in &mut offs {
            *slot = petrel_sdnv::decode_advance(&mut cur)?;
        }
        let secs = petrel_sdnv::decode_advance(&mut cur)?;
        let seqno = petrel_sdnv::decode_advance(&mut cur)?;
        let lifetime = petrel_sdnv::decode_advance(&mut cur)?;
        let dict_len = petrel_sdnv::decode_advance(&mut cur)?;
        if (cur.len() as u64) < dict_len {
            return Err(BpError::Malformed("dictionary extends past block"));
        }
        *dict = Dictionary::from_raw(cur[..dict_len as usize].to_vec());
        cur = &cur[dict_len as usize..];

        apply_flags(bundle, flags);
        bundle.dest = dict.extract_eid(offs[0], offs[1])?;
        bundle.source = dict.extract_eid(offs[2], offs[3])?;
        bundle.replyto = dict.extract_eid(offs[4], offs[5])?;
        bundle.set_custodian(dict.extract_eid(offs[6], offs[7])?);
        bundle.creation_ts = BundleTimestamp::new(secs, seqno);
        bundle.lifetime_secs = lifetime;

        if bundle.is_fragment {
            bundle.frag_offset = petrel_sdnv::decode_advance(&mut cur)?;
            bundle.orig_length = petrel_sdnv::decode_advance(&mut cur)?;
        }
        Ok(())
    }

    /// Total length of a primary image whose header is present in `buf`,
    /// or None if the header itself is incomplete.
    fn total_len(buf: &[u8]) -> Result<Option<usize>, BpError> {
        if buf.is_empty() {
            return Ok(None);
        }
        if buf[0] != BP_VERSION {
            return Err(BpError::BadVersion(buf[0]));
        }
        let mut cur = &buf[1..];
        for _ in 0..2 {
            match petrel_sdnv::decode_advance(&mut cur) {
                Ok(_) => {}
                Err(petrel_sdnv::SdnvError::Truncated(_)) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
        // Re-decode the second SDNV (block length) now that we know both fit.
        let mut cur2 = &buf[1..];
        let _flags = petrel_sdnv::decode_advance(&mut cur2)?;
        let block_len = petrel_sdnv::decode_advance(&mut cur2)?;
        let header = buf.len() - cur2.len();
        Ok(Some(header + block_len as usize))
    }
}

impl BlockProcessor for PrimaryBlockProcessor {
    fn block_type(&self) -> u8 {
        block_type::PRIMARY
    }

    fn consume(
        &self,
        bundle: &mut Bundle,
        block: &mut BlockInfo,
        dict: &mut Dictionary,
        data: &[u8],
    ) -> Result<usize, BpError> {
        let mut consumed = 0;

        // Accrete until the (version, flags, length) header decodes, then
        // bulk-copy up to the declared end of the block.
        loop {
            match Self::total_len(&block.contents)? {
                None => {
                    if consumed == data.len() {
                        return Ok(consumed);
                    }
                    block.contents.push(data[consumed]);
                    consumed += 1;
                }
                Some(total) => {
                    let want = total.saturating_sub(block.contents.len());
                    let take = want.min(data.len() - consumed);
                    block.contents.extend_from_slice(&data[consumed..consumed + take]);
                    consumed += take;
                    if block.contents.len() < total {
                        return Ok(consumed);
                    }
                    break;
                }
            }
        }

        let image = block.contents.clone();
        Self::parse(bundle, dict, &image)?;
        block.block_type = block_type::PRIMARY;
        block.data_length = image.len() as u64;
        block.data_offset = 0;
        block.preamble_done = true;
        block.complete = true;
        Ok(consumed)
    }

    fn prepare(
        &self,
        _bundle: &Bundle,
        xmit: &mut XmitBlocks,
        _source: Option<&BlockInfo>,
        _link: &str,
        _list: BlockListType,
    ) -> Result<(), BpError> {
        // The primary always leads the outbound image.
        xmit.blocks.insert(0, BlockInfo::new(block_type::PRIMARY));
        Ok(())
    }

    fn generate(
        &self,
        bundle: &Bundle,
        xmit: &mut XmitBlocks,
        idx: usize,
        _link: &str,
        last: bool,
    ) -> Result<(), BpError> {
        debug_assert!(!last, "primary cannot be the only block");

        // Fold every EID the other outbound blocks reference into the
        // dictionary before it is serialized; later preamble writes must
        // find their strings already present.
        let referenced: Vec<_> =
            xmit.blocks.iter().flat_map(|b| b.eid_refs.iter().cloned()).collect();
        for eid in &referenced {
            xmit.dict.add_eid(eid);
        }

        let image = Self::serialize(bundle, &mut xmit.dict);
        let block = &mut xmit.blocks[idx];
        block.data_length = image.len() as u64;
        block.data_offset = 0;
        block.contents = image;
        block.preamble_done = true;
        block.complete = true;
        Ok(())
    }
}
