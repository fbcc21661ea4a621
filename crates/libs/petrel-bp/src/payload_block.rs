use crate::block::{block_flags, block_type, BlockInfo, BlockInfoVec, XmitBlocks};
use crate::bundle::Bundle;
use crate::dictionary::Dictionary;
use crate::error::BpError;
use crate::processor::{BlockProcessor, BlockValidation};

/// The payload block. Its data portion is never buffered in the block's
/// contents; bytes stream directly into the bundle payload so large
/// payloads can stay file-backed.
pub struct PayloadBlockProcessor;

impl BlockProcessor for PayloadBlockProcessor {
    fn block_type(&self) -> u8 {
        block_type::PAYLOAD
    }

    fn consume(
        &self,
        bundle: &mut Bundle,
        block: &mut BlockInfo,
        dict: &mut Dictionary,
        data: &[u8],
    ) -> Result<usize, BpError> {
        let mut consumed = 0;

        while !block.preamble_done {
            if consumed == data.len() {
                return Ok(consumed);
            }
            block.contents.push(data[consumed]);
            consumed += 1;
            block.try_parse_preamble(dict)?;
        }

        let mut state = bundle.state();
        let have = state.payload.len();
        let want = block.data_length.saturating_sub(have) as usize;
        let take = want.min(data.len() - consumed);
        state.payload.append(&data[consumed..consumed + take])?;
        consumed += take;

        if state.payload.len() >= block.data_length {
            block.complete = true;
        }
        Ok(consumed)
    }

    fn validate(&self, bundle: &Bundle, blocks: &mut BlockInfoVec, idx: usize) -> BlockValidation {
        let declared = blocks[idx].data_length;
        let actual = bundle.payload_len();
        if declared != actual {
            log::error!("bp: {} payload length {} != declared {}", bundle, actual, declared);
            return BlockValidation::Fail {
                reception: crate::protocol::ReceptionReason::BlockUnintelligible,
                deletion: crate::protocol::DeletionReason::BlockUnintelligible,
            };
        }
        BlockValidation::Ok
    }

    fn generate(
        &self,
        bundle: &Bundle,
        xmit: &mut XmitBlocks,
        idx: usize,
        _link: &str,
        last: bool,
    ) -> Result<(), BpError> {
        let mut flags = 0;
        if last {
            flags |= block_flags::LAST_BLOCK;
        }
        let len = bundle.payload_len();
        let block = &mut xmit.blocks[idx];
        block.generate_preamble(&mut xmit.dict, block_type::PAYLOAD, flags, len);
        block.complete = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::BundlePayload;

    #[test]
    fn payload_streams_into_bundle() {
        let mut dict = Dictionary::new();
        let mut src = BlockInfo::new(block_type::PAYLOAD);
        src.generate_preamble(&mut dict, block_type::PAYLOAD, block_flags::LAST_BLOCK, 5);
        let mut wire = src.contents.clone();
        wire.extend_from_slice(b"hello");

        let proc = PayloadBlockProcessor;
        let mut bundle = Bundle::new();
        bundle.set_payload(BundlePayload::with_memory(Vec::new()));
        let mut block = BlockInfo::new(0);
        let mut total = 0;
        for chunk in wire.chunks(3) {
            total += proc.consume(&mut bundle, &mut block, &mut dict, chunk).expect("consume");
        }
        assert_eq!(total, wire.len());
        assert!(block.complete);
        assert_eq!(bundle.state().payload.read_all().expect("read"), b"hello");
        assert!(block.contents.len() == block.data_offset, "payload not buffered in block");
    }
}
