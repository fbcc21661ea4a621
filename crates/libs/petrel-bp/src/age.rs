use crate::block::{block_flags, block_type, BlockInfo, XmitBlocks};
use crate::bundle::Bundle;
use crate::dictionary::Dictionary;
use crate::error::BpError;
use crate::processor::{generic_consume, BlockListType, BlockProcessor};

/// Age extension block: one SDNV counting seconds the bundle has existed.
/// Carried for clockless sources (creation timestamp zero) so lifetime can
/// still be enforced; residence time at this node is added on transmit.
pub struct AgeBlockProcessor;

impl BlockProcessor for AgeBlockProcessor {
    fn block_type(&self) -> u8 {
        block_type::AGE
    }

    fn consume(
        &self,
        bundle: &mut Bundle,
        block: &mut BlockInfo,
        dict: &mut Dictionary,
        data: &[u8],
    ) -> Result<usize, BpError> {
        let consumed = generic_consume(block, dict, data)?;
        if block.complete {
            let (age, _) = petrel_sdnv::decode(block.data())?;
            bundle.state().age_secs = age;
        }
        Ok(consumed)
    }

    fn prepare(
        &self,
        bundle: &Bundle,
        xmit: &mut XmitBlocks,
        source: Option<&BlockInfo>,
        _link: &str,
        _list: BlockListType,
    ) -> Result<(), BpError> {
        // Only bundles that arrived with an age block, or that were created
        // without a clock, carry one outbound.
        if source.is_none() && bundle.creation_ts.secs != 0 {
            return Ok(());
        }
        let mut block = BlockInfo::new(block_type::AGE);
        block.set_flag(block_flags::REPLICATE_IN_EVERY_FRAGMENT);
        xmit.blocks.push(block);
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
        let age = bundle.state().age_secs + bundle.received_at.elapsed().as_secs();
        let mut flags =
            block_flags::DELETE_BUNDLE_ONERROR | block_flags::REPLICATE_IN_EVERY_FRAGMENT;
        if last {
            flags |= block_flags::LAST_BLOCK;
        }
        let mut data = Vec::with_capacity(petrel_sdnv::MAX_LENGTH);
        petrel_sdnv::append(age, &mut data);

        let block = &mut xmit.blocks[idx];
        block.generate_preamble(&mut xmit.dict, block_type::AGE, flags, data.len() as u64);
        block.set_data(&data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::BundleTimestamp;

    #[test]
    fn age_roundtrip() {
        let mut bundle = Bundle::new();
        bundle.creation_ts = BundleTimestamp::new(0, 0);
        bundle.state().age_secs = 77;

        let mut xmit = XmitBlocks::new("l1");
        let proc = AgeBlockProcessor;
        proc.prepare(&bundle, &mut xmit, None, "l1", BlockListType::Api).expect("prepare");
        assert_eq!(xmit.blocks.len(), 1);
        proc.generate(&bundle, &mut xmit, 0, "l1", true).expect("generate");

        let wire = xmit.blocks[0].contents.clone();
        let mut inbound = Bundle::new();
        let mut dict = Dictionary::new();
        let mut block = BlockInfo::new(0);
        proc.consume(&mut inbound, &mut block, &mut dict, &wire).expect("consume");
        assert!(block.complete);
        assert!(inbound.state().age_secs >= 77);
        assert!(block.last_block());
    }

    #[test]
    fn skipped_for_clocked_bundles() {
        let bundle = Bundle::new();
        let mut xmit = XmitBlocks::new("l1");
        AgeBlockProcessor
            .prepare(&bundle, &mut xmit, None, "l1", BlockListType::Api)
            .expect("prepare");
        assert!(xmit.blocks.is_empty());
    }
}
