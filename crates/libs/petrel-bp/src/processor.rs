use std::collections::HashMap;
use std::sync::Arc;

use crate::block::{block_flags, BlockInfo, BlockInfoVec, XmitBlocks};
use crate::bundle::Bundle;
use crate::dictionary::Dictionary;
use crate::error::BpError;
use crate::protocol::{DeletionReason, ReceptionReason};

/// Which list a block being prepared came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockListType {
    Received,
    Api,
    Xmit,
}

/// Outcome of the post-reception validation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockValidation {
    Ok,
    Fail { reception: ReceptionReason, deletion: DeletionReason },
}

/// Polymorphic per-block-type protocol logic.
///
/// Defaults implement the opaque pass-through behavior; processors override
/// the stages they care about. `generate` is called front to back,
/// `finalize` back to front so digests can cover earlier blocks.
pub trait BlockProcessor: Send + Sync {
    fn block_type(&self) -> u8;

    /// Incrementally parse wire bytes into `block`. Returns the number of
    /// bytes consumed; sets `block.complete` when the block is whole.
    fn consume(
        &self,
        bundle: &mut Bundle,
        block: &mut BlockInfo,
        dict: &mut Dictionary,
        data: &[u8],
    ) -> Result<usize, BpError> {
        let _ = bundle;
        generic_consume(block, dict, data)
    }

    /// Validate a fully received block. May mutate flags on the block.
    fn validate(
        &self,
        bundle: &Bundle,
        blocks: &mut BlockInfoVec,
        idx: usize,
    ) -> BlockValidation {
        let _ = (bundle, blocks, idx);
        BlockValidation::Ok
    }

    /// Decide inclusion in the outbound image, typically by copying the
    /// received block onto the xmit list.
    fn prepare(
        &self,
        bundle: &Bundle,
        xmit: &mut XmitBlocks,
        source: Option<&BlockInfo>,
        link: &str,
        list: BlockListType,
    ) -> Result<(), BpError> {
        let _ = (bundle, link, list);
        let mut block = match source {
            Some(src) => src.clone(),
            None => BlockInfo::new(self.block_type()),
        };
        block.clear_flag(block_flags::LAST_BLOCK);
        xmit.blocks.push(block);
        Ok(())
    }

    /// Fill in wire contents that do not depend on other outbound blocks.
    fn generate(
        &self,
        bundle: &Bundle,
        xmit: &mut XmitBlocks,
        idx: usize,
        link: &str,
        last: bool,
    ) -> Result<(), BpError> {
        let _ = (bundle, link);
        // Re-emit the copied data under a fresh preamble.
        let (block_type, data, mut flags) = {
            let block = &xmit.blocks[idx];
            (block.block_type, block.data().to_vec(), block.flags)
        };
        flags &= !(block_flags::LAST_BLOCK | block_flags::EID_REFS);
        if last {
            flags |= block_flags::LAST_BLOCK;
        }
        let block = &mut xmit.blocks[idx];
        block.generate_preamble(&mut xmit.dict, block_type, flags, data.len() as u64);
        block.set_data(&data);
        Ok(())
    }

    /// Compute contents that depend on other outbound blocks (digests,
    /// ciphertexts). Called in reverse block order.
    fn finalize(
        &self,
        bundle: &Bundle,
        xmit: &mut XmitBlocks,
        idx: usize,
        link: &str,
    ) -> Result<(), BpError> {
        let _ = (bundle, xmit, idx, link);
        Ok(())
    }

    /// Stream `len` bytes of the block image starting at `offset` to `f`.
    fn process(&self, f: &mut dyn FnMut(&[u8]), block: &BlockInfo, offset: usize, len: usize) {
        let end = (offset + len).min(block.contents.len());
        let start = offset.min(end);
        f(&block.contents[start..end]);
    }

    /// Like `process` but permits in-place modification.
    fn mutate(&self, f: &mut dyn FnMut(&mut [u8]), block: &mut BlockInfo, offset: usize, len: usize) {
        let end = (offset + len).min(block.contents.len());
        let start = offset.min(end);
        f(&mut block.contents[start..end]);
    }

    /// Reconstruct derived state after a store reload.
    fn reload_post_process(
        &self,
        bundle: &Bundle,
        blocks: &BlockInfoVec,
        block: &mut BlockInfo,
    ) -> Result<(), BpError> {
        let _ = (bundle, blocks, block);
        Ok(())
    }
}

/// Default incremental parse: accrete the preamble byte by byte until it
/// decodes, then bulk-copy data until `data_length` bytes are present.
pub fn generic_consume(
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

    let have = block.contents.len() - block.data_offset;
    let want = (block.data_length as usize).saturating_sub(have);
    let take = want.min(data.len() - consumed);
    block.contents.extend_from_slice(&data[consumed..consumed + take]);
    consumed += take;

    if block.contents.len() - block.data_offset >= block.data_length as usize {
        block.complete = true;
    }
    Ok(consumed)
}

/// Pass-through processor for unrecognized block types.
///
/// The block is carried opaquely; validation applies the block's own
/// can't-process flags.
pub struct UnknownBlockProcessor;

impl BlockProcessor for UnknownBlockProcessor {
    fn block_type(&self) -> u8 {
        0xff
    }

    fn validate(&self, bundle: &Bundle, blocks: &mut BlockInfoVec, idx: usize) -> BlockValidation {
        let block = &mut blocks[idx];
        if block.flags & block_flags::DELETE_BUNDLE_ONERROR != 0 {
            log::warn!(
                "bp: {} carries unprocessable block type {} flagged delete-bundle",
                bundle,
                block.block_type
            );
            return BlockValidation::Fail {
                reception: ReceptionReason::BlockUnintelligible,
                deletion: DeletionReason::BlockUnintelligible,
            };
        }
        block.set_flag(block_flags::FORWARDED_UNPROCESSED);
        BlockValidation::Ok
    }

    fn prepare(
        &self,
        _bundle: &Bundle,
        xmit: &mut XmitBlocks,
        source: Option<&BlockInfo>,
        _link: &str,
        _list: BlockListType,
    ) -> Result<(), BpError> {
        let Some(src) = source else {
            return Err(BpError::Malformed("unknown block with no source"));
        };
        if src.flags & block_flags::DISCARD_BLOCK_ONERROR != 0 {
            // Dropped from the outbound image rather than forwarded blind.
            return Ok(());
        }
        let mut block = src.clone();
        block.clear_flag(block_flags::LAST_BLOCK);
        xmit.blocks.push(block);
        Ok(())
    }
}

/// One processor per block type, with an opaque fallback.
pub struct ProcessorRegistry {
    map: HashMap<u8, Arc<dyn BlockProcessor>>,
    unknown: Arc<dyn BlockProcessor>,
    /// Block types offered a prepare() with no source block on every
    /// outbound bundle (security policy blocks).
    outbound: Vec<u8>,
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorRegistry {
    /// Registry with the standard processors (primary, payload, age).
    pub fn new() -> Self {
        let mut reg = Self {
            map: HashMap::new(),
            unknown: Arc::new(UnknownBlockProcessor),
            outbound: Vec::new(),
        };
        reg.register(Arc::new(crate::primary::PrimaryBlockProcessor));
        reg.register(Arc::new(crate::payload_block::PayloadBlockProcessor));
        reg.register(Arc::new(crate::age::AgeBlockProcessor));
        reg
    }

    pub fn register(&mut self, p: Arc<dyn BlockProcessor>) {
        if self.map.insert(p.block_type(), p).is_some() {
            log::debug!("bp: replaced block processor registration");
        }
    }

    pub fn find(&self, block_type: u8) -> Arc<dyn BlockProcessor> {
        self.map.get(&block_type).cloned().unwrap_or_else(|| self.unknown.clone())
    }

    pub fn is_registered(&self, block_type: u8) -> bool {
        self.map.contains_key(&block_type)
    }

    /// Mark `block_type` as an outbound policy block; its processor will be
    /// offered a sourceless prepare() on every transmitted bundle.
    pub fn add_outbound(&mut self, block_type: u8) {
        if !self.outbound.contains(&block_type) {
            self.outbound.push(block_type);
        }
    }

    pub fn outbound(&self) -> &[u8] {
        &self.outbound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::block_type;

    #[test]
    fn generic_consume_handles_chunking() {
        let mut dict = Dictionary::new();
        let mut src = BlockInfo::new(block_type::AGE);
        src.generate_preamble(&mut dict, block_type::AGE, 0, 4);
        src.set_data(&[9, 9, 9, 9]);

        let wire = src.contents.clone();
        let mut block = BlockInfo::new(0);
        let mut total = 0;
        // One byte at a time, worst-case chunking.
        for chunk in wire.chunks(1) {
            total += generic_consume(&mut block, &mut dict, chunk).expect("consume");
        }
        assert_eq!(total, wire.len());
        assert!(block.complete);
        assert_eq!(block.data(), &[9, 9, 9, 9]);
    }

    #[test]
    fn registry_falls_back_to_unknown() {
        let reg = ProcessorRegistry::new();
        assert_eq!(reg.find(block_type::PAYLOAD).block_type(), block_type::PAYLOAD);
        assert_eq!(reg.find(0x77).block_type(), 0xff);
    }
}
