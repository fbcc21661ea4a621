use std::sync::Arc;

use crate::block::{block_flags, block_type, BlockInfo, BlockInfoVec, XmitBlocks};
use crate::bundle::Bundle;
use crate::dictionary::Dictionary;
use crate::error::BpError;
use crate::processor::{BlockListType, BlockValidation, ProcessorRegistry};

/// Status-report reason codes (RFC 5050 §6.1.1, plus the security
/// extension code).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReceptionReason {
    NoAdditionalInfo = 0x00,
    LifetimeExpired = 0x01,
    ForwardedUnidirectional = 0x02,
    TransmissionCancelled = 0x03,
    DepletedStorage = 0x04,
    DestEidUnintelligible = 0x05,
    NoKnownRoute = 0x06,
    NoTimelyContact = 0x07,
    BlockUnintelligible = 0x08,
    SecurityFailed = 0x09,
}

/// Deletion reasons share the status-report code space.
pub type DeletionReason = ReceptionReason;

/// Per-bundle inbound parse state: the primary dictionary and the block
/// list under construction.
#[derive(Default)]
pub struct BundleParser {
    pub dict: Dictionary,
    pub blocks: BlockInfoVec,
    done: bool,
}

impl BundleParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self) -> bool {
        self.done
    }
}

/// The bundle codec: drives block processors to produce and consume wire
/// images.
#[derive(Clone)]
pub struct BundleProtocol {
    registry: Arc<ProcessorRegistry>,
}

impl Default for BundleProtocol {
    fn default() -> Self {
        Self::new(Arc::new(ProcessorRegistry::new()))
    }
}

impl BundleProtocol {
    pub fn new(registry: Arc<ProcessorRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ProcessorRegistry> {
        &self.registry
    }

    /// Consume wire bytes into `bundle`, returning `(consumed, complete)`.
    /// Tolerates arbitrary chunking; call repeatedly until complete.
    pub fn consume(
        &self,
        bundle: &mut Bundle,
        parser: &mut BundleParser,
        data: &[u8],
    ) -> Result<(usize, bool), BpError> {
        let mut consumed = 0;

        while consumed < data.len() && !parser.done {
            let idx = match parser.blocks.last() {
                Some(b) if !b.complete => parser.blocks.len() - 1,
                _ => {
                    let mut block = BlockInfo::new(data[consumed]);
                    if parser.blocks.is_empty() {
                        block.block_type = block_type::PRIMARY;
                    }
                    parser.blocks.push(block);
                    parser.blocks.len() - 1
                }
            };

            let processor = if idx == 0 {
                self.registry.find(block_type::PRIMARY)
            } else {
                self.registry.find(parser.blocks[idx].block_type)
            };

            let block = &mut parser.blocks[idx];
            let n = processor.consume(bundle, block, &mut parser.dict, &data[consumed..])?;
            if n == 0 && !block.complete {
                // A processor that made no progress on nonempty input would
                // loop forever; treat as malformed.
                return Err(BpError::Malformed("block processor made no progress"));
            }
            consumed += n;

            if block.complete && idx > 0 && block.last_block() {
                parser.done = true;
            }
        }

        if parser.done {
            bundle.state().recv_blocks = std::mem::take(&mut parser.blocks);
        }
        Ok((consumed, parser.done))
    }

    /// Post-reception validation pass over the received block list.
    pub fn validate(&self, bundle: &Bundle) -> Result<(), (ReceptionReason, DeletionReason)> {
        let mut blocks = std::mem::take(&mut bundle.state().recv_blocks);
        let mut outcome = Ok(());

        let last_count = blocks.iter().filter(|b| b.last_block()).count();
        if blocks.len() < 2 || last_count != 1 {
            outcome = Err((
                ReceptionReason::BlockUnintelligible,
                DeletionReason::BlockUnintelligible,
            ));
        }

        if outcome.is_ok() {
            for idx in 1..blocks.len() {
                let processor = self.registry.find(blocks[idx].block_type);
                match processor.validate(bundle, &mut blocks, idx) {
                    BlockValidation::Ok => {}
                    BlockValidation::Fail { reception, deletion } => {
                        outcome = Err((reception, deletion));
                        break;
                    }
                }
            }
        }

        bundle.state().recv_blocks = blocks;
        outcome
    }

    /// Build and fully generate the outbound image of `bundle` for `link`.
    /// The result is also cached on the bundle's per-link xmit map.
    pub fn prepare_blocks(&self, bundle: &Bundle, link: &str) -> Result<XmitBlocks, BpError> {
        let (recv, api) = {
            let state = bundle.state();
            (state.recv_blocks.clone(), state.api_blocks.clone())
        };

        let mut xmit = XmitBlocks::new(link);
        self.registry.find(block_type::PRIMARY).prepare(
            bundle,
            &mut xmit,
            None,
            link,
            BlockListType::Xmit,
        )?;

        // Received extension blocks keep their relative order; payload is
        // appended last so the last-block flag lands on it.
        for block in recv.iter().filter(|b| {
            b.block_type != block_type::PRIMARY && b.block_type != block_type::PAYLOAD
        }) {
            let processor = self.registry.find(block.block_type);
            processor.prepare(bundle, &mut xmit, Some(block), link, BlockListType::Received)?;
        }
        for block in &api {
            let processor = self.registry.find(block.block_type);
            processor.prepare(bundle, &mut xmit, Some(block), link, BlockListType::Api)?;
        }
        if recv.is_empty() && api.iter().all(|b| b.block_type != block_type::AGE) {
            // Locally sourced bundle: give the age processor a chance to
            // include itself for clockless timestamps.
            self.registry.find(block_type::AGE).prepare(
                bundle,
                &mut xmit,
                None,
                link,
                BlockListType::Api,
            )?;
        }
        self.registry.find(block_type::PAYLOAD).prepare(
            bundle,
            &mut xmit,
            None,
            link,
            BlockListType::Xmit,
        )?;

        // Security policy blocks decide their own placement, including
        // trailers that follow the payload.
        for &policy_type in self.registry.outbound() {
            if xmit.blocks.iter().any(|b| b.block_type == policy_type) {
                continue;
            }
            self.registry.find(policy_type).prepare(
                bundle,
                &mut xmit,
                None,
                link,
                BlockListType::Xmit,
            )?;
        }

        let n = xmit.blocks.len();
        for idx in 0..n {
            let processor = self.registry.find(xmit.blocks[idx].block_type);
            processor.generate(bundle, &mut xmit, idx, link, idx == n - 1)?;
        }
        for idx in (0..n).rev() {
            let processor = self.registry.find(xmit.blocks[idx].block_type);
            processor.finalize(bundle, &mut xmit, idx, link)?;
        }

        bundle.state().xmit_blocks.insert(link.to_string(), xmit.clone());
        Ok(xmit)
    }

    /// Fully serialized wire length of a generated image.
    pub fn total_length(&self, bundle: &Bundle, xmit: &XmitBlocks) -> u64 {
        let payload = xmit
            .blocks
            .iter()
            .any(|b| b.block_type == block_type::PAYLOAD)
            .then(|| bundle.payload_len())
            .unwrap_or(0);
        xmit.total_length() + payload
    }

    /// Copy serialized bytes starting at stream position `offset` into
    /// `buf`. Returns `(written, complete)` where complete means the image
    /// end was reached.
    pub fn produce(
        &self,
        bundle: &Bundle,
        xmit: &XmitBlocks,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<(usize, bool), BpError> {
        let mut written = 0usize;
        let mut pos = 0u64;

        for block in &xmit.blocks {
            // Preamble/contents bytes.
            let clen = block.contents.len() as u64;
            if pos + clen > offset && written < buf.len() {
                let skip = offset.saturating_sub(pos) as usize;
                let avail = &block.contents[skip..];
                let take = avail.len().min(buf.len() - written);
                buf[written..written + take].copy_from_slice(&avail[..take]);
                written += take;
            }
            pos += clen;

            if block.block_type == block_type::PAYLOAD {
                let plen = bundle.payload_len();
                if pos + plen > offset && written < buf.len() {
                    let skip = offset.saturating_sub(pos).min(plen);
                    let take = ((plen - skip) as usize).min(buf.len() - written);
                    let bytes = {
                        let state = bundle.state();
                        state.payload.read_range(skip, take as u64)?
                    };
                    buf[written..written + bytes.len()].copy_from_slice(&bytes);
                    written += bytes.len();
                }
                pos += plen;
            }
        }

        let complete = offset + written as u64 >= pos;
        Ok((written, complete))
    }

    /// Convenience: serialize the whole image into one buffer.
    pub fn produce_all(&self, bundle: &Bundle, xmit: &XmitBlocks) -> Result<Vec<u8>, BpError> {
        let total = self.total_length(bundle, xmit) as usize;
        let mut buf = vec![0u8; total];
        let (written, complete) = self.produce(bundle, xmit, &mut buf, 0)?;
        debug_assert!(complete && written == total);
        buf.truncate(written);
        Ok(buf)
    }

    /// Convenience: consume a complete image into a fresh bundle.
    pub fn consume_all(&self, data: &[u8]) -> Result<Bundle, BpError> {
        let mut bundle = Bundle::new();
        let mut parser = BundleParser::new();
        let (consumed, complete) = self.consume(&mut bundle, &mut parser, data)?;
        if !complete {
            return Err(BpError::Truncated);
        }
        if consumed != data.len() {
            log::debug!("bp: {} trailing bytes after bundle image", data.len() - consumed);
        }
        Ok(bundle)
    }

    /// Re-run processors over a bundle reloaded from the store so derived
    /// state can be rebuilt.
    pub fn reload_post_process(&self, bundle: &Bundle) -> Result<(), BpError> {
        let mut blocks = std::mem::take(&mut bundle.state().recv_blocks);
        let context = blocks.clone();
        for block in blocks.iter_mut() {
            let processor = self.registry.find(block.block_type);
            processor.reload_post_process(bundle, &context, block)?;
        }
        bundle.state().recv_blocks = blocks;
        Ok(())
    }
}

/// True when every declared flag on `flags` is understood by this node.
pub fn known_block_flags(flags: u64) -> bool {
    flags
        & !(block_flags::REPLICATE_IN_EVERY_FRAGMENT
            | block_flags::REPORT_ONERROR
            | block_flags::DELETE_BUNDLE_ONERROR
            | block_flags::LAST_BLOCK
            | block_flags::DISCARD_BLOCK_ONERROR
            | block_flags::FORWARDED_UNPROCESSED
            | block_flags::EID_REFS)
        == 0
}
