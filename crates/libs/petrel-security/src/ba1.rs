use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha1::Sha1;

use petrel_bp::block::{block_flags, block_type};
use petrel_bp::dictionary::Dictionary;
use petrel_bp::processor::{generic_consume, BlockListType, BlockProcessor, BlockValidation};
use petrel_bp::protocol::ReceptionReason;
use petrel_bp::{BlockInfo, BlockInfoVec, BpError, Bundle, SecurityItem, SecurityLocals, XmitBlocks};

use crate::items::{find_item, item_type};
use crate::keys::KeySteward;
use crate::suite::{decode_security_data, encode_security_data, SecurityPolicy};
use crate::ciphersuite;

const ICV_LEN: usize = 20;

static NEXT_CORRELATOR: AtomicU64 = AtomicU64::new(1);

/// BA1: hop-by-hop bundle authentication. A leading block carries the
/// ciphersuite parameters (key id), a trailing block after the payload
/// carries the HMAC-SHA1 ICV; a correlator ties the pair.
pub struct BaBlockProcessor {
    steward: Arc<dyn KeySteward>,
    policy: SecurityPolicy,
}

impl BaBlockProcessor {
    pub fn new(steward: Arc<dyn KeySteward>, policy: SecurityPolicy) -> Self {
        Self { steward, policy }
    }

    /// HMAC over every block image in order, with the trailing block's ICV
    /// bytes zeroed. The payload block's data streams from the bundle
    /// payload on both sides.
    fn compute_icv(
        &self,
        bundle: &Bundle,
        blocks: &BlockInfoVec,
        trailing_idx: usize,
    ) -> Result<Vec<u8>, BpError> {
        let key = self
            .steward
            .hmac_key(&bundle.dest, self.policy.ba1_key_id)
            .ok_or(BpError::Security("no authentication key"))?;
        let mut mac = Hmac::<Sha1>::new_from_slice(&key)
            .map_err(|_| BpError::Security("bad authentication key length"))?;

        for (idx, block) in blocks.iter().enumerate() {
            if idx == trailing_idx {
                let mut locals = block.locals.clone().unwrap_or_default();
                for item in &mut locals.result {
                    if item.item_type == item_type::ICV {
                        item.value = vec![0u8; item.value.len()];
                    }
                }
                mac.update(&block.contents[..block.data_offset]);
                mac.update(&encode_security_data(&locals));
            } else {
                mac.update(&block.contents);
            }
            if block.block_type == block_type::PAYLOAD {
                let payload = bundle.state().payload.read_all()?;
                mac.update(&payload);
            }
        }
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn find_trailing(blocks: &BlockInfoVec, correlator: u64, after: usize) -> Option<usize> {
        blocks.iter().enumerate().skip(after + 1).find_map(|(idx, b)| {
            (b.block_type == block_type::BUNDLE_AUTHENTICATION
                && b.locals.as_ref().map(|l| l.correlator) == Some(correlator))
            .then_some(idx)
        })
    }
}

impl BlockProcessor for BaBlockProcessor {
    fn block_type(&self) -> u8 {
        block_type::BUNDLE_AUTHENTICATION
    }

    fn consume(
        &self,
        bundle: &mut Bundle,
        block: &mut BlockInfo,
        dict: &mut Dictionary,
        data: &[u8],
    ) -> Result<usize, BpError> {
        let _ = bundle;
        let consumed = generic_consume(block, dict, data)?;
        if block.complete {
            block.locals = Some(decode_security_data(block.data())?);
        }
        Ok(consumed)
    }

    fn prepare(
        &self,
        _bundle: &Bundle,
        xmit: &mut XmitBlocks,
        source: Option<&BlockInfo>,
        _link: &str,
        _list: BlockListType,
    ) -> Result<(), BpError> {
        if source.is_some() {
            // Hop-by-hop: received BA blocks are never forwarded.
            return Ok(());
        }
        if !self.policy.ba1 {
            return Ok(());
        }

        let correlator = NEXT_CORRELATOR.fetch_add(1, Ordering::Relaxed);

        let mut leading = BlockInfo::new(block_type::BUNDLE_AUTHENTICATION);
        let mut key_id = Vec::new();
        petrel_sdnv::append(self.policy.ba1_key_id, &mut key_id);
        leading.locals = Some(SecurityLocals {
            ciphersuite: ciphersuite::BA1,
            correlator,
            params: vec![SecurityItem { item_type: item_type::KEY_INFO, value: key_id }],
            ..Default::default()
        });

        let mut trailing = BlockInfo::new(block_type::BUNDLE_AUTHENTICATION);
        trailing.locals = Some(SecurityLocals {
            ciphersuite: ciphersuite::BA1,
            correlator,
            result: vec![SecurityItem { item_type: item_type::ICV, value: vec![0u8; ICV_LEN] }],
            ..Default::default()
        });

        xmit.blocks.insert(1, leading);
        xmit.blocks.push(trailing);
        Ok(())
    }

    fn generate(
        &self,
        _bundle: &Bundle,
        xmit: &mut XmitBlocks,
        idx: usize,
        _link: &str,
        last: bool,
    ) -> Result<(), BpError> {
        let locals = xmit.blocks[idx]
            .locals
            .clone()
            .ok_or(BpError::Security("ba block missing locals"))?;
        let data = encode_security_data(&locals);
        let mut flags = block_flags::DISCARD_BLOCK_ONERROR;
        if last {
            flags |= block_flags::LAST_BLOCK;
        }
        let block = &mut xmit.blocks[idx];
        block.generate_preamble(
            &mut xmit.dict,
            block_type::BUNDLE_AUTHENTICATION,
            flags,
            data.len() as u64,
        );
        block.set_data(&data);
        Ok(())
    }

    fn finalize(
        &self,
        bundle: &Bundle,
        xmit: &mut XmitBlocks,
        idx: usize,
        _link: &str,
    ) -> Result<(), BpError> {
        // Only the leading block (the one with parameters) computes; it
        // runs late in the reverse pass, after every other block settled.
        let Some(locals) = xmit.blocks[idx].locals.clone() else {
            return Ok(());
        };
        if locals.result.iter().any(|i| i.item_type == item_type::ICV) {
            return Ok(());
        }
        let trailing_idx = Self::find_trailing(&xmit.blocks, locals.correlator, idx)
            .ok_or(BpError::Security("ba trailer missing"))?;

        let icv = self.compute_icv(bundle, &xmit.blocks, trailing_idx)?;

        let trailing = &mut xmit.blocks[trailing_idx];
        let mut tlocals =
            trailing.locals.clone().ok_or(BpError::Security("ba trailer missing locals"))?;
        for item in &mut tlocals.result {
            if item.item_type == item_type::ICV {
                item.value.clone_from(&icv);
            }
        }
        let data = encode_security_data(&tlocals);
        trailing.set_data(&data);
        trailing.locals = Some(tlocals);
        Ok(())
    }

    fn validate(&self, bundle: &Bundle, blocks: &mut BlockInfoVec, idx: usize) -> BlockValidation {
        let Some(locals) = blocks[idx].locals.clone() else {
            return fail();
        };
        if locals.result.iter().any(|i| i.item_type == item_type::ICV) {
            // The trailer is checked from the leading block.
            return BlockValidation::Ok;
        }
        let Some(trailing_idx) = Self::find_trailing(blocks, locals.correlator, idx) else {
            log::warn!("ba1: {} has unpaired authentication block", bundle);
            return fail();
        };
        let Some(expected) = blocks[trailing_idx]
            .locals
            .as_ref()
            .and_then(|l| find_item(&l.result, item_type::ICV))
            .map(<[u8]>::to_vec)
        else {
            return fail();
        };

        match self.compute_icv(bundle, blocks, trailing_idx) {
            Ok(icv) if icv == expected => BlockValidation::Ok,
            Ok(_) => {
                log::warn!("ba1: {} failed authentication", bundle);
                fail()
            }
            Err(e) => {
                log::warn!("ba1: {} cannot verify: {}", bundle, e);
                fail()
            }
        }
    }
}

fn fail() -> BlockValidation {
    BlockValidation::Fail {
        reception: ReceptionReason::SecurityFailed,
        deletion: ReceptionReason::SecurityFailed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::StaticKeySteward;
    use petrel_bp::payload::BundlePayload;
    use petrel_bp::{BundleProtocol, EndpointId, ProcessorRegistry};

    fn protocol(key: &[u8]) -> BundleProtocol {
        let steward = Arc::new(StaticKeySteward::new());
        steward.set_hmac_key(&EndpointId::parse("*:*").expect("parse"), 7, key.to_vec());
        let mut registry = ProcessorRegistry::new();
        let policy = SecurityPolicy { ba1: true, ba1_key_id: 7, ..Default::default() };
        crate::register(&mut registry, steward, policy);
        BundleProtocol::new(Arc::new(registry))
    }

    fn sample_bundle() -> Bundle {
        let mut b = Bundle::new();
        b.source = EndpointId::parse("dtn://src/app").expect("parse");
        b.dest = EndpointId::parse("dtn://dst/app").expect("parse");
        b.lifetime_secs = 60;
        b.set_payload(BundlePayload::with_memory(b"authenticated payload".to_vec()));
        b
    }

    #[test]
    fn authenticated_roundtrip() {
        let bp = protocol(b"shared secret");
        let bundle = sample_bundle();
        let xmit = bp.prepare_blocks(&bundle, "l1").expect("prepare");

        let ba_count = xmit
            .blocks
            .iter()
            .filter(|b| b.block_type == block_type::BUNDLE_AUTHENTICATION)
            .count();
        assert_eq!(ba_count, 2);
        assert!(xmit.blocks.last().expect("blocks").block_type
            == block_type::BUNDLE_AUTHENTICATION);

        let wire = bp.produce_all(&bundle, &xmit).expect("produce");
        let parsed = bp.consume_all(&wire).expect("consume");
        bp.validate(&parsed).expect("validate");
    }

    #[test]
    fn tampered_payload_rejected() {
        let bp = protocol(b"shared secret");
        let bundle = sample_bundle();
        let xmit = bp.prepare_blocks(&bundle, "l1").expect("prepare");
        let mut wire = bp.produce_all(&bundle, &xmit).expect("produce");

        // Flip a byte of the payload, which sits just before the trailer.
        let n = wire.len();
        wire[n - ICV_LEN - 12] ^= 0xff;
        let parsed = bp.consume_all(&wire).expect("consume");
        let err = bp.validate(&parsed).expect_err("must fail");
        assert_eq!(err.0, ReceptionReason::SecurityFailed);
    }

    #[test]
    fn wrong_key_rejected() {
        let sender = protocol(b"sender key");
        let receiver = protocol(b"other key");
        let bundle = sample_bundle();
        let xmit = sender.prepare_blocks(&bundle, "l1").expect("prepare");
        let wire = sender.produce_all(&bundle, &xmit).expect("produce");
        let parsed = receiver.consume_all(&wire).expect("consume");
        assert!(receiver.validate(&parsed).is_err());
    }
}
