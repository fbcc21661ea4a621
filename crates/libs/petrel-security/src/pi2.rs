use std::sync::Arc;

use ed25519_dalek::{Signature, Signer, Verifier};
use sha2::{Digest, Sha256};

use petrel_bp::block::{block_flags, block_type};
use petrel_bp::dictionary::Dictionary;
use petrel_bp::processor::{generic_consume, BlockListType, BlockProcessor, BlockValidation};
use petrel_bp::protocol::ReceptionReason;
use petrel_bp::{BlockInfo, BlockInfoVec, BpError, Bundle, SecurityItem, SecurityLocals, XmitBlocks};

use crate::ciphersuite;
use crate::items::{find_item, item_type};
use crate::keys::KeySteward;
use crate::suite::{decode_security_data, encode_security_data, SecurityPolicy};

const SIG_LEN: usize = 64;

/// PI2: end-to-end payload integrity. One block carrying an Ed25519
/// signature over a canonical digest of the bundle's immutable identity and
/// payload bytes; fields a forwarding hop may rewrite (custodian,
/// dictionary layout) are excluded from the digest.
pub struct PiBlockProcessor {
    steward: Arc<dyn KeySteward>,
    policy: SecurityPolicy,
}

impl PiBlockProcessor {
    pub fn new(steward: Arc<dyn KeySteward>, policy: SecurityPolicy) -> Self {
        Self { steward, policy }
    }

    fn canonical_digest(bundle: &Bundle) -> Result<[u8; 32], BpError> {
        let mut hasher = Sha256::new();
        hasher.update(bundle.source.to_string().as_bytes());
        hasher.update([0]);
        hasher.update(bundle.dest.to_string().as_bytes());
        hasher.update([0]);
        hasher.update(bundle.creation_ts.secs.to_be_bytes());
        hasher.update(bundle.creation_ts.seqno.to_be_bytes());
        hasher.update(bundle.lifetime_secs.to_be_bytes());
        if bundle.is_fragment {
            hasher.update(bundle.frag_offset.to_be_bytes());
            hasher.update(bundle.orig_length.to_be_bytes());
        }
        let payload = bundle.state().payload.read_all()?;
        hasher.update(&payload);
        Ok(hasher.finalize().into())
    }
}

impl BlockProcessor for PiBlockProcessor {
    fn block_type(&self) -> u8 {
        block_type::PAYLOAD_INTEGRITY
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
            let mut locals = decode_security_data(block.data())?;
            if !block.eid_refs.is_empty() {
                locals.security_src = Some(block.eid_refs[0].clone());
            }
            block.locals = Some(locals);
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
        if let Some(src) = source {
            // Forwarded end-to-end block: carry it unchanged.
            let mut block = src.clone();
            block.clear_flag(block_flags::LAST_BLOCK);
            xmit.blocks.insert(1, block);
            return Ok(());
        }
        if !self.policy.pi2 || self.steward.signing_key().is_none() {
            return Ok(());
        }
        let mut block = BlockInfo::new(block_type::PAYLOAD_INTEGRITY);
        block.eid_refs.push(bundle.source.clone());
        block.locals = Some(SecurityLocals {
            ciphersuite: ciphersuite::PI2,
            result: vec![SecurityItem { item_type: item_type::ICV, value: vec![0u8; SIG_LEN] }],
            security_src: Some(bundle.source.clone()),
            // Marks the block as locally originated so finalize signs it;
            // forwarded copies keep their received signature.
            session_key: vec![1],
            ..Default::default()
        });
        xmit.blocks.insert(1, block);
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
        let Some(locals) = xmit.blocks[idx].locals.clone() else {
            // Forwarded copy: re-emit the received image.
            let (data, flags) = {
                let b = &xmit.blocks[idx];
                (b.data().to_vec(), b.flags & !(block_flags::LAST_BLOCK | block_flags::EID_REFS))
            };
            let flags = if last { flags | block_flags::LAST_BLOCK } else { flags };
            let block = &mut xmit.blocks[idx];
            block.generate_preamble(
                &mut xmit.dict,
                block_type::PAYLOAD_INTEGRITY,
                flags,
                data.len() as u64,
            );
            block.set_data(&data);
            return Ok(());
        };

        let data = encode_security_data(&locals);
        let mut flags = block_flags::DISCARD_BLOCK_ONERROR;
        if last {
            flags |= block_flags::LAST_BLOCK;
        }
        let block = &mut xmit.blocks[idx];
        block.generate_preamble(
            &mut xmit.dict,
            block_type::PAYLOAD_INTEGRITY,
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
        let Some(mut locals) = xmit.blocks[idx].locals.clone() else {
            return Ok(());
        };
        if locals.session_key.is_empty() {
            // Forwarded block: the origin's signature stands.
            return Ok(());
        }
        let Some(key) = self.steward.signing_key() else {
            return Err(BpError::Security("no signing key"));
        };

        let digest = Self::canonical_digest(bundle)?;
        let sig: Signature = key.sign(&digest);
        for item in &mut locals.result {
            if item.item_type == item_type::ICV {
                item.value = sig.to_bytes().to_vec();
            }
        }
        let data = encode_security_data(&locals);
        let block = &mut xmit.blocks[idx];
        block.set_data(&data);
        block.locals = Some(locals);
        Ok(())
    }

    fn validate(&self, bundle: &Bundle, blocks: &mut BlockInfoVec, idx: usize) -> BlockValidation {
        let Some(locals) = blocks[idx].locals.clone() else {
            return fail();
        };
        let signer = locals.security_src.clone().unwrap_or_else(|| bundle.source.clone());
        let Some(key) = self.steward.verify_key(&signer) else {
            log::warn!("pi2: {} no verification key for {}", bundle, signer);
            return fail();
        };
        let Some(sig_bytes) = find_item(&locals.result, item_type::ICV) else {
            return fail();
        };
        let Ok(sig) = Signature::from_slice(sig_bytes) else {
            return fail();
        };
        let Ok(digest) = Self::canonical_digest(bundle) else {
            return fail();
        };
        if key.verify(&digest, &sig).is_err() {
            log::warn!("pi2: {} signature verification failed", bundle);
            return fail();
        }
        BlockValidation::Ok
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
    use ed25519_dalek::SigningKey;
    use petrel_bp::payload::BundlePayload;
    use petrel_bp::{BundleProtocol, EndpointId, ProcessorRegistry};

    fn protocol_pair() -> (BundleProtocol, BundleProtocol) {
        let signing = SigningKey::from_bytes(&[0x11; 32]);
        let verifying = signing.verifying_key();
        let source = EndpointId::parse("dtn://src/app").expect("parse");

        let sender_steward = Arc::new(StaticKeySteward::new());
        sender_steward.set_signing_key(signing);
        let receiver_steward = Arc::new(StaticKeySteward::new());
        receiver_steward.set_verify_key(&source, verifying);

        let policy = SecurityPolicy { pi2: true, ..Default::default() };
        let mut sreg = ProcessorRegistry::new();
        crate::register(&mut sreg, sender_steward, policy.clone());
        let mut rreg = ProcessorRegistry::new();
        crate::register(&mut rreg, receiver_steward, policy);
        (BundleProtocol::new(Arc::new(sreg)), BundleProtocol::new(Arc::new(rreg)))
    }

    fn sample_bundle(payload: &[u8]) -> Bundle {
        let mut b = Bundle::new();
        b.source = EndpointId::parse("dtn://src/app").expect("parse");
        b.dest = EndpointId::parse("dtn://dst/app").expect("parse");
        b.lifetime_secs = 60;
        b.set_payload(BundlePayload::with_memory(payload.to_vec()));
        b
    }

    #[test]
    fn signed_roundtrip() {
        let (sender, receiver) = protocol_pair();
        let bundle = sample_bundle(b"signed payload");
        let xmit = sender.prepare_blocks(&bundle, "l1").expect("prepare");
        assert!(xmit.blocks.iter().any(|b| b.block_type == block_type::PAYLOAD_INTEGRITY));

        let wire = sender.produce_all(&bundle, &xmit).expect("produce");
        let parsed = receiver.consume_all(&wire).expect("consume");
        receiver.validate(&parsed).expect("validate");
    }

    #[test]
    fn modified_payload_fails_verification() {
        let (sender, receiver) = protocol_pair();
        let bundle = sample_bundle(b"signed payload");
        let xmit = sender.prepare_blocks(&bundle, "l1").expect("prepare");
        let wire = sender.produce_all(&bundle, &xmit).expect("produce");

        let parsed = receiver.consume_all(&wire).expect("consume");
        parsed.state().payload = BundlePayload::with_memory(b"sIgned payload".to_vec());
        let err = receiver.validate(&parsed).expect_err("must fail");
        assert_eq!(err.0, ReceptionReason::SecurityFailed);
    }

    #[test]
    fn signature_survives_custodian_rewrite() {
        let (sender, receiver) = protocol_pair();
        let bundle = sample_bundle(b"signed payload");
        let xmit = sender.prepare_blocks(&bundle, "l1").expect("prepare");
        let wire = sender.produce_all(&bundle, &xmit).expect("produce");

        let parsed = receiver.consume_all(&wire).expect("consume");
        parsed.set_custodian(EndpointId::parse("dtn://hop1").expect("parse"));
        receiver.validate(&parsed).expect("custodian change must not break integrity");
    }
}
