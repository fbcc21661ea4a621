use std::sync::Arc;

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes128Gcm, Key, KeyInit, Nonce, Tag};

use petrel_bp::block::{block_flags, block_type};
use petrel_bp::dictionary::Dictionary;
use petrel_bp::processor::{generic_consume, BlockListType, BlockProcessor, BlockValidation};
use petrel_bp::protocol::ReceptionReason;
use petrel_bp::{BlockInfo, BlockInfoVec, BpError, Bundle, SecurityItem, SecurityLocals, XmitBlocks};

use crate::ciphersuite;
use crate::items::{find_item, item_type};
use crate::keys::KeySteward;
use crate::pc3::{fresh_material, nonce_from, unwrap_key, CEK_LEN, TAG_LEN};
use crate::suite::{decode_security_data, encode_security_data, SecurityPolicy};

fn encapsulatable(bt: u8) -> bool {
    !matches!(
        bt,
        block_type::PRIMARY
            | block_type::PAYLOAD
            | block_type::BUNDLE_AUTHENTICATION
            | block_type::PAYLOAD_INTEGRITY
            | block_type::PAYLOAD_CONFIDENTIALITY
            | block_type::EXTENSION_SECURITY
    )
}

/// ES4: extension-block confidentiality. Each eligible extension block is
/// replaced by a security block whose result carries the AES-GCM
/// encapsulation of the original block's wire image; the content key is
/// wrapped for the security destination as in PC3.
pub struct EsBlockProcessor {
    steward: Arc<dyn KeySteward>,
    policy: SecurityPolicy,
}

impl EsBlockProcessor {
    pub fn new(steward: Arc<dyn KeySteward>, policy: SecurityPolicy) -> Self {
        Self { steward, policy }
    }
}

impl BlockProcessor for EsBlockProcessor {
    fn block_type(&self) -> u8 {
        block_type::EXTENSION_SECURITY
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
                locals.security_dest = Some(block.eid_refs[0].clone());
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
            let mut block = src.clone();
            block.clear_flag(block_flags::LAST_BLOCK);
            xmit.blocks.insert(1, block);
            return Ok(());
        }
        if !self.policy.es4 || self.steward.agreement_public(&bundle.dest).is_none() {
            return Ok(());
        }

        // Swap every eligible extension block for an encapsulation shell
        // carrying the original's wire image; the image is encrypted during
        // generation. Blocks with nothing serialized yet are left alone.
        for block in xmit.blocks.iter_mut() {
            if !encapsulatable(block.block_type) || block.contents.is_empty() {
                continue;
            }
            let plain = block.contents.clone();
            let mut shell = BlockInfo::new(block_type::EXTENSION_SECURITY);
            shell.eid_refs.push(bundle.dest.clone());
            shell.locals = Some(SecurityLocals {
                ciphersuite: ciphersuite::ES4,
                security_dest: Some(bundle.dest.clone()),
                result: vec![SecurityItem {
                    item_type: item_type::ENCAPSULATED_BLOCK,
                    value: plain,
                }],
                session_key: vec![1],
                ..Default::default()
            });
            *block = shell;
        }
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
        let mut locals = xmit.blocks[idx]
            .locals
            .clone()
            .ok_or(BpError::Security("es block missing locals"))?;

        if !locals.session_key.is_empty() {
            let dest =
                locals.security_dest.clone().unwrap_or_else(|| bundle.dest.clone());
            let dest_pub = self
                .steward
                .agreement_public(&dest)
                .ok_or(BpError::Security("no agreement key for destination"))?;
            let (cek, params) = fresh_material(&dest_pub)?;
            let iv = find_item(&params, item_type::IV)
                .ok_or(BpError::Security("es block missing iv"))?;
            let salt = find_item(&params, item_type::SALT)
                .ok_or(BpError::Security("es block missing salt"))?;
            let nonce = nonce_from(salt, iv)?;

            let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&cek));
            for item in &mut locals.result {
                if item.item_type == item_type::ENCAPSULATED_BLOCK {
                    let tag = cipher
                        .encrypt_in_place_detached(
                            Nonce::from_slice(&nonce),
                            b"",
                            &mut item.value,
                        )
                        .map_err(|_| BpError::Security("block encapsulation failed"))?;
                    item.value.extend_from_slice(&tag);
                }
            }
            locals.params = params;
            locals.session_key.clear();
        }

        let data = encode_security_data(&locals);
        let mut flags = block_flags::DISCARD_BLOCK_ONERROR;
        if last {
            flags |= block_flags::LAST_BLOCK;
        }
        let block = &mut xmit.blocks[idx];
        block.generate_preamble(
            &mut xmit.dict,
            block_type::EXTENSION_SECURITY,
            flags,
            data.len() as u64,
        );
        block.set_data(&data);
        block.locals = Some(locals);
        Ok(())
    }

    fn validate(&self, bundle: &Bundle, blocks: &mut BlockInfoVec, idx: usize) -> BlockValidation {
        let Some(locals) = blocks[idx].locals.clone() else {
            return fail();
        };
        let (Some(iv), Some(salt), Some(key_info), Some(ct)) = (
            find_item(&locals.params, item_type::IV),
            find_item(&locals.params, item_type::SALT),
            find_item(&locals.params, item_type::KEY_INFO),
            find_item(&locals.result, item_type::ENCAPSULATED_BLOCK),
        ) else {
            log::warn!("es4: {} encapsulation block missing fields", bundle);
            return fail();
        };
        if ct.len() < TAG_LEN {
            return fail();
        }

        let restored = (|| -> Result<BlockInfo, BpError> {
            let cek = unwrap_key(key_info, self.steward.as_ref())?;
            debug_assert_eq!(cek.len(), CEK_LEN);
            let nonce = nonce_from(salt, iv)?;
            let split = ct.len() - TAG_LEN;
            let mut plain = ct[..split].to_vec();
            let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&cek));
            cipher
                .decrypt_in_place_detached(
                    Nonce::from_slice(&nonce),
                    b"",
                    &mut plain,
                    Tag::from_slice(&ct[split..]),
                )
                .map_err(|_| BpError::Security("block decapsulation failed"))?;

            let mut block = BlockInfo::new(0);
            block.contents = plain;
            if !block.try_parse_preamble(&Dictionary::new())? {
                return Err(BpError::Security("decapsulated block truncated"));
            }
            block.complete = true;
            Ok(block)
        })();

        match restored {
            Ok(mut block) => {
                // The shell's position in the list is inherited; the last
                // flag belongs to whatever actually ends the bundle.
                block.clear_flag(block_flags::LAST_BLOCK);
                if blocks[idx].last_block() {
                    block.set_flag(block_flags::LAST_BLOCK);
                }
                blocks[idx] = block;
                BlockValidation::Ok
            }
            Err(e) => {
                log::warn!("es4: {} {}", bundle, e);
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
    use x25519_dalek::{PublicKey, StaticSecret};

    fn protocol_pair() -> (BundleProtocol, BundleProtocol) {
        let dest_secret = StaticSecret::from([0x31; 32]);
        let dest_public = PublicKey::from(&dest_secret);
        let dest = EndpointId::parse("dtn://dst/app").expect("parse");

        let sender_steward = Arc::new(StaticKeySteward::new());
        sender_steward.set_agreement_public(&dest, dest_public);
        let receiver_steward = Arc::new(StaticKeySteward::new());
        receiver_steward.set_agreement_secret(dest_secret);

        let policy = SecurityPolicy { es4: true, ..Default::default() };
        let mut sreg = ProcessorRegistry::new();
        crate::register(&mut sreg, sender_steward, policy.clone());
        let mut rreg = ProcessorRegistry::new();
        crate::register(&mut rreg, receiver_steward, policy);
        (BundleProtocol::new(Arc::new(sreg)), BundleProtocol::new(Arc::new(rreg)))
    }

    fn bundle_with_extension() -> Bundle {
        let mut b = Bundle::new();
        b.source = EndpointId::parse("dtn://src/app").expect("parse");
        b.dest = EndpointId::parse("dtn://dst/app").expect("parse");
        b.lifetime_secs = 60;
        b.set_payload(BundlePayload::with_memory(b"plain payload".to_vec()));
        {
            let mut state = b.state();
            let mut dict = Dictionary::new();
            let mut ext = BlockInfo::new(0x55);
            ext.generate_preamble(&mut dict, 0x55, 0, 6);
            ext.set_data(b"secret");
            state.api_blocks.push(ext);
        }
        b
    }

    #[test]
    fn extension_block_encapsulated_and_restored() {
        let (sender, receiver) = protocol_pair();
        let bundle = bundle_with_extension();
        let xmit = sender.prepare_blocks(&bundle, "l1").expect("prepare");

        assert!(
            xmit.blocks.iter().all(|b| b.block_type != 0x55),
            "extension must not ride in the clear"
        );
        assert!(xmit.blocks.iter().any(|b| b.block_type == block_type::EXTENSION_SECURITY));

        let wire = sender.produce_all(&bundle, &xmit).expect("produce");
        assert!(!wire.windows(6).any(|w| w == b"secret"));

        let parsed = receiver.consume_all(&wire).expect("consume");
        receiver.validate(&parsed).expect("validate");
        let state = parsed.state();
        let restored = state.recv_blocks.iter().find(|b| b.block_type == 0x55).expect("restored");
        assert_eq!(restored.data(), b"secret");
    }
}
