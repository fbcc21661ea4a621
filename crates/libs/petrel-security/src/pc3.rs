use std::sync::Arc;

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes128Gcm, Key, KeyInit, Nonce, Tag};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};

use petrel_bp::block::{block_flags, block_type};
use petrel_bp::dictionary::Dictionary;
use petrel_bp::processor::{generic_consume, BlockListType, BlockProcessor, BlockValidation};
use petrel_bp::protocol::ReceptionReason;
use petrel_bp::{BlockInfo, BlockInfoVec, BpError, Bundle, SecurityItem, SecurityLocals, XmitBlocks};

use crate::ciphersuite;
use crate::items::{find_item, item_type};
use crate::keys::KeySteward;
use crate::suite::{decode_security_data, encode_security_data, SecurityPolicy};

pub(crate) const CEK_LEN: usize = 16;
pub(crate) const IV_LEN: usize = 8;
pub(crate) const SALT_LEN: usize = 4;
pub(crate) const TAG_LEN: usize = 16;
const KEK_INFO: &[u8] = b"petrel-pc-kek";

/// Wrapped content key: ephemeral agreement public key, then the key
/// ciphertext and its tag.
pub(crate) const KEY_INFO_LEN: usize = 32 + CEK_LEN + TAG_LEN;

pub(crate) fn derive_kek(shared: &[u8; 32]) -> [u8; CEK_LEN] {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut kek = [0u8; CEK_LEN];
    // Output length is fixed and valid for SHA-256.
    let _ = hk.expand(KEK_INFO, &mut kek);
    kek
}

/// Wrap `cek` for `dest_pub` with an ephemeral X25519 agreement.
pub(crate) fn wrap_key(cek: &[u8; CEK_LEN], dest_pub: &PublicKey) -> Result<Vec<u8>, BpError> {
    let eph = EphemeralSecret::random_from_rng(OsRng);
    let eph_pub = PublicKey::from(&eph);
    let shared = eph.diffie_hellman(dest_pub);
    let kek = derive_kek(shared.as_bytes());

    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&kek));
    let mut wrapped = cek.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&[0u8; 12]), b"", &mut wrapped)
        .map_err(|_| BpError::Security("key wrap failed"))?;

    let mut out = Vec::with_capacity(KEY_INFO_LEN);
    out.extend_from_slice(eph_pub.as_bytes());
    out.extend_from_slice(&wrapped);
    out.extend_from_slice(&tag);
    Ok(out)
}

/// Unwrap a key-info field with our agreement secret.
pub(crate) fn unwrap_key(
    key_info: &[u8],
    steward: &dyn KeySteward,
) -> Result<[u8; CEK_LEN], BpError> {
    if key_info.len() != KEY_INFO_LEN {
        return Err(BpError::Security("bad key-info length"));
    }
    let secret = steward.agreement_secret().ok_or(BpError::Security("no agreement secret"))?;
    let mut eph_pub = [0u8; 32];
    eph_pub.copy_from_slice(&key_info[..32]);
    let shared = secret.diffie_hellman(&PublicKey::from(eph_pub));
    let kek = derive_kek(shared.as_bytes());

    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&kek));
    let mut cek = key_info[32..32 + CEK_LEN].to_vec();
    let tag = Tag::from_slice(&key_info[32 + CEK_LEN..]);
    cipher
        .decrypt_in_place_detached(Nonce::from_slice(&[0u8; 12]), b"", &mut cek, tag)
        .map_err(|_| BpError::Security("key unwrap failed"))?;
    let mut out = [0u8; CEK_LEN];
    out.copy_from_slice(&cek);
    Ok(out)
}

pub(crate) fn nonce_from(salt: &[u8], iv: &[u8]) -> Result<[u8; 12], BpError> {
    if salt.len() != SALT_LEN || iv.len() != IV_LEN {
        return Err(BpError::Security("bad iv or salt length"));
    }
    let mut nonce = [0u8; 12];
    nonce[..SALT_LEN].copy_from_slice(salt);
    nonce[SALT_LEN..].copy_from_slice(iv);
    Ok(nonce)
}

/// Fresh (cek, iv, salt, key-info-params) for one encryption operation.
pub(crate) fn fresh_material(
    dest_pub: &PublicKey,
) -> Result<([u8; CEK_LEN], Vec<SecurityItem>), BpError> {
    let mut cek = [0u8; CEK_LEN];
    OsRng.fill_bytes(&mut cek);
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let key_info = wrap_key(&cek, dest_pub)?;

    let params = vec![
        SecurityItem { item_type: item_type::IV, value: iv.to_vec() },
        SecurityItem { item_type: item_type::SALT, value: salt.to_vec() },
        SecurityItem { item_type: item_type::KEY_INFO, value: key_info },
    ];
    Ok((cek, params))
}

/// PC3: payload confidentiality. AES-GCM-128 over the payload bytes with a
/// per-bundle content-encryption key wrapped for the security destination;
/// the tag rides in the security result.
pub struct PcBlockProcessor {
    steward: Arc<dyn KeySteward>,
    policy: SecurityPolicy,
}

impl PcBlockProcessor {
    pub fn new(steward: Arc<dyn KeySteward>, policy: SecurityPolicy) -> Self {
        Self { steward, policy }
    }
}

impl BlockProcessor for PcBlockProcessor {
    fn block_type(&self) -> u8 {
        block_type::PAYLOAD_CONFIDENTIALITY
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
        if !self.policy.pc3 {
            return Ok(());
        }
        if self.steward.agreement_public(&bundle.dest).is_none() {
            log::warn!("pc3: {} no agreement key for {}, sending in clear", bundle, bundle.dest);
            return Ok(());
        }
        let mut block = BlockInfo::new(block_type::PAYLOAD_CONFIDENTIALITY);
        block.eid_refs.push(bundle.dest.clone());
        block.locals = Some(SecurityLocals {
            ciphersuite: ciphersuite::PC3,
            security_dest: Some(bundle.dest.clone()),
            result: vec![SecurityItem { item_type: item_type::ICV, value: vec![0u8; TAG_LEN] }],
            session_key: vec![1],
            ..Default::default()
        });
        xmit.blocks.insert(1, block);
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
            .ok_or(BpError::Security("pc block missing locals"))?;

        if !locals.session_key.is_empty() && locals.params.is_empty() {
            let dest = locals
                .security_dest
                .clone()
                .unwrap_or_else(|| bundle.dest.clone());
            let dest_pub = self
                .steward
                .agreement_public(&dest)
                .ok_or(BpError::Security("no agreement key for destination"))?;
            let (cek, params) = fresh_material(&dest_pub)?;
            locals.params = params;
            locals.session_key = cek.to_vec();
        }

        let data = encode_security_data(&locals);
        let mut flags = block_flags::DELETE_BUNDLE_ONERROR;
        if last {
            flags |= block_flags::LAST_BLOCK;
        }
        let block = &mut xmit.blocks[idx];
        block.generate_preamble(
            &mut xmit.dict,
            block_type::PAYLOAD_CONFIDENTIALITY,
            flags,
            data.len() as u64,
        );
        block.set_data(&data);
        block.locals = Some(locals);
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
        if locals.session_key.len() != CEK_LEN {
            // Forwarded block or no key: nothing to encrypt here.
            return Ok(());
        }

        let iv = find_item(&locals.params, item_type::IV)
            .ok_or(BpError::Security("pc block missing iv"))?;
        let salt = find_item(&locals.params, item_type::SALT)
            .ok_or(BpError::Security("pc block missing salt"))?;
        let nonce = nonce_from(salt, iv)?;

        let mut payload = bundle.state().payload.read_all()?;
        let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&locals.session_key));
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut payload)
            .map_err(|_| BpError::Security("payload encryption failed"))?;
        bundle.state().payload.set_data(payload)?;

        for item in &mut locals.result {
            if item.item_type == item_type::ICV {
                item.value = tag.to_vec();
            }
        }
        locals.session_key.clear();
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
        let (Some(iv), Some(salt), Some(key_info), Some(tag_bytes)) = (
            find_item(&locals.params, item_type::IV),
            find_item(&locals.params, item_type::SALT),
            find_item(&locals.params, item_type::KEY_INFO),
            find_item(&locals.result, item_type::ICV),
        ) else {
            log::warn!("pc3: {} confidentiality block missing fields", bundle);
            return fail();
        };
        if tag_bytes.len() != TAG_LEN {
            return fail();
        }

        let outcome = (|| -> Result<(), BpError> {
            let cek = unwrap_key(key_info, self.steward.as_ref())?;
            let nonce = nonce_from(salt, iv)?;
            let mut payload = bundle.state().payload.read_all()?;
            let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&cek));
            cipher
                .decrypt_in_place_detached(
                    Nonce::from_slice(&nonce),
                    b"",
                    &mut payload,
                    Tag::from_slice(tag_bytes),
                )
                .map_err(|_| BpError::Security("payload decryption failed"))?;
            bundle.state().payload.set_data(payload)?;
            Ok(())
        })();

        match outcome {
            Ok(()) => BlockValidation::Ok,
            Err(e) => {
                log::warn!("pc3: {} {}", bundle, e);
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
    use x25519_dalek::StaticSecret;

    fn protocol_pair() -> (BundleProtocol, BundleProtocol) {
        let dest_secret = StaticSecret::from([0x42; 32]);
        let dest_public = PublicKey::from(&dest_secret);
        let dest = EndpointId::parse("dtn://dst/app").expect("parse");

        let sender_steward = Arc::new(StaticKeySteward::new());
        sender_steward.set_agreement_public(&dest, dest_public);
        let receiver_steward = Arc::new(StaticKeySteward::new());
        receiver_steward.set_agreement_secret(dest_secret);

        let policy = SecurityPolicy { pc3: true, ..Default::default() };
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
    fn key_wrap_roundtrip() {
        let secret = StaticSecret::from([9u8; 32]);
        let steward = StaticKeySteward::new();
        steward.set_agreement_secret(secret.clone());
        let cek = [0xcd; CEK_LEN];
        let wrapped = wrap_key(&cek, &PublicKey::from(&secret)).expect("wrap");
        assert_eq!(wrapped.len(), KEY_INFO_LEN);
        assert_eq!(unwrap_key(&wrapped, &steward).expect("unwrap"), cek);
    }

    #[test]
    fn encrypted_roundtrip() {
        let (sender, receiver) = protocol_pair();
        let bundle = sample_bundle(b"very secret payload");
        let xmit = sender.prepare_blocks(&bundle, "l1").expect("prepare");
        let wire = sender.produce_all(&bundle, &xmit).expect("produce");

        // The wire image must not leak the plaintext.
        assert!(!wire.windows(11).any(|w| w == b"very secret"));

        let parsed = receiver.consume_all(&wire).expect("consume");
        receiver.validate(&parsed).expect("validate");
        assert_eq!(
            parsed.state().payload.read_all().expect("read"),
            b"very secret payload"
        );
    }

    #[test]
    fn wrong_recipient_cannot_decrypt() {
        let (sender, _) = protocol_pair();
        let bundle = sample_bundle(b"very secret payload");
        let xmit = sender.prepare_blocks(&bundle, "l1").expect("prepare");
        let wire = sender.produce_all(&bundle, &xmit).expect("produce");

        let other_steward = Arc::new(StaticKeySteward::new());
        other_steward.set_agreement_secret(StaticSecret::from([7u8; 32]));
        let mut reg = ProcessorRegistry::new();
        crate::register(
            &mut reg,
            other_steward,
            SecurityPolicy { pc3: true, ..Default::default() },
        );
        let other = BundleProtocol::new(Arc::new(reg));

        let parsed = other.consume_all(&wire).expect("consume");
        let err = other.validate(&parsed).expect_err("must fail");
        assert_eq!(err.0, ReceptionReason::SecurityFailed);
    }
}
