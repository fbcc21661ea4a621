use std::collections::HashMap;
use std::sync::Mutex;

use ed25519_dalek::{SigningKey, VerifyingKey};
use petrel_bp::EndpointId;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Key lookup boundary for the security subsystem.
///
/// Deployments bind this to real key storage; tests substitute
/// deterministic material.
pub trait KeySteward: Send + Sync {
    /// Preshared HMAC key for `peer`, by key id. Used by BA1 and the LTP
    /// segment authentication trailer.
    fn hmac_key(&self, peer: &EndpointId, key_id: u64) -> Option<Zeroizing<Vec<u8>>>;

    /// Our signing key, for outbound integrity blocks.
    fn signing_key(&self) -> Option<SigningKey>;

    /// Verification key published by `source`.
    fn verify_key(&self, source: &EndpointId) -> Option<VerifyingKey>;

    /// Key-agreement public key for `dest`, used to wrap content keys.
    fn agreement_public(&self, dest: &EndpointId) -> Option<PublicKey>;

    /// Our key-agreement secret, used to unwrap inbound content keys.
    fn agreement_secret(&self) -> Option<StaticSecret>;
}

/// In-memory steward populated from configuration.
#[derive(Default)]
pub struct StaticKeySteward {
    hmac_keys: Mutex<HashMap<(String, u64), Vec<u8>>>,
    signing: Mutex<Option<SigningKey>>,
    verify_keys: Mutex<HashMap<String, VerifyingKey>>,
    agreement_publics: Mutex<HashMap<String, PublicKey>>,
    agreement: Mutex<Option<StaticSecret>>,
}

impl StaticKeySteward {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_hmac_key(&self, peer: &EndpointId, key_id: u64, key: Vec<u8>) {
        self.hmac_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((peer.to_string(), key_id), key);
    }

    pub fn set_signing_key(&self, key: SigningKey) {
        *self.signing.lock().unwrap_or_else(|e| e.into_inner()) = Some(key);
    }

    pub fn set_verify_key(&self, source: &EndpointId, key: VerifyingKey) {
        self.verify_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(source.to_string(), key);
    }

    pub fn set_agreement_public(&self, dest: &EndpointId, key: PublicKey) {
        self.agreement_publics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(dest.to_string(), key);
    }

    pub fn set_agreement_secret(&self, secret: StaticSecret) {
        *self.agreement.lock().unwrap_or_else(|e| e.into_inner()) = Some(secret);
    }
}

impl KeySteward for StaticKeySteward {
    fn hmac_key(&self, peer: &EndpointId, key_id: u64) -> Option<Zeroizing<Vec<u8>>> {
        let keys = self.hmac_keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.get(&(peer.to_string(), key_id))
            .or_else(|| keys.get(&("*:*".to_string(), key_id)))
            .cloned()
            .map(Zeroizing::new)
    }

    fn signing_key(&self) -> Option<SigningKey> {
        self.signing.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn verify_key(&self, source: &EndpointId) -> Option<VerifyingKey> {
        self.verify_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&source.to_string())
            .copied()
    }

    fn agreement_public(&self, dest: &EndpointId) -> Option<PublicKey> {
        self.agreement_publics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&dest.to_string())
            .copied()
    }

    fn agreement_secret(&self) -> Option<StaticSecret> {
        self.agreement.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_lookup_with_wildcard_fallback() {
        let steward = StaticKeySteward::new();
        let peer = EndpointId::parse("dtn://peer").expect("parse");
        let other = EndpointId::parse("dtn://other").expect("parse");
        let wildcard = EndpointId::parse("*:*").expect("parse");

        steward.set_hmac_key(&peer, 1, b"peerkey".to_vec());
        steward.set_hmac_key(&wildcard, 1, b"anykey".to_vec());

        assert_eq!(steward.hmac_key(&peer, 1).expect("key").as_slice(), b"peerkey");
        assert_eq!(steward.hmac_key(&other, 1).expect("key").as_slice(), b"anykey");
        assert!(steward.hmac_key(&peer, 9).is_none());
    }
}
