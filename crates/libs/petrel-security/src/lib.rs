//! Security block processors.
//!
//! Four ciphersuites, each a [`petrel_bp::BlockProcessor`]:
//!
//! - **BA1** bundle authentication: HMAC-SHA1 over the whole bundle with a
//!   preshared key, split across a leading parameter block and a trailing
//!   ICV block tied by a correlator.
//! - **PI2** payload integrity: Ed25519 signature over a SHA-256 digest
//!   that walks the blocks in order, excluding its own security result.
//! - **PC3** payload confidentiality: AES-GCM-128 over the payload with a
//!   per-bundle content key wrapped for the security destination.
//! - **ES4** extension security: PC3's cryptography applied per extension
//!   block via encapsulation.
//!
//! Key material is resolved through the injectable [`KeySteward`] trait.

pub mod ba1;
pub mod es4;
pub mod items;
pub mod keys;
pub mod pc3;
pub mod pi2;

mod suite;

pub use keys::{KeySteward, StaticKeySteward};
pub use suite::{cs_flags, decode_security_data, encode_security_data, SecurityPolicy};

/// Ciphersuite numbers.
pub mod ciphersuite {
    pub const BA1: u8 = 1;
    pub const PI2: u8 = 2;
    pub const PC3: u8 = 3;
    pub const ES4: u8 = 4;
}

/// Register the enabled security processors and outbound policy on a
/// registry.
pub fn register(
    registry: &mut petrel_bp::ProcessorRegistry,
    steward: std::sync::Arc<dyn KeySteward>,
    policy: SecurityPolicy,
) {
    use petrel_bp::block::block_type;
    use std::sync::Arc;

    registry.register(Arc::new(ba1::BaBlockProcessor::new(steward.clone(), policy.clone())));
    registry.register(Arc::new(pi2::PiBlockProcessor::new(steward.clone(), policy.clone())));
    registry.register(Arc::new(pc3::PcBlockProcessor::new(steward.clone(), policy.clone())));
    registry.register(Arc::new(es4::EsBlockProcessor::new(steward, policy.clone())));

    // Order matters: integrity is applied inside confidentiality, and the
    // authentication trailer is outermost.
    if policy.pi2 {
        registry.add_outbound(block_type::PAYLOAD_INTEGRITY);
    }
    if policy.pc3 {
        registry.add_outbound(block_type::PAYLOAD_CONFIDENTIALITY);
    }
    if policy.es4 {
        registry.add_outbound(block_type::EXTENSION_SECURITY);
    }
    if policy.ba1 {
        registry.add_outbound(block_type::BUNDLE_AUTHENTICATION);
    }
}
