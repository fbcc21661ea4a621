use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::block::{BlockInfoVec, XmitBlocks};
use crate::eid::EndpointId;
use crate::payload::BundlePayload;
use crate::timestamp::BundleTimestamp;

static NEXT_BUNDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Class of service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    Bulk,
    #[default]
    Normal,
    Expedited,
    Reserved,
}

impl Priority {
    pub fn from_cos_bits(bits: u64) -> Self {
        match bits & 0x3 {
            0 => Priority::Bulk,
            1 => Priority::Normal,
            2 => Priority::Expedited,
            _ => Priority::Reserved,
        }
    }

    pub fn cos_bits(self) -> u64 {
        match self {
            Priority::Bulk => 0,
            Priority::Normal => 1,
            Priority::Expedited => 2,
            Priority::Reserved => 3,
        }
    }
}

/// Where a forwarding-log entry ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    InFlight,
    Transmitted,
    TransmitFailed,
    Delivered,
}

#[derive(Debug, Clone)]
pub struct ForwardLogEntry {
    pub link: String,
    pub state: ForwardState,
    pub at: BundleTimestamp,
}

/// The mutable subset of a bundle, guarded by one lock.
#[derive(Debug, Default)]
pub struct BundleState {
    pub custodian: EndpointId,
    pub payload: BundlePayload,
    pub recv_blocks: BlockInfoVec,
    pub api_blocks: BlockInfoVec,
    pub xmit_blocks: HashMap<String, XmitBlocks>,
    pub fwd_log: Vec<ForwardLogEntry>,
    /// Accumulated age in seconds carried by an age block.
    pub age_secs: u64,
}

/// A bundle. Immutable after creation except for the fields the protocol
/// explicitly mutates, which live in [`BundleState`] behind the lock.
#[derive(Debug)]
pub struct Bundle {
    id: u64,
    pub source: EndpointId,
    pub dest: EndpointId,
    pub replyto: EndpointId,
    pub priority: Priority,
    pub custody_requested: bool,
    pub singleton_dest: bool,
    pub app_ack_requested: bool,
    pub do_not_fragment: bool,
    pub is_admin: bool,
    pub receive_rcpt: bool,
    pub custody_rcpt: bool,
    pub forward_rcpt: bool,
    pub delivery_rcpt: bool,
    pub deletion_rcpt: bool,
    pub creation_ts: BundleTimestamp,
    pub lifetime_secs: u64,
    pub is_fragment: bool,
    pub frag_offset: u64,
    /// Original application data unit length; equals payload length for
    /// non-fragments.
    pub orig_length: u64,
    pub received_at: Instant,
    state: Mutex<BundleState>,
}

pub type BundleRef = Arc<Bundle>;

impl Default for Bundle {
    fn default() -> Self {
        Self::new()
    }
}

impl Bundle {
    pub fn new() -> Self {
        Self {
            id: NEXT_BUNDLE_ID.fetch_add(1, Ordering::Relaxed),
            source: EndpointId::null(),
            dest: EndpointId::null(),
            replyto: EndpointId::null(),
            priority: Priority::Normal,
            custody_requested: false,
            singleton_dest: true,
            app_ack_requested: false,
            do_not_fragment: false,
            is_admin: false,
            receive_rcpt: false,
            custody_rcpt: false,
            forward_rcpt: false,
            delivery_rcpt: false,
            deletion_rcpt: false,
            creation_ts: BundleTimestamp::now(),
            lifetime_secs: 0,
            is_fragment: false,
            frag_offset: 0,
            orig_length: 0,
            received_at: Instant::now(),
            state: Mutex::new(BundleState::default()),
        }
    }

    /// Process-local bundle id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> MutexGuard<'_, BundleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_payload(&self, payload: BundlePayload) {
        self.state().payload = payload;
    }

    pub fn payload_len(&self) -> u64 {
        self.state().payload.len()
    }

    pub fn custodian(&self) -> EndpointId {
        self.state().custodian.clone()
    }

    pub fn set_custodian(&self, eid: EndpointId) {
        self.state().custodian = eid;
    }

    /// Global identity of the bundle on the wire: source, creation
    /// timestamp, and fragment coordinates.
    pub fn gbofid(&self) -> String {
        if self.is_fragment {
            format!(
                "{}|{}|{}|{}",
                self.source, self.creation_ts, self.frag_offset, self.orig_length
            )
        } else {
            format!("{}|{}", self.source, self.creation_ts)
        }
    }

    /// Identity of the original bundle this one is (a fragment of).
    pub fn orig_gbofid(&self) -> String {
        format!("{}|{}", self.source, self.creation_ts)
    }

    /// Seconds until expiration, or zero if already expired. A zero
    /// creation timestamp defers to the age block.
    pub fn time_to_expiration(&self) -> u64 {
        if self.creation_ts.secs == 0 {
            let aged = self.state().age_secs + self.received_at.elapsed().as_secs();
            return self.lifetime_secs.saturating_sub(aged);
        }
        let expires = self.creation_ts.secs + self.lifetime_secs;
        expires.saturating_sub(BundleTimestamp::current_secs())
    }

    pub fn expired(&self) -> bool {
        self.time_to_expiration() == 0
    }

    pub fn add_fwd_log(&self, link: &str, fwd_state: ForwardState) {
        self.state().fwd_log.push(ForwardLogEntry {
            link: link.to_string(),
            state: fwd_state,
            at: BundleTimestamp::now(),
        });
    }
}

impl std::fmt::Display for Bundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bundle-{} [{} -> {}]", self.id, self.source, self.dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = Bundle::new();
        let b = Bundle::new();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn expiration_window() {
        let mut b = Bundle::new();
        b.lifetime_secs = 3600;
        assert!(!b.expired());
        assert!(b.time_to_expiration() > 3590);

        let mut expired = Bundle::new();
        expired.creation_ts = BundleTimestamp::new(1, 0);
        expired.lifetime_secs = 1;
        assert!(expired.expired());
    }

    #[test]
    fn clockless_bundle_uses_age() {
        let mut b = Bundle::new();
        b.creation_ts = BundleTimestamp::new(0, 0);
        b.lifetime_secs = 100;
        b.state().age_secs = 40;
        let ttl = b.time_to_expiration();
        assert!(ttl <= 60, "age counts against lifetime, got {ttl}");
    }

    #[test]
    fn gbofid_distinguishes_fragments() {
        let mut b = Bundle::new();
        b.source = EndpointId::parse("dtn://src").expect("parse");
        let plain = b.gbofid();
        b.is_fragment = true;
        b.frag_offset = 100;
        b.orig_length = 1000;
        assert_ne!(plain, b.gbofid());
        assert_eq!(plain, b.orig_gbofid());
    }
}
