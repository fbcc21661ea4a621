use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use petrel_bp::BundleRef;

use crate::event::ContactDownReason;

/// Link lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Unavailable,
    Available,
    Opening,
    Open,
    Busy,
    Closed,
}

/// Administrative link parameters.
#[derive(Debug, Clone)]
pub struct LinkParams {
    pub mtu: Option<u64>,
    pub min_retry_interval_secs: u64,
    pub retry_interval_secs: u64,
    pub max_retry_interval_secs: u64,
    pub idle_close_secs: u64,
    /// Queue depth at which the link goes BUSY.
    pub busy_threshold: usize,
}

impl Default for LinkParams {
    fn default() -> Self {
        Self {
            mtu: None,
            min_retry_interval_secs: 5,
            retry_interval_secs: 5,
            max_retry_interval_secs: 600,
            idle_close_secs: 0,
            busy_threshold: 1024,
        }
    }
}

/// A time-bounded materialization of a link.
#[derive(Debug)]
pub struct Contact {
    pub started: Instant,
    pub bundles_sent: u64,
    pub bytes_sent: u64,
}

impl Contact {
    fn new() -> Self {
        Self { started: Instant::now(), bundles_sent: 0, bytes_sent: 0 }
    }
}

#[derive(Debug, Default)]
pub struct LinkStats {
    pub bundles_queued: u64,
    pub bundles_transmitted: u64,
    pub bundles_cancelled: u64,
    pub contact_attempts: u64,
    pub contacts: u64,
}

#[derive(Debug)]
struct LinkInner {
    state: LinkState,
    queue: VecDeque<BundleRef>,
    inflight: Vec<BundleRef>,
    contact: Option<Contact>,
    retry_interval_secs: u64,
    stats: LinkStats,
}

/// A next-hop link. The immutable identity lives in plain fields; the
/// queue, inflight list, and state machine are mutex-protected since both
/// the daemon and the link's CLA actor touch them.
#[derive(Debug)]
pub struct Link {
    pub name: String,
    pub cla: String,
    pub nexthop: String,
    pub remote_eid: Option<petrel_bp::EndpointId>,
    pub params: LinkParams,
    inner: Mutex<LinkInner>,
}

pub type LinkRef = Arc<Link>;

impl Link {
    pub fn new(name: &str, cla: &str, nexthop: &str, params: LinkParams) -> LinkRef {
        let retry = params.retry_interval_secs;
        Arc::new(Self {
            name: name.to_string(),
            cla: cla.to_string(),
            nexthop: nexthop.to_string(),
            remote_eid: None,
            params,
            inner: Mutex::new(LinkInner {
                state: LinkState::Unavailable,
                queue: VecDeque::new(),
                inflight: Vec::new(),
                contact: None,
                retry_interval_secs: retry,
                stats: LinkStats::default(),
            }),
        })
    }

    fn inner(&self) -> MutexGuard<'_, LinkInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> LinkState {
        self.inner().state
    }

    /// Apply a state transition, logging the edge. Illegal edges are
    /// rejected so a late event cannot corrupt the machine.
    pub fn set_state(&self, next: LinkState) -> bool {
        use LinkState::*;
        let mut inner = self.inner();
        let cur = inner.state;
        let legal = matches!(
            (cur, next),
            (Unavailable, Available)
                | (Available, Opening)
                | (Available, Unavailable)
                | (Opening, Open)
                | (Opening, Available)
                | (Opening, Unavailable)
                | (Open, Busy)
                | (Open, Available)
                | (Open, Unavailable)
                | (Busy, Open)
                | (Busy, Available)
                | (Busy, Unavailable)
                | (_, Closed)
        ) || cur == next;
        if !legal {
            log::warn!("link({}): illegal transition {:?} -> {:?}", self.name, cur, next);
            return false;
        }
        if cur != next {
            log::debug!("link({}): {:?} -> {:?}", self.name, cur, next);
        }
        inner.state = next;
        match next {
            Open => {
                inner.contact.get_or_insert_with(Contact::new);
                inner.stats.contacts += 1;
                // Successful contact resets the backoff.
                inner.retry_interval_secs = self.params.min_retry_interval_secs;
            }
            Available | Unavailable | Closed => {
                inner.contact = None;
            }
            _ => {}
        }
        true
    }

    /// Queue a bundle for transmission. Idempotent: a bundle already queued
    /// or in flight is not duplicated.
    pub fn enqueue(&self, bundle: &BundleRef) -> bool {
        let mut inner = self.inner();
        if inner.queue.iter().any(|b| b.id() == bundle.id())
            || inner.inflight.iter().any(|b| b.id() == bundle.id())
        {
            return false;
        }
        inner.queue.push_back(bundle.clone());
        inner.stats.bundles_queued += 1;
        true
    }

    pub fn is_queued(&self, bundle: &BundleRef) -> bool {
        self.inner().queue.iter().any(|b| b.id() == bundle.id())
    }

    pub fn is_inflight(&self, bundle: &BundleRef) -> bool {
        self.inner().inflight.iter().any(|b| b.id() == bundle.id())
    }

    pub fn queue_depth(&self) -> usize {
        self.inner().queue.len()
    }

    /// Pop the next bundle for transmission, moving it to the inflight
    /// list. The queue/inflight sets stay disjoint.
    pub fn start_next(&self) -> Option<BundleRef> {
        let mut inner = self.inner();
        if inner.state != LinkState::Open && inner.state != LinkState::Busy {
            return None;
        }
        let bundle = inner.queue.pop_front()?;
        inner.inflight.push(bundle.clone());
        Some(bundle)
    }

    /// Acknowledge a transmitted bundle, dropping it from inflight.
    pub fn finish(&self, bundle_id: u64, bytes: u64) -> bool {
        let mut inner = self.inner();
        let before = inner.inflight.len();
        inner.inflight.retain(|b| b.id() != bundle_id);
        if inner.inflight.len() < before {
            inner.stats.bundles_transmitted += 1;
            if let Some(contact) = inner.contact.as_mut() {
                contact.bundles_sent += 1;
                contact.bytes_sent += bytes;
            }
            true
        } else {
            false
        }
    }

    /// A transmit gave up on this bundle: drop it from both the queue and
    /// the inflight list and count the cancellation.
    pub fn fail(&self, bundle_id: u64) -> bool {
        let mut inner = self.inner();
        let before = inner.queue.len() + inner.inflight.len();
        inner.queue.retain(|b| b.id() != bundle_id);
        inner.inflight.retain(|b| b.id() != bundle_id);
        if inner.queue.len() + inner.inflight.len() < before {
            inner.stats.bundles_cancelled += 1;
            true
        } else {
            false
        }
    }

    /// Drain the inflight list, e.g. when the contact breaks. The caller
    /// decides whether the bundles are requeued or signaled failed.
    pub fn drain_inflight(&self) -> Vec<BundleRef> {
        std::mem::take(&mut self.inner().inflight)
    }

    pub fn drain_queue(&self) -> Vec<BundleRef> {
        self.inner().queue.drain(..).collect()
    }

    pub fn remove_queued(&self, bundle_id: u64) -> bool {
        let mut inner = self.inner();
        let before = inner.queue.len();
        inner.queue.retain(|b| b.id() != bundle_id);
        inner.queue.len() < before
    }

    /// Current backoff interval; doubles on each failed attempt.
    pub fn next_retry_interval(&self) -> u64 {
        let mut inner = self.inner();
        let current = inner.retry_interval_secs;
        inner.retry_interval_secs =
            (current * 2).min(self.params.max_retry_interval_secs.max(1));
        inner.stats.contact_attempts += 1;
        current
    }

    pub fn busy(&self) -> bool {
        let inner = self.inner();
        inner.queue.len() >= self.params.busy_threshold
    }

    pub fn with_stats<R>(&self, f: impl FnOnce(&LinkStats) -> R) -> R {
        f(&self.inner().stats)
    }
}

/// The set of known links, owned by the daemon thread.
#[derive(Default)]
pub struct ContactManager {
    links: HashMap<String, LinkRef>,
}

impl ContactManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_link(&mut self, link: LinkRef) -> Result<(), crate::error::NodeError> {
        if self.links.contains_key(&link.name) {
            return Err(crate::error::NodeError::Policy(format!(
                "link {} already exists",
                link.name
            )));
        }
        log::info!("contacts: link {} via {} -> {}", link.name, link.cla, link.nexthop);
        self.links.insert(link.name.clone(), link);
        Ok(())
    }

    pub fn del_link(&mut self, name: &str) -> Option<LinkRef> {
        let link = self.links.remove(name)?;
        link.set_state(LinkState::Closed);
        Some(link)
    }

    pub fn find(&self, name: &str) -> Option<LinkRef> {
        self.links.get(name).cloned()
    }

    pub fn links(&self) -> impl Iterator<Item = &LinkRef> {
        self.links.values()
    }

    pub fn handle_contact_down(&self, name: &str, reason: ContactDownReason) -> Vec<BundleRef> {
        let Some(link) = self.links.get(name) else {
            return Vec::new();
        };
        let inflight = link.drain_inflight();
        match reason {
            ContactDownReason::User | ContactDownReason::Shutdown => {
                link.set_state(LinkState::Unavailable);
            }
            _ => {
                link.set_state(LinkState::Available);
            }
        }
        inflight
    }
}
