use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::mpsc;

use petrel_bp::{BundleRef, EndpointId};

use crate::error::NodeError;
use crate::storage::RegistrationStore;

/// Reserved registration ids.
pub const ADMIN_REGID: u32 = 0;
pub const PING_REGID: u32 = 2;
pub const MAX_RESERVED_REGID: u32 = 10;

/// What to do with a matching bundle when no application is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Defer,
    Abort,
    Exec,
}

impl FailureAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "defer" => Some(FailureAction::Defer),
            "abort" => Some(FailureAction::Abort),
            "exec" => Some(FailureAction::Exec),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureAction::Defer => "defer",
            FailureAction::Abort => "abort",
            FailureAction::Exec => "exec",
        }
    }
}

/// Outcome of attempting delivery to one registration.
#[derive(Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Queued,
    Dropped,
}

#[derive(Debug, Default)]
struct RegInner {
    bound: bool,
    delivery: Option<mpsc::UnboundedSender<BundleRef>>,
    queue: VecDeque<BundleRef>,
}

/// An application-facing delivery binding: an endpoint pattern plus the
/// policy for bundles that arrive while no application is attached.
pub struct Registration {
    pub regid: u32,
    pub endpoint: EndpointId,
    pub failure_action: FailureAction,
    pub script: Option<String>,
    pub expiration_secs: u64,
    created: Instant,
    inner: Mutex<RegInner>,
}

pub type RegistrationRef = Arc<Registration>;

impl Registration {
    pub fn new(
        regid: u32,
        endpoint: EndpointId,
        failure_action: FailureAction,
        expiration_secs: u64,
        script: Option<String>,
    ) -> RegistrationRef {
        Arc::new(Self {
            regid,
            endpoint,
            failure_action,
            script,
            expiration_secs,
            created: Instant::now(),
            inner: Mutex::new(RegInner::default()),
        })
    }

    fn inner(&self) -> MutexGuard<'_, RegInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn bound(&self) -> bool {
        self.inner().bound
    }

    /// Attach an application. One live binding per registration; a second
    /// bind is refused rather than multiplexed.
    pub fn bind(&self, tx: mpsc::UnboundedSender<BundleRef>) -> Result<(), NodeError> {
        let mut inner = self.inner();
        if inner.bound {
            return Err(NodeError::Policy(format!(
                "registration {} already bound",
                self.regid
            )));
        }
        inner.bound = true;
        // Flush anything deferred while unbound.
        while let Some(bundle) = inner.queue.pop_front() {
            let _ = tx.send(bundle);
        }
        inner.delivery = Some(tx);
        Ok(())
    }

    pub fn unbind(&self) {
        let mut inner = self.inner();
        inner.bound = false;
        inner.delivery = None;
    }

    /// Hand a bundle to the bound application, or apply the failure action.
    pub fn deliver(&self, bundle: &BundleRef) -> DeliveryOutcome {
        let mut inner = self.inner();
        if let Some(tx) = inner.delivery.as_ref() {
            if tx.send(bundle.clone()).is_ok() {
                return DeliveryOutcome::Delivered;
            }
            // Receiver side went away without unbinding.
            inner.bound = false;
            inner.delivery = None;
        }
        match self.failure_action {
            FailureAction::Defer => {
                inner.queue.push_back(bundle.clone());
                DeliveryOutcome::Queued
            }
            FailureAction::Abort => DeliveryOutcome::Dropped,
            FailureAction::Exec => {
                // The scripting surface is an external collaborator; the
                // bundle is deferred for when it attaches.
                if let Some(script) = self.script.as_deref() {
                    log::info!("reg({}): exec handler {}", self.regid, script);
                }
                inner.queue.push_back(bundle.clone());
                DeliveryOutcome::Queued
            }
        }
    }

    pub fn queue_len(&self) -> usize {
        self.inner().queue.len()
    }

    pub fn remove_queued(&self, bundle_id: u64) -> bool {
        let mut inner = self.inner();
        let before = inner.queue.len();
        inner.queue.retain(|b| b.id() != bundle_id);
        inner.queue.len() < before
    }

    /// Drop expired bundles from the defer queue, so a late bind never
    /// flushes them to the application. Returns how many went.
    pub fn drain_expired(&self) -> usize {
        let mut inner = self.inner();
        let before = inner.queue.len();
        inner.queue.retain(|b| !b.expired());
        before - inner.queue.len()
    }

    pub fn expired(&self) -> bool {
        self.expiration_secs != 0 && self.created.elapsed().as_secs() >= self.expiration_secs
    }

    pub fn is_reserved(&self) -> bool {
        self.regid <= MAX_RESERVED_REGID
    }
}

/// The flat registration list keyed by (regid, endpoint), backed by the
/// persistent store for non-reserved ids.
pub struct RegistrationTable {
    regs: Vec<RegistrationRef>,
    store: Option<RegistrationStore>,
    next_regid: u32,
}

impl RegistrationTable {
    pub fn new(store: Option<RegistrationStore>) -> Result<Self, NodeError> {
        let mut table = Self { regs: Vec::new(), store, next_regid: MAX_RESERVED_REGID + 1 };
        if let Some(store) = table.store.as_ref() {
            for rec in store.iterate()? {
                table.next_regid = table.next_regid.max(rec.regid + 1);
                let endpoint = EndpointId::parse(&rec.endpoint)
                    .map_err(|e| NodeError::Protocol(e.to_string()))?;
                let action =
                    FailureAction::parse(&rec.failure_action).unwrap_or(FailureAction::Defer);
                table.regs.push(Registration::new(
                    rec.regid,
                    endpoint,
                    action,
                    rec.expiration_secs,
                    rec.script,
                ));
            }
            log::info!("reg: reloaded {} registrations", table.regs.len());
        }
        Ok(table)
    }

    pub fn next_regid(&mut self) -> u32 {
        let id = self.next_regid;
        self.next_regid += 1;
        id
    }

    /// Insert a registration. Persistence failure is fatal for the
    /// operation: the in-memory list is left untouched.
    pub fn add(&mut self, reg: RegistrationRef) -> Result<(), NodeError> {
        if self.get(reg.regid).is_some() {
            return Err(NodeError::Policy(format!("regid {} in use", reg.regid)));
        }
        if !reg.is_reserved() {
            if let Some(store) = self.store.as_ref() {
                store.add(&reg)?;
            }
        }
        self.regs.push(reg);
        Ok(())
    }

    pub fn del(&mut self, regid: u32) -> Result<RegistrationRef, NodeError> {
        let idx = self
            .regs
            .iter()
            .position(|r| r.regid == regid)
            .ok_or_else(|| NodeError::Policy(format!("no registration {regid}")))?;
        if !self.regs[idx].is_reserved() {
            if let Some(store) = self.store.as_ref() {
                store.del(regid)?;
            }
        }
        Ok(self.regs.remove(idx))
    }

    pub fn get(&self, regid: u32) -> Option<RegistrationRef> {
        self.regs.iter().find(|r| r.regid == regid).cloned()
    }

    /// Every registration whose endpoint pattern matches the demux EID.
    pub fn get_matching(&self, demux: &EndpointId) -> Vec<RegistrationRef> {
        self.regs.iter().filter(|r| r.endpoint.matches(demux)).cloned().collect()
    }

    pub fn expired_regids(&self) -> Vec<u32> {
        self.regs.iter().filter(|r| r.expired()).map(|r| r.regid).collect()
    }

    /// Sweep every registration's defer queue for expired bundles.
    pub fn drain_expired(&self) -> usize {
        self.regs.iter().map(|r| r.drain_expired()).sum()
    }

    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use petrel_bp::Bundle;

    fn eid(s: &str) -> EndpointId {
        EndpointId::parse(s).expect("parse")
    }

    #[test]
    fn matching_by_pattern() {
        let mut table = RegistrationTable::new(None).expect("table");
        table
            .add(Registration::new(11, eid("dtn://node/app"), FailureAction::Defer, 0, None))
            .expect("add");
        table
            .add(Registration::new(12, eid("dtn://node/*"), FailureAction::Defer, 0, None))
            .expect("add");

        let matches = table.get_matching(&eid("dtn://node/app"));
        assert_eq!(matches.len(), 2);
        let matches = table.get_matching(&eid("dtn://node/other"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].regid, 12);
    }

    #[test]
    fn duplicate_regid_rejected() {
        let mut table = RegistrationTable::new(None).expect("table");
        table
            .add(Registration::new(11, eid("dtn://node/app"), FailureAction::Defer, 0, None))
            .expect("add");
        assert!(table
            .add(Registration::new(11, eid("dtn://node/x"), FailureAction::Defer, 0, None))
            .is_err());
    }

    #[test]
    fn second_bind_refused() {
        let reg = Registration::new(11, eid("dtn://node/app"), FailureAction::Defer, 0, None);
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        reg.bind(tx1).expect("first bind");
        assert!(reg.bind(tx2).is_err());
    }

    #[test]
    fn defer_queues_until_bound() {
        let reg = Registration::new(11, eid("dtn://node/app"), FailureAction::Defer, 0, None);
        let bundle: BundleRef = Arc::new(Bundle::new());
        assert_eq!(reg.deliver(&bundle), DeliveryOutcome::Queued);
        assert_eq!(reg.queue_len(), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        reg.bind(tx).expect("bind");
        let flushed = rx.try_recv().expect("queued bundle flushed on bind");
        assert_eq!(flushed.id(), bundle.id());
        assert_eq!(reg.deliver(&bundle), DeliveryOutcome::Delivered);
    }

    #[test]
    fn expired_bundle_never_reaches_a_late_bind() {
        use petrel_bp::BundleTimestamp;

        let reg = Registration::new(11, eid("dtn://node/app"), FailureAction::Defer, 0, None);
        let mut expired = Bundle::new();
        expired.creation_ts = BundleTimestamp::new(1, 0);
        expired.lifetime_secs = 1;
        let expired: BundleRef = Arc::new(expired);
        let mut live = Bundle::new();
        live.lifetime_secs = 3600;
        let live: BundleRef = Arc::new(live);

        assert_eq!(reg.deliver(&expired), DeliveryOutcome::Queued);
        assert_eq!(reg.deliver(&live), DeliveryOutcome::Queued);
        assert_eq!(reg.drain_expired(), 1);
        assert_eq!(reg.queue_len(), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        reg.bind(tx).expect("bind");
        let flushed = rx.try_recv().expect("live bundle flushed");
        assert_eq!(flushed.id(), live.id());
        assert!(rx.try_recv().is_err(), "expired bundle must not be delivered");
    }

    #[test]
    fn abort_drops() {
        let reg = Registration::new(11, eid("dtn://node/app"), FailureAction::Abort, 0, None);
        let bundle: BundleRef = Arc::new(Bundle::new());
        assert_eq!(reg.deliver(&bundle), DeliveryOutcome::Dropped);
        assert_eq!(reg.queue_len(), 0);
    }
}
