use std::collections::HashMap;
use std::sync::Arc;

use petrel_bp::admin::{status_flags, AdminRecord, CustodyReason, CustodySignal, StatusReport};
use petrel_bp::payload::BundlePayload;
use petrel_bp::{Bundle, BundleRef, EndpointId, Priority, ReceptionReason};

use crate::error::NodeError;
use crate::storage::{PendingAcsRecord, PendingAcsStore};

/// Build an admin bundle carrying `record`, addressed to `dest`.
pub fn admin_bundle(record: &AdminRecord, source: &EndpointId, dest: &EndpointId) -> BundleRef {
    let mut b = Bundle::new();
    b.source = source.clone();
    b.dest = dest.clone();
    b.replyto = EndpointId::null();
    b.is_admin = true;
    b.priority = Priority::Expedited;
    b.lifetime_secs = 86_400;
    b.set_payload(BundlePayload::with_memory(record.encode()));
    Arc::new(b)
}

/// Build a status report about `subject` for its reply-to endpoint, or
/// None when no one asked.
pub fn status_report_bundle(
    subject: &Bundle,
    status: u8,
    reason: ReceptionReason,
    local_eid: &EndpointId,
) -> Option<BundleRef> {
    if subject.replyto.is_null() {
        return None;
    }
    let report = StatusReport::about(subject, status, reason);
    Some(admin_bundle(&AdminRecord::StatusReport(report), local_eid, &subject.replyto))
}

/// Custody bookkeeping: which bundles this node holds custody of, and the
/// persistent record of signals not yet acknowledged by release.
pub struct CustodyManager {
    local_eid: EndpointId,
    store: Option<PendingAcsStore>,
    /// Bundles we are custodian of, keyed by global bundle id.
    held: HashMap<String, BundleRef>,
}

impl CustodyManager {
    pub fn new(local_eid: EndpointId, store: Option<PendingAcsStore>) -> Self {
        Self { local_eid, store, held: HashMap::new() }
    }

    fn fingerprint(custodian: &EndpointId, gbofid: &str) -> String {
        format!("{custodian}|{gbofid}")
    }

    /// Accept custody of `bundle`: rewrite the custodian, remember the
    /// bundle, persist the signal record, and return the succeeded signal
    /// addressed to the previous custodian.
    pub fn accept(&mut self, bundle: &BundleRef) -> Result<Option<BundleRef>, NodeError> {
        let previous = bundle.custodian();
        bundle.set_custodian(self.local_eid.clone());
        self.held.insert(bundle.gbofid(), bundle.clone());

        if previous.is_null() {
            // We are the first custodian; nobody to signal.
            return Ok(None);
        }

        let signal = CustodySignal::about(bundle, true, CustodyReason::NoAdditionalInfo);
        if let Some(store) = self.store.as_ref() {
            store.add(&PendingAcsRecord {
                fingerprint: Self::fingerprint(&previous, &bundle.gbofid()),
                custodian: previous.to_string(),
                gbofid: bundle.gbofid(),
                succeeded: true,
                reason: CustodyReason::NoAdditionalInfo as u8,
            })?;
        }
        log::debug!("custody: accepted {} from {}", bundle, previous);
        Ok(Some(admin_bundle(
            &AdminRecord::CustodySignal(signal),
            &self.local_eid,
            &previous,
        )))
    }

    /// Refuse custody, e.g. for a redundant reception.
    pub fn refuse(
        &self,
        bundle: &BundleRef,
        reason: CustodyReason,
    ) -> Option<BundleRef> {
        let previous = bundle.custodian();
        if previous.is_null() {
            return None;
        }
        let signal = CustodySignal::about(bundle, false, reason);
        log::debug!("custody: refused {} ({:?})", bundle, reason);
        Some(admin_bundle(&AdminRecord::CustodySignal(signal), &self.local_eid, &previous))
    }

    /// Process an inbound custody signal about a bundle we hold. A
    /// succeeded signal releases custody; the released bundle is returned
    /// so the daemon can drop its references.
    pub fn handle_signal(&mut self, signal: &CustodySignal) -> Result<Option<BundleRef>, NodeError> {
        let gbofid = match signal.frag {
            Some((off, len)) => format!(
                "{}|{}|{}|{}",
                signal.orig_source, signal.orig_creation_ts, off, len
            ),
            None => format!("{}|{}", signal.orig_source, signal.orig_creation_ts),
        };
        if !signal.succeeded {
            log::warn!(
                "custody: transfer of {} refused ({:?}); retaining custody",
                gbofid,
                signal.reason
            );
            return Ok(None);
        }
        let Some(bundle) = self.held.remove(&gbofid) else {
            log::debug!("custody: signal for unknown bundle {}", gbofid);
            return Ok(None);
        };
        if let Some(store) = self.store.as_ref() {
            store.del(&Self::fingerprint(&self.local_eid, &gbofid))?;
        }
        log::debug!("custody: released {}", bundle);
        Ok(Some(bundle))
    }

    pub fn holds(&self, gbofid: &str) -> bool {
        self.held.contains_key(gbofid)
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

/// Build the custody-accepted receipt for a bundle whose source asked for
/// custody reports.
pub fn custody_receipt(subject: &Bundle, local_eid: &EndpointId) -> Option<BundleRef> {
    if !subject.custody_rcpt {
        return None;
    }
    status_report_bundle(
        subject,
        status_flags::CUSTODY_ACCEPTED,
        ReceptionReason::NoAdditionalInfo,
        local_eid,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eid(s: &str) -> EndpointId {
        EndpointId::parse(s).expect("parse")
    }

    fn custody_bundle() -> BundleRef {
        let mut b = Bundle::new();
        b.source = eid("dtn://src/app");
        b.dest = eid("dtn://dst/app");
        b.custody_requested = true;
        b.set_payload(BundlePayload::with_memory(b"held".to_vec()));
        b.set_custodian(eid("dtn://prev"));
        Arc::new(b)
    }

    #[test]
    fn accept_and_release() {
        let mut mgr = CustodyManager::new(
            eid("dtn://node"),
            Some(PendingAcsStore::in_memory().expect("store")),
        );
        let bundle = custody_bundle();
        let signal = mgr.accept(&bundle).expect("accept").expect("signal");

        assert_eq!(bundle.custodian(), eid("dtn://node"));
        assert!(mgr.holds(&bundle.gbofid()));
        assert!(signal.is_admin);
        assert_eq!(signal.dest, eid("dtn://prev"));

        // Downstream accepts custody and signals us.
        let record =
            AdminRecord::parse(&signal.state().payload.read_all().expect("read")).expect("parse");
        let AdminRecord::CustodySignal(mut sig) = record else {
            panic!("wrong record");
        };
        sig.orig_source = bundle.source.clone();
        sig.orig_creation_ts = bundle.creation_ts;
        let released = mgr.handle_signal(&sig).expect("handle").expect("released");
        assert_eq!(released.id(), bundle.id());
        assert!(!mgr.holds(&bundle.gbofid()));
    }

    #[test]
    fn first_custodian_signals_no_one() {
        let mut mgr = CustodyManager::new(eid("dtn://node"), None);
        let mut b = Bundle::new();
        b.custody_requested = true;
        let bundle: BundleRef = Arc::new(b);
        assert!(mgr.accept(&bundle).expect("accept").is_none());
        assert!(mgr.holds(&bundle.gbofid()));
    }

    #[test]
    fn failed_signal_retains_custody() {
        let mut mgr = CustodyManager::new(eid("dtn://node"), None);
        let bundle = custody_bundle();
        mgr.accept(&bundle).expect("accept");
        let sig = CustodySignal::about(&bundle, false, CustodyReason::DepletedStorage);
        assert!(mgr.handle_signal(&sig).expect("handle").is_none());
        assert!(mgr.holds(&bundle.gbofid()));
    }
}
