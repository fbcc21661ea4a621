use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use petrel_bp::admin::{status_flags, AdminRecord, CustodyReason};
use petrel_bp::bundle::ForwardState;
use petrel_bp::payload::BundlePayload;
use petrel_bp::{Bundle, BundleProtocol, BundleRef, EndpointId, ReceptionReason};

use crate::cla::ClaRegistry;
use crate::config::NodeConfig;
use crate::contacts::{ContactManager, LinkRef, LinkState};
use crate::custody::{self, CustodyManager};
use crate::event::{BundleEvent, ContactDownReason, EventSource};
use crate::fragment::{self, ReassemblyTable};
use crate::reg::{DeliveryOutcome, RegistrationTable};
use crate::router::{Router, RouterAction};
use crate::storage::BundleStore;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct DaemonStats {
    pub events_processed: u64,
    pub received: u64,
    pub transmitted: u64,
    pub delivered: u64,
    pub expired: u64,
    pub deleted: u64,
    pub duplicates: u64,
    pub custody_accepted: u64,
}

/// Cloneable handle onto a daemon: post events, observe shutdown. This is
/// the only way I/O actors talk to the daemon.
#[derive(Clone)]
pub struct DaemonHandle {
    tx: mpsc::UnboundedSender<BundleEvent>,
    cancel: CancellationToken,
}

impl DaemonHandle {
    /// A handle with no daemon behind it; the paired receiver observes
    /// every posted event. Lets harnesses drive actors without a full
    /// node.
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<BundleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, cancel: CancellationToken::new() }, rx)
    }

    pub fn post(&self, event: BundleEvent) {
        if self.tx.send(event).is_err() {
            log::debug!("daemon: event queue closed");
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn shutdown(&self) {
        self.post(BundleEvent::Shutdown);
    }
}

/// The bundle daemon: one task draining an unbounded event queue. Every
/// state transition of bundles, links, and registrations happens here;
/// I/O actors only produce events.
pub struct BundleDaemon {
    config: NodeConfig,
    protocol: BundleProtocol,
    router: Box<dyn Router>,
    contacts: Arc<Mutex<ContactManager>>,
    regs: Arc<Mutex<RegistrationTable>>,
    store: Option<BundleStore>,
    custody: CustodyManager,
    reassembly: ReassemblyTable,
    clas: Arc<ClaRegistry>,
    stats: DaemonStats,
    seen: HashSet<String>,
    seen_order: VecDeque<String>,
    rx: mpsc::UnboundedReceiver<BundleEvent>,
    handle: DaemonHandle,
    local_pattern: EndpointId,
    ping_eid: EndpointId,
}

impl BundleDaemon {
    pub fn new(
        config: NodeConfig,
        protocol: BundleProtocol,
        router: Box<dyn Router>,
        regs: RegistrationTable,
        store: Option<BundleStore>,
        custody: CustodyManager,
        clas: Arc<ClaRegistry>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = DaemonHandle { tx, cancel: CancellationToken::new() };
        let local_pattern = config.local_eid.with_service("*");
        let ping_eid = config.local_eid.with_service("ping");
        Self {
            config,
            protocol,
            router,
            contacts: Arc::new(Mutex::new(ContactManager::new())),
            regs: Arc::new(Mutex::new(regs)),
            store,
            custody,
            reassembly: ReassemblyTable::new(),
            clas,
            stats: DaemonStats::default(),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            rx,
            handle,
            local_pattern,
            ping_eid,
        }
    }

    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    pub fn contacts(&self) -> Arc<Mutex<ContactManager>> {
        self.contacts.clone()
    }

    pub fn registrations(&self) -> Arc<Mutex<RegistrationTable>> {
        self.regs.clone()
    }

    pub fn local_eid(&self) -> &EndpointId {
        &self.config.local_eid
    }

    pub fn stats(&self) -> &DaemonStats {
        &self.stats
    }

    fn lock_contacts(&self) -> std::sync::MutexGuard<'_, ContactManager> {
        self.contacts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_regs(&self) -> std::sync::MutexGuard<'_, RegistrationTable> {
        self.regs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_local(&self, dest: &EndpointId) -> bool {
        *dest == self.config.local_eid || self.local_pattern.matches(dest)
    }

    /// Drain the queue until shutdown.
    pub async fn run(mut self) {
        log::info!("daemon: up as {}", self.config.local_eid);
        self.reload_stores();

        let cancel = self.handle.cancel.clone();
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = self.rx.recv() => match maybe {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = housekeeping.tick() => self.housekeeping(),
            }
        }
        self.shutdown_all().await;
    }

    async fn handle_event(&mut self, event: BundleEvent) {
        self.stats.events_processed += 1;
        log::trace!("daemon: event {}", event.type_str());

        if matches!(event, BundleEvent::Shutdown) {
            self.handle.cancel.cancel();
            return;
        }

        let route = self.apply_event(&event).await;
        if !route || event.daemon_only() {
            return;
        }

        let actions = {
            let contacts_arc = self.contacts.clone();
            let contacts = contacts_arc.lock().unwrap_or_else(|e| e.into_inner());
            self.router.handle_event(&event, &contacts)
        };
        for action in actions {
            if let Err(e) = self.apply_action(action).await {
                // A failing action is isolated; the queue keeps draining.
                log::error!("daemon: action failed: {e}");
            }
        }
    }

    /// Daemon-side state transitions. Returns false to withhold the event
    /// from the router (e.g. a bundle that failed validation).
    async fn apply_event(&mut self, event: &BundleEvent) -> bool {
        match event {
            BundleEvent::BundleReceived { bundle, source, link, .. } => {
                self.on_bundle_received(bundle, source, link.as_deref())
            }
            BundleEvent::ReassemblyCompleted { bundle } => {
                self.deliver_local(bundle);
                true
            }
            BundleEvent::BundleTransmitted { bundle, link, bytes_sent, .. } => {
                if let Some(l) = self.lock_contacts().find(link) {
                    l.finish(bundle.id(), *bytes_sent);
                }
                bundle.add_fwd_log(link, ForwardState::Transmitted);
                self.stats.transmitted += 1;
                if bundle.forward_rcpt {
                    self.post_report(bundle, status_flags::FORWARDED, ReceptionReason::NoAdditionalInfo);
                }
                true
            }
            BundleEvent::BundleTransmitFailed { bundle, link } => {
                if let Some(l) = self.lock_contacts().find(link) {
                    l.fail(bundle.id());
                }
                bundle.add_fwd_log(link, ForwardState::TransmitFailed);
                true
            }
            BundleEvent::BundleDelivered { .. } => {
                self.stats.delivered += 1;
                true
            }
            BundleEvent::BundleExpired { bundle } => {
                self.on_bundle_expired(bundle);
                true
            }
            BundleEvent::BundleFree { bundle_id } => {
                log::trace!("daemon: bundle {} freed", bundle_id);
                false
            }
            BundleEvent::BundleForwardTimeout { bundle, link } => {
                if let Some(l) = self.lock_contacts().find(link) {
                    l.remove_queued(bundle.id());
                }
                true
            }
            BundleEvent::ContactUp { link } => {
                let found = self.lock_contacts().find(link);
                if let Some(l) = found {
                    l.set_state(LinkState::Open);
                    // Drain anything queued before the contact came up.
                    if l.queue_depth() > 0 {
                        if let Some(cla) = self.clas.find(&l.cla) {
                            cla.notify_queued(link);
                        }
                    }
                }
                true
            }
            BundleEvent::ContactDown { link, reason } => {
                self.on_contact_down(link, *reason);
                true
            }
            BundleEvent::LinkCreated { .. } | BundleEvent::LinkDeleted { .. } => true,
            BundleEvent::LinkAvailable { link } => {
                if let Some(l) = self.lock_contacts().find(link) {
                    l.set_state(LinkState::Available);
                }
                true
            }
            BundleEvent::LinkUnavailable { link } => {
                if let Some(l) = self.lock_contacts().find(link) {
                    l.set_state(LinkState::Unavailable);
                }
                true
            }
            BundleEvent::LinkStateChangeRequest { link, state, reason } => {
                self.on_link_state_request(link, *state, *reason).await;
                false
            }
            BundleEvent::RegistrationExpired { regid } => {
                let _ = self.lock_regs().del(*regid);
                true
            }
            BundleEvent::RegistrationAdded { .. } | BundleEvent::RegistrationRemoved { .. } => true,
            BundleEvent::RouteAdd { .. } | BundleEvent::RouteDel { .. } => true,
            BundleEvent::CustodySignalReceived { signal } => {
                match self.custody.handle_signal(signal) {
                    Ok(Some(released)) => {
                        self.drop_bundle(&released);
                        self.handle.post(BundleEvent::BundleFree { bundle_id: released.id() });
                    }
                    Ok(None) => {}
                    Err(e) => log::error!("daemon: custody signal: {e}"),
                }
                true
            }
            BundleEvent::Shutdown => false,
        }
    }

    fn on_bundle_received(
        &mut self,
        bundle: &BundleRef,
        source: &EventSource,
        _link: Option<&str>,
    ) -> bool {
        self.stats.received += 1;

        if *source == EventSource::Peer {
            if let Err((_reception, deletion)) = self.protocol.validate(bundle) {
                log::warn!("daemon: {} failed validation ({:?})", bundle, deletion);
                self.stats.deleted += 1;
                if bundle.deletion_rcpt {
                    self.post_report(bundle, status_flags::DELETED, deletion);
                }
                return false;
            }

            let key = bundle.gbofid();
            if !self.seen.insert(key.clone()) {
                self.stats.duplicates += 1;
                log::debug!("daemon: duplicate {}", bundle);
                if bundle.custody_requested {
                    if let Some(refusal) =
                        self.custody.refuse(bundle, CustodyReason::RedundantReception)
                    {
                        self.post_received(refusal, EventSource::Admin);
                    }
                }
                return false;
            }
            self.seen_order.push_back(key);
            while self.seen_order.len() > self.config.seen_window {
                if let Some(old) = self.seen_order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }

        if bundle.expired() {
            self.handle.post(BundleEvent::BundleExpired { bundle: bundle.clone() });
            return false;
        }

        // Large payloads spill to the payload directory.
        if let Some(dir) = self.config.payload_dir.as_ref() {
            let mut state = bundle.state();
            if state.payload.file_path().is_none()
                && state.payload.len() >= self.config.payload_spill_bytes
            {
                let name = format!("bundle-{}.payload", bundle.id());
                match state
                    .payload
                    .read_all()
                    .and_then(|bytes| BundlePayload::in_file(dir, &name, &bytes))
                {
                    Ok(payload) => state.payload = payload,
                    Err(e) => log::warn!("daemon: payload spill failed: {e}"),
                }
            }
        }

        if bundle.receive_rcpt && *source == EventSource::Peer {
            self.post_report(bundle, status_flags::RECEIVED, ReceptionReason::NoAdditionalInfo);
        }

        if bundle.custody_requested && *source == EventSource::Peer {
            match self.custody.accept(bundle) {
                Ok(signal) => {
                    self.stats.custody_accepted += 1;
                    if let Some(signal) = signal {
                        self.post_received(signal, EventSource::Admin);
                    }
                    if let Some(receipt) =
                        custody::custody_receipt(bundle, &self.config.local_eid)
                    {
                        self.post_received(receipt, EventSource::Admin);
                    }
                }
                Err(e) => log::error!("daemon: custody accept failed: {e}"),
            }
        }

        if self.is_local(&bundle.dest) {
            return self.deliver_local(bundle);
        }
        true
    }

    /// Local delivery: admin records, ping, fragments, registrations.
    /// Returns whether the router should still see the arrival.
    fn deliver_local(&mut self, bundle: &BundleRef) -> bool {
        if bundle.is_admin {
            self.handle_admin(bundle);
            return false;
        }

        if bundle.dest == self.ping_eid {
            // Ping responder: echo the payload back to the source.
            let mut echo = Bundle::new();
            echo.source = self.ping_eid.clone();
            echo.dest = bundle.source.clone();
            echo.lifetime_secs = bundle.lifetime_secs.max(60);
            let payload = bundle.state().payload.read_all().unwrap_or_default();
            echo.set_payload(BundlePayload::with_memory(payload));
            log::debug!("daemon: ping from {}", bundle.source);
            self.stats.delivered += 1;
            self.post_received(Arc::new(echo), EventSource::App);
            return false;
        }

        if bundle.is_fragment {
            match self.reassembly.add_fragment(bundle) {
                Ok(Some(whole)) => {
                    self.handle.post(BundleEvent::ReassemblyCompleted { bundle: whole })
                }
                Ok(None) => {}
                Err(e) => log::warn!("daemon: reassembly: {e}"),
            }
            return true;
        }

        let matching = self.lock_regs().get_matching(&bundle.dest);
        if matching.is_empty() {
            log::debug!("daemon: no registration for {}, bundle stays pending", bundle.dest);
            return true;
        }
        for reg in matching {
            match reg.deliver(bundle) {
                DeliveryOutcome::Delivered => {
                    log::debug!("daemon: {} delivered to reg {}", bundle, reg.regid);
                    bundle.add_fwd_log("local", ForwardState::Delivered);
                    self.handle.post(BundleEvent::BundleDelivered {
                        bundle: bundle.clone(),
                        regid: reg.regid,
                    });
                    self.handle.post(BundleEvent::BundleTransmitted {
                        bundle: bundle.clone(),
                        link: "local".to_string(),
                        bytes_sent: bundle.payload_len(),
                        acked: true,
                    });
                    if bundle.delivery_rcpt {
                        self.post_report(
                            bundle,
                            status_flags::DELIVERED,
                            ReceptionReason::NoAdditionalInfo,
                        );
                    }
                }
                DeliveryOutcome::Queued => {
                    log::debug!("daemon: {} deferred on reg {}", bundle, reg.regid);
                }
                DeliveryOutcome::Dropped => {
                    log::info!("daemon: {} dropped by reg {} (abort)", bundle, reg.regid);
                    self.stats.deleted += 1;
                    if bundle.deletion_rcpt {
                        self.post_report(
                            bundle,
                            status_flags::DELETED,
                            ReceptionReason::NoAdditionalInfo,
                        );
                    }
                }
            }
        }
        true
    }

    /// The admin registration: custody signals and status reports sent to
    /// the local EID.
    fn handle_admin(&mut self, bundle: &BundleRef) {
        let payload = match bundle.state().payload.read_all() {
            Ok(p) => p,
            Err(e) => {
                log::warn!("daemon: admin payload unreadable: {e}");
                return;
            }
        };
        match AdminRecord::parse(&payload) {
            Ok(AdminRecord::CustodySignal(signal)) => {
                self.handle.post(BundleEvent::CustodySignalReceived { signal });
            }
            Ok(AdminRecord::StatusReport(report)) => {
                log::info!(
                    "daemon: status report from {}: status {:#04x} reason {:?}",
                    report.orig_source,
                    report.status,
                    report.reason
                );
            }
            Err(e) => log::warn!("daemon: unparseable admin record: {e}"),
        }
        self.stats.delivered += 1;
    }

    fn on_bundle_expired(&mut self, bundle: &BundleRef) {
        log::debug!("daemon: {} expired", bundle);
        self.stats.expired += 1;
        self.drop_bundle(bundle);
        if bundle.deletion_rcpt {
            self.post_report(bundle, status_flags::DELETED, ReceptionReason::LifetimeExpired);
        }
        self.handle.post(BundleEvent::BundleFree { bundle_id: bundle.id() });
    }

    /// Remove a bundle from every queue and the store.
    fn drop_bundle(&mut self, bundle: &BundleRef) {
        for link in self.lock_contacts().links() {
            link.remove_queued(bundle.id());
        }
        for reg in self.lock_regs().get_matching(&bundle.dest) {
            reg.remove_queued(bundle.id());
        }
        if let Some(store) = self.store.as_ref() {
            if let Err(e) = store.del(bundle.id()) {
                log::warn!("daemon: store del: {e}");
            }
        }
    }

    fn on_contact_down(&mut self, link_name: &str, reason: ContactDownReason) {
        let (inflight, link) = {
            let contacts = self.lock_contacts();
            let inflight = contacts.handle_contact_down(link_name, reason);
            (inflight, contacts.find(link_name))
        };
        let Some(link) = link else { return };

        // Inflight bundles go back on the queue for the next contact.
        for bundle in inflight {
            link.enqueue(&bundle);
        }

        if matches!(reason, ContactDownReason::Broken | ContactDownReason::Timeout) {
            let delay = link.next_retry_interval();
            log::info!("daemon: contact {} broken, reopening in {}s", link_name, delay);
            let handle = self.handle.clone();
            let name = link_name.to_string();
            tokio::spawn(async move {
                let cancel_token = handle.cancel_token();
                let cancelled = cancel_token.cancelled();
                tokio::select! {
                    _ = cancelled => {}
                    _ = tokio::time::sleep(Duration::from_secs(delay)) => {
                        handle.post(BundleEvent::LinkStateChangeRequest {
                            link: name,
                            state: LinkState::Opening,
                            reason: ContactDownReason::Reconnect,
                        });
                    }
                }
            });
        }
    }

    async fn on_link_state_request(
        &mut self,
        link_name: &str,
        state: LinkState,
        reason: ContactDownReason,
    ) {
        let Some(link) = self.lock_contacts().find(link_name) else {
            return;
        };
        match state {
            LinkState::Opening => {
                self.open_link(&link).await;
            }
            LinkState::Unavailable => {
                if let Some(cla) = self.clas.find(&link.cla) {
                    cla.close_contact(link_name).await;
                }
                link.set_state(LinkState::Unavailable);
                log::info!("daemon: link {} down ({:?})", link_name, reason);
            }
            LinkState::Available if link.state() == LinkState::Busy => {
                link.set_state(LinkState::Open);
                if let Some(cla) = self.clas.find(&link.cla) {
                    cla.notify_queued(link_name);
                }
            }
            LinkState::Available => {
                link.set_state(LinkState::Available);
            }
            other => {
                log::warn!("daemon: unsupported state request {:?} for {}", other, link_name);
            }
        }
    }

    async fn open_link(&mut self, link: &LinkRef) {
        if link.state() != LinkState::Available {
            log::debug!("daemon: link {} not available to open", link.name);
            return;
        }
        link.set_state(LinkState::Opening);
        let Some(cla) = self.clas.find(&link.cla) else {
            log::error!("daemon: link {} names unknown cla {}", link.name, link.cla);
            link.set_state(LinkState::Available);
            return;
        };
        if let Err(e) = cla.open_contact(link.clone(), self.handle.clone()).await {
            log::warn!("daemon: open {} failed: {e}", link.name);
            link.set_state(LinkState::Available);
        }
    }

    async fn apply_action(&mut self, action: RouterAction) -> Result<(), crate::error::NodeError> {
        match action {
            RouterAction::EnqueueBundle { link: link_name, bundle } => {
                let Some(link) = self.lock_contacts().find(&link_name) else {
                    return Err(crate::error::NodeError::Policy(format!(
                        "no such link {link_name}"
                    )));
                };

                // Proactive fragmentation to the link MTU.
                let bundles = match link.params.mtu {
                    Some(mtu) if bundle.payload_len() > mtu && !bundle.do_not_fragment => {
                        fragment::fragment(&bundle, mtu)?
                    }
                    _ => vec![bundle],
                };

                let mut queued = false;
                for b in bundles {
                    if link.enqueue(&b) {
                        b.add_fwd_log(&link_name, ForwardState::InFlight);
                        queued = true;
                    }
                }
                if queued {
                    if link.busy() && link.state() == LinkState::Open {
                        link.set_state(LinkState::Busy);
                    }
                    if link.state() == LinkState::Available {
                        self.open_link(&link).await;
                    }
                    if let Some(cla) = self.clas.find(&link.cla) {
                        cla.notify_queued(&link_name);
                    }
                }
                Ok(())
            }
            RouterAction::StoreAdd(bundle) => {
                if let Some(store) = self.store.as_ref() {
                    store.add(&bundle)?;
                }
                Ok(())
            }
            RouterAction::StoreDel(id) => {
                if let Some(store) = self.store.as_ref() {
                    store.del(id)?;
                }
                Ok(())
            }
            RouterAction::OpenLink(name) => {
                let link = self.lock_contacts().find(&name);
                if let Some(link) = link {
                    self.open_link(&link).await;
                }
                Ok(())
            }
        }
    }

    fn post_report(&self, subject: &BundleRef, status: u8, reason: ReceptionReason) {
        if let Some(report) =
            custody::status_report_bundle(subject, status, reason, &self.config.local_eid)
        {
            self.post_received(report, EventSource::Admin);
        }
    }

    fn post_received(&self, bundle: BundleRef, source: EventSource) {
        let bytes = bundle.payload_len();
        self.handle.post(BundleEvent::BundleReceived { bundle, source, bytes, link: None });
    }

    fn housekeeping(&mut self) {
        for bundle in self.router.pending_bundles() {
            if bundle.expired() {
                self.handle.post(BundleEvent::BundleExpired { bundle });
            }
        }
        let (expired, dropped) = {
            let regs = self.lock_regs();
            (regs.expired_regids(), regs.drain_expired())
        };
        if dropped > 0 {
            log::debug!("daemon: dropped {} expired bundles from defer queues", dropped);
            self.stats.expired += dropped as u64;
        }
        for regid in expired {
            log::info!("daemon: registration {} expired", regid);
            self.handle.post(BundleEvent::RegistrationExpired { regid });
        }
    }

    fn reload_stores(&mut self) {
        let Some(store) = self.store.as_ref() else { return };
        let stored = match store.iterate() {
            Ok(s) => s,
            Err(e) => {
                log::error!("daemon: store iterate: {e}");
                return;
            }
        };
        let mut reloaded = 0usize;
        for rec in &stored {
            match store.reload(rec) {
                Ok(bundle) => {
                    let bundle: BundleRef = Arc::new(bundle);
                    if let Err(e) = self.protocol.reload_post_process(&bundle) {
                        log::warn!("daemon: reload post-process {}: {e}", rec.gbofid);
                        continue;
                    }
                    // Reloaded bundles keep their old row; delete it so the
                    // re-add under the new local id does not leak rows.
                    let _ = store.del(rec.id);
                    self.post_received(bundle, EventSource::Store);
                    reloaded += 1;
                }
                Err(e) => log::warn!("daemon: reload {}: {e}", rec.gbofid),
            }
        }
        if reloaded > 0 {
            log::info!("daemon: reloaded {} bundles from store", reloaded);
        }
    }

    async fn shutdown_all(&mut self) {
        log::info!(
            "daemon: shutting down ({} events, {} received, {} delivered)",
            self.stats.events_processed,
            self.stats.received,
            self.stats.delivered
        );
        let links: Vec<LinkRef> = self.lock_contacts().links().cloned().collect();
        for link in links {
            if let Some(cla) = self.clas.find(&link.cla) {
                cla.close_contact(&link.name).await;
            }
            link.set_state(LinkState::Closed);
        }
    }
}
