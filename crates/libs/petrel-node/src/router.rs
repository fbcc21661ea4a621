use std::collections::HashMap;

use petrel_bp::{BundleRef, EndpointId};

use crate::contacts::{ContactManager, LinkState};
use crate::event::BundleEvent;

/// Whether a route entry duplicates or consumes the bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingMode {
    /// Send a copy; other matching entries still fire.
    ForwardCopy,
    /// One matching unique entry forwards the bundle; later unique matches
    /// are skipped.
    ForwardUnique,
}

#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub pattern: EndpointId,
    pub link: String,
    pub mode: ForwardingMode,
}

/// An ordered route table; lookup yields all matches in insertion order.
#[derive(Debug, Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entry: RouteEntry) {
        log::info!(
            "route: {} -> {} ({:?})",
            entry.pattern,
            entry.link,
            entry.mode
        );
        self.entries.push(entry);
    }

    /// Remove every entry with this pattern; returns how many went.
    pub fn del(&mut self, pattern: &EndpointId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| &e.pattern != pattern);
        before - self.entries.len()
    }

    pub fn get_matching(&self, dest: &EndpointId) -> Vec<&RouteEntry> {
        self.entries.iter().filter(|e| e.pattern.matches(dest)).collect()
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }
}

/// Actions a router hands back to the daemon, executed in order.
#[derive(Debug, Clone)]
pub enum RouterAction {
    EnqueueBundle { link: String, bundle: BundleRef },
    StoreAdd(BundleRef),
    StoreDel(u64),
    OpenLink(String),
}

/// Interchangeable routing strategy. The daemon feeds it every event that
/// is not daemon-only and executes the returned actions in order.
pub trait Router: Send {
    fn handle_event(&mut self, event: &BundleEvent, contacts: &ContactManager)
        -> Vec<RouterAction>;

    fn local_eid(&self) -> &EndpointId;

    fn route_table(&mut self) -> &mut RouteTable;

    /// Bundles accepted but not yet delivered or acknowledged.
    fn pending_bundles(&self) -> Vec<BundleRef>;
}

/// Table-driven router: consults the route table on arrival and on contact
/// changes, emitting enqueue actions for each match.
pub struct StaticRouter {
    local_eid: EndpointId,
    table: RouteTable,
    pending: HashMap<u64, BundleRef>,
}

impl StaticRouter {
    pub fn new(local_eid: EndpointId) -> Self {
        Self { local_eid, table: RouteTable::new(), pending: HashMap::new() }
    }

    /// Route one bundle: enqueue on every FORWARD_COPY match and on the
    /// first FORWARD_UNIQUE match. Emits an open request for closed links
    /// so the contact comes up.
    fn route_bundle(&self, bundle: &BundleRef, contacts: &ContactManager) -> Vec<RouterAction> {
        if self.local_eid.matches(&bundle.dest) {
            // Local delivery is the daemon's job, not ours.
            return Vec::new();
        }

        let mut actions = Vec::new();
        let mut unique_done = false;
        for entry in self.table.get_matching(&bundle.dest) {
            if entry.mode == ForwardingMode::ForwardUnique {
                if unique_done {
                    continue;
                }
                unique_done = true;
            }
            actions.push(RouterAction::EnqueueBundle {
                link: entry.link.clone(),
                bundle: bundle.clone(),
            });
            if let Some(link) = contacts.find(&entry.link) {
                if link.state() == LinkState::Available {
                    actions.push(RouterAction::OpenLink(entry.link.clone()));
                }
            }
        }
        if actions.is_empty() {
            log::debug!("router: no route for {}", bundle.dest);
        }
        actions
    }

    /// Re-run routing for everything pending, e.g. after a route change or
    /// a contact coming up.
    fn reroute_pending(&self, contacts: &ContactManager) -> Vec<RouterAction> {
        let mut actions = Vec::new();
        for bundle in self.pending.values() {
            actions.extend(self.route_bundle(bundle, contacts));
        }
        actions
    }
}

impl Router for StaticRouter {
    fn handle_event(
        &mut self,
        event: &BundleEvent,
        contacts: &ContactManager,
    ) -> Vec<RouterAction> {
        match event {
            BundleEvent::BundleReceived { bundle, .. } => {
                self.pending.insert(bundle.id(), bundle.clone());
                let mut actions = vec![RouterAction::StoreAdd(bundle.clone())];
                actions.extend(self.route_bundle(bundle, contacts));
                actions
            }
            BundleEvent::ReassemblyCompleted { bundle } => {
                self.pending.insert(bundle.id(), bundle.clone());
                self.route_bundle(bundle, contacts)
            }
            BundleEvent::BundleTransmitted { bundle, acked: true, .. }
            | BundleEvent::BundleDelivered { bundle, .. } => {
                self.pending.remove(&bundle.id());
                vec![RouterAction::StoreDel(bundle.id())]
            }
            BundleEvent::BundleExpired { bundle } => {
                self.pending.remove(&bundle.id());
                vec![RouterAction::StoreDel(bundle.id())]
            }
            BundleEvent::BundleTransmitFailed { bundle, .. }
            | BundleEvent::BundleForwardTimeout { bundle, .. } => {
                // Still pending; try any other viable route.
                self.route_bundle(bundle, contacts)
            }
            BundleEvent::ContactUp { link } => {
                log::debug!("router: contact up on {}, rerouting pending", link);
                self.reroute_pending(contacts)
            }
            BundleEvent::RouteAdd { entry } => {
                self.table.add(entry.clone());
                self.reroute_pending(contacts)
            }
            BundleEvent::RouteDel { pattern } => {
                self.table.del(pattern);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn local_eid(&self) -> &EndpointId {
        &self.local_eid
    }

    fn route_table(&mut self) -> &mut RouteTable {
        &mut self.table
    }

    fn pending_bundles(&self) -> Vec<BundleRef> {
        self.pending.values().cloned().collect()
    }
}
