use petrel_bp::admin::CustodySignal;
use petrel_bp::{BundleRef, EndpointId};

use crate::contacts::LinkState;
use crate::router::RouteEntry;

/// Why a contact or link changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactDownReason {
    NoInfo,
    User,
    Broken,
    Reconnect,
    Idle,
    Timeout,
    Shutdown,
}

/// Where a received bundle came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventSource {
    App,
    Peer,
    Store,
    Admin,
    Fragmentation,
}

/// Everything the daemon reacts to. Events carry strong references to the
/// entities they concern, or bare ids where the daemon must look up.
#[derive(Debug, Clone)]
pub enum BundleEvent {
    BundleReceived {
        bundle: BundleRef,
        source: EventSource,
        bytes: u64,
        link: Option<String>,
    },
    BundleTransmitted {
        bundle: BundleRef,
        link: String,
        bytes_sent: u64,
        acked: bool,
    },
    BundleTransmitFailed {
        bundle: BundleRef,
        link: String,
    },
    BundleExpired {
        bundle: BundleRef,
    },
    BundleFree {
        bundle_id: u64,
    },
    BundleForwardTimeout {
        bundle: BundleRef,
        link: String,
    },
    BundleDelivered {
        bundle: BundleRef,
        regid: u32,
    },
    ContactUp {
        link: String,
    },
    ContactDown {
        link: String,
        reason: ContactDownReason,
    },
    LinkCreated {
        link: String,
    },
    LinkDeleted {
        link: String,
    },
    LinkAvailable {
        link: String,
    },
    LinkUnavailable {
        link: String,
    },
    LinkStateChangeRequest {
        link: String,
        state: LinkState,
        reason: ContactDownReason,
    },
    ReassemblyCompleted {
        bundle: BundleRef,
    },
    RegistrationAdded {
        regid: u32,
    },
    RegistrationRemoved {
        regid: u32,
    },
    RegistrationExpired {
        regid: u32,
    },
    RouteAdd {
        entry: RouteEntry,
    },
    RouteDel {
        pattern: EndpointId,
    },
    CustodySignalReceived {
        signal: CustodySignal,
    },
    Shutdown,
}

impl BundleEvent {
    /// Daemon-only events are never delivered to routers.
    pub fn daemon_only(&self) -> bool {
        matches!(
            self,
            BundleEvent::BundleFree { .. }
                | BundleEvent::LinkStateChangeRequest { .. }
                | BundleEvent::Shutdown
        )
    }

    pub fn type_str(&self) -> &'static str {
        match self {
            BundleEvent::BundleReceived { .. } => "bundle_received",
            BundleEvent::BundleTransmitted { .. } => "bundle_transmitted",
            BundleEvent::BundleTransmitFailed { .. } => "bundle_transmit_failed",
            BundleEvent::BundleExpired { .. } => "bundle_expired",
            BundleEvent::BundleFree { .. } => "bundle_free",
            BundleEvent::BundleForwardTimeout { .. } => "bundle_forward_timeout",
            BundleEvent::BundleDelivered { .. } => "bundle_delivered",
            BundleEvent::ContactUp { .. } => "contact_up",
            BundleEvent::ContactDown { .. } => "contact_down",
            BundleEvent::LinkCreated { .. } => "link_created",
            BundleEvent::LinkDeleted { .. } => "link_deleted",
            BundleEvent::LinkAvailable { .. } => "link_available",
            BundleEvent::LinkUnavailable { .. } => "link_unavailable",
            BundleEvent::LinkStateChangeRequest { .. } => "link_state_change_request",
            BundleEvent::ReassemblyCompleted { .. } => "reassembly_completed",
            BundleEvent::RegistrationAdded { .. } => "registration_added",
            BundleEvent::RegistrationRemoved { .. } => "registration_removed",
            BundleEvent::RegistrationExpired { .. } => "registration_expired",
            BundleEvent::RouteAdd { .. } => "route_add",
            BundleEvent::RouteDel { .. } => "route_del",
            BundleEvent::CustodySignalReceived { .. } => "custody_signal",
            BundleEvent::Shutdown => "shutdown",
        }
    }
}
