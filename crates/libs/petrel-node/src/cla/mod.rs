//! Convergence-layer adapters: each ships bundles over one transport and
//! runs as an I/O actor tree that produces daemon events.

pub mod ltp;
pub mod tcp;
pub mod udp;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::contacts::LinkRef;
use crate::daemon::DaemonHandle;
use crate::error::NodeError;

/// Parameters for a listening interface.
#[derive(Debug, Clone)]
pub struct InterfaceParams {
    pub name: String,
    pub local_addr: String,
}

/// A convergence-layer adapter. Interfaces receive bundles from peers;
/// contacts transmit a link's queue. All bundle state changes flow back
/// through daemon events.
#[async_trait]
pub trait ConvergenceLayer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start a listener. Spawns the receive actor and returns.
    async fn start_interface(
        &self,
        params: InterfaceParams,
        daemon: DaemonHandle,
    ) -> Result<(), NodeError>;

    /// Open a contact on `link`. Spawns the sender actor; posts ContactUp
    /// when the contact is usable.
    async fn open_contact(&self, link: LinkRef, daemon: DaemonHandle) -> Result<(), NodeError>;

    /// Tear down the contact for `link_name`, if any.
    async fn close_contact(&self, link_name: &str);

    /// Kick the sender actor: the link queue has new work.
    fn notify_queued(&self, link_name: &str);
}

/// The set of registered adapters, keyed by name.
#[derive(Default)]
pub struct ClaRegistry {
    map: HashMap<&'static str, Arc<dyn ConvergenceLayer>>,
}

impl ClaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, cla: Arc<dyn ConvergenceLayer>) {
        log::info!("cla: registered {}", cla.name());
        self.map.insert(cla.name(), cla);
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn ConvergenceLayer>> {
        self.map.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.map.keys().copied().collect()
    }
}
