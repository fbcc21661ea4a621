#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use petrel_bp::payload::BundlePayload;
use petrel_bp::{Bundle, BundleProtocol, BundleRef, EndpointId};
use petrel_node::cla::{ClaRegistry, ConvergenceLayer, InterfaceParams};
use petrel_node::custody::CustodyManager;
use petrel_node::daemon::{BundleDaemon, DaemonHandle};
use petrel_node::reg::RegistrationTable;
use petrel_node::router::StaticRouter;
use petrel_node::{ContactManager, LinkRef, NodeConfig};

pub fn eid(s: &str) -> EndpointId {
    EndpointId::parse(s).expect("valid eid")
}

pub fn bundle_to(dest: &str, payload: &[u8]) -> BundleRef {
    let mut b = Bundle::new();
    b.source = eid("dtn://src/app");
    b.dest = eid(dest);
    b.lifetime_secs = 300;
    b.set_payload(BundlePayload::with_memory(payload.to_vec()));
    Arc::new(b)
}

/// A convergence layer that records contacts and does no I/O. Opening a
/// contact immediately reports it up.
#[derive(Default)]
pub struct MockCla {
    pub opened: Mutex<Vec<String>>,
    pub closed: Mutex<Vec<String>>,
}

#[async_trait]
impl ConvergenceLayer for MockCla {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn start_interface(
        &self,
        _params: InterfaceParams,
        _daemon: DaemonHandle,
    ) -> Result<(), petrel_node::NodeError> {
        Ok(())
    }

    async fn open_contact(
        &self,
        link: LinkRef,
        daemon: DaemonHandle,
    ) -> Result<(), petrel_node::NodeError> {
        self.opened.lock().expect("lock").push(link.name.clone());
        daemon.post(petrel_node::BundleEvent::ContactUp { link: link.name.clone() });
        Ok(())
    }

    async fn close_contact(&self, link_name: &str) {
        self.closed.lock().expect("lock").push(link_name.to_string());
    }

    fn notify_queued(&self, _link_name: &str) {}
}

pub struct TestNode {
    pub handle: DaemonHandle,
    pub contacts: Arc<Mutex<ContactManager>>,
    pub regs: Arc<Mutex<RegistrationTable>>,
    pub local_eid: EndpointId,
}

/// Spin up an independent daemon with a static router and the given CLA
/// registry, running on the current runtime.
pub fn spawn_node(local: &str, clas: ClaRegistry) -> TestNode {
    let router = StaticRouter::new(eid(local));
    spawn_node_with_router(local, clas, router)
}

pub fn spawn_node_with_router(local: &str, clas: ClaRegistry, router: StaticRouter) -> TestNode {
    let local_eid = eid(local);
    let config = NodeConfig::new(local_eid.clone());
    let protocol = BundleProtocol::default();
    let router = Box::new(router);
    let regs = RegistrationTable::new(None).expect("table");
    let custody = CustodyManager::new(local_eid.clone(), None);

    let daemon =
        BundleDaemon::new(config, protocol, router, regs, None, custody, Arc::new(clas));
    let handle = daemon.handle();
    let contacts = daemon.contacts();
    let regs = daemon.registrations();
    tokio::spawn(daemon.run());
    TestNode { handle, contacts, regs, local_eid }
}

pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
}
