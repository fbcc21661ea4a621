//! Link lifecycle through the daemon: up, open, broken, recovered.

mod common;

use std::sync::Arc;

use common::{bundle_to, eid, settle, spawn_node_with_router, MockCla};
use petrel_node::cla::ClaRegistry;
use petrel_node::event::{BundleEvent, ContactDownReason, EventSource};
use petrel_node::router::{ForwardingMode, RouteEntry, Router, StaticRouter};
use petrel_node::{Link, LinkParams, LinkState};

#[tokio::test]
async fn flap_requeues_inflight() {
    let mock = Arc::new(MockCla::default());
    let mut clas = ClaRegistry::new();
    clas.register(mock.clone());

    let mut router = StaticRouter::new(eid("dtn://node"));
    router.route_table().add(RouteEntry {
        pattern: eid("dtn://far/*"),
        link: "l1".into(),
        mode: ForwardingMode::ForwardUnique,
    });
    let node = spawn_node_with_router("dtn://node", clas, router);

    let link = Link::new("l1", "mock", "peer:1", LinkParams::default());
    node.contacts.lock().expect("lock").add_link(link.clone()).expect("add");
    assert_eq!(link.state(), LinkState::Unavailable);

    node.handle.post(BundleEvent::LinkAvailable { link: "l1".into() });
    settle().await;
    assert_eq!(link.state(), LinkState::Available);

    // Queueing a bundle on an available link opens the contact; the mock
    // CLA reports ContactUp immediately.
    let bundle = bundle_to("dtn://far/app", b"flap");
    node.handle.post(BundleEvent::BundleReceived {
        bundle: bundle.clone(),
        source: EventSource::Peer,
        bytes: 4,
        link: None,
    });
    settle().await;
    assert_eq!(link.state(), LinkState::Open);
    assert_eq!(mock.opened.lock().expect("lock").as_slice(), ["l1"]);

    // Simulate the CLA taking the bundle in flight, then the contact
    // breaking underneath it.
    let started = link.start_next().expect("inflight");
    assert_eq!(started.id(), bundle.id());
    assert!(link.is_inflight(&bundle));

    node.handle.post(BundleEvent::ContactDown {
        link: "l1".into(),
        reason: ContactDownReason::Broken,
    });
    settle().await;
    assert_eq!(link.state(), LinkState::Available);
    assert!(link.is_queued(&bundle), "inflight bundle requeued for the next contact");
    assert!(!link.is_inflight(&bundle));

    node.handle.shutdown();
}

#[tokio::test]
async fn user_takedown_goes_unavailable() {
    let mock = Arc::new(MockCla::default());
    let mut clas = ClaRegistry::new();
    clas.register(mock.clone());
    let node = spawn_node_with_router(
        "dtn://node",
        clas,
        StaticRouter::new(eid("dtn://node")),
    );

    let link = Link::new("l1", "mock", "peer:1", LinkParams::default());
    node.contacts.lock().expect("lock").add_link(link.clone()).expect("add");
    node.handle.post(BundleEvent::LinkAvailable { link: "l1".into() });
    settle().await;

    node.handle.post(BundleEvent::LinkStateChangeRequest {
        link: "l1".into(),
        state: LinkState::Unavailable,
        reason: ContactDownReason::User,
    });
    settle().await;
    assert_eq!(link.state(), LinkState::Unavailable);
    assert_eq!(mock.closed.lock().expect("lock").as_slice(), ["l1"]);
    node.handle.shutdown();
}
