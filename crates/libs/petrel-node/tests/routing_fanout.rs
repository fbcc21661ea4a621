//! Route-table fanout through a running daemon.

mod common;

use std::sync::Arc;

use common::{bundle_to, eid, settle, spawn_node_with_router, MockCla};
use petrel_node::cla::ClaRegistry;
use petrel_node::event::{BundleEvent, EventSource};
use petrel_node::router::{ForwardingMode, RouteEntry, Router, StaticRouter};
use petrel_node::{Link, LinkParams};

#[tokio::test]
async fn forward_copy_enqueues_on_both_links() {
    let mut clas = ClaRegistry::new();
    clas.register(Arc::new(MockCla::default()));

    let mut router = StaticRouter::new(eid("dtn://node"));
    for link in ["l1", "l2"] {
        router.route_table().add(RouteEntry {
            pattern: eid("dtn://*/app"),
            link: link.into(),
            mode: ForwardingMode::ForwardCopy,
        });
    }
    let node = spawn_node_with_router("dtn://node", clas, router);

    let (l1, l2) = {
        let mut contacts = node.contacts.lock().expect("lock");
        let l1 = Link::new("l1", "mock", "peer1:1", LinkParams::default());
        let l2 = Link::new("l2", "mock", "peer2:1", LinkParams::default());
        contacts.add_link(l1.clone()).expect("add l1");
        contacts.add_link(l2.clone()).expect("add l2");
        (l1, l2)
    };

    let bundle = bundle_to("dtn://far/app", b"fanout");
    node.handle.post(BundleEvent::BundleReceived {
        bundle: bundle.clone(),
        source: EventSource::Peer,
        bytes: 6,
        link: None,
    });
    settle().await;

    assert!(l1.is_queued(&bundle), "bundle must be queued on l1");
    assert!(l2.is_queued(&bundle), "bundle must be queued on l2");
    assert_eq!(l1.queue_depth(), 1, "exactly once on l1");
    assert_eq!(l2.queue_depth(), 1, "exactly once on l2");

    // A duplicate arrival must not double-queue.
    node.handle.post(BundleEvent::BundleReceived {
        bundle: bundle.clone(),
        source: EventSource::App,
        bytes: 6,
        link: None,
    });
    settle().await;
    assert_eq!(l1.queue_depth(), 1);
    node.handle.shutdown();
}

#[tokio::test]
async fn forward_unique_picks_first_match() {
    let mut clas = ClaRegistry::new();
    clas.register(Arc::new(MockCla::default()));

    let mut router = StaticRouter::new(eid("dtn://node"));
    for link in ["l1", "l2"] {
        router.route_table().add(RouteEntry {
            pattern: eid("dtn://*/app"),
            link: link.into(),
            mode: ForwardingMode::ForwardUnique,
        });
    }
    let node = spawn_node_with_router("dtn://node", clas, router);

    let (l1, l2) = {
        let mut contacts = node.contacts.lock().expect("lock");
        let l1 = Link::new("l1", "mock", "peer1:1", LinkParams::default());
        let l2 = Link::new("l2", "mock", "peer2:1", LinkParams::default());
        contacts.add_link(l1.clone()).expect("add l1");
        contacts.add_link(l2.clone()).expect("add l2");
        (l1, l2)
    };

    let bundle = bundle_to("dtn://far/app", b"unique");
    node.handle.post(BundleEvent::BundleReceived {
        bundle: bundle.clone(),
        source: EventSource::Peer,
        bytes: 6,
        link: None,
    });
    settle().await;

    assert!(l1.is_queued(&bundle));
    assert!(!l2.is_queued(&bundle), "unique forwarding must pick a single link");
    node.handle.shutdown();
}
