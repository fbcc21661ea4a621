//! Two full nodes talking LTP over loopback UDP: a bundle submitted on
//! node A is segmented, shipped, reassembled, and delivered to the
//! application bound on node B.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use petrel_bp::payload::BundlePayload;
use petrel_bp::{Bundle, EndpointId};
use petrel_daemon::bootstrap::bootstrap;
use petrel_daemon::config::DaemonConfig;
use petrel_node::event::{BundleEvent, EventSource};
use petrel_node::reg::{FailureAction, Registration};

fn free_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind");
    socket.local_addr().expect("addr").port()
}

#[tokio::test(flavor = "multi_thread")]
async fn bundle_crosses_ltp_link() {
    let port_b = free_udp_port();

    let config_b = format!(
        r#"
local_eid = "dtn://nodeb"

[[interfaces]]
name = "ltp0"
cla = "ltp"
listen = "127.0.0.1:{port_b}"

[ltp]
engine_id = 2
seg_size = 1000
agg_time_ms = 50

[api]
port = 0
"#
    );
    let node_b = bootstrap(DaemonConfig::from_toml(&config_b).expect("config b"))
        .await
        .expect("bootstrap b");

    let config_a = format!(
        r#"
local_eid = "dtn://nodea"

[[links]]
name = "to-b"
cla = "ltp"
nexthop = "127.0.0.1:{port_b}"

[[routes]]
pattern = "dtn://nodeb/*"
link = "to-b"

[ltp]
engine_id = 1
seg_size = 1000
agg_time_ms = 50

[api]
port = 0
"#
    );
    let node_a = bootstrap(DaemonConfig::from_toml(&config_a).expect("config a"))
        .await
        .expect("bootstrap a");

    // Application bound on B.
    let (tx, mut rx) = mpsc::unbounded_channel();
    {
        let mut regs = node_b.regs.lock().expect("lock");
        let regid = regs.next_regid();
        let reg = Registration::new(
            regid,
            EndpointId::parse("dtn://nodeb/app").expect("eid"),
            FailureAction::Defer,
            0,
            None,
        );
        reg.bind(tx).expect("bind");
        regs.add(reg).expect("add");
    }

    // 10 kB payload forces multiple data segments.
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 241) as u8).collect();
    let mut bundle = Bundle::new();
    bundle.source = EndpointId::parse("dtn://nodea/app").expect("eid");
    bundle.dest = EndpointId::parse("dtn://nodeb/app").expect("eid");
    bundle.lifetime_secs = 300;
    bundle.set_payload(BundlePayload::with_memory(payload.clone()));
    node_a.handle.post(BundleEvent::BundleReceived {
        bundle: Arc::new(bundle),
        source: EventSource::App,
        bytes: payload.len() as u64,
        link: None,
    });

    let delivered = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("delivery within deadline")
        .expect("delivered bundle");
    assert_eq!(delivered.source, EndpointId::parse("dtn://nodea/app").expect("eid"));
    assert_eq!(
        delivered.state().payload.read_all().expect("read"),
        payload,
        "payload must survive segmentation and reassembly byte-for-byte"
    );

    node_a.handle.shutdown();
    node_b.handle.shutdown();
}
