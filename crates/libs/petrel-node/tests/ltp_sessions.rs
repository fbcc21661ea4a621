//! LTP sender/receiver state machines driven over real sockets, with the
//! test relaying (and selectively dropping) segments between them.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use common::bundle_to;
use petrel_node::cla::ltp::bucket::{spawn_rate_sender, BucketKind, TokenBucket};
use petrel_node::cla::ltp::receiver::{ExtractedBlock, LtpReceiver};
use petrel_node::cla::ltp::segment::{Segment, SessionId};
use petrel_node::cla::ltp::sender::LtpSender;
use petrel_node::cla::ltp::timers::spawn_timer_actor;
use petrel_node::cla::ltp::LtpParams;
use petrel_node::daemon::DaemonHandle;
use petrel_node::event::BundleEvent;

struct Harness {
    sender: LtpSender,
    receiver: LtpReceiver,
    /// Datagrams emitted by the sender land here.
    capture_snd: UdpSocket,
    /// Datagrams emitted by the receiver land here.
    capture_rcv: UdpSocket,
    extract_rx: mpsc::UnboundedReceiver<ExtractedBlock>,
    events_rx: mpsc::UnboundedReceiver<BundleEvent>,
    _keep: (mpsc::UnboundedReceiver<petrel_node::cla::ltp::timers::TimerKey>,
            mpsc::UnboundedReceiver<petrel_node::cla::ltp::timers::TimerKey>),
}

fn params() -> LtpParams {
    LtpParams {
        engine_id: 7,
        agg_size: 1 << 30,
        agg_time_ms: 3_600_000,
        seg_size: 2500,
        retran_retries: 2,
        ..LtpParams::default()
    }
}

async fn harness() -> Harness {
    let params = params();
    let cancel = CancellationToken::new();

    let capture_snd = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let out_snd = Arc::new(UdpSocket::bind("127.0.0.1:0").await.expect("bind"));
    let (fire_snd_tx, fire_snd_rx) = mpsc::unbounded_channel();
    let timers_snd = spawn_timer_actor(fire_snd_tx, cancel.clone());
    let rate_snd = spawn_rate_sender(
        out_snd,
        capture_snd.local_addr().expect("addr"),
        TokenBucket::new(BucketKind::Standard, 0, 0),
        cancel.clone(),
    );
    let (daemon, events_rx) = DaemonHandle::detached();
    let sender = LtpSender::new(params.clone(), "l1".into(), rate_snd, timers_snd, daemon);

    let capture_rcv = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let out_rcv = Arc::new(UdpSocket::bind("127.0.0.1:0").await.expect("bind"));
    let (fire_rcv_tx, fire_rcv_rx) = mpsc::unbounded_channel();
    let timers_rcv = spawn_timer_actor(fire_rcv_tx, cancel.clone());
    let rate_rcv = spawn_rate_sender(
        out_rcv,
        capture_rcv.local_addr().expect("addr"),
        TokenBucket::new(BucketKind::Standard, 0, 0),
        cancel.clone(),
    );
    let (extract_tx, extract_rx) = mpsc::unbounded_channel();
    let receiver = LtpReceiver::new(params, "l1".into(), rate_rcv, timers_rcv, extract_tx);

    Harness {
        sender,
        receiver,
        capture_snd,
        capture_rcv,
        extract_rx,
        events_rx,
        _keep: (fire_snd_rx, fire_rcv_rx),
    }
}

async fn recv_segment(socket: &UdpSocket) -> Segment {
    let mut buf = vec![0u8; 65536];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("segment within deadline")
        .expect("recv");
    Segment::decode(&buf[..n], None).expect("decode")
}

fn drain_events(rx: &mut mpsc::UnboundedReceiver<BundleEvent>) -> Vec<BundleEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

#[tokio::test]
async fn clean_session_roundtrip() {
    let mut h = harness().await;
    let block = vec![0xa5u8; 10_000];
    let bundle = bundle_to("dtn://far/app", b"x");
    h.sender.offer_bundle(bundle, block.clone());
    h.sender.flush();
    assert_eq!(h.sender.session_count(), 1);

    // Four data segments, the last checkpoint + end-of-block.
    let mut segments = Vec::new();
    for _ in 0..4 {
        match recv_segment(&h.capture_snd).await {
            Segment::Data(ds) => segments.push(ds),
            other => panic!("expected data segment, got {other:?}"),
        }
    }
    assert!(segments.iter().all(|ds| ds.data.len() <= 2500));
    assert_eq!(segments[3].offset, 7500);
    assert!(segments[3].checkpoint.is_some());
    assert!(segments[3].eorp);
    assert!(segments[3].eob);

    for ds in &segments {
        h.receiver.handle_data(ds);
    }
    assert_eq!(h.receiver.session_count(), 1);

    // The checkpoint answer covers the whole block.
    let rs = match recv_segment(&h.capture_rcv).await {
        Segment::Report(rs) => rs,
        other => panic!("expected report, got {other:?}"),
    };
    assert_eq!(rs.lower, 0);
    assert_eq!(rs.upper, 10_000);
    assert_eq!(rs.claims, vec![(0, 10_000)]);

    h.sender.handle_report(&rs);
    assert_eq!(h.sender.session_count(), 0, "session completes on covering report");

    let ra = recv_segment(&h.capture_snd).await;
    let Segment::ReportAck { session, report_serial } = ra else {
        panic!("expected report-ack, got {ra:?}");
    };
    h.receiver.handle_report_ack(session, report_serial);
    assert_eq!(h.receiver.session_count(), 0, "receiver closes after the ack");

    let extracted = h.extract_rx.try_recv().expect("extracted block");
    assert_eq!(extracted.bytes, block, "reassembly must be byte-identical");

    let events = drain_events(&mut h.events_rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, BundleEvent::BundleTransmitted { acked: true, .. })));
    assert!(!events.iter().any(|e| matches!(e, BundleEvent::BundleTransmitFailed { .. })));
}

#[tokio::test]
async fn lost_segment_is_retransmitted() {
    let mut h = harness().await;
    let block: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    h.sender.offer_bundle(bundle_to("dtn://far/app", b"x"), block.clone());
    h.sender.flush();

    let mut segments = Vec::new();
    for _ in 0..4 {
        match recv_segment(&h.capture_snd).await {
            Segment::Data(ds) => segments.push(ds),
            other => panic!("expected data segment, got {other:?}"),
        }
    }

    // Drop the second segment.
    for ds in segments.iter().filter(|ds| ds.offset != 2500) {
        h.receiver.handle_data(ds);
    }
    let rs = match recv_segment(&h.capture_rcv).await {
        Segment::Report(rs) => rs,
        other => panic!("expected report, got {other:?}"),
    };
    assert_eq!(rs.claims, vec![(0, 2500), (5000, 5000)], "gap claim for the lost range");

    h.sender.handle_report(&rs);
    assert_eq!(h.sender.session_count(), 1, "gap keeps the session alive");

    // Ack first (control priority), then exactly the missing range.
    let ra = recv_segment(&h.capture_snd).await;
    assert!(matches!(ra, Segment::ReportAck { .. }));
    let retransmit = match recv_segment(&h.capture_snd).await {
        Segment::Data(ds) => ds,
        other => panic!("expected retransmitted data, got {other:?}"),
    };
    assert_eq!(retransmit.offset, 2500);
    assert_eq!(retransmit.data.len(), 2500);
    assert!(retransmit.checkpoint.is_some(), "retransmission ends in a fresh checkpoint");

    h.receiver.handle_data(&retransmit);
    let rs2 = match recv_segment(&h.capture_rcv).await {
        Segment::Report(rs) => rs,
        other => panic!("expected covering report, got {other:?}"),
    };
    assert_eq!(rs2.claims, vec![(0, 10_000)]);
    h.sender.handle_report(&rs2);
    assert_eq!(h.sender.session_count(), 0);

    let extracted = h.extract_rx.try_recv().expect("extracted block");
    assert_eq!(extracted.bytes, block);

    let events = drain_events(&mut h.events_rx);
    assert!(!events.iter().any(|e| matches!(e, BundleEvent::BundleTransmitFailed { .. })),
        "recovered loss must not surface transmit-failed");
}

#[tokio::test]
async fn retry_exhaustion_cancels_session() {
    let mut h = harness().await;
    h.sender.offer_bundle(bundle_to("dtn://far/app", b"x"), vec![1u8; 5000]);
    h.sender.flush();

    // Swallow the initial segments; note the checkpoint serial.
    let mut serial = None;
    for _ in 0..2 {
        if let Segment::Data(ds) = recv_segment(&h.capture_snd).await {
            if let Some((ckpt, _)) = ds.checkpoint {
                serial = Some(ckpt);
            }
        }
    }
    let serial = serial.expect("checkpoint serial");

    // Every retransmit round is also lost; the budget is two retries.
    h.sender.on_checkpoint_timer(1, serial);
    h.sender.on_checkpoint_timer(1, serial);
    h.sender.on_checkpoint_timer(1, serial);

    let cancel = loop {
        match recv_segment(&h.capture_snd).await {
            Segment::Cancel { session, by_sender: true, reason } => break (session, reason),
            Segment::Data(_) => continue,
            other => panic!("unexpected segment {other:?}"),
        }
    };
    assert_eq!(cancel.0, SessionId { engine: 7, session: 1 });
    assert_eq!(
        cancel.1,
        petrel_node::cla::ltp::segment::CancelReason::RetransmitCycleExceeded
    );

    let events = drain_events(&mut h.events_rx);
    assert!(
        events.iter().any(|e| matches!(e, BundleEvent::BundleTransmitFailed { .. })),
        "exhaustion must surface transmit-failed"
    );

    // The cancel-ack completes the handshake and frees the session.
    h.sender.handle_cancel_ack(SessionId { engine: 7, session: 1 });
    assert_eq!(h.sender.session_count(), 0);
}

#[tokio::test]
async fn receiver_acks_cancel_for_unknown_session() {
    let mut h = harness().await;
    let sid = SessionId { engine: 99, session: 5 };
    h.receiver.handle_cancel_by_sender(sid);
    let ack = recv_segment(&h.capture_rcv).await;
    assert_eq!(ack, Segment::CancelAck { session: sid, to_sender: true });
}
