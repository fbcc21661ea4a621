//! LTP-over-UDP convergence layer: cooperating actors bound to one socket
//! per link. A per-link engine task owns the sender and receiver state
//! machines; a timer actor serializes all timers; a rate-limited sender
//! actor owns the socket's send half; an extraction task turns completed
//! blocks back into bundles.

pub mod bucket;
pub mod receiver;
pub mod segment;
pub mod sender;
pub mod timers;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use petrel_bp::{BundleProtocol, BundleRef};

use bucket::{spawn_rate_sender, BucketKind, TokenBucket};
use receiver::{ExtractedBlock, LtpReceiver};
use segment::{Segment, SegmentAuth, SERVICE_BUNDLE, SERVICE_BUNDLE_AGGREGATE};
use sender::LtpSender;
use timers::{spawn_timer_actor, TimerKey};

use crate::cla::{ConvergenceLayer, InterfaceParams};
use crate::contacts::LinkRef;
use crate::daemon::DaemonHandle;
use crate::error::NodeError;
use crate::event::{BundleEvent, EventSource};

const RECV_BUF_SIZE: usize = 65_536;
const AGG_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct LtpParams {
    pub engine_id: u64,
    /// Loading-session flush threshold in bytes.
    pub agg_size: u64,
    /// Loading-session flush deadline.
    pub agg_time_ms: u64,
    /// Data-segment payload size.
    pub seg_size: usize,
    pub retran_intvl_ms: u64,
    pub retran_retries: u32,
    pub cancel_retries: u32,
    pub inact_intvl_ms: u64,
    /// Send sessions green (unreliable) instead of red.
    pub green: bool,
    pub service_id: u64,
    pub rate_bps: u64,
    pub bucket_depth_bits: u64,
    pub bucket_kind: BucketKind,
    pub auth: Option<SegmentAuth>,
    /// Receive buffers rotated round-robin by the socket reader.
    pub recv_bufs: usize,
}

impl Default for LtpParams {
    fn default() -> Self {
        Self {
            engine_id: 1,
            agg_size: 100_000,
            agg_time_ms: 500,
            seg_size: 1400,
            retran_intvl_ms: 1000,
            retran_retries: 7,
            cancel_retries: 4,
            inact_intvl_ms: 30_000,
            green: false,
            service_id: SERVICE_BUNDLE,
            rate_bps: 0,
            bucket_depth_bits: 524_288,
            bucket_kind: BucketKind::Standard,
            auth: None,
            recv_bufs: 4,
        }
    }
}

enum EngineCmd {
    Kick,
    Datagram(Vec<u8>),
    Timer(TimerKey),
}

struct EngineHandle {
    cmd_tx: mpsc::UnboundedSender<EngineCmd>,
    cancel: CancellationToken,
    rate: bucket::RateSenderHandle,
}

/// The LTP convergence layer adapter.
pub struct LtpCla {
    protocol: BundleProtocol,
    params: LtpParams,
    engines: Mutex<HashMap<String, EngineHandle>>,
}

impl LtpCla {
    pub fn new(protocol: BundleProtocol, params: LtpParams) -> Self {
        Self { protocol, params, engines: Mutex::new(HashMap::new()) }
    }

    fn engines(&self) -> std::sync::MutexGuard<'_, HashMap<String, EngineHandle>> {
        self.engines.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the actor tree for one peer. With a link the engine carries
    /// outbound sessions; without one it only receives.
    fn spawn_engine(
        &self,
        key: String,
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        link: Option<LinkRef>,
        daemon: DaemonHandle,
    ) -> EngineHandle {
        let cancel = daemon.cancel_token().child_token();
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<EngineCmd>();

        // Timer firings route back into the engine's command stream.
        let (fire_tx, mut fire_rx) = mpsc::unbounded_channel::<TimerKey>();
        let timer_handle = spawn_timer_actor(fire_tx, cancel.clone());
        {
            let cmd_tx = cmd_tx.clone();
            tokio::spawn(async move {
                while let Some(key) = fire_rx.recv().await {
                    if cmd_tx.send(EngineCmd::Timer(key)).is_err() {
                        break;
                    }
                }
            });
        }

        let out = spawn_rate_sender(
            socket.clone(),
            peer,
            TokenBucket::new(self.params.bucket_kind, self.params.rate_bps, self.params.bucket_depth_bits),
            cancel.clone(),
        );

        // Bundle extraction runs on its own task so reassembled blocks do
        // not stall segment processing.
        let (extract_tx, mut extract_rx) = mpsc::unbounded_channel::<ExtractedBlock>();
        {
            let protocol = self.protocol.clone();
            let daemon = daemon.clone();
            let link_name = link.as_ref().map(|l| l.name.clone());
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        block = extract_rx.recv() => match block {
                            Some(block) => extract_bundles(&protocol, &daemon, link_name.as_deref(), block),
                            None => break,
                        },
                    }
                }
            });
        }

        let link_name =
            link.as_ref().map(|l| l.name.clone()).unwrap_or_else(|| format!("ltp-in:{peer}"));
        let mut snd = LtpSender::new(
            self.params.clone(),
            link_name.clone(),
            out.clone(),
            timer_handle.clone(),
            daemon.clone(),
        );
        let mut rcv = LtpReceiver::new(
            self.params.clone(),
            link_name.clone(),
            out.clone(),
            timer_handle.clone(),
            extract_tx,
        );

        let auth = self.params.auth.clone();
        let protocol = self.protocol.clone();
        let engine_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut agg_tick = tokio::time::interval(AGG_TICK);
            loop {
                tokio::select! {
                    _ = engine_cancel.cancelled() => {
                        snd.fail_all();
                        break;
                    }
                    _ = agg_tick.tick() => snd.tick(),
                    cmd = cmd_rx.recv() => match cmd {
                        None => break,
                        Some(EngineCmd::Kick) => {
                            if let Some(link) = link.as_ref() {
                                drain_link(link, &protocol, &mut snd);
                            }
                        }
                        Some(EngineCmd::Datagram(bytes)) => {
                            dispatch_segment(&bytes, auth.as_ref(), &mut snd, &mut rcv, &link_name);
                        }
                        Some(EngineCmd::Timer(key)) => match key {
                            TimerKey::Checkpoint { session, serial } => {
                                snd.on_checkpoint_timer(session, serial);
                            }
                            TimerKey::SenderCancel { session } => snd.on_cancel_timer(session),
                            TimerKey::Report { session, serial } => {
                                rcv.on_report_timer(session, serial);
                            }
                            TimerKey::ReceiverCancel { session } => rcv.on_cancel_timer(session),
                            TimerKey::Inactivity { session } => rcv.on_inactivity_timer(session),
                        },
                    },
                }
            }
        });

        EngineHandle { cmd_tx, cancel, rate: out }
    }

    /// Socket reader: pre-allocated buffers rotated round-robin, one
    /// datagram per command. Short poll timeouts keep the stop flag
    /// observable.
    fn spawn_reader(
        &self,
        socket: Arc<UdpSocket>,
        cmd_for: impl Fn(SocketAddr) -> Option<mpsc::UnboundedSender<EngineCmd>> + Send + 'static,
        cancel: CancellationToken,
    ) {
        let bufs = self.params.recv_bufs.max(1);
        tokio::spawn(async move {
            let mut pool = vec![vec![0u8; RECV_BUF_SIZE]; bufs];
            let mut next = 0usize;
            loop {
                let buf = &mut pool[next];
                next = (next + 1) % bufs;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = socket.recv_from(buf) => match result {
                        Ok((n, from)) => {
                            if let Some(tx) = cmd_for(from) {
                                let _ = tx.send(EngineCmd::Datagram(buf[..n].to_vec()));
                            } else {
                                log::debug!("ltp: datagram from unknown peer {from}");
                            }
                        }
                        Err(e) => {
                            log::warn!("ltp: recv error: {e}");
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    },
                }
            }
        });
    }
}

fn drain_link(link: &LinkRef, protocol: &BundleProtocol, snd: &mut LtpSender) {
    while let Some(bundle) = link.start_next() {
        match serialize_bundle(protocol, &bundle, &link.name) {
            Ok(image) => snd.offer_bundle(bundle, image),
            Err(e) => {
                log::error!("ltp({}): serialize {}: {e}", link.name, bundle);
            }
        }
    }
}

fn serialize_bundle(
    protocol: &BundleProtocol,
    bundle: &BundleRef,
    link: &str,
) -> Result<Vec<u8>, NodeError> {
    let xmit = protocol.prepare_blocks(bundle, link)?;
    Ok(protocol.produce_all(bundle, &xmit)?)
}

fn dispatch_segment(
    bytes: &[u8],
    auth: Option<&SegmentAuth>,
    snd: &mut LtpSender,
    rcv: &mut LtpReceiver,
    link_name: &str,
) {
    let segment = match Segment::decode(bytes, auth) {
        Ok(s) => s,
        Err(NodeError::Security(_)) => {
            // Authentication failures are dropped without a response.
            log::trace!("ltp({link_name}): dropping unauthenticated segment");
            return;
        }
        Err(e) => {
            log::warn!("ltp({link_name}): bad segment: {e}");
            return;
        }
    };
    match segment {
        Segment::Data(ds) => rcv.handle_data(&ds),
        Segment::Report(rs) => snd.handle_report(&rs),
        Segment::ReportAck { session, report_serial } => {
            rcv.handle_report_ack(session, report_serial);
        }
        Segment::Cancel { session, by_sender: true, .. } => rcv.handle_cancel_by_sender(session),
        Segment::Cancel { session, by_sender: false, reason } => {
            snd.handle_cancel_by_receiver(session, reason);
        }
        Segment::CancelAck { session, to_sender: true } => snd.handle_cancel_ack(session),
        Segment::CancelAck { session, to_sender: false } => rcv.handle_cancel_ack(session),
    }
}

/// Turn a completed LTP block back into bundles and hand them up.
fn extract_bundles(
    protocol: &BundleProtocol,
    daemon: &DaemonHandle,
    link: Option<&str>,
    block: ExtractedBlock,
) {
    let post = |bundle: petrel_bp::Bundle, bytes: u64| {
        daemon.post(BundleEvent::BundleReceived {
            bundle: Arc::new(bundle),
            source: EventSource::Peer,
            bytes,
            link: link.map(str::to_string),
        });
    };

    match block.service_id {
        SERVICE_BUNDLE => match protocol.consume_all(&block.bytes) {
            Ok(bundle) => post(bundle, block.bytes.len() as u64),
            Err(e) => log::warn!("ltp: extracted block is not a bundle: {e}"),
        },
        SERVICE_BUNDLE_AGGREGATE => {
            let mut cur = block.bytes.as_slice();
            while !cur.is_empty() {
                let len = match petrel_sdnv::decode_advance(&mut cur) {
                    Ok(len) => len as usize,
                    Err(e) => {
                        log::warn!("ltp: aggregate framing: {e}");
                        return;
                    }
                };
                if cur.len() < len {
                    log::warn!("ltp: aggregate bundle extends past block");
                    return;
                }
                match protocol.consume_all(&cur[..len]) {
                    Ok(bundle) => post(bundle, len as u64),
                    Err(e) => log::warn!("ltp: aggregate member: {e}"),
                }
                cur = &cur[len..];
            }
        }
        other => log::warn!("ltp: dropping block with service id {other}"),
    }
}

#[async_trait]
impl ConvergenceLayer for LtpCla {
    fn name(&self) -> &'static str {
        "ltp"
    }

    async fn start_interface(
        &self,
        params: InterfaceParams,
        daemon: DaemonHandle,
    ) -> Result<(), NodeError> {
        let socket = Arc::new(UdpSocket::bind(&params.local_addr).await?);
        log::info!("ltp: interface {} on {}", params.name, params.local_addr);

        // Receiver-only engines, created per peer on first datagram.
        let engines: Arc<Mutex<HashMap<SocketAddr, EngineHandle>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let this = LtpCla::new(self.protocol.clone(), self.params.clone());
        let socket_for_engines = socket.clone();
        let cancel = daemon.cancel_token().child_token();
        self.spawn_reader(
            socket,
            move |peer| {
                let mut map = engines.lock().unwrap_or_else(|e| e.into_inner());
                let handle = map.entry(peer).or_insert_with(|| {
                    this.spawn_engine(
                        format!("{}:{}", params.name, peer),
                        socket_for_engines.clone(),
                        peer,
                        None,
                        daemon.clone(),
                    )
                });
                Some(handle.cmd_tx.clone())
            },
            cancel,
        );
        Ok(())
    }

    async fn open_contact(&self, link: LinkRef, daemon: DaemonHandle) -> Result<(), NodeError> {
        let peer: SocketAddr = link
            .nexthop
            .parse()
            .map_err(|_| NodeError::Policy(format!("bad ltp nexthop {}", link.nexthop)))?;
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        log::info!("ltp({}): contact to {}", link.name, peer);

        let handle = self.spawn_engine(
            link.name.clone(),
            socket.clone(),
            peer,
            Some(link.clone()),
            daemon.clone(),
        );
        let cmd_tx = handle.cmd_tx.clone();
        self.spawn_reader(socket, move |_from| Some(cmd_tx.clone()), handle.cancel.clone());

        self.engines().insert(link.name.clone(), handle);
        daemon.post(BundleEvent::ContactUp { link: link.name.clone() });
        Ok(())
    }

    async fn close_contact(&self, link_name: &str) {
        if let Some(engine) = self.engines().remove(link_name) {
            engine.cancel.cancel();
            log::info!("ltp({}): contact closed", link_name);
        }
    }

    fn notify_queued(&self, link_name: &str) {
        if let Some(engine) = self.engines().get(link_name) {
            let _ = engine.cmd_tx.send(EngineCmd::Kick);
        }
    }
}

impl Drop for LtpCla {
    fn drop(&mut self) {
        for engine in self.engines().values() {
            engine.cancel.cancel();
        }
    }
}

impl LtpCla {
    /// Runtime reconfiguration from the admin channel: applied by the
    /// rate sender at the next segment boundary.
    pub fn reconfigure_rate(&self, link_name: &str, config: bucket::RateConfig) {
        if let Some(engine) = self.engines().get(link_name) {
            engine.rate.reconfigure(config);
        } else {
            log::warn!("ltp: reconfigure for unknown link {link_name}");
        }
    }
}
