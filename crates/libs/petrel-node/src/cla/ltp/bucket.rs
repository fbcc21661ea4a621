use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Token-bucket flavor: standard lets bursts drain a full bucket, leaky
/// admits at most one segment of credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketKind {
    Standard,
    Leaky,
}

#[derive(Debug)]
pub struct TokenBucket {
    kind: BucketKind,
    rate_bps: u64,
    depth_bits: u64,
    tokens_bits: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(kind: BucketKind, rate_bps: u64, depth_bits: u64) -> Self {
        Self { kind, rate_bps, depth_bits, tokens_bits: depth_bits as f64, last: Instant::now() }
    }

    pub fn reconfigure(&mut self, rate_bps: u64, depth_bits: u64, kind: BucketKind) {
        self.rate_bps = rate_bps;
        self.depth_bits = depth_bits;
        self.kind = kind;
        self.tokens_bits = self.tokens_bits.min(depth_bits as f64);
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        let cap = match self.kind {
            BucketKind::Standard => self.depth_bits as f64,
            // A leaky bucket never accumulates more than one MTU of credit.
            BucketKind::Leaky => (self.depth_bits as f64).min(12_000.0),
        };
        self.tokens_bits = (self.tokens_bits + elapsed * self.rate_bps as f64).min(cap);
    }

    /// How long to wait before `bytes` may be sent. Zero when unthrottled.
    pub fn delay_for(&mut self, bytes: usize) -> Duration {
        if self.rate_bps == 0 {
            return Duration::ZERO;
        }
        self.refill();
        let need = (bytes * 8) as f64;
        if self.tokens_bits >= need {
            self.tokens_bits -= need;
            return Duration::ZERO;
        }
        let deficit = need - self.tokens_bits;
        self.tokens_bits -= need;
        Duration::from_secs_f64(deficit / self.rate_bps as f64)
    }
}

/// Runtime reconfiguration applied at the next segment boundary.
#[derive(Debug, Clone)]
pub struct RateConfig {
    pub rate_bps: u64,
    pub depth_bits: u64,
    pub kind: BucketKind,
    /// All-Ops-Normal / in-communication flag; false parks the sender.
    pub aos: bool,
    pub clear_stats: bool,
}

enum RateCmd {
    Send { control: bool, bytes: Vec<u8> },
    Reconfigure(RateConfig),
}

#[derive(Debug, Default)]
pub struct RateStats {
    pub segments_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
}

/// Handle onto the rate-limited sender actor that fronts one UDP socket.
#[derive(Clone)]
pub struct RateSenderHandle {
    tx: mpsc::UnboundedSender<RateCmd>,
}

impl RateSenderHandle {
    /// Queue a segment. Control segments jump ahead of bulk data.
    pub fn send(&self, control: bool, bytes: Vec<u8>) {
        let _ = self.tx.send(RateCmd::Send { control, bytes });
    }

    pub fn reconfigure(&self, config: RateConfig) {
        let _ = self.tx.send(RateCmd::Reconfigure(config));
    }
}

/// Spawn the sender actor: one socket, two priority queues, one bucket.
/// The actor owns the send half exclusively; everything reaches the wire
/// through it.
pub fn spawn_rate_sender(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    mut bucket: TokenBucket,
    cancel: CancellationToken,
) -> RateSenderHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<RateCmd>();

    tokio::spawn(async move {
        let mut control: VecDeque<Vec<u8>> = VecDeque::new();
        let mut bulk: VecDeque<Vec<u8>> = VecDeque::new();
        let mut aos = true;
        let mut stats = RateStats::default();

        loop {
            // Drain commands first; block for one when idle or parked.
            while control.is_empty() && bulk.is_empty() || !aos {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    cmd = rx.recv() => match cmd {
                        Some(cmd) => apply_cmd(cmd, &mut control, &mut bulk, &mut bucket, &mut aos, &mut stats),
                        None => return,
                    },
                }
            }
            while let Ok(cmd) = rx.try_recv() {
                apply_cmd(cmd, &mut control, &mut bulk, &mut bucket, &mut aos, &mut stats);
            }
            if !aos {
                continue;
            }

            let Some(next) = control.pop_front().or_else(|| bulk.pop_front()) else {
                continue;
            };
            let delay = bucket.delay_for(next.len());
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            match socket.send_to(&next, peer).await {
                Ok(n) => {
                    stats.segments_sent += 1;
                    stats.bytes_sent += n as u64;
                }
                Err(e) => {
                    stats.send_errors += 1;
                    log::warn!("ltp: send to {} failed: {}", peer, e);
                }
            }
        }
    });

    RateSenderHandle { tx }
}

fn apply_cmd(
    cmd: RateCmd,
    control: &mut VecDeque<Vec<u8>>,
    bulk: &mut VecDeque<Vec<u8>>,
    bucket: &mut TokenBucket,
    aos: &mut bool,
    stats: &mut RateStats,
) {
    match cmd {
        RateCmd::Send { control: is_control, bytes } => {
            if is_control {
                control.push_back(bytes);
            } else {
                bulk.push_back(bytes);
            }
        }
        RateCmd::Reconfigure(config) => {
            log::info!(
                "ltp: rate reconfigure {}bps depth {} aos {}",
                config.rate_bps,
                config.depth_bits,
                config.aos
            );
            bucket.reconfigure(config.rate_bps, config.depth_bits, config.kind);
            *aos = config.aos;
            if config.clear_stats {
                *stats = RateStats::default();
            }
        }
    }
}
