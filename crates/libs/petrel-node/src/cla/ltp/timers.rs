use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::segment::SessionId;

/// Every LTP timer, keyed so it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Sender-side checkpoint retransmit.
    Checkpoint { session: u64, serial: u64 },
    /// Sender-side cancel-segment retransmit.
    SenderCancel { session: u64 },
    /// Receiver-side report retransmit.
    Report { session: SessionId, serial: u64 },
    /// Receiver-side cancel retransmit.
    ReceiverCancel { session: SessionId },
    /// Receiver-side session inactivity.
    Inactivity { session: SessionId },
}

enum TimerCmd {
    Schedule { key: TimerKey, after: Duration },
    Cancel { key: TimerKey },
}

/// Handle for scheduling and cancelling timers. Cancellation is
/// best-effort: a timer may fire concurrently with its cancel, so firing
/// handlers must tolerate stale keys.
#[derive(Clone)]
pub struct TimerHandle {
    tx: mpsc::UnboundedSender<TimerCmd>,
}

impl TimerHandle {
    pub fn schedule(&self, key: TimerKey, after: Duration) {
        let _ = self.tx.send(TimerCmd::Schedule { key, after });
    }

    pub fn cancel(&self, key: TimerKey) {
        let _ = self.tx.send(TimerCmd::Cancel { key });
    }
}

struct Entry {
    at: Instant,
    seq: u64,
    gen: u64,
    key: TimerKey,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

/// One actor serializes all LTP timers, posting fired keys to `fire_tx`.
/// Routing every firing through one task bounds concurrency and removes
/// the fire-after-free class entirely: a fired key for a dead session is
/// just ignored by the engine.
pub fn spawn_timer_actor(
    fire_tx: mpsc::UnboundedSender<TimerKey>,
    cancel: CancellationToken,
) -> TimerHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut heap: BinaryHeap<Reverse<Entry>> = BinaryHeap::new();
        let mut live: HashMap<TimerKey, u64> = HashMap::new();
        let mut seq = 0u64;
        let mut gen = 0u64;

        loop {
            let next_at = heap.peek().map(|Reverse(e)| e.at);
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(TimerCmd::Schedule { key, after }) => {
                        gen += 1;
                        seq += 1;
                        live.insert(key, gen);
                        heap.push(Reverse(Entry { at: Instant::now() + after, seq, gen, key }));
                    }
                    Some(TimerCmd::Cancel { key }) => {
                        live.remove(&key);
                    }
                    None => break,
                },
                _ = sleep_until_opt(next_at), if next_at.is_some() => {
                    let now = Instant::now();
                    while let Some(Reverse(head)) = heap.peek() {
                        if head.at > now {
                            break;
                        }
                        let Some(Reverse(entry)) = heap.pop() else { break };
                        // Only the latest schedule of a key fires.
                        if live.get(&entry.key) == Some(&entry.gen) {
                            live.remove(&entry.key);
                            if fire_tx.send(entry.key).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    });

    TimerHandle { tx }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(serial: u64) -> TimerKey {
        TimerKey::Checkpoint { session: 1, serial }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_in_order() {
        let (fire_tx, mut fire_rx) = mpsc::unbounded_channel();
        let timers = spawn_timer_actor(fire_tx, CancellationToken::new());
        timers.schedule(key(2), Duration::from_millis(200));
        timers.schedule(key(1), Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fire_rx.recv().await, Some(key(1)));
        assert_eq!(fire_rx.recv().await, Some(key(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_suppresses_fire() {
        let (fire_tx, mut fire_rx) = mpsc::unbounded_channel();
        let timers = spawn_timer_actor(fire_tx, CancellationToken::new());
        timers.schedule(key(1), Duration::from_millis(100));
        timers.cancel(key(1));
        timers.schedule(key(2), Duration::from_millis(200));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fire_rx.recv().await, Some(key(2)));
        assert!(fire_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_supersedes() {
        let (fire_tx, mut fire_rx) = mpsc::unbounded_channel();
        let timers = spawn_timer_actor(fire_tx, CancellationToken::new());
        timers.schedule(key(1), Duration::from_millis(100));
        timers.schedule(key(1), Duration::from_millis(500));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fire_rx.try_recv().is_err(), "superseded schedule must not fire");
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(fire_rx.recv().await, Some(key(1)));
    }
}
