use std::collections::HashMap;
use std::time::Duration;

use petrel_bp::BundleRef;
use tokio::time::Instant;

use super::bucket::RateSenderHandle;
use super::segment::{
    CancelReason, DataSegment, ReportSegment, Segment, SegmentAuth, SessionId,
};
use super::timers::{TimerHandle, TimerKey};
use super::LtpParams;
use crate::daemon::DaemonHandle;
use crate::event::BundleEvent;

/// A session being aggregated but not yet committed to the wire.
struct Loading {
    bundles: Vec<BundleRef>,
    buf: Vec<u8>,
    started: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// Data segments outstanding.
    Ds,
    /// Cancelled, awaiting the cancel-ack handshake.
    Cs,
}

struct Checkpoint {
    retries: u32,
    /// Byte range whose reception this checkpoint demands a report for.
    range: (u64, u64),
}

struct SenderSession {
    id: u64,
    bundles: Vec<BundleRef>,
    buf: Vec<u8>,
    state: SessionState,
    /// Merged reception claims accumulated from reports.
    claimed: Vec<(u64, u64)>,
    checkpoints: HashMap<u64, Checkpoint>,
    cancel_retries: u32,
}

impl SenderSession {
    fn merge_claims(&mut self, new: impl IntoIterator<Item = (u64, u64)>) {
        for (off, len) in new {
            self.claimed.push((off, off + len));
        }
        self.claimed.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.claimed.len());
        for &(start, end) in &self.claimed {
            match merged.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }
        self.claimed = merged;
    }

    /// Byte ranges of `[0, len)` not yet claimed.
    fn gaps(&self) -> Vec<(u64, u64)> {
        let len = self.buf.len() as u64;
        let mut gaps = Vec::new();
        let mut cursor = 0u64;
        for &(start, end) in &self.claimed {
            if start > cursor {
                gaps.push((cursor, start));
            }
            cursor = cursor.max(end);
        }
        if cursor < len {
            gaps.push((cursor, len));
        }
        gaps
    }

    fn complete(&self) -> bool {
        self.claimed.first().is_some_and(|&(s, e)| s == 0 && e >= self.buf.len() as u64)
    }
}

/// The per-peer LTP sender: aggregates outbound bundles into sessions,
/// slices them into data segments, and drives checkpoint/report/cancel
/// handshakes until each session completes or fails.
pub struct LtpSender {
    params: LtpParams,
    link_name: String,
    out: RateSenderHandle,
    timers: TimerHandle,
    daemon: DaemonHandle,
    auth: Option<SegmentAuth>,
    loading: Option<Loading>,
    sessions: HashMap<u64, SenderSession>,
    next_session: u64,
    next_checkpoint: u64,
}

impl LtpSender {
    pub fn new(
        params: LtpParams,
        link_name: String,
        out: RateSenderHandle,
        timers: TimerHandle,
        daemon: DaemonHandle,
    ) -> Self {
        let auth = params.auth.clone();
        Self {
            params,
            link_name,
            out,
            timers,
            daemon,
            auth,
            loading: None,
            sessions: HashMap::new(),
            next_session: 1,
            next_checkpoint: 1,
        }
    }

    fn emit(&self, segment: &Segment) {
        self.out.send(segment.is_control(), segment.encode(self.auth.as_ref()));
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Add one serialized bundle to the loading session, flushing if the
    /// aggregate crossed the size threshold.
    pub fn offer_bundle(&mut self, bundle: BundleRef, image: Vec<u8>) {
        let loading = self.loading.get_or_insert_with(|| Loading {
            bundles: Vec::new(),
            buf: Vec::new(),
            started: Instant::now(),
        });
        if self.params.service_id == super::segment::SERVICE_BUNDLE_AGGREGATE {
            petrel_sdnv::append(image.len() as u64, &mut loading.buf);
        }
        loading.buf.extend_from_slice(&image);
        loading.bundles.push(bundle);

        if loading.buf.len() as u64 >= self.params.agg_size {
            self.flush();
        }
    }

    /// Aggregation-time tick: flush a loading session past its deadline.
    pub fn tick(&mut self) {
        let due = self
            .loading
            .as_ref()
            .is_some_and(|l| l.started.elapsed() >= Duration::from_millis(self.params.agg_time_ms));
        if due {
            self.flush();
        }
    }

    /// Commit the loading session: assign ids, slice into data segments,
    /// checkpoint the tail, and start the retransmit clock.
    pub fn flush(&mut self) {
        let Some(loading) = self.loading.take() else { return };
        if loading.buf.is_empty() {
            return;
        }
        let id = self.next_session;
        self.next_session += 1;
        let sid = SessionId { engine: self.params.engine_id, session: id };

        log::debug!(
            "ltp({}): session {} open, {} bundles, {} bytes",
            self.link_name,
            sid,
            loading.bundles.len(),
            loading.buf.len()
        );

        let mut session = SenderSession {
            id,
            bundles: loading.bundles,
            buf: loading.buf,
            state: SessionState::Ds,
            claimed: Vec::new(),
            checkpoints: HashMap::new(),
            cancel_retries: 0,
        };

        if self.params.green {
            self.send_range(&session, 0, session.buf.len() as u64, None);
            // Green data is fire-and-forget: report transmission now.
            for bundle in &session.bundles {
                self.daemon.post(BundleEvent::BundleTransmitted {
                    bundle: bundle.clone(),
                    link: self.link_name.clone(),
                    bytes_sent: bundle.payload_len(),
                    acked: false,
                });
            }
            return;
        }

        let serial = self.next_checkpoint;
        self.next_checkpoint += 1;
        session.checkpoints.insert(serial, Checkpoint { retries: 0, range: (0, session.buf.len() as u64) });
        self.send_range(&session, 0, session.buf.len() as u64, Some((serial, 0)));
        self.timers.schedule(
            TimerKey::Checkpoint { session: id, serial },
            Duration::from_millis(self.params.retran_intvl_ms),
        );
        self.sessions.insert(id, session);
    }

    /// Slice `[start, end)` of the session buffer into data segments. The
    /// final segment carries the checkpoint (and EORP/EOB when the range
    /// reaches the block end).
    fn send_range(&self, session: &SenderSession, start: u64, end: u64, ckpt: Option<(u64, u64)>) {
        let sid = SessionId { engine: self.params.engine_id, session: session.id };
        let block_end = session.buf.len() as u64;
        let mut offset = start;
        while offset < end {
            let len = (self.params.seg_size as u64).min(end - offset);
            let last_of_range = offset + len >= end;
            let at_block_end = offset + len >= block_end;
            let ds = DataSegment {
                session: sid,
                red: !self.params.green,
                checkpoint: if last_of_range { ckpt } else { None },
                eorp: !self.params.green && last_of_range && ckpt.is_some() && at_block_end,
                eob: at_block_end,
                service_id: self.params.service_id,
                offset,
                data: session.buf[offset as usize..(offset + len) as usize].to_vec(),
            };
            self.emit(&Segment::Data(ds));
            offset += len;
        }
    }

    /// A report arrived: ack it, clear covered ranges, retransmit gaps
    /// under a fresh checkpoint, or finish the session.
    pub fn handle_report(&mut self, rs: &ReportSegment) {
        let sid = rs.session;
        self.emit(&Segment::ReportAck { session: sid, report_serial: rs.report_serial });

        let Some(mut session) = self.sessions.remove(&sid.session) else {
            log::debug!("ltp({}): report for unknown session {}", self.link_name, sid);
            return;
        };
        if session.state == SessionState::Cs {
            self.sessions.insert(sid.session, session);
            return;
        }

        // The answered checkpoint's clock stops.
        if session.checkpoints.remove(&rs.checkpoint_serial).is_some() {
            self.timers.cancel(TimerKey::Checkpoint {
                session: sid.session,
                serial: rs.checkpoint_serial,
            });
        }

        session.merge_claims(rs.claims.iter().map(|&(off, len)| (rs.lower + off, len)));

        if session.complete() {
            log::debug!("ltp({}): session {} acknowledged complete", self.link_name, sid);
            for serial in session.checkpoints.keys() {
                self.timers.cancel(TimerKey::Checkpoint { session: sid.session, serial: *serial });
            }
            for bundle in &session.bundles {
                self.daemon.post(BundleEvent::BundleTransmitted {
                    bundle: bundle.clone(),
                    link: self.link_name.clone(),
                    bytes_sent: bundle.payload_len(),
                    acked: true,
                });
            }
            return;
        }

        let gaps = session.gaps();
        log::debug!(
            "ltp({}): session {} report leaves {} gap(s)",
            self.link_name,
            sid,
            gaps.len()
        );
        for (i, &(start, end)) in gaps.iter().enumerate() {
            let ckpt = if i == gaps.len() - 1 {
                let serial = self.next_checkpoint;
                self.next_checkpoint += 1;
                session.checkpoints.insert(serial, Checkpoint { retries: 0, range: (start, end) });
                self.timers.schedule(
                    TimerKey::Checkpoint { session: sid.session, serial },
                    Duration::from_millis(self.params.retran_intvl_ms),
                );
                Some((serial, rs.report_serial))
            } else {
                None
            };
            self.send_range(&session, start, end, ckpt);
        }
        self.sessions.insert(sid.session, session);
    }

    /// Checkpoint retransmit clock fired: resend or give up.
    pub fn on_checkpoint_timer(&mut self, session_id: u64, serial: u64) {
        let Some(mut session) = self.sessions.remove(&session_id) else { return };
        let Some(ckpt) = session.checkpoints.get_mut(&serial) else {
            self.sessions.insert(session_id, session);
            return;
        };
        ckpt.retries += 1;
        if ckpt.retries > self.params.retran_retries {
            log::warn!(
                "ltp({}): session {} checkpoint {} retransmit budget exhausted",
                self.link_name,
                session_id,
                serial
            );
            self.cancel_session(session, CancelReason::RetransmitCycleExceeded);
            return;
        }
        let range = ckpt.range;
        log::debug!(
            "ltp({}): session {} resend checkpoint {} (try {})",
            self.link_name,
            session_id,
            serial,
            session.checkpoints[&serial].retries
        );
        self.send_range(&session, range.0, range.1, Some((serial, 0)));
        self.timers.schedule(
            TimerKey::Checkpoint { session: session_id, serial },
            Duration::from_millis(self.params.retran_intvl_ms),
        );
        self.sessions.insert(session_id, session);
    }

    /// Move a session into the cancel handshake and fail its bundles so
    /// the daemon can reroute.
    fn cancel_session(&mut self, mut session: SenderSession, reason: CancelReason) {
        let sid = SessionId { engine: self.params.engine_id, session: session.id };
        for serial in session.checkpoints.keys() {
            self.timers.cancel(TimerKey::Checkpoint { session: session.id, serial: *serial });
        }
        session.checkpoints.clear();
        session.state = SessionState::Cs;
        self.emit(&Segment::Cancel { session: sid, by_sender: true, reason });
        self.timers.schedule(
            TimerKey::SenderCancel { session: session.id },
            Duration::from_millis(self.params.retran_intvl_ms),
        );
        for bundle in &session.bundles {
            self.daemon.post(BundleEvent::BundleTransmitFailed {
                bundle: bundle.clone(),
                link: self.link_name.clone(),
            });
        }
        self.sessions.insert(session.id, session);
    }

    pub fn on_cancel_timer(&mut self, session_id: u64) {
        let Some(session) = self.sessions.get_mut(&session_id) else { return };
        if session.state != SessionState::Cs {
            return;
        }
        session.cancel_retries += 1;
        if session.cancel_retries > self.params.cancel_retries {
            log::warn!(
                "ltp({}): session {} cancel unacknowledged, force destroy",
                self.link_name,
                session_id
            );
            self.sessions.remove(&session_id);
            return;
        }
        let sid = SessionId { engine: self.params.engine_id, session: session_id };
        self.emit(&Segment::Cancel {
            session: sid,
            by_sender: true,
            reason: CancelReason::RetransmitCycleExceeded,
        });
        self.timers.schedule(
            TimerKey::SenderCancel { session: session_id },
            Duration::from_millis(self.params.retran_intvl_ms),
        );
    }

    /// CA for our CS_BS: the cancel handshake is done.
    pub fn handle_cancel_ack(&mut self, sid: SessionId) {
        if self.sessions.remove(&sid.session).is_some() {
            self.timers.cancel(TimerKey::SenderCancel { session: sid.session });
            log::debug!("ltp({}): session {} cancel acknowledged", self.link_name, sid);
        }
    }

    /// The receiver cancelled one of our sessions: ack and fail bundles.
    pub fn handle_cancel_by_receiver(&mut self, sid: SessionId, reason: CancelReason) {
        self.emit(&Segment::CancelAck { session: sid, to_sender: false });
        let Some(session) = self.sessions.remove(&sid.session) else { return };
        log::warn!(
            "ltp({}): session {} cancelled by receiver ({:?})",
            self.link_name,
            sid,
            reason
        );
        for serial in session.checkpoints.keys() {
            self.timers.cancel(TimerKey::Checkpoint { session: sid.session, serial: *serial });
        }
        if session.state != SessionState::Cs {
            for bundle in &session.bundles {
                self.daemon.post(BundleEvent::BundleTransmitFailed {
                    bundle: bundle.clone(),
                    link: self.link_name.clone(),
                });
            }
        }
    }

    /// Fail everything outstanding, e.g. on contact teardown.
    pub fn fail_all(&mut self) {
        for (_, session) in self.sessions.drain() {
            for bundle in &session.bundles {
                self.daemon.post(BundleEvent::BundleTransmitFailed {
                    bundle: bundle.clone(),
                    link: self.link_name.clone(),
                });
            }
        }
        self.loading = None;
    }
}
