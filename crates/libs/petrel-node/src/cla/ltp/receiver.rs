use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::bucket::RateSenderHandle;
use super::segment::{
    CancelReason, DataSegment, Segment, SegmentAuth, SessionId, SERVICE_BUNDLE,
    SERVICE_BUNDLE_AGGREGATE,
};
use super::timers::{TimerHandle, TimerKey};
use super::LtpParams;

/// A completed block handed to the bundle-extraction task.
#[derive(Debug)]
pub struct ExtractedBlock {
    pub service_id: u64,
    pub bytes: Vec<u8>,
}

struct ReportState {
    segment: Segment,
    retries: u32,
}

struct ReceiverSession {
    red: BTreeMap<u64, Vec<u8>>,
    green: BTreeMap<u64, Vec<u8>>,
    /// Declared red-part length, learned from the EORP segment.
    red_expected: Option<u64>,
    service_id: u64,
    eob_seen: bool,
    delivered: bool,
    reports: HashMap<u64, ReportState>,
    next_report: u64,
    reports_sent: u32,
    last_activity: Instant,
    had_progress: bool,
    cancel_retries: Option<u32>,
}

impl ReceiverSession {
    fn new() -> Self {
        Self {
            red: BTreeMap::new(),
            green: BTreeMap::new(),
            red_expected: None,
            service_id: 0,
            eob_seen: false,
            delivered: false,
            reports: HashMap::new(),
            next_report: 1,
            reports_sent: 0,
            last_activity: Instant::now(),
            had_progress: false,
            cancel_retries: None,
        }
    }

    fn overlaps(map: &BTreeMap<u64, Vec<u8>>, offset: u64, len: u64) -> bool {
        let end = offset + len;
        if let Some((&o, v)) = map.range(..end).next_back() {
            if o + v.len() as u64 > offset {
                return true;
            }
        }
        map.range(offset..end).next().is_some()
    }

    /// Length of the contiguous prefix starting at zero.
    fn contiguous(map: &BTreeMap<u64, Vec<u8>>) -> u64 {
        let mut cursor = 0u64;
        for (&off, data) in map {
            if off > cursor {
                break;
            }
            cursor = cursor.max(off + data.len() as u64);
        }
        cursor
    }

    /// Merged reception claims over the red map.
    fn claims(&self) -> Vec<(u64, u64)> {
        let mut claims: Vec<(u64, u64)> = Vec::new();
        for (&off, data) in &self.red {
            let end = off + data.len() as u64;
            match claims.last_mut() {
                Some(last) if off <= last.0 + last.1 => {
                    let new_end = end.max(last.0 + last.1);
                    last.1 = new_end - last.0;
                }
                _ => claims.push((off, end - off)),
            }
        }
        claims
    }

    fn assemble(map: &BTreeMap<u64, Vec<u8>>, len: u64) -> Vec<u8> {
        let mut out = vec![0u8; len as usize];
        for (&off, data) in map {
            let end = ((off as usize) + data.len()).min(out.len());
            let start = (off as usize).min(end);
            out[start..end].copy_from_slice(&data[..end - start]);
        }
        out
    }
}

/// The per-peer LTP receiver: merges inbound data segments into sessions,
/// answers checkpoints with reports, and posts assembled blocks for
/// bundle extraction.
pub struct LtpReceiver {
    params: LtpParams,
    link_name: String,
    out: RateSenderHandle,
    timers: TimerHandle,
    extract_tx: mpsc::UnboundedSender<ExtractedBlock>,
    auth: Option<SegmentAuth>,
    sessions: HashMap<SessionId, ReceiverSession>,
}

impl LtpReceiver {
    pub fn new(
        params: LtpParams,
        link_name: String,
        out: RateSenderHandle,
        timers: TimerHandle,
        extract_tx: mpsc::UnboundedSender<ExtractedBlock>,
    ) -> Self {
        let auth = params.auth.clone();
        Self {
            params,
            link_name,
            out,
            timers,
            extract_tx,
            auth,
            sessions: HashMap::new(),
        }
    }

    fn emit(&self, segment: &Segment) {
        self.out.send(segment.is_control(), segment.encode(self.auth.as_ref()));
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Merge one data segment. Sessions are created only here.
    pub fn handle_data(&mut self, ds: &DataSegment) {
        if ds.red && ds.service_id != SERVICE_BUNDLE && ds.service_id != SERVICE_BUNDLE_AGGREGATE {
            log::warn!(
                "ltp({}): session {} rejects service id {}",
                self.link_name,
                ds.session,
                ds.service_id
            );
            self.cancel_session(ds.session, CancelReason::SystemCancelled);
            return;
        }
        if !ds.red && ds.service_id != SERVICE_BUNDLE && ds.service_id != SERVICE_BUNDLE_AGGREGATE
        {
            // Green misdelivery is a policy drop, not a silent pass-through.
            log::warn!(
                "ltp({}): dropping green segment with service id {}",
                self.link_name,
                ds.service_id
            );
            return;
        }

        let miscolored = {
            let session = self.sessions.entry(ds.session).or_insert_with(|| {
                log::debug!("ltp: new receiver session {}", ds.session);
                ReceiverSession::new()
            });
            session.last_activity = Instant::now();
            session.service_id = ds.service_id;

            // A session is all-red or all-green.
            if (ds.red && !session.green.is_empty()) || (!ds.red && !session.red.is_empty()) {
                true
            } else {
                let map = if ds.red { &mut session.red } else { &mut session.green };
                if ReceiverSession::overlaps(map, ds.offset, ds.data.len() as u64) {
                    log::debug!(
                        "ltp: session {} duplicate/overlapping segment at {}",
                        ds.session,
                        ds.offset
                    );
                } else {
                    map.insert(ds.offset, ds.data.clone());
                    session.had_progress = true;
                }
                if ds.eorp {
                    session.red_expected = Some(ds.end());
                }
                if ds.eob {
                    session.eob_seen = true;
                }
                false
            }
        };
        if miscolored {
            log::warn!("ltp({}): session {} miscolored", self.link_name, ds.session);
            self.cancel_session(ds.session, CancelReason::Miscolored);
            return;
        }

        if let Some((ckpt_serial, _)) = ds.checkpoint {
            self.send_report(ds.session, ckpt_serial);
        }

        self.timers.schedule(
            TimerKey::Inactivity { session: ds.session },
            Duration::from_millis(self.params.inact_intvl_ms),
        );
        self.try_complete(ds.session);
    }

    fn send_report(&mut self, sid: SessionId, ckpt_serial: u64) {
        let Some(session) = self.sessions.get_mut(&sid) else { return };
        let serial = session.next_report;
        session.next_report += 1;
        session.reports_sent += 1;

        let claims = session.claims();
        let upper = claims.last().map(|&(o, l)| o + l).unwrap_or(0);
        let report = Segment::Report(super::segment::ReportSegment {
            session: sid,
            report_serial: serial,
            checkpoint_serial: ckpt_serial,
            upper,
            lower: 0,
            claims,
        });
        session.reports.insert(serial, ReportState { segment: report.clone(), retries: 0 });
        self.emit(&report);
        self.timers.schedule(
            TimerKey::Report { session: sid, serial },
            Duration::from_millis(self.params.retran_intvl_ms),
        );
    }

    /// Red data forms a contiguous prefix equal to the declared red
    /// length: hand the block to extraction. Green delivers on EOB.
    fn try_complete(&mut self, sid: SessionId) {
        enum Done {
            No,
            Red,
            Green,
        }
        let outcome = {
            let Some(session) = self.sessions.get_mut(&sid) else { return };
            if session.delivered {
                Done::No
            } else if session
                .red_expected
                .is_some_and(|expected| ReceiverSession::contiguous(&session.red) >= expected)
            {
                let expected = session.red_expected.unwrap_or(0);
                let bytes = ReceiverSession::assemble(&session.red, expected);
                log::debug!(
                    "ltp({}): session {} red part complete ({} bytes)",
                    self.link_name,
                    sid,
                    expected
                );
                session.delivered = true;
                let _ = self
                    .extract_tx
                    .send(ExtractedBlock { service_id: session.service_id, bytes });
                Done::Red
            } else if session.eob_seen && session.red.is_empty() && !session.green.is_empty() {
                let len =
                    session.green.iter().map(|(&o, d)| o + d.len() as u64).max().unwrap_or(0);
                if ReceiverSession::contiguous(&session.green) >= len {
                    let bytes = ReceiverSession::assemble(&session.green, len);
                    let _ = self
                        .extract_tx
                        .send(ExtractedBlock { service_id: session.service_id, bytes });
                } else {
                    log::debug!("ltp({}): green session {} has gaps, dropped", self.link_name, sid);
                }
                session.delivered = true;
                Done::Green
            } else {
                Done::No
            }
        };
        match outcome {
            Done::No => {}
            Done::Red => self.maybe_destroy(sid),
            Done::Green => {
                self.sessions.remove(&sid);
                self.timers.cancel(TimerKey::Inactivity { session: sid });
            }
        }
    }

    /// A report-ack cancels the report's retransmit clock; the session
    /// dies once data is delivered and no reports are outstanding.
    pub fn handle_report_ack(&mut self, sid: SessionId, report_serial: u64) {
        let Some(session) = self.sessions.get_mut(&sid) else { return };
        if session.reports.remove(&report_serial).is_some() {
            self.timers.cancel(TimerKey::Report { session: sid, serial: report_serial });
        }
        session.last_activity = Instant::now();
        self.maybe_destroy(sid);
    }

    fn maybe_destroy(&mut self, sid: SessionId) {
        let done = self
            .sessions
            .get(&sid)
            .is_some_and(|s| s.delivered && s.reports.is_empty());
        if done {
            log::debug!("ltp({}): session {} closed", self.link_name, sid);
            self.sessions.remove(&sid);
            self.timers.cancel(TimerKey::Inactivity { session: sid });
        }
    }

    pub fn on_report_timer(&mut self, sid: SessionId, serial: u64) {
        let resend = {
            let Some(session) = self.sessions.get_mut(&sid) else { return };
            let Some(report) = session.reports.get_mut(&serial) else { return };
            report.retries += 1;
            if report.retries > self.params.retran_retries {
                None
            } else {
                Some(report.segment.clone())
            }
        };
        match resend {
            Some(segment) => {
                self.emit(&segment);
                self.timers.schedule(
                    TimerKey::Report { session: sid, serial },
                    Duration::from_millis(self.params.retran_intvl_ms),
                );
            }
            None => {
                log::warn!(
                    "ltp({}): session {} report {} unanswered, cancelling",
                    self.link_name,
                    sid,
                    serial
                );
                self.cancel_session(sid, CancelReason::RetransmitCycleExceeded);
            }
        }
    }

    /// Inactivity expiry: progress within the window extends, otherwise
    /// the session is cancelled toward the sender.
    pub fn on_inactivity_timer(&mut self, sid: SessionId) {
        let Some(session) = self.sessions.get_mut(&sid) else { return };
        let window = Duration::from_millis(self.params.inact_intvl_ms);
        if session.last_activity.elapsed() < window {
            let remaining = window - session.last_activity.elapsed();
            self.timers.schedule(TimerKey::Inactivity { session: sid }, remaining);
            return;
        }
        if session.had_progress {
            session.had_progress = false;
            self.timers.schedule(TimerKey::Inactivity { session: sid }, window);
            return;
        }
        log::warn!("ltp({}): session {} inactive, cancelling", self.link_name, sid);
        self.cancel_session(sid, CancelReason::RetransmitCycleExceeded);
    }

    fn cancel_session(&mut self, sid: SessionId, reason: CancelReason) {
        if let Some(session) = self.sessions.get_mut(&sid) {
            for serial in session.reports.keys() {
                self.timers.cancel(TimerKey::Report { session: sid, serial: *serial });
            }
            session.reports.clear();
            session.cancel_retries = Some(0);
        }
        self.emit(&Segment::Cancel { session: sid, by_sender: false, reason });
        self.timers.schedule(
            TimerKey::ReceiverCancel { session: sid },
            Duration::from_millis(self.params.retran_intvl_ms),
        );
    }

    pub fn on_cancel_timer(&mut self, sid: SessionId) {
        let Some(session) = self.sessions.get_mut(&sid) else { return };
        let Some(retries) = session.cancel_retries.as_mut() else { return };
        *retries += 1;
        if *retries > self.params.cancel_retries {
            self.sessions.remove(&sid);
            self.timers.cancel(TimerKey::Inactivity { session: sid });
            return;
        }
        self.emit(&Segment::Cancel {
            session: sid,
            by_sender: false,
            reason: CancelReason::RetransmitCycleExceeded,
        });
        self.timers.schedule(
            TimerKey::ReceiverCancel { session: sid },
            Duration::from_millis(self.params.retran_intvl_ms),
        );
    }

    /// CA for our CS_BR: drop the session.
    pub fn handle_cancel_ack(&mut self, sid: SessionId) {
        if self.sessions.remove(&sid).is_some() {
            self.timers.cancel(TimerKey::ReceiverCancel { session: sid });
            self.timers.cancel(TimerKey::Inactivity { session: sid });
        }
    }

    /// The sender cancelled: ack and destroy.
    pub fn handle_cancel_by_sender(&mut self, sid: SessionId) {
        self.emit(&Segment::CancelAck { session: sid, to_sender: true });
        if let Some(session) = self.sessions.remove(&sid) {
            for serial in session.reports.keys() {
                self.timers.cancel(TimerKey::Report { session: sid, serial: *serial });
            }
            self.timers.cancel(TimerKey::Inactivity { session: sid });
            log::debug!("ltp({}): session {} cancelled by sender", self.link_name, sid);
        }
    }
}
