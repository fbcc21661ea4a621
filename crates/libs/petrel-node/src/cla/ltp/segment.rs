use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::NodeError;

/// Segment-class values carried in the low nibble of the control byte; the
/// high nibble is the LTP version (0).
mod seg_type {
    pub const DS_RED: u8 = 0;
    pub const DS_RED_CKPT: u8 = 1;
    pub const DS_RED_CKPT_EORP: u8 = 2;
    pub const DS_RED_CKPT_EORP_EOB: u8 = 3;
    pub const DS_GREEN: u8 = 4;
    pub const DS_GREEN_EOB: u8 = 7;
    pub const RS: u8 = 8;
    pub const RA: u8 = 9;
    pub const CS_BS: u8 = 12;
    pub const CAS_BS: u8 = 13;
    pub const CS_BR: u8 = 14;
    pub const CAS_BR: u8 = 15;
}

/// Client service ids accepted on red sessions.
pub const SERVICE_BUNDLE: u64 = 1;
pub const SERVICE_BUNDLE_AGGREGATE: u64 = 2;

const AUTH_EXT_TAG: u8 = 0x00;
const AUTH_LEN: usize = 32;

/// Preshared authentication material for the per-segment trailer.
#[derive(Debug, Clone)]
pub struct SegmentAuth {
    pub key: Vec<u8>,
    pub key_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    pub engine: u64,
    pub session: u64,
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.engine, self.session)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CancelReason {
    UserCancelled = 0,
    Unreachable = 1,
    RateLimitExceeded = 2,
    Miscolored = 3,
    SystemCancelled = 4,
    RetransmitCycleExceeded = 5,
}

impl CancelReason {
    fn from_code(code: u8) -> Self {
        match code {
            1 => CancelReason::Unreachable,
            2 => CancelReason::RateLimitExceeded,
            3 => CancelReason::Miscolored,
            4 => CancelReason::SystemCancelled,
            5 => CancelReason::RetransmitCycleExceeded,
            _ => CancelReason::UserCancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSegment {
    pub session: SessionId,
    pub red: bool,
    /// (checkpoint serial, report serial being answered; zero if none).
    pub checkpoint: Option<(u64, u64)>,
    pub eorp: bool,
    pub eob: bool,
    pub service_id: u64,
    pub offset: u64,
    pub data: Vec<u8>,
}

impl DataSegment {
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSegment {
    pub session: SessionId,
    pub report_serial: u64,
    pub checkpoint_serial: u64,
    pub upper: u64,
    pub lower: u64,
    /// Reception claims relative to `lower`.
    pub claims: Vec<(u64, u64)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Data(DataSegment),
    Report(ReportSegment),
    ReportAck { session: SessionId, report_serial: u64 },
    /// by_sender: true for CS from the block sender (CS_BS).
    Cancel { session: SessionId, by_sender: bool, reason: CancelReason },
    /// to_sender: true acknowledges a CS_BS (CAS_BS).
    CancelAck { session: SessionId, to_sender: bool },
}

impl Segment {
    pub fn session(&self) -> SessionId {
        match self {
            Segment::Data(ds) => ds.session,
            Segment::Report(rs) => rs.session,
            Segment::ReportAck { session, .. } => *session,
            Segment::Cancel { session, .. } => *session,
            Segment::CancelAck { session, .. } => *session,
        }
    }

    /// Control-plane segments jump the rate-limiter queue.
    pub fn is_control(&self) -> bool {
        !matches!(self, Segment::Data(_))
    }

    pub fn encode(&self, auth: Option<&SegmentAuth>) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        let (ctrl, session) = match self {
            Segment::Data(ds) => {
                let t = if ds.red {
                    match (ds.checkpoint.is_some(), ds.eorp, ds.eob) {
                        (false, _, _) => seg_type::DS_RED,
                        (true, false, _) => seg_type::DS_RED_CKPT,
                        (true, true, false) => seg_type::DS_RED_CKPT_EORP,
                        (true, true, true) => seg_type::DS_RED_CKPT_EORP_EOB,
                    }
                } else if ds.eob {
                    seg_type::DS_GREEN_EOB
                } else {
                    seg_type::DS_GREEN
                };
                (t, ds.session)
            }
            Segment::Report(rs) => (seg_type::RS, rs.session),
            Segment::ReportAck { session, .. } => (seg_type::RA, *session),
            Segment::Cancel { session, by_sender, .. } => {
                (if *by_sender { seg_type::CS_BS } else { seg_type::CS_BR }, *session)
            }
            Segment::CancelAck { session, to_sender } => {
                (if *to_sender { seg_type::CAS_BS } else { seg_type::CAS_BR }, *session)
            }
        };
        out.push(ctrl);
        petrel_sdnv::append(session.engine, &mut out);
        petrel_sdnv::append(session.session, &mut out);
        // Header/trailer extension counts, one nibble each.
        out.push(if auth.is_some() { 0x01 } else { 0x00 });

        match self {
            Segment::Data(ds) => {
                petrel_sdnv::append(ds.service_id, &mut out);
                petrel_sdnv::append(ds.offset, &mut out);
                petrel_sdnv::append(ds.data.len() as u64, &mut out);
                if let Some((ckpt, report)) = ds.checkpoint {
                    petrel_sdnv::append(ckpt, &mut out);
                    petrel_sdnv::append(report, &mut out);
                }
                out.extend_from_slice(&ds.data);
            }
            Segment::Report(rs) => {
                petrel_sdnv::append(rs.report_serial, &mut out);
                petrel_sdnv::append(rs.checkpoint_serial, &mut out);
                petrel_sdnv::append(rs.upper, &mut out);
                petrel_sdnv::append(rs.lower, &mut out);
                petrel_sdnv::append(rs.claims.len() as u64, &mut out);
                for (off, len) in &rs.claims {
                    petrel_sdnv::append(*off, &mut out);
                    petrel_sdnv::append(*len, &mut out);
                }
            }
            Segment::ReportAck { report_serial, .. } => {
                petrel_sdnv::append(*report_serial, &mut out);
            }
            Segment::Cancel { reason, .. } => {
                out.push(*reason as u8);
            }
            Segment::CancelAck { .. } => {}
        }

        if let Some(auth) = auth {
            let mac = segment_mac(auth, &out);
            out.push(AUTH_EXT_TAG);
            petrel_sdnv::append(AUTH_LEN as u64, &mut out);
            out.extend_from_slice(&mac);
        }
        out
    }

    /// Parse one datagram. With auth configured, segments failing
    /// verification are rejected.
    pub fn decode(buf: &[u8], auth: Option<&SegmentAuth>) -> Result<Segment, NodeError> {
        if buf.len() < 4 {
            return Err(NodeError::Protocol("ltp segment too short".into()));
        }
        if buf[0] >> 4 != 0 {
            return Err(NodeError::Protocol(format!("ltp version {}", buf[0] >> 4)));
        }
        let ctrl = buf[0] & 0x0f;
        let mut cur = &buf[1..];
        let engine = petrel_sdnv::decode_advance(&mut cur)
            .map_err(|e| NodeError::Protocol(e.to_string()))?;
        let session = petrel_sdnv::decode_advance(&mut cur)
            .map_err(|e| NodeError::Protocol(e.to_string()))?;
        let ext_counts = cur
            .first()
            .copied()
            .ok_or_else(|| NodeError::Protocol("ltp segment truncated".into()))?;
        cur = &cur[1..];
        let trailer_exts = (ext_counts & 0x0f) as usize;

        // Strip and verify the trailer before parsing the body.
        let mut body = cur;
        if trailer_exts > 0 {
            let Some(auth) = auth else {
                return Err(NodeError::Security("unexpected ltp auth trailer".into()));
            };
            // tag (1) + len sdnv (1 for 32) + mac
            let trailer_len = 2 + AUTH_LEN;
            if body.len() < trailer_len {
                return Err(NodeError::Protocol("ltp auth trailer truncated".into()));
            }
            let (payload, trailer) = body.split_at(body.len() - trailer_len);
            if trailer[0] != AUTH_EXT_TAG {
                return Err(NodeError::Security("unknown ltp trailer extension".into()));
            }
            let covered_len = buf.len() - trailer_len;
            let expected = segment_mac(auth, &buf[..covered_len]);
            if trailer[2..] != expected {
                return Err(NodeError::Security("ltp segment authentication failed".into()));
            }
            body = payload;
        } else if auth.is_some() {
            return Err(NodeError::Security("ltp segment missing auth trailer".into()));
        }

        let sid = SessionId { engine, session };
        let mut cur = body;
        let take = |c: &mut &[u8]| {
            petrel_sdnv::decode_advance(c).map_err(|e| NodeError::Protocol(e.to_string()))
        };

        let segment = match ctrl {
            seg_type::DS_RED
            | seg_type::DS_RED_CKPT
            | seg_type::DS_RED_CKPT_EORP
            | seg_type::DS_RED_CKPT_EORP_EOB
            | seg_type::DS_GREEN
            | 5
            | 6
            | seg_type::DS_GREEN_EOB => {
                let red = ctrl < 4;
                let service_id = take(&mut cur)?;
                let offset = take(&mut cur)?;
                let len = take(&mut cur)? as usize;
                let checkpoint = if red && ctrl >= seg_type::DS_RED_CKPT {
                    Some((take(&mut cur)?, take(&mut cur)?))
                } else {
                    None
                };
                if cur.len() < len {
                    return Err(NodeError::Protocol("ltp data segment short".into()));
                }
                Segment::Data(DataSegment {
                    session: sid,
                    red,
                    checkpoint,
                    eorp: red && ctrl >= seg_type::DS_RED_CKPT_EORP,
                    eob: ctrl == seg_type::DS_RED_CKPT_EORP_EOB || ctrl == seg_type::DS_GREEN_EOB,
                    service_id,
                    offset,
                    data: cur[..len].to_vec(),
                })
            }
            seg_type::RS => {
                let report_serial = take(&mut cur)?;
                let checkpoint_serial = take(&mut cur)?;
                let upper = take(&mut cur)?;
                let lower = take(&mut cur)?;
                let count = take(&mut cur)? as usize;
                if count > 4096 {
                    return Err(NodeError::Protocol("ltp report claim count".into()));
                }
                let mut claims = Vec::with_capacity(count);
                for _ in 0..count {
                    claims.push((take(&mut cur)?, take(&mut cur)?));
                }
                Segment::Report(ReportSegment {
                    session: sid,
                    report_serial,
                    checkpoint_serial,
                    upper,
                    lower,
                    claims,
                })
            }
            seg_type::RA => Segment::ReportAck { session: sid, report_serial: take(&mut cur)? },
            seg_type::CS_BS | seg_type::CS_BR => {
                let code = cur
                    .first()
                    .copied()
                    .ok_or_else(|| NodeError::Protocol("ltp cancel truncated".into()))?;
                Segment::Cancel {
                    session: sid,
                    by_sender: ctrl == seg_type::CS_BS,
                    reason: CancelReason::from_code(code),
                }
            }
            seg_type::CAS_BS | seg_type::CAS_BR => {
                Segment::CancelAck { session: sid, to_sender: ctrl == seg_type::CAS_BS }
            }
            other => {
                return Err(NodeError::Protocol(format!("ltp segment type {other}")));
            }
        };
        Ok(segment)
    }
}

/// HMAC-SHA256 over the serialized segment up to the trailer. The session
/// id is inside the covered bytes, binding the tag to the session.
fn segment_mac(auth: &SegmentAuth, covered: &[u8]) -> [u8; AUTH_LEN] {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(&auth.key).expect("hmac accepts any key length");
    mac.update(&auth.key_id.to_be_bytes());
    mac.update(covered);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> SessionId {
        SessionId { engine: 7, session: 42 }
    }

    #[test]
    fn data_segment_roundtrip() {
        let ds = DataSegment {
            session: sid(),
            red: true,
            checkpoint: Some((3, 0)),
            eorp: true,
            eob: true,
            service_id: SERVICE_BUNDLE,
            offset: 7500,
            data: vec![0xab; 100],
        };
        let seg = Segment::Data(ds.clone());
        let decoded = Segment::decode(&seg.encode(None), None).expect("decode");
        assert_eq!(decoded, seg);
    }

    #[test]
    fn plain_red_segment() {
        let ds = DataSegment {
            session: sid(),
            red: true,
            checkpoint: None,
            eorp: false,
            eob: false,
            service_id: SERVICE_BUNDLE,
            offset: 0,
            data: vec![1, 2, 3],
        };
        let decoded = Segment::decode(&Segment::Data(ds.clone()).encode(None), None)
            .expect("decode");
        assert_eq!(decoded, Segment::Data(ds));
    }

    #[test]
    fn green_segment_roundtrip() {
        let ds = DataSegment {
            session: sid(),
            red: false,
            checkpoint: None,
            eorp: false,
            eob: true,
            service_id: SERVICE_BUNDLE,
            offset: 12,
            data: vec![9; 10],
        };
        let decoded = Segment::decode(&Segment::Data(ds.clone()).encode(None), None)
            .expect("decode");
        assert_eq!(decoded, Segment::Data(ds));
    }

    #[test]
    fn report_roundtrip() {
        let rs = ReportSegment {
            session: sid(),
            report_serial: 5,
            checkpoint_serial: 3,
            upper: 10_000,
            lower: 0,
            claims: vec![(0, 2500), (5000, 5000)],
        };
        let decoded = Segment::decode(&Segment::Report(rs.clone()).encode(None), None)
            .expect("decode");
        assert_eq!(decoded, Segment::Report(rs));
    }

    #[test]
    fn control_segments_roundtrip() {
        for seg in [
            Segment::ReportAck { session: sid(), report_serial: 9 },
            Segment::Cancel {
                session: sid(),
                by_sender: true,
                reason: CancelReason::RetransmitCycleExceeded,
            },
            Segment::Cancel {
                session: sid(),
                by_sender: false,
                reason: CancelReason::SystemCancelled,
            },
            Segment::CancelAck { session: sid(), to_sender: true },
            Segment::CancelAck { session: sid(), to_sender: false },
        ] {
            let decoded = Segment::decode(&seg.encode(None), None).expect("decode");
            assert_eq!(decoded, seg);
            assert!(decoded.is_control());
        }
    }

    #[test]
    fn authenticated_roundtrip() {
        let auth = SegmentAuth { key: b"ltp shared key".to_vec(), key_id: 3 };
        let seg = Segment::ReportAck { session: sid(), report_serial: 1 };
        let wire = seg.encode(Some(&auth));
        assert_eq!(Segment::decode(&wire, Some(&auth)).expect("decode"), seg);

        // Tampering or the wrong key drops the segment.
        let mut bad = wire.clone();
        let n = bad.len();
        bad[n - 1] ^= 1;
        assert!(Segment::decode(&bad, Some(&auth)).is_err());
        let other = SegmentAuth { key: b"different key".to_vec(), key_id: 3 };
        assert!(Segment::decode(&wire, Some(&other)).is_err());
        // Unauthenticated segments are rejected when auth is required.
        assert!(Segment::decode(&seg.encode(None), Some(&auth)).is_err());
    }

    #[test]
    fn junk_rejected() {
        assert!(Segment::decode(&[], None).is_err());
        assert!(Segment::decode(&[0xff, 0, 0, 0], None).is_err());
        assert!(Segment::decode(&[0x0b, 1, 1, 0], None).is_err());
    }
}
