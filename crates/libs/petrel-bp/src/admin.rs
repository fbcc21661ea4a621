use crate::bundle::Bundle;
use crate::eid::EndpointId;
use crate::error::BpError;
use crate::protocol::ReceptionReason;
use crate::timestamp::BundleTimestamp;

const RECORD_STATUS_REPORT: u8 = 0x01;
const RECORD_CUSTODY_SIGNAL: u8 = 0x02;
const RECORD_FLAG_FRAGMENT: u8 = 0x01;

/// Status flag bits in a bundle status report.
pub mod status_flags {
    pub const RECEIVED: u8 = 1 << 0;
    pub const CUSTODY_ACCEPTED: u8 = 1 << 1;
    pub const FORWARDED: u8 = 1 << 2;
    pub const DELIVERED: u8 = 1 << 3;
    pub const DELETED: u8 = 1 << 4;
}

/// Custody signal reason codes (RFC 5050 §6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CustodyReason {
    NoAdditionalInfo = 0x00,
    RedundantReception = 0x03,
    DepletedStorage = 0x04,
    DestEidUnintelligible = 0x05,
    NoKnownRoute = 0x06,
    NoTimelyContact = 0x07,
    BlockUnintelligible = 0x08,
}

impl CustodyReason {
    fn from_code(code: u8) -> Self {
        match code {
            0x03 => CustodyReason::RedundantReception,
            0x04 => CustodyReason::DepletedStorage,
            0x05 => CustodyReason::DestEidUnintelligible,
            0x06 => CustodyReason::NoKnownRoute,
            0x07 => CustodyReason::NoTimelyContact,
            0x08 => CustodyReason::BlockUnintelligible,
            _ => CustodyReason::NoAdditionalInfo,
        }
    }
}

/// A bundle status report admin record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub status: u8,
    pub reason: ReceptionReason,
    pub frag: Option<(u64, u64)>,
    pub at: BundleTimestamp,
    pub orig_creation_ts: BundleTimestamp,
    pub orig_source: EndpointId,
}

/// A custody signal admin record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustodySignal {
    pub succeeded: bool,
    pub reason: CustodyReason,
    pub frag: Option<(u64, u64)>,
    pub at: BundleTimestamp,
    pub orig_creation_ts: BundleTimestamp,
    pub orig_source: EndpointId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminRecord {
    StatusReport(StatusReport),
    CustodySignal(CustodySignal),
}

impl StatusReport {
    /// Build a report about `subject` with the given status bits.
    pub fn about(subject: &Bundle, status: u8, reason: ReceptionReason) -> Self {
        Self {
            status,
            reason,
            frag: subject.is_fragment.then_some((subject.frag_offset, subject.orig_length)),
            at: BundleTimestamp::now(),
            orig_creation_ts: subject.creation_ts,
            orig_source: subject.source.clone(),
        }
    }
}

impl CustodySignal {
    pub fn about(subject: &Bundle, succeeded: bool, reason: CustodyReason) -> Self {
        Self {
            succeeded,
            reason,
            frag: subject.is_fragment.then_some((subject.frag_offset, subject.orig_length)),
            at: BundleTimestamp::now(),
            orig_creation_ts: subject.creation_ts,
            orig_source: subject.source.clone(),
        }
    }
}

fn reception_reason_from_code(code: u8) -> ReceptionReason {
    match code {
        0x01 => ReceptionReason::LifetimeExpired,
        0x02 => ReceptionReason::ForwardedUnidirectional,
        0x03 => ReceptionReason::TransmissionCancelled,
        0x04 => ReceptionReason::DepletedStorage,
        0x05 => ReceptionReason::DestEidUnintelligible,
        0x06 => ReceptionReason::NoKnownRoute,
        0x07 => ReceptionReason::NoTimelyContact,
        0x08 => ReceptionReason::BlockUnintelligible,
        0x09 => ReceptionReason::SecurityFailed,
        _ => ReceptionReason::NoAdditionalInfo,
    }
}

fn append_common(
    out: &mut Vec<u8>,
    frag: &Option<(u64, u64)>,
    at: &BundleTimestamp,
    ts: &BundleTimestamp,
    source: &EndpointId,
) {
    if let Some((off, len)) = frag {
        petrel_sdnv::append(*off, out);
        petrel_sdnv::append(*len, out);
    }
    petrel_sdnv::append(at.secs, out);
    petrel_sdnv::append(at.seqno, out);
    petrel_sdnv::append(ts.secs, out);
    petrel_sdnv::append(ts.seqno, out);
    let eid = source.to_string();
    petrel_sdnv::append(eid.len() as u64, out);
    out.extend_from_slice(eid.as_bytes());
}

fn parse_common(
    cur: &mut &[u8],
    fragment: bool,
) -> Result<(Option<(u64, u64)>, BundleTimestamp, BundleTimestamp, EndpointId), BpError> {
    let frag = if fragment {
        let off = petrel_sdnv::decode_advance(cur)?;
        let len = petrel_sdnv::decode_advance(cur)?;
        Some((off, len))
    } else {
        None
    };
    let at = BundleTimestamp::new(
        petrel_sdnv::decode_advance(cur)?,
        petrel_sdnv::decode_advance(cur)?,
    );
    let ts = BundleTimestamp::new(
        petrel_sdnv::decode_advance(cur)?,
        petrel_sdnv::decode_advance(cur)?,
    );
    let eid_len = petrel_sdnv::decode_advance(cur)? as usize;
    if cur.len() < eid_len {
        return Err(BpError::Truncated);
    }
    let eid_str = std::str::from_utf8(&cur[..eid_len])
        .map_err(|_| BpError::Malformed("admin record eid not utf-8"))?;
    let source = EndpointId::parse(eid_str)?;
    *cur = &cur[eid_len..];
    Ok((frag, at, ts, source))
}

impl AdminRecord {
    /// Serialize into an admin-record payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        match self {
            AdminRecord::StatusReport(r) => {
                let mut head = RECORD_STATUS_REPORT << 4;
                if r.frag.is_some() {
                    head |= RECORD_FLAG_FRAGMENT;
                }
                out.push(head);
                out.push(r.status);
                out.push(r.reason as u8);
                append_common(&mut out, &r.frag, &r.at, &r.orig_creation_ts, &r.orig_source);
            }
            AdminRecord::CustodySignal(s) => {
                let mut head = RECORD_CUSTODY_SIGNAL << 4;
                if s.frag.is_some() {
                    head |= RECORD_FLAG_FRAGMENT;
                }
                out.push(head);
                let mut status = s.reason as u8 & 0x7f;
                if s.succeeded {
                    status |= 0x80;
                }
                out.push(status);
                append_common(&mut out, &s.frag, &s.at, &s.orig_creation_ts, &s.orig_source);
            }
        }
        out
    }

    /// Parse an admin-record payload.
    pub fn parse(data: &[u8]) -> Result<Self, BpError> {
        if data.len() < 2 {
            return Err(BpError::Truncated);
        }
        let record_type = data[0] >> 4;
        let fragment = data[0] & RECORD_FLAG_FRAGMENT != 0;
        let mut cur = &data[1..];

        match record_type {
            RECORD_STATUS_REPORT => {
                if cur.len() < 2 {
                    return Err(BpError::Truncated);
                }
                let status = cur[0];
                let reason = reception_reason_from_code(cur[1]);
                cur = &cur[2..];
                let (frag, at, ts, source) = parse_common(&mut cur, fragment)?;
                Ok(AdminRecord::StatusReport(StatusReport {
                    status,
                    reason,
                    frag,
                    at,
                    orig_creation_ts: ts,
                    orig_source: source,
                }))
            }
            RECORD_CUSTODY_SIGNAL => {
                if cur.is_empty() {
                    return Err(BpError::Truncated);
                }
                let status = cur[0];
                cur = &cur[1..];
                let (frag, at, ts, source) = parse_common(&mut cur, fragment)?;
                Ok(AdminRecord::CustodySignal(CustodySignal {
                    succeeded: status & 0x80 != 0,
                    reason: CustodyReason::from_code(status & 0x7f),
                    frag,
                    at,
                    orig_creation_ts: ts,
                    orig_source: source,
                }))
            }
            other => {
                log::warn!("bp: unknown admin record type {other}");
                Err(BpError::Malformed("unknown admin record type"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject() -> Bundle {
        let mut b = Bundle::new();
        b.source = EndpointId::parse("dtn://orig/app").expect("parse");
        b
    }

    #[test]
    fn status_report_roundtrip() {
        let b = subject();
        let report = StatusReport::about(
            &b,
            status_flags::DELIVERED | status_flags::RECEIVED,
            ReceptionReason::NoAdditionalInfo,
        );
        let rec = AdminRecord::StatusReport(report.clone());
        let parsed = AdminRecord::parse(&rec.encode()).expect("parse");
        assert_eq!(parsed, rec);
    }

    #[test]
    fn custody_signal_roundtrip() {
        let mut b = subject();
        b.is_fragment = true;
        b.frag_offset = 10;
        b.orig_length = 100;
        let sig = CustodySignal::about(&b, true, CustodyReason::NoAdditionalInfo);
        let rec = AdminRecord::CustodySignal(sig);
        let parsed = AdminRecord::parse(&rec.encode()).expect("parse");
        match parsed {
            AdminRecord::CustodySignal(s) => {
                assert!(s.succeeded);
                assert_eq!(s.frag, Some((10, 100)));
                assert_eq!(s.orig_source, b.source);
            }
            _ => panic!("wrong record type"),
        }
    }

    #[test]
    fn failed_custody_signal() {
        let b = subject();
        let sig = CustodySignal::about(&b, false, CustodyReason::RedundantReception);
        let rec = AdminRecord::CustodySignal(sig);
        match AdminRecord::parse(&rec.encode()).expect("parse") {
            AdminRecord::CustodySignal(s) => {
                assert!(!s.succeeded);
                assert_eq!(s.reason, CustodyReason::RedundantReception);
            }
            _ => panic!("wrong record type"),
        }
    }

    #[test]
    fn junk_rejected() {
        assert!(AdminRecord::parse(&[]).is_err());
        assert!(AdminRecord::parse(&[0xf0, 0x00, 0x00]).is_err());
    }
}
