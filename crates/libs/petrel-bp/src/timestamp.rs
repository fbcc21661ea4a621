use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between the UNIX epoch and the DTN epoch, 2000-01-01T00:00:00Z.
pub const DTN_EPOCH_OFFSET: u64 = 946_684_800;

/// Bundle creation timestamp: seconds since the DTN epoch plus a sequence
/// number that increases monotonically within one second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BundleTimestamp {
    pub secs: u64,
    pub seqno: u64,
}

static LAST: Mutex<(u64, u64)> = Mutex::new((0, 0));

impl BundleTimestamp {
    pub fn new(secs: u64, seqno: u64) -> Self {
        Self { secs, seqno }
    }

    /// Current creation timestamp. Two calls within the same second get
    /// increasing sequence numbers.
    pub fn now() -> Self {
        let secs = Self::current_secs();
        let mut last = LAST.lock().unwrap_or_else(|e| e.into_inner());
        if last.0 == secs {
            last.1 += 1;
        } else {
            *last = (secs, 0);
        }
        Self { secs, seqno: last.1 }
    }

    /// Wall-clock seconds since the DTN epoch. Zero on a host whose clock
    /// predates it.
    pub fn current_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs().saturating_sub(DTN_EPOCH_OFFSET))
            .unwrap_or(0)
    }

    pub fn as_unix_secs(&self) -> u64 {
        self.secs + DTN_EPOCH_OFFSET
    }
}

impl std::fmt::Display for BundleTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.secs, self.seqno)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_increases_within_second() {
        let a = BundleTimestamp::now();
        let b = BundleTimestamp::now();
        assert!(b > a);
        if a.secs == b.secs {
            assert!(b.seqno > a.seqno);
        }
    }

    #[test]
    fn unix_conversion() {
        let ts = BundleTimestamp::new(10, 0);
        assert_eq!(ts.as_unix_secs(), DTN_EPOCH_OFFSET + 10);
    }
}
