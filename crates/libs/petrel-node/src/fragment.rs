use std::collections::HashMap;
use std::sync::Arc;

use petrel_bp::block::block_flags;
use petrel_bp::payload::BundlePayload;
use petrel_bp::{Bundle, BundleRef};

use crate::error::NodeError;

/// Split `bundle` into fragments whose payloads are at most `max_payload`
/// bytes. Blocks flagged replicate-in-every-fragment ride in each
/// fragment; everything else only in the first.
pub fn fragment(bundle: &BundleRef, max_payload: u64) -> Result<Vec<BundleRef>, NodeError> {
    if max_payload == 0 {
        return Err(NodeError::Policy("fragment size of zero".into()));
    }
    if bundle.do_not_fragment {
        return Err(NodeError::Policy("bundle forbids fragmentation".into()));
    }

    let payload = bundle.state().payload.read_all()?;
    let total = payload.len() as u64;
    if total <= max_payload {
        return Ok(vec![bundle.clone()]);
    }

    // A fragment of a fragment keeps the original coordinates.
    let (base_offset, orig_length) = if bundle.is_fragment {
        (bundle.frag_offset, bundle.orig_length)
    } else {
        (0, total)
    };

    let (replicated, first_only): (Vec<_>, Vec<_>) = {
        let state = bundle.state();
        state
            .recv_blocks
            .iter()
            .filter(|b| {
                b.block_type != petrel_bp::block::block_type::PRIMARY
                    && b.block_type != petrel_bp::block::block_type::PAYLOAD
            })
            .chain(state.api_blocks.iter())
            .cloned()
            .partition(|b| b.flags & block_flags::REPLICATE_IN_EVERY_FRAGMENT != 0)
    };

    let mut fragments = Vec::new();
    let mut offset = 0u64;
    while offset < total {
        let len = max_payload.min(total - offset);
        let mut frag = Bundle::new();
        frag.source = bundle.source.clone();
        frag.dest = bundle.dest.clone();
        frag.replyto = bundle.replyto.clone();
        frag.priority = bundle.priority;
        frag.custody_requested = bundle.custody_requested;
        frag.singleton_dest = bundle.singleton_dest;
        frag.receive_rcpt = bundle.receive_rcpt;
        frag.custody_rcpt = bundle.custody_rcpt;
        frag.forward_rcpt = bundle.forward_rcpt;
        frag.delivery_rcpt = bundle.delivery_rcpt;
        frag.deletion_rcpt = bundle.deletion_rcpt;
        frag.creation_ts = bundle.creation_ts;
        frag.lifetime_secs = bundle.lifetime_secs;
        frag.is_fragment = true;
        frag.frag_offset = base_offset + offset;
        frag.orig_length = orig_length;
        frag.set_payload(BundlePayload::with_memory(
            payload[offset as usize..(offset + len) as usize].to_vec(),
        ));
        {
            let mut state = frag.state();
            state.custodian = bundle.custodian();
            state.api_blocks = replicated.clone();
            if offset == 0 {
                state.api_blocks.extend(first_only.iter().cloned());
            }
        }
        fragments.push(Arc::new(frag));
        offset += len;
    }

    log::debug!(
        "fragment: {} split into {} fragments of <= {} bytes",
        bundle,
        fragments.len(),
        max_payload
    );
    Ok(fragments)
}

struct ReassemblyState {
    base: BundleRef,
    data: Vec<u8>,
    /// Sorted, disjoint received ranges.
    ranges: Vec<(u64, u64)>,
}

impl ReassemblyState {
    fn insert(&mut self, offset: u64, bytes: &[u8]) {
        let end = offset + bytes.len() as u64;
        self.data[offset as usize..end as usize].copy_from_slice(bytes);
        self.ranges.push((offset, end));
        self.ranges.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.ranges.len());
        for &(start, stop) in &self.ranges {
            match merged.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(stop),
                _ => merged.push((start, stop)),
            }
        }
        self.ranges = merged;
    }

    fn complete(&self, total: u64) -> bool {
        self.ranges.first().is_some_and(|&(s, e)| s == 0 && e >= total)
    }
}

/// Reassembles fragments keyed by the original bundle's identity.
#[derive(Default)]
pub struct ReassemblyTable {
    inflight: HashMap<String, ReassemblyState>,
}

impl ReassemblyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one fragment. Returns the rebuilt bundle once the payload is
    /// whole.
    pub fn add_fragment(&mut self, frag: &BundleRef) -> Result<Option<BundleRef>, NodeError> {
        if !frag.is_fragment {
            return Ok(Some(frag.clone()));
        }
        let key = frag.orig_gbofid();
        let total = frag.orig_length;
        let bytes = frag.state().payload.read_all()?;
        if frag.frag_offset + bytes.len() as u64 > total {
            return Err(NodeError::Protocol(format!(
                "fragment range {}..{} exceeds original length {}",
                frag.frag_offset,
                frag.frag_offset + bytes.len() as u64,
                total
            )));
        }

        let state = self.inflight.entry(key.clone()).or_insert_with(|| ReassemblyState {
            base: frag.clone(),
            data: vec![0u8; total as usize],
            ranges: Vec::new(),
        });
        state.insert(frag.frag_offset, &bytes);

        if !state.complete(total) {
            return Ok(None);
        }
        let state = self.inflight.remove(&key).expect("state present");

        let mut whole = Bundle::new();
        let base = &state.base;
        whole.source = base.source.clone();
        whole.dest = base.dest.clone();
        whole.replyto = base.replyto.clone();
        whole.priority = base.priority;
        whole.custody_requested = base.custody_requested;
        whole.receive_rcpt = base.receive_rcpt;
        whole.custody_rcpt = base.custody_rcpt;
        whole.forward_rcpt = base.forward_rcpt;
        whole.delivery_rcpt = base.delivery_rcpt;
        whole.deletion_rcpt = base.deletion_rcpt;
        whole.creation_ts = base.creation_ts;
        whole.lifetime_secs = base.lifetime_secs;
        whole.orig_length = total;
        whole.set_payload(BundlePayload::with_memory(state.data));
        log::debug!("reassembly: {} complete ({} bytes)", whole, total);
        Ok(Some(Arc::new(whole)))
    }

    pub fn pending(&self) -> usize {
        self.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use petrel_bp::EndpointId;

    fn bundle(payload: Vec<u8>) -> BundleRef {
        let mut b = Bundle::new();
        b.source = EndpointId::parse("dtn://src").expect("parse");
        b.dest = EndpointId::parse("dtn://dst/app").expect("parse");
        b.lifetime_secs = 60;
        b.set_payload(BundlePayload::with_memory(payload));
        Arc::new(b)
    }

    #[test]
    fn split_and_reassemble() {
        let original = bundle((0..=255u8).cycle().take(10_000).collect());
        let frags = fragment(&original, 2500).expect("fragment");
        assert_eq!(frags.len(), 4);
        assert_eq!(frags[0].frag_offset, 0);
        assert_eq!(frags[3].frag_offset, 7500);
        assert!(frags.iter().all(|f| f.orig_length == 10_000));

        let mut table = ReassemblyTable::new();
        // Out-of-order arrival.
        assert!(table.add_fragment(&frags[2]).expect("add").is_none());
        assert!(table.add_fragment(&frags[0]).expect("add").is_none());
        assert!(table.add_fragment(&frags[3]).expect("add").is_none());
        let whole = table.add_fragment(&frags[1]).expect("add").expect("complete");

        assert_eq!(
            whole.state().payload.read_all().expect("read"),
            original.state().payload.read_all().expect("read")
        );
        assert!(!whole.is_fragment);
        assert_eq!(table.pending(), 0);
    }

    #[test]
    fn duplicate_fragment_tolerated() {
        let original = bundle(vec![7u8; 100]);
        let frags = fragment(&original, 60).expect("fragment");
        assert_eq!(frags.len(), 2);
        let mut table = ReassemblyTable::new();
        assert!(table.add_fragment(&frags[0]).expect("add").is_none());
        assert!(table.add_fragment(&frags[0]).expect("add").is_none());
        assert!(table.add_fragment(&frags[1]).expect("add").is_some());
    }

    #[test]
    fn small_bundle_not_split() {
        let original = bundle(vec![1u8; 10]);
        let frags = fragment(&original, 100).expect("fragment");
        assert_eq!(frags.len(), 1);
        assert!(!frags[0].is_fragment);
    }

    #[test]
    fn do_not_fragment_respected() {
        let original = bundle(vec![1u8; 100]);
        let mut b = Bundle::new();
        b.do_not_fragment = true;
        b.set_payload(BundlePayload::with_memory(vec![0; 100]));
        let _ = original;
        assert!(fragment(&Arc::new(b), 10).is_err());
    }

    #[test]
    fn oversize_fragment_rejected() {
        let mut b = Bundle::new();
        b.is_fragment = true;
        b.frag_offset = 90;
        b.orig_length = 100;
        b.set_payload(BundlePayload::with_memory(vec![0; 20]));
        let mut table = ReassemblyTable::new();
        assert!(table.add_fragment(&Arc::new(b)).is_err());
    }
}
