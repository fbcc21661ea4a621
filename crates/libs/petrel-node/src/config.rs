use std::path::PathBuf;

use petrel_bp::EndpointId;

/// Core node parameters. The daemon binary layers TOML and CLI parsing on
/// top of this.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub local_eid: EndpointId,
    /// Where file-backed payloads live. None keeps payloads in memory.
    pub payload_dir: Option<PathBuf>,
    /// Payloads larger than this spill to files when a payload dir is set.
    pub payload_spill_bytes: u64,
    /// Bundles from peers seen twice are dropped; this bounds the
    /// duplicate-suppression window.
    pub seen_window: usize,
}

impl NodeConfig {
    pub fn new(local_eid: EndpointId) -> Self {
        Self {
            local_eid,
            payload_dir: None,
            payload_spill_bytes: 64 * 1024,
            seen_window: 4096,
        }
    }
}
