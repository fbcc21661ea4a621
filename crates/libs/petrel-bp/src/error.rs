use crate::eid::EidError;
use petrel_sdnv::SdnvError;

#[derive(Debug, thiserror::Error)]
pub enum BpError {
    /// The wire image ended mid-field. More input may complete it.
    #[error("bundle image truncated")]
    Truncated,

    #[error("malformed bundle: {0}")]
    Malformed(&'static str),

    #[error("unsupported bundle protocol version {0}")]
    BadVersion(u8),

    #[error(transparent)]
    Sdnv(#[from] SdnvError),

    #[error(transparent)]
    Eid(#[from] EidError),

    #[error("security processing failed: {0}")]
    Security(&'static str),

    #[error("payload io: {0}")]
    PayloadIo(#[from] std::io::Error),
}

impl BpError {
    /// Truncation is recoverable with more input; everything else is fatal
    /// for the containing bundle.
    pub fn is_truncation(&self) -> bool {
        matches!(self, BpError::Truncated | BpError::Sdnv(SdnvError::Truncated(_)))
    }
}
