use thiserror::Error;

/// Errors reported by a [`crate::BlockBackend`] when an operation fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend I/O error")]
    Io,

    #[error("request out of range: offset={offset:#x} len={len}")]
    OutOfRange { offset: u64, len: u64 },

    #[error("request cancelled")]
    Cancelled,
}

/// Errors returned by the controller's host-facing API (construction and namespace management).
///
/// Guest-visible command failures are never reported this way; they travel in the completion
/// entry as an [`crate::NvmeStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NvmeError {
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParam { name: &'static str, reason: String },

    #[error("namespace id {0} is outside the supported range")]
    InvalidNamespaceId(u32),

    #[error("namespace {0} already exists")]
    NamespaceExists(u32),

    #[error("namespace {0} not found")]
    NamespaceNotFound(u32),

    #[error("unsupported LBA format: lba_size={lba_size} metadata_size={metadata_size}")]
    UnsupportedFormat { lba_size: u32, metadata_size: u16 },

    #[error("backend of {len} bytes cannot hold a single zone or block")]
    BackendTooSmall { len: u64 },
}

impl NvmeError {
    pub(crate) fn param(name: &'static str, reason: impl Into<String>) -> Self {
        NvmeError::InvalidParam {
            name,
            reason: reason.into(),
        }
    }
}
