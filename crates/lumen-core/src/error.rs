//! Error types for the decode-and-cache pipeline.
//!
//! Errors are grouped by the layer that raises them:
//! - [`DecodeError`] - a decode stage or processor could not produce pixels
//! - [`CacheError`] - the transformed-result disk cache failed
//! - [`FetchError`] - the fetch layer could not deliver source bytes
//! - [`PipelineError`] - what the caller of a request finally sees

use thiserror::Error;

use crate::raster::DataFrom;
use crate::options::RequestDepth;

/// Coarse classification of a [`DecodeError`], used for logging and matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    UnsupportedFormat,
    CorruptData,
    BufferReuseConflict,
    OutputTooSmall,
    ProcessorFailed,
    Cache,
}

/// Error types for decode stages and processors.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The byte stream is not in a format any codec understands.
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    /// The byte stream claims a supported format but cannot be decoded.
    #[error("Corrupted or incomplete image data: {0}")]
    CorruptData(String),

    /// The decode primitive rejected the pooled buffer offered for reuse.
    #[error("Reused buffer rejected for a {width}x{height} decode")]
    BufferReuseConflict { width: u32, height: u32 },

    /// A buffer is too small to hold the decoded pixels.
    #[error("Output buffer too small: need {required} bytes, have {available}")]
    OutputTooSmall { required: usize, available: usize },

    /// A post-process pixel transform failed.
    #[error("Processor '{processor}' failed: {reason}")]
    ProcessorFailed { processor: String, reason: String },

    /// The transformed-result cache could not serve the entry.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl DecodeError {
    /// Classify this error.
    pub fn kind(&self) -> DecodeErrorKind {
        match self {
            DecodeError::UnsupportedFormat(_) => DecodeErrorKind::UnsupportedFormat,
            DecodeError::CorruptData(_) => DecodeErrorKind::CorruptData,
            DecodeError::BufferReuseConflict { .. } => DecodeErrorKind::BufferReuseConflict,
            DecodeError::OutputTooSmall { .. } => DecodeErrorKind::OutputTooSmall,
            DecodeError::ProcessorFailed { .. } => DecodeErrorKind::ProcessorFailed,
            DecodeError::Cache(_) => DecodeErrorKind::Cache,
        }
    }

    /// Whether retrying the request once with buffer pooling disabled may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DecodeError::BufferReuseConflict { .. })
    }
}

/// Errors raised by the transformed-result disk cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Reading, writing or committing a cache file failed.
    #[error("Disk cache I/O failure: {0}")]
    DiskIoFailure(#[from] std::io::Error),

    /// A committed entry exists but its contents cannot be decoded.
    #[error("Corrupt disk cache entry {key}: {reason}")]
    DiskCacheCorrupt { key: String, reason: String },
}

/// Errors reported by the fetch layer.
#[derive(Debug, Error)]
pub enum FetchError {
    /// No source is known under this identity.
    #[error("Source not found: {0}")]
    NotFound(String),

    /// Delivering the bytes would need a tier beyond the request's allowed depth.
    #[error("Source requires {required:?} access")]
    DepthBlocked { required: DataFrom },

    /// Reading the source failed.
    #[error("Fetch I/O error: {0}")]
    Io(String),
}

/// The single error surfaced to a request's caller.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Satisfying the request would require a deeper tier than it allows.
    #[error("Request limited to {allowed:?} but needs {required:?}")]
    DepthExceeded {
        allowed: RequestDepth,
        required: RequestDepth,
    },

    /// No decode stage accepted the request.
    #[error("No decode stage matched the request")]
    NoMatchingStage,

    /// The request was cancelled or the engine shut down.
    #[error("Request aborted")]
    Aborted,

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_reuse_conflict_is_recoverable() {
        let conflict = DecodeError::BufferReuseConflict {
            width: 10,
            height: 10,
        };
        assert!(conflict.is_recoverable());
        assert_eq!(conflict.kind(), DecodeErrorKind::BufferReuseConflict);

        assert!(!DecodeError::CorruptData("eof".to_string()).is_recoverable());
        assert!(!DecodeError::UnsupportedFormat("image/x".to_string()).is_recoverable());
    }

    #[test]
    fn test_cache_errors_classify_as_cache() {
        let err = DecodeError::from(CacheError::DiskCacheCorrupt {
            key: "k".to_string(),
            reason: "bad png".to_string(),
        });
        assert_eq!(err.kind(), DecodeErrorKind::Cache);
        assert!(!err.is_recoverable());

        let io = DecodeError::from(CacheError::DiskIoFailure(std::io::Error::other("disk")));
        assert_eq!(io.kind(), DecodeErrorKind::Cache);
    }

    #[test]
    fn test_error_display() {
        let err = DecodeError::OutputTooSmall {
            required: 400,
            available: 100,
        };
        assert_eq!(
            err.to_string(),
            "Output buffer too small: need 400 bytes, have 100"
        );

        let err = PipelineError::DepthExceeded {
            allowed: RequestDepth::Memory,
            required: RequestDepth::Local,
        };
        assert_eq!(err.to_string(), "Request limited to Memory but needs Local");
    }
}
