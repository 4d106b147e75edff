use thiserror::Error;

/// Fatal wire-level failures.
///
/// A framing error means the byte stream can no longer be trusted: the
/// protocol has no mid-stream resync, so the connection must be closed.
/// Recoverable conditions (unknown packet kinds, missing artifacts) are
/// modelled elsewhere, never here.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("frame length {declared} exceeds maximum {max}")]
    FrameTooLarge { declared: usize, max: usize },

    #[error("zlib compression failed: {0}")]
    Compress(String),

    #[error("zlib decompression failed: {0}")]
    Decompress(String),

    #[error("truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },

    #[error("frame body not exhausted: {remaining} trailing bytes")]
    TrailingBytes { remaining: usize },

    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },

    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
}

impl FramingError {
    pub(crate) fn malformed(what: &'static str, detail: impl ToString) -> Self {
        FramingError::Malformed {
            what,
            detail: detail.to_string(),
        }
    }
}

pub type FramingResult<T> = Result<T, FramingError>;

/// Artifact cipher failures.
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid iv length: expected {expected} bytes, got {actual}")]
    InvalidIvLength { expected: usize, actual: usize },

    #[error("decryption failed: {0}")]
    Decrypt(String),
}

pub type CipherResult<T> = Result<T, CipherError>;
