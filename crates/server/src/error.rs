use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading/reload failures.
///
/// File-level variants abort a reload outright and the previous generation
/// stays live. Per-script problems never surface here; they are logged and
/// the offending script is skipped.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("manifest not found at {0}")]
    ManifestMissing(PathBuf),

    #[error("invalid manifest {path}: {detail}")]
    ManifestInvalid { path: PathBuf, detail: String },

    #[error("revision file unreadable at {path}: {detail}")]
    RevisionUnreadable { path: PathBuf, detail: String },

    #[error("script config directory missing or not a directory: {0}")]
    ScriptDirMissing(PathBuf),

    #[error("cannot list script config directory {path}: {detail}")]
    ScriptDirUnreadable { path: PathBuf, detail: String },
}

/// Artifact store lookup failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Typed miss: the id is not part of the current generation.
    #[error("no script with id {0} in the current generation")]
    ArtifactNotFound(i32),

    #[error("failed to read {path}: {detail}")]
    Io { path: PathBuf, detail: String },
}

/// Top-level server failures (binding, ingress setup).
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {detail}")]
    Bind { addr: String, detail: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Framing(#[from] scriptcast_protocol::FramingError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
