//! Typed error boundaries (§10.3).
//!
//! Only the components that need a typed identity downstream (the metrics registry
//! weighting connectivity vs. timeout differently, the VRAM guard's decision kinds,
//! persistence failures) get a `thiserror` enum. Everything upstream of those
//! boundaries uses `anyhow::Result` with `.context(...)`.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InferenceError {
    #[error("could not connect to inference server: {0}")]
    Connect(String),
    #[error("inference server returned HTTP {0}: {1}")]
    Http(u16, String),
    #[error("inference call timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("malformed response payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("obfuscation key derivation failed: {0}")]
    KeyDerivation(String),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VramDecisionKind {
    Load,
    UnloadFirst,
    OffloadCpu,
    Refuse,
}

impl std::fmt::Display for VramDecisionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VramDecisionKind::Load => "LOAD",
            VramDecisionKind::UnloadFirst => "UNLOAD_FIRST",
            VramDecisionKind::OffloadCpu => "OFFLOAD_CPU",
            VramDecisionKind::Refuse => "REFUSE",
        };
        write!(f, "{s}")
    }
}
