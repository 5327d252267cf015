// ── Error types ──
//
// The transport is best-effort by design, so almost every fault is
// logged and degraded rather than surfaced. The one hard error a
// caller must handle is the endpoint bind failing.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// The UDP endpoint could not be bound. When the cause is
    /// `AddrInUse` (another controller instance, or the previous one
    /// still shutting down) callers should treat this as retryable.
    #[error("failed to bind UDP endpoint on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// Socket setup or I/O failure outside the bind itself.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

impl CoreError {
    /// Whether the caller should retry later instead of giving up.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Bind { source, .. } if source.kind() == io::ErrorKind::AddrInUse
        )
    }
}
