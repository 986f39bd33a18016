//! Audit Sink: a one-way, fire-and-forget log of pre-execution code hashes.
//!
//! Implementations MUST tolerate bursts and MUST NOT block execution on
//! failure — the Façade always swallows and logs audit errors itself, but
//! a well-behaved sink should not need that safety net in practice.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::info;

#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Log a code execution attempt and return the SHA-256 hash of the
    /// code, hex-encoded.
    async fn log_pre_execution(&self, code: &str, language: &str) -> anyhow::Result<String>;
}

/// Default Audit Sink: logs through `tracing` rather than a dedicated
/// collector. Stands in for a richer sink while keeping the hashing/logging
/// contract from §4.6/§6 real.
#[derive(Debug, Default, Clone)]
pub struct StdoutAuditSink;

impl StdoutAuditSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuditSink for StdoutAuditSink {
    async fn log_pre_execution(&self, code: &str, language: &str) -> anyhow::Result<String> {
        let code_hash = hex::encode(Sha256::digest(code.as_bytes()));
        info!(
            language = %language,
            code_hash = %code_hash,
            code_length = code.len(),
            "audit: sandbox execution start"
        );
        Ok(code_hash)
    }
}

/// Audit Sink used when `enable_audit_logging` is turned off: still hashes
/// the code (callers may rely on the returned hash) but never logs it.
#[derive(Debug, Default, Clone)]
pub struct NoopAuditSink;

impl NoopAuditSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn log_pre_execution(&self, code: &str, _language: &str) -> anyhow::Result<String> {
        Ok(hex::encode(Sha256::digest(code.as_bytes())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_is_stable_sha256() {
        let sink = StdoutAuditSink::new();
        let hash = sink.log_pre_execution("print(1)", "python").await.unwrap();
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            hex::encode(Sha256::digest(b"print(1)"))
        );
    }

    #[tokio::test]
    async fn noop_sink_still_returns_the_hash() {
        let sink = NoopAuditSink::new();
        let hash = sink.log_pre_execution("print(1)", "python").await.unwrap();
        assert_eq!(hash, hex::encode(Sha256::digest(b"print(1)")));
    }
}
