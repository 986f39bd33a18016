//! Orchestrator configuration.
//!
//! Unlike the per-environment metadata a single-shot sandbox wrapper would
//! load, this configuration describes the orchestrator as a whole: which
//! runtime backs new sessions, the package allowlist, the timing knobs in
//! §5 of the design, and (optionally) where artifacts get uploaded.

use std::collections::HashSet;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Which backend driver new sessions are created against.
    #[serde(default)]
    pub runtime_kind: RuntimeKind,

    /// Container image used by the container-flavored driver.
    #[serde(default = "default_container_image")]
    pub container_image: String,

    /// Package base names (case-insensitive) that `install_package` accepts.
    #[serde(default)]
    pub allowed_packages: HashSet<String>,

    /// Wall-clock ceiling for a single `execute` call.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_seconds: f64,

    /// How long a session may sit idle before the reaper terminates it.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: f64,

    /// Interval between reaper sweeps.
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_seconds: f64,

    /// Whether pre-execution code hashes are sent to the Audit Sink.
    #[serde(default = "default_true")]
    pub enable_audit_logging: bool,

    /// Object-store credentials for shipping non-image artifacts. Optional:
    /// if absent, the core skips uploads and such artifacts carry no `url`.
    #[serde(default)]
    pub object_store: Option<ObjectStoreConfig>,
}

/// Which concrete Backend Driver the orchestrator constructs for new
/// sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Long-lived container/process-jail driver.
    #[default]
    Container,
    /// Remote microVM driver (contract-only in this crate; see §4.1).
    #[serde(rename = "microvm")]
    MicroVm,
}

/// Credential/endpoint bundle for an S3-compatible object store.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStoreConfig {
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            runtime_kind: RuntimeKind::default(),
            container_image: default_container_image(),
            allowed_packages: HashSet::new(),
            execution_timeout_seconds: default_execution_timeout(),
            idle_timeout_seconds: default_idle_timeout(),
            reaper_interval_seconds: default_reaper_interval(),
            enable_audit_logging: true,
            object_store: None,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from the `SANDBOX_ORCHESTRATOR_CONFIG` environment
    /// variable, which holds a JSON document shaped like this struct.
    /// Falls back to defaults if the variable is unset.
    pub fn from_env() -> Result<Self> {
        let config_json =
            std::env::var("SANDBOX_ORCHESTRATOR_CONFIG").unwrap_or_else(|_| "{}".to_string());

        let config: Self = serde_json::from_str(&config_json)
            .context("Failed to parse SANDBOX_ORCHESTRATOR_CONFIG")?;
        Ok(config)
    }

    /// Create a config from a JSON string (for testing).
    #[cfg(any(test, feature = "test-util"))]
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse JSON")
    }

    pub fn execution_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.execution_timeout_seconds.max(0.0))
    }

    pub fn idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.idle_timeout_seconds.max(0.0))
    }

    pub fn reaper_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.reaper_interval_seconds.max(0.001))
    }
}

const fn default_true() -> bool {
    true
}

fn default_container_image() -> String {
    "python:3.12-slim".to_string()
}

const fn default_execution_timeout() -> f64 {
    60.0
}

const fn default_idle_timeout() -> f64 {
    300.0
}

const fn default_reaper_interval() -> f64 {
    60.0
}
