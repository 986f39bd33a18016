//! Backend Driver trait and implementations.
//!
//! A driver owns exactly one sandbox instance for the lifetime of the
//! Session it is bound to. The Session Manager never talks to a concrete
//! driver type directly — only through this trait — so a microVM-backed
//! driver can be dropped in without touching session/reaper/scope code.

pub mod process;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

use std::path::Path;

use async_trait::async_trait;

use crate::artifact::ArtifactRef;
use crate::error::{OrchestratorError, Result};

/// Source language of a single `execute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Bash,
    R,
}

impl Language {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "python" => Ok(Self::Python),
            "bash" => Ok(Self::Bash),
            "r" => Ok(Self::R),
            other => Err(OrchestratorError::InvalidArgument(format!(
                "unsupported language: {other}"
            ))),
        }
    }
}

/// Result of executing code in a sandbox, minus any artifacts the diff
/// loop (§4.3) discovers after the fact. A driver MAY populate `artifacts`
/// itself for results it produces intrinsically (e.g. a microVM driver's
/// rich image output) — the Session Scope treats those as already
/// processed and appends filesystem artifacts on top.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub artifacts: Vec<ArtifactRef>,
    pub duration_seconds: f64,
}

/// Uniform contract for starting, executing, file I/O, package install,
/// listing, and terminating a sandbox instance (§4.1).
///
/// Every method may suspend; every method runs while the owning Session's
/// mutex is held, so a driver may assume no two calls overlap in time for
/// the same instance — but MUST tolerate being called from different
/// threads across successive calls.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Provision the sandbox instance. Called exactly once per instance.
    async fn start(&mut self) -> Result<()>;

    /// Run `code` under `language` and capture output.
    ///
    /// MUST enforce `execution_timeout` and, on expiry, forcibly clear the
    /// offending process (restart the container / reset the microVM) so
    /// the *next* call succeeds against a fresh interpreter.
    async fn execute(&mut self, code: &str, language: Language) -> Result<ExecutionResult>;

    /// Inject a local file into the sandbox's working directory.
    async fn upload(&mut self, local_path: &Path, remote_path: &str) -> Result<()>;

    /// Retrieve a file from the sandbox's working directory.
    async fn download(&mut self, remote_path: &str, local_path: &Path) -> Result<()>;

    /// List filenames (not paths) directly under `path`, non-recursively.
    async fn list_files(&mut self, path: &str) -> Result<Vec<String>>;

    /// Install a package after the caller has already passed the
    /// allowlist check performed by the Façade; drivers MAY re-validate.
    async fn install_package(&mut self, package_spec: &str) -> Result<()>;

    /// Tear down the sandbox instance. MUST NOT raise — internal errors
    /// are logged and swallowed by the implementation itself.
    async fn terminate(&mut self);
}

/// Constructs a fresh, unstarted [`IsolationBackend`] for each new Session.
///
/// Kept separate from [`IsolationBackend`] itself so the Session Manager
/// can hold a single `Arc<dyn DriverFactory>` without needing to know how
/// many driver instances it has spun up.
pub trait DriverFactory: Send + Sync {
    fn create(&self) -> Box<dyn IsolationBackend>;
}

/// Parse a package base name out of a requirement specifier, the way
/// `installPackage` must before consulting the allowlist (§4.1): strip
/// version specifiers and compare case-insensitively. `"PaNdAs>=1.0,<2.0"`
/// yields `"pandas"`.
pub fn base_package_name(package_spec: &str) -> String {
    let end = package_spec
        .find(|c: char| "<>=!~; [".contains(c))
        .unwrap_or(package_spec.len());
    package_spec[..end].trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_language_case_insensitively() {
        assert_eq!(Language::parse("Python").unwrap(), Language::Python);
        assert_eq!(Language::parse("BASH").unwrap(), Language::Bash);
        assert_eq!(Language::parse("r").unwrap(), Language::R);
        assert!(Language::parse("ruby").is_err());
    }

    #[test]
    fn strips_version_specifiers_case_insensitively() {
        assert_eq!(base_package_name("pandas"), "pandas");
        assert_eq!(base_package_name("PaNdAs>=1.0,<2.0"), "pandas");
        assert_eq!(base_package_name("numpy==1.26.0"), "numpy");
        assert_eq!(base_package_name("scikit-learn~=1.4"), "scikit-learn");
        assert_eq!(base_package_name("  requests "), "requests");
    }
}
