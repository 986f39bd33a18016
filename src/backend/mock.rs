//! Deterministic in-memory Backend Driver used by tests (§4.1, §8).
//!
//! Grounded in the teacher's `mcp.rs` `MockBackend` test fixture, extended
//! to simulate the things the Session Manager/Scope/reaper need to exercise
//! without a real subprocess or container: a timeout that the driver itself
//! enforces and recovers from, a crash, and a toy filesystem for artifact
//! diffing.
//!
//! Code bodies are tiny directives rather than real source, since this
//! driver never actually interprets anything:
//! - `"CRASH"` → `BackendCrashed`
//! - `"SLEEP <seconds>"` → sleeps, bounded by `execution_timeout`
//! - `"WRITE <filename>"` → adds `filename` to the working directory listing

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use super::{base_package_name, DriverFactory, ExecutionResult, IsolationBackend, Language};
use crate::error::{OrchestratorError, Result};

/// Shared lifecycle counters so tests can assert invariants like "`start`
/// called exactly once, `terminate` at most once" across however many
/// driver instances a factory hands out.
#[derive(Default)]
pub struct MockStats {
    pub starts: AtomicUsize,
    pub terminates: AtomicUsize,
    pub executes: AtomicUsize,
}

pub struct MockBackend {
    stats: Arc<MockStats>,
    execution_timeout: Duration,
    allowed_packages: HashSet<String>,
    files: AsyncMutex<BTreeSet<String>>,
    started: AtomicBool,
}

#[async_trait]
impl IsolationBackend for MockBackend {
    async fn start(&mut self) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        self.stats.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&mut self, code: &str, language: Language) -> Result<ExecutionResult> {
        self.stats.executes.fetch_add(1, Ordering::SeqCst);

        if code == "CRASH" {
            return Err(OrchestratorError::BackendCrashed("simulated crash".to_string()));
        }

        if let Some(rest) = code.strip_prefix("SLEEP ") {
            let secs: f64 = rest.trim().parse().unwrap_or(0.0);
            let sleep = tokio::time::sleep(Duration::from_secs_f64(secs));
            if tokio::time::timeout(self.execution_timeout, sleep).await.is_err() {
                return Err(OrchestratorError::Timeout);
            }
        }

        if let Some(rest) = code.strip_prefix("WRITE ") {
            self.files.lock().await.insert(rest.trim().to_string());
        }

        Ok(ExecutionResult {
            stdout: format!("executed[{language:?}]: {code}"),
            stderr: String::new(),
            exit_code: 0,
            artifacts: Vec::new(),
            duration_seconds: 0.0,
        })
    }

    async fn upload(&mut self, _local_path: &Path, remote_path: &str) -> Result<()> {
        self.files.lock().await.insert(remote_path.to_string());
        Ok(())
    }

    async fn download(&mut self, remote_path: &str, local_path: &Path) -> Result<()> {
        if !self.files.lock().await.contains(remote_path) {
            return Err(OrchestratorError::NotFound(remote_path.to_string()));
        }
        tokio::fs::write(local_path, b"mock artifact contents")
            .await
            .map_err(|err| OrchestratorError::BackendCrashed(err.to_string()))
    }

    async fn list_files(&mut self, _path: &str) -> Result<Vec<String>> {
        Ok(self.files.lock().await.iter().cloned().collect())
    }

    async fn install_package(&mut self, package_spec: &str) -> Result<()> {
        let base = base_package_name(package_spec);
        if !self.allowed_packages.contains(&base) {
            return Err(OrchestratorError::PackageNotAllowed(base));
        }
        Ok(())
    }

    async fn terminate(&mut self) {
        self.stats.terminates.fetch_add(1, Ordering::SeqCst);
    }
}

/// Constructs [`MockBackend`]s that share one [`MockStats`] handle.
pub struct MockDriverFactory {
    stats: Arc<MockStats>,
    execution_timeout: Duration,
    allowed_packages: HashSet<String>,
    fail_start: AtomicBool,
}

impl MockDriverFactory {
    pub fn new(stats: Arc<MockStats>, execution_timeout: Duration, allowed_packages: HashSet<String>) -> Self {
        Self {
            stats,
            execution_timeout,
            allowed_packages,
            fail_start: AtomicBool::new(false),
        }
    }

    /// Makes every subsequently-created driver fail `start()`, to exercise
    /// the `BackendUnavailable` path (§4.4.1 step 5).
    pub fn fail_next_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }
}

impl DriverFactory for MockDriverFactory {
    fn create(&self) -> Box<dyn IsolationBackend> {
        Box::new(FallibleStartBackend {
            inner: MockBackend {
                stats: Arc::clone(&self.stats),
                execution_timeout: self.execution_timeout,
                allowed_packages: self.allowed_packages.clone(),
                files: AsyncMutex::new(BTreeSet::new()),
                started: AtomicBool::new(false),
            },
            should_fail: self.fail_start.swap(false, Ordering::SeqCst),
        })
    }
}

/// Wraps a [`MockBackend`] so a single `start()` call can be made to fail,
/// without threading that flag through every other method.
struct FallibleStartBackend {
    inner: MockBackend,
    should_fail: bool,
}

#[async_trait]
impl IsolationBackend for FallibleStartBackend {
    async fn start(&mut self) -> Result<()> {
        if self.should_fail {
            return Err(OrchestratorError::BackendUnavailable(
                "simulated start failure".to_string(),
            ));
        }
        self.inner.start().await
    }

    async fn execute(&mut self, code: &str, language: Language) -> Result<ExecutionResult> {
        self.inner.execute(code, language).await
    }

    async fn upload(&mut self, local_path: &Path, remote_path: &str) -> Result<()> {
        self.inner.upload(local_path, remote_path).await
    }

    async fn download(&mut self, remote_path: &str, local_path: &Path) -> Result<()> {
        self.inner.download(remote_path, local_path).await
    }

    async fn list_files(&mut self, path: &str) -> Result<Vec<String>> {
        self.inner.list_files(path).await
    }

    async fn install_package(&mut self, package_spec: &str) -> Result<()> {
        self.inner.install_package(package_spec).await
    }

    async fn terminate(&mut self) {
        self.inner.terminate().await;
    }
}
