//! Subprocess-based Backend Driver.
//!
//! Grounded in the teacher's `backend/jail.rs` (spawn, pipe stdin, wait
//! with a timeout) and in `original_source`'s `runtimes/docker.py`, whose
//! `DockerRuntime.execute` restarts the container on timeout rather than
//! tearing the whole session down: the working directory survives, only
//! the runaway process doesn't. This driver reproduces that externally
//! visible behavior without needing a container runtime: each Session
//! gets one scoped temporary directory that persists for its lifetime,
//! and each `execute` call spawns a fresh interpreter subprocess rooted
//! there. A timeout kills that subprocess; the next `execute` spawns a
//! new one, satisfying the self-healing invariant in §8.
//!
//! Stands in for the real container driver, which is out of scope (§1).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::{base_package_name, DriverFactory, ExecutionResult, IsolationBackend, Language};
use crate::error::{OrchestratorError, Result};

/// Runs each `execute` as a one-shot subprocess in a working directory that
/// outlives any single call.
pub struct ProcessBackend {
    workdir: Option<TempDir>,
    execution_timeout: Duration,
    allowed_packages: HashSet<String>,
}

impl ProcessBackend {
    pub fn new(execution_timeout: Duration, allowed_packages: HashSet<String>) -> Self {
        Self {
            workdir: None,
            execution_timeout,
            allowed_packages,
        }
    }

    fn workdir_path(&self) -> Result<&Path> {
        self.workdir
            .as_ref()
            .map(TempDir::path)
            .ok_or_else(|| OrchestratorError::BackendCrashed("driver not started".to_string()))
    }

    fn resolve(&self, remote_path: &str) -> Result<PathBuf> {
        Ok(self.workdir_path()?.join(remote_path))
    }

    /// Run a subprocess to completion or until `execution_timeout` elapses.
    /// On timeout, forcibly kills it — the spec requires the driver
    /// reclaim the offending process, not just stop waiting on it.
    async fn run_with_timeout(&self, mut cmd: Command) -> Result<(String, String, i32)> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| OrchestratorError::BackendCrashed(format!("failed to spawn: {err}")))?;

        let mut stdout_pipe = child.stdout.take().expect("stdout piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr piped");

        let collect = async {
            let mut stdout_buf = Vec::new();
            let mut stderr_buf = Vec::new();
            let (stdout_res, stderr_res) = tokio::join!(
                stdout_pipe.read_to_end(&mut stdout_buf),
                stderr_pipe.read_to_end(&mut stderr_buf),
            );
            stdout_res.map_err(|err| OrchestratorError::BackendCrashed(err.to_string()))?;
            stderr_res.map_err(|err| OrchestratorError::BackendCrashed(err.to_string()))?;
            let status = child
                .wait()
                .await
                .map_err(|err| OrchestratorError::BackendCrashed(err.to_string()))?;
            Ok::<_, OrchestratorError>((stdout_buf, stderr_buf, status, child))
        };

        match tokio::time::timeout(self.execution_timeout, collect).await {
            Ok(Ok((stdout_buf, stderr_buf, status, _child))) => {
                let exit_code = status.code().unwrap_or(-1);
                Ok((
                    String::from_utf8_lossy(&stdout_buf).into_owned(),
                    String::from_utf8_lossy(&stderr_buf).into_owned(),
                    exit_code,
                ))
            }
            Ok(Err(err)) => Err(err),
            Err(_elapsed) => {
                warn!("execution exceeded timeout, killing subprocess");
                Err(OrchestratorError::Timeout)
            }
        }
    }
}

#[async_trait]
impl IsolationBackend for ProcessBackend {
    async fn start(&mut self) -> Result<()> {
        let dir = tempfile::Builder::new()
            .prefix("sandbox-session-")
            .tempdir()
            .map_err(|err| OrchestratorError::BackendUnavailable(err.to_string()))?;
        debug!(workdir = %dir.path().display(), "process driver provisioned");
        self.workdir = Some(dir);
        Ok(())
    }

    #[instrument(skip(self, code), fields(language = ?language))]
    async fn execute(&mut self, code: &str, language: Language) -> Result<ExecutionResult> {
        let workdir = self.workdir_path()?.to_path_buf();

        let (program, args): (&str, Vec<&str>) = match language {
            Language::Python => ("python3", vec!["-c", code]),
            Language::Bash => ("bash", vec!["-c", code]),
            Language::R => ("Rscript", vec!["-e", code]),
        };

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&workdir);

        let start = Instant::now();
        let (stdout, stderr, exit_code) = self.run_with_timeout(cmd).await?;

        Ok(ExecutionResult {
            stdout,
            stderr,
            exit_code,
            artifacts: Vec::new(),
            duration_seconds: start.elapsed().as_secs_f64(),
        })
    }

    async fn upload(&mut self, local_path: &Path, remote_path: &str) -> Result<()> {
        let dest = self.resolve(remote_path)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| OrchestratorError::BackendCrashed(err.to_string()))?;
        }
        tokio::fs::copy(local_path, &dest).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                OrchestratorError::NotFound(local_path.display().to_string())
            } else {
                OrchestratorError::BackendCrashed(err.to_string())
            }
        })?;
        Ok(())
    }

    async fn download(&mut self, remote_path: &str, local_path: &Path) -> Result<()> {
        let src = self.resolve(remote_path)?;
        tokio::fs::copy(&src, local_path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                OrchestratorError::NotFound(remote_path.to_string())
            } else {
                OrchestratorError::BackendCrashed(err.to_string())
            }
        })?;
        Ok(())
    }

    async fn list_files(&mut self, path: &str) -> Result<Vec<String>> {
        let dir = if path == "." || path.is_empty() {
            self.workdir_path()?.to_path_buf()
        } else {
            self.resolve(path)?
        };

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(OrchestratorError::BackendCrashed(err.to_string())),
        };

        let mut names = Vec::new();
        loop {
            let next = entries
                .next_entry()
                .await
                .map_err(|err| OrchestratorError::BackendCrashed(err.to_string()))?;
            let Some(entry) = next else { break };
            let file_type = entry
                .file_type()
                .await
                .map_err(|err| OrchestratorError::BackendCrashed(err.to_string()))?;
            if file_type.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    async fn install_package(&mut self, package_spec: &str) -> Result<()> {
        let base = base_package_name(package_spec);
        if !self.allowed_packages.contains(&base) {
            return Err(OrchestratorError::PackageNotAllowed(base));
        }

        let workdir = self.workdir_path()?.to_path_buf();
        let mut cmd = Command::new("python3");
        cmd.args(["-m", "pip", "install", "--quiet", package_spec])
            .current_dir(&workdir);

        let (_, stderr, exit_code) = self.run_with_timeout(cmd).await?;
        if exit_code != 0 {
            return Err(OrchestratorError::InstallFailed(stderr));
        }
        Ok(())
    }

    async fn terminate(&mut self) {
        if self.workdir.take().is_some() {
            debug!("process driver working directory reclaimed");
        }
    }
}

/// Constructs a fresh [`ProcessBackend`] for each new Session.
pub struct ProcessDriverFactory {
    execution_timeout: Duration,
    allowed_packages: HashSet<String>,
}

impl ProcessDriverFactory {
    pub fn new(execution_timeout: Duration, allowed_packages: HashSet<String>) -> Self {
        Self {
            execution_timeout,
            allowed_packages,
        }
    }
}

impl DriverFactory for ProcessDriverFactory {
    fn create(&self) -> Box<dyn IsolationBackend> {
        Box::new(ProcessBackend::new(self.execution_timeout, self.allowed_packages.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn executes_python_and_captures_stdout() {
        let mut backend = ProcessBackend::new(Duration::from_secs(5), HashSet::new());
        backend.start().await.unwrap();
        let result = backend.execute("print('hello')", Language::Python).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn timeout_kills_process_and_next_call_recovers() {
        let mut backend = ProcessBackend::new(Duration::from_millis(100), HashSet::new());
        backend.start().await.unwrap();

        let err = backend
            .execute("import time; time.sleep(5)", Language::Python)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout));

        let result = backend.execute("print(1 + 1)", Language::Python).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains('2'));
    }

    #[tokio::test]
    async fn upload_then_list_files_then_download_round_trips() {
        let mut backend = ProcessBackend::new(Duration::from_secs(5), HashSet::new());
        backend.start().await.unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let local = tmp.path().join("input.txt");
        tokio::fs::write(&local, b"payload").await.unwrap();

        backend.upload(&local, "input.txt").await.unwrap();
        let files = backend.list_files(".").await.unwrap();
        assert!(files.contains(&"input.txt".to_string()));

        let out = tmp.path().join("roundtrip.txt");
        backend.download("input.txt", &out).await.unwrap();
        assert_eq!(tokio::fs::read(&out).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn install_package_rejects_non_allowlisted() {
        let mut backend = ProcessBackend::new(Duration::from_secs(5), HashSet::new());
        backend.start().await.unwrap();
        let err = backend.install_package("requests").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::PackageNotAllowed(_)));
    }
}
