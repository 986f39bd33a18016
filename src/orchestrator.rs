//! Orchestrator Façade (§4.6) and the artifact diff loop (§4.3).
//!
//! The four public operations — `execute`, `install_package`, `list_files`,
//! `shutdown` — are thin wrappers around a Session Scope. `execute` is the
//! only one that does real work beyond delegation: it audits the code
//! before running it and snapshots the session's working directory before
//! and after, turning any new files into [`ArtifactRef`]s.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::warn;

use crate::artifact::ArtifactProcessor;
use crate::audit::AuditSink;
use crate::backend::{ExecutionResult, Language};
use crate::error::{OrchestratorError, Result};
use crate::session::SessionManager;
use crate::user::UserContext;

/// Public surface of the Session Orchestrator. Cloneable — all clones
/// share the same underlying Session Manager.
#[derive(Clone)]
pub struct Orchestrator {
    sessions: Arc<SessionManager>,
    audit: Arc<dyn AuditSink>,
    artifacts: Arc<ArtifactProcessor>,
}

impl Orchestrator {
    pub fn new(sessions: Arc<SessionManager>, audit: Arc<dyn AuditSink>, artifacts: Arc<ArtifactProcessor>) -> Self {
        Self {
            sessions,
            audit,
            artifacts,
        }
    }

    /// Execute `code` under `language` in the session `session_id` owned by
    /// `owner`, creating the session on first use (§2 data flow).
    pub async fn execute(
        &self,
        session_id: &str,
        owner: &UserContext,
        language: &str,
        code: &str,
    ) -> Result<ExecutionResult> {
        let parsed_language = Language::parse(language)?;

        let audit = Arc::clone(&self.audit);
        let artifacts = Arc::clone(&self.artifacts);
        let code = code.to_string();
        let language_str = language.to_string();
        let owner_id = owner.id.clone();
        let session_id_owned = session_id.to_string();

        self.sessions
            .run_scoped(session_id, owner, move |driver| {
                let audit = Arc::clone(&audit);
                let artifacts = Arc::clone(&artifacts);
                let code = code.clone();
                let language_str = language_str.clone();
                let owner_id = owner_id.clone();
                let session_id = session_id_owned.clone();

                Box::pin(async move {
                    // Audit is a one-way side channel: never a gate on execution (§4.6, §7).
                    if let Err(err) = audit.log_pre_execution(&code, &language_str).await {
                        warn!(error = %err, "audit logging failed, proceeding with execution");
                    }

                    let before: HashSet<String> = list_files_best_effort(driver).await;

                    let mut result = driver.execute(&code, parsed_language).await?;

                    let after: HashSet<String> = list_files_best_effort(driver).await;
                    let already_reported: HashSet<String> =
                        result.artifacts.iter().map(|artifact| artifact.filename.clone()).collect();

                    let mut additions: Vec<String> = after
                        .difference(&before)
                        .filter(|name| !already_reported.contains(*name))
                        .cloned()
                        .collect();
                    additions.sort();

                    for filename in additions {
                        match collect_artifact(driver, &artifacts, &filename, &owner_id, &session_id).await {
                            Ok(artifact) => result.artifacts.push(artifact),
                            Err(err) => {
                                warn!(filename = %filename, error = %err, "failed to collect artifact, skipping");
                            }
                        }
                    }

                    Ok(result)
                })
            })
            .await
    }

    /// Install a package, already allowlist-checked by the driver (§4.1,
    /// §4.6). Returns a canned acknowledgement on success.
    pub async fn install_package(&self, session_id: &str, owner: &UserContext, package_spec: &str) -> Result<String> {
        let spec = package_spec.to_string();
        self.sessions
            .run_scoped(session_id, owner, move |driver| {
                let spec = spec.clone();
                Box::pin(async move { driver.install_package(&spec).await })
            })
            .await?;
        Ok(format!("Package {package_spec} installed successfully."))
    }

    /// List filenames directly under `path` (default `.`), verbatim from
    /// the driver (§4.6).
    pub async fn list_files(&self, session_id: &str, owner: &UserContext, path: &str) -> Result<Vec<String>> {
        let path = if path.is_empty() { ".".to_string() } else { path.to_string() };
        self.sessions
            .run_scoped(session_id, owner, move |driver| {
                let path = path.clone();
                Box::pin(async move { driver.list_files(&path).await })
            })
            .await
    }

    /// Terminate every session and stop the reaper (§4.4.3). Idempotent.
    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
    }
}

/// Non-recursive listing of the session's working directory, tolerating
/// failure by treating it as empty — a listing error shouldn't fail the
/// whole `execute` call, only blunt artifact detection for this round.
async fn list_files_best_effort(driver: &mut dyn crate::backend::IsolationBackend) -> HashSet<String> {
    match driver.list_files(".").await {
        Ok(files) => files.into_iter().collect(),
        Err(err) => {
            warn!(error = %err, "working directory listing failed, treating as empty");
            HashSet::new()
        }
    }
}

/// Download one newly-appeared file and hand it to the [`ArtifactProcessor`].
async fn collect_artifact(
    driver: &mut dyn crate::backend::IsolationBackend,
    artifacts: &ArtifactProcessor,
    filename: &str,
    owner_id: &str,
    session_id: &str,
) -> std::result::Result<crate::artifact::ArtifactRef, OrchestratorError> {
    let tmp = tempfile::Builder::new()
        .prefix("sandbox-artifact-")
        .tempdir()
        .map_err(|err| OrchestratorError::from_driver_error("provisioning artifact scratch dir", err.into()))?;
    let local_path = tmp.path().join(filename);

    driver.download(filename, &local_path).await?;

    artifacts
        .process_file(&local_path, filename, owner_id, session_id)
        .await
        .map_err(|err| OrchestratorError::from_driver_error("processing artifact", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::StdoutAuditSink;
    use crate::backend::mock::{MockDriverFactory, MockStats};
    use std::time::Duration;

    fn orchestrator() -> Orchestrator {
        let stats = Arc::new(MockStats::default());
        let mut allowed = HashSet::new();
        allowed.insert("pandas".to_string());
        let factory = Arc::new(MockDriverFactory::new(stats, Duration::from_millis(100), allowed));
        let sessions = SessionManager::new(factory, Duration::from_secs(300), Duration::from_secs(60));
        Orchestrator::new(
            sessions,
            Arc::new(StdoutAuditSink::new()),
            Arc::new(ArtifactProcessor::without_store()),
        )
    }

    #[tokio::test]
    async fn simple_execute_returns_result() {
        let orch = orchestrator();
        let owner = UserContext::new("u1");
        let result = orch.execute("s1", &owner, "python", "print('hello')").await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.artifacts.is_empty());
    }

    #[tokio::test]
    async fn cross_user_is_denied() {
        let orch = orchestrator();
        orch.execute("s1", &UserContext::new("u1"), "python", "print(1)").await.unwrap();
        let err = orch
            .execute("s1", &UserContext::new("u2"), "python", "print(1)")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::AccessDenied));
    }

    #[tokio::test]
    async fn unsupported_language_is_invalid_argument() {
        let orch = orchestrator();
        let err = orch
            .execute("s1", &UserContext::new("u1"), "ruby", "puts 1")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn new_file_is_surfaced_as_artifact() {
        let orch = orchestrator();
        let owner = UserContext::new("u1");
        let result = orch.execute("s1", &owner, "python", "WRITE notes.txt").await.unwrap();
        assert_eq!(result.artifacts.len(), 1);
        assert_eq!(result.artifacts[0].filename, "notes.txt");
        assert_eq!(result.artifacts[0].mime_type, "text/plain");
    }

    #[tokio::test]
    async fn timeout_then_recovery() {
        let orch = orchestrator();
        let owner = UserContext::new("u1");
        let err = orch.execute("s1", &owner, "python", "SLEEP 5").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout));

        let result = orch.execute("s1", &owner, "python", "print(2)").await.unwrap();
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn install_package_allowlisted_accepted_denied_rejected() {
        let orch = orchestrator();
        let owner = UserContext::new("u1");
        let ack = orch
            .install_package("s1", &owner, "PaNdAs>=1.0,<2.0")
            .await
            .unwrap();
        assert!(ack.contains("installed successfully"));

        let err = orch.install_package("s1", &owner, "requests").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::PackageNotAllowed(_)));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_through_facade() {
        let orch = orchestrator();
        orch.execute("s1", &UserContext::new("u1"), "python", "print(1)").await.unwrap();
        orch.shutdown().await;
        orch.shutdown().await;
    }
}
