//! MCP server implementation using rmcp.
//!
//! Exposes the Orchestrator Façade's `execute`, `install_package`, and
//! `list_files` operations as MCP tools (the RPC surface, §1 out-of-scope
//! for the core but carried here as the ambient outer layer). `shutdown` is deliberately
//! not a tool: it is a process-lifecycle hook the embedder calls directly
//! (see `main.rs`), not something an MCP client should be able to trigger.

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{error, info};

use crate::orchestrator::Orchestrator;
use crate::user::UserContext;

/// MCP server exposing one [`Orchestrator`] over stdio. Stateless itself —
/// all session state lives behind the Façade, so cloning a `SandboxServer`
/// is cheap and every clone shares the same sessions.
#[derive(Clone)]
pub struct SandboxServer {
    orchestrator: Orchestrator,
    tool_router: ToolRouter<Self>,
}

/// Parameters for the `execute` tool. `session_id` is reused across calls
/// to keep state (installed packages, written files) alive between them;
/// `owner_id` scopes that session to one caller.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteParams {
    #[schemars(description = "Session to run in; reuse the same id to persist state across calls")]
    pub session_id: String,

    #[schemars(description = "Caller id the session is scoped to")]
    pub owner_id: String,

    #[schemars(description = "Source language: python, bash, or r")]
    pub language: String,

    #[schemars(description = "Code to execute")]
    pub code: String,
}

/// Parameters for the `install_package` tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct InstallPackageParams {
    #[schemars(description = "Session to install into")]
    pub session_id: String,

    #[schemars(description = "Caller id the session is scoped to")]
    pub owner_id: String,

    #[schemars(description = "Package requirement specifier, e.g. 'pandas>=2.0'")]
    pub package_spec: String,
}

/// Parameters for the `list_files` tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListFilesParams {
    #[schemars(description = "Session whose working directory to list")]
    pub session_id: String,

    #[schemars(description = "Caller id the session is scoped to")]
    pub owner_id: String,

    #[schemars(description = "Directory to list, defaults to '.'")]
    #[serde(default)]
    pub path: String,
}

#[tool_router]
impl SandboxServer {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(description = "Execute code in a persistent sandbox session")]
    async fn execute(
        &self,
        Parameters(params): Parameters<ExecuteParams>,
    ) -> Result<CallToolResult, McpError> {
        let owner = UserContext::new(params.owner_id);

        info!(
            session_id = %params.session_id,
            language = %params.language,
            code_len = params.code.len(),
            "executing code"
        );

        match self
            .orchestrator
            .execute(&params.session_id, &owner, &params.language, &params.code)
            .await
        {
            Ok(result) => {
                let is_error = result.exit_code != 0;
                let output = if result.stderr.is_empty() {
                    result.stdout
                } else if result.stdout.is_empty() {
                    result.stderr
                } else {
                    format!("{}\n--- stderr ---\n{}", result.stdout, result.stderr)
                };

                let mut contents = vec![Content::text(output)];
                for artifact in &result.artifacts {
                    contents.push(Content::text(format!(
                        "artifact: {} ({}){}",
                        artifact.filename,
                        artifact.mime_type,
                        artifact
                            .url
                            .as_ref()
                            .map(|url| format!(" -> {url}"))
                            .unwrap_or_default()
                    )));
                }

                if is_error {
                    Ok(CallToolResult::error(contents))
                } else {
                    Ok(CallToolResult::success(contents))
                }
            }
            Err(err) => {
                error!(error = %err, "execute failed");
                Ok(CallToolResult::error(vec![Content::text(format!(
                    "execution error: {err}"
                ))]))
            }
        }
    }

    #[tool(description = "Install a package (subject to the configured allowlist) into a sandbox session")]
    async fn install_package(
        &self,
        Parameters(params): Parameters<InstallPackageParams>,
    ) -> Result<CallToolResult, McpError> {
        let owner = UserContext::new(params.owner_id);

        match self
            .orchestrator
            .install_package(&params.session_id, &owner, &params.package_spec)
            .await
        {
            Ok(ack) => Ok(CallToolResult::success(vec![Content::text(ack)])),
            Err(err) => {
                error!(error = %err, "install_package failed");
                Ok(CallToolResult::error(vec![Content::text(format!(
                    "install error: {err}"
                ))]))
            }
        }
    }

    #[tool(description = "List files in a sandbox session's working directory")]
    async fn list_files(
        &self,
        Parameters(params): Parameters<ListFilesParams>,
    ) -> Result<CallToolResult, McpError> {
        let owner = UserContext::new(params.owner_id);

        match self
            .orchestrator
            .list_files(&params.session_id, &owner, &params.path)
            .await
        {
            Ok(files) => Ok(CallToolResult::success(vec![Content::text(files.join("\n"))])),
            Err(err) => {
                error!(error = %err, "list_files failed");
                Ok(CallToolResult::error(vec![Content::text(format!(
                    "listing error: {err}"
                ))]))
            }
        }
    }
}

#[tool_handler]
impl ServerHandler for SandboxServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "sandbox-orchestrator".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Execute code in isolated, stateful sandbox sessions.\n\
                 \n\
                 Use 'execute' with session_id, owner_id, language (python/bash/r), and code.\n\
                 Reuse the same session_id across calls to keep files and installed packages.\n\
                 Use 'install_package' and 'list_files' against the same session_id/owner_id."
                    .to_string(),
            ),
        }
    }
}

/// Serve the sandbox server over stdio until the client disconnects, then
/// shut the orchestrator down (§4.4.3).
pub async fn serve_stdio(orchestrator: Orchestrator) -> anyhow::Result<()> {
    let server = SandboxServer::new(orchestrator.clone());

    info!("starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|err| anyhow::anyhow!("failed to start MCP server: {err}"))?;

    let result = service.waiting().await;

    orchestrator.shutdown().await;

    result.map_err(|err| anyhow::anyhow!("MCP server error: {err}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactProcessor;
    use crate::audit::StdoutAuditSink;
    use crate::backend::mock::{MockDriverFactory, MockStats};
    use crate::session::SessionManager;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    fn server() -> SandboxServer {
        let stats = Arc::new(MockStats::default());
        let factory = Arc::new(MockDriverFactory::new(stats, Duration::from_secs(1), HashSet::new()));
        let sessions = SessionManager::new(factory, Duration::from_secs(300), Duration::from_secs(60));
        let orchestrator = Orchestrator::new(
            sessions,
            Arc::new(StdoutAuditSink::new()),
            Arc::new(ArtifactProcessor::without_store()),
        );
        SandboxServer::new(orchestrator)
    }

    #[tokio::test]
    async fn execute_tool_returns_success_for_zero_exit() {
        let server = server();
        let params = Parameters(ExecuteParams {
            session_id: "s1".to_string(),
            owner_id: "u1".to_string(),
            language: "python".to_string(),
            code: "print(1)".to_string(),
        });

        let result = server.execute(params).await.unwrap();
        assert!(!result.is_error.unwrap_or(false));
    }

    #[tokio::test]
    async fn execute_tool_surfaces_errors_without_failing_the_call() {
        let server = server();
        let params = Parameters(ExecuteParams {
            session_id: "s1".to_string(),
            owner_id: "u1".to_string(),
            language: "cobol".to_string(),
            code: "print 1".to_string(),
        });

        let result = server.execute(params).await.unwrap();
        assert!(result.is_error.unwrap_or(false));
    }

    #[tokio::test]
    async fn install_package_tool_rejects_non_allowlisted() {
        let server = server();
        let params = Parameters(InstallPackageParams {
            session_id: "s1".to_string(),
            owner_id: "u1".to_string(),
            package_spec: "requests".to_string(),
        });

        let result = server.install_package(params).await.unwrap();
        assert!(result.is_error.unwrap_or(false));
    }
}
