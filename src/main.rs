//! sandbox-orchestrator daemon
//!
//! Loads the orchestrator configuration, constructs a Session Manager
//! bound to the configured Backend Driver, and serves the Orchestrator
//! Façade over MCP on stdio.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sandbox_orchestrator::artifact::{ArtifactProcessor, S3ArtifactStore};
use sandbox_orchestrator::audit::{AuditSink, NoopAuditSink, StdoutAuditSink};
use sandbox_orchestrator::backend::process::ProcessDriverFactory;
use sandbox_orchestrator::backend::DriverFactory;
use sandbox_orchestrator::config::{OrchestratorConfig, RuntimeKind};
use sandbox_orchestrator::mcp;
use sandbox_orchestrator::orchestrator::Orchestrator;
use sandbox_orchestrator::session::SessionManager;

#[derive(Parser, Debug)]
#[command(name = "sandbox-orchestrator-daemon")]
#[command(about = "MCP server fronting a multi-tenant code-execution sandbox orchestrator")]
struct Args {
    /// Run in stdio mode (for MCP clients)
    #[arg(long)]
    stdio: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for MCP protocol)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = OrchestratorConfig::from_env().context("failed to load configuration")?;

    info!(
        runtime_kind = ?config.runtime_kind,
        allowed_packages = ?config.allowed_packages,
        "loaded configuration"
    );

    let driver_factory = build_driver_factory(&config)?;

    let sessions = SessionManager::new(driver_factory, config.idle_timeout(), config.reaper_interval());

    let artifact_processor = match &config.object_store {
        Some(store_config) => {
            info!(bucket = %store_config.bucket, "artifact store configured");
            ArtifactProcessor::new(Some(Arc::new(S3ArtifactStore::from_config(store_config).await)))
        }
        None => {
            info!("no artifact store configured; non-image artifacts will have no url");
            ArtifactProcessor::without_store()
        }
    };

    let audit: Arc<dyn AuditSink> = if config.enable_audit_logging {
        Arc::new(StdoutAuditSink::new())
    } else {
        info!("audit logging disabled by configuration");
        Arc::new(NoopAuditSink::new())
    };
    let orchestrator = Orchestrator::new(sessions, audit, Arc::new(artifact_processor));

    if args.stdio {
        mcp::serve_stdio(orchestrator).await?;
    } else {
        anyhow::bail!("only --stdio mode is currently supported");
    }

    Ok(())
}

/// Construct the Backend Driver factory for `config.runtime_kind`. Only the
/// container-flavored process driver is implemented in this crate (§4.1);
/// `microvm` is a valid configuration value whose driver is out of scope
/// here, so it fails fast with a clear message rather than silently
/// falling back to the process driver.
fn build_driver_factory(config: &OrchestratorConfig) -> Result<Arc<dyn DriverFactory>> {
    match config.runtime_kind {
        RuntimeKind::Container => Ok(Arc::new(ProcessDriverFactory::new(
            config.execution_timeout(),
            config.allowed_packages.clone(),
        ))),
        RuntimeKind::MicroVm => {
            anyhow::bail!(
                "runtime_kind \"microvm\" has no driver in this build; configure \"container\" \
                 or supply a custom DriverFactory when embedding this crate"
            )
        }
    }
}
