//! sandbox-orchestrator daemon library
//!
//! This crate provides the core functionality for the sandbox orchestrator
//! daemon:
//! - Configuration parsing (§6)
//! - MCP server implementation using rmcp (outer RPC surface, ambient)
//! - Backend Driver trait and implementations for sandboxed execution (§4.1)
//! - Session object, Session Manager, and Session Scope (§4.4, §4.5)
//! - Artifact processing and the Orchestrator Façade (§4.2, §4.3, §4.6)

pub mod artifact;
pub mod audit;
pub mod backend;
pub mod config;
pub mod error;
pub mod mcp;
pub mod orchestrator;
pub mod session;
pub mod user;
