//! MCP client connection manager.
//!
//! This crate provides:
//! - Streamable HTTP and legacy SSE transports (`http_transport`, `sse_transport`)
//! - A JSON-RPC session with the `initialize` handshake (`session`)
//! - Capability discovery of tools, resources, templates and prompts (`discovery`)
//! - The connection state machine with OAuth, fallback and retry (`manager`)
//! - The `use_mcp` entry point consumed by UI code (`hook`)

pub mod auth;
pub mod capability;
pub mod config;
pub mod discovery;
pub mod error;
pub mod event_stream;
pub mod hook;
pub mod http_transport;
pub mod manager;
pub mod session;
pub mod sse_transport;
pub mod state;
pub mod traits;
pub mod transport;
pub mod types;

pub use {
    auth::McpOAuthProvider,
    capability::{Capabilities, Prompt, Resource, ResourceTemplate, Tool},
    config::{McpConfig, RetryPolicy, TransportMode},
    error::{Error, ErrorKind, Result, TransportError},
    hook::{UseMcp, use_mcp, use_mcp_with},
    manager::{McpManager, McpManagerBuilder},
    session::Session,
    state::{ConnectionState, LogEntry, LogLevel, McpSnapshot, StateKind},
    traits::McpTransport,
    transport::{TransportKind, TransportOptions},
};
