//! Transport abstraction. The state machine and [`Session`](crate::session::Session)
//! only see this trait, so HTTP and SSE are interchangeable at every call site.

use {async_trait::async_trait, tokio_util::sync::CancellationToken};

use crate::{
    error::TransportResult,
    transport::TransportKind,
    types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse},
};

/// One open channel to one MCP server URL.
#[async_trait]
pub trait McpTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Send a request and wait for the response carrying the same id.
    async fn send(&self, request: JsonRpcRequest) -> TransportResult<JsonRpcResponse>;

    /// Send a notification (no response expected).
    async fn notify(&self, notification: JsonRpcNotification) -> TransportResult<()>;

    /// Cancelled when the connection is lost after it was opened. Never
    /// cancelled by [`close`](Self::close).
    fn dropped(&self) -> CancellationToken;

    /// Release the connection. Idempotent.
    async fn close(&self);
}
