//! One live, transport-bound connection: JSON-RPC request ids, the
//! `initialize` handshake and the typed calls capability entries make.

use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicU64, Ordering},
};

use {
    serde::de::DeserializeOwned,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info},
};

use crate::{
    error::{Context, Error, Result},
    traits::McpTransport,
    transport::TransportKind,
    types::{
        ClientCapabilities, ClientInfo, InitializeParams, InitializeResult, JsonRpcNotification,
        JsonRpcRequest, PROTOCOL_VERSION, PromptGetResult, ResourceReadResult, ToolsCallParams,
        ToolsCallResult,
    },
};

pub struct Session {
    generation: u64,
    transport: Arc<dyn McpTransport>,
    next_id: AtomicU64,
    server: OnceLock<InitializeResult>,
}

impl Session {
    pub fn new(generation: u64, transport: Arc<dyn McpTransport>) -> Self {
        Self {
            generation,
            transport,
            next_id: AtomicU64::new(1),
            server: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Result of the `initialize` handshake, once it completed.
    #[must_use]
    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.server.get()
    }

    #[must_use]
    pub fn dropped(&self) -> CancellationToken {
        self.transport.dropped()
    }

    /// Send a request and return its `result`. A JSON-RPC error object is
    /// [`Error::Rpc`].
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let resp = self
            .transport
            .send(JsonRpcRequest::new(id, method, params))
            .await?;

        if let Some(err) = resp.error {
            debug!(method, code = err.code, message = %err.message, "JSON-RPC error");
            return Err(Error::Rpc {
                method: method.to_string(),
                code: err.code,
                message: err.message,
            });
        }
        Ok(resp.result.unwrap_or(serde_json::Value::Null))
    }

    pub async fn request_typed<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<T> {
        let value = self.request(method, params).await?;
        serde_json::from_value(value).with_context(|| format!("malformed '{method}' result"))
    }

    pub async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        self.transport
            .notify(JsonRpcNotification::new(method, params))
            .await?;
        Ok(())
    }

    /// Run the `initialize` handshake.
    pub async fn initialize(&self, client_info: ClientInfo) -> Result<&InitializeResult> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: ClientCapabilities::default(),
            client_info,
        };
        let result: InitializeResult = self
            .request_typed("initialize", Some(serde_json::to_value(&params)?))
            .await?;

        info!(
            transport = %self.kind(),
            protocol = %result.protocol_version,
            server_name = %result.server_info.name,
            "MCP server initialized"
        );

        Ok(self.server.get_or_init(|| result))
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolsCallResult> {
        let params = ToolsCallParams {
            name: name.into(),
            arguments,
        };
        self.request_typed("tools/call", Some(serde_json::to_value(&params)?))
            .await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ResourceReadResult> {
        self.request_typed("resources/read", Some(serde_json::json!({ "uri": uri })))
            .await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<PromptGetResult> {
        let mut params = serde_json::json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = serde_json::Value::Object(arguments);
        }
        self.request_typed("prompts/get", Some(params)).await
    }

    pub async fn close(&self) {
        debug!(generation = self.generation, transport = %self.kind(), "closing session");
        self.transport.close().await;
    }
}
