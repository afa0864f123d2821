//! Streamable HTTP transport for remote MCP servers.
//!
//! Every message is one POST. The server answers with either a single JSON
//! body or a `text/event-stream` that eventually carries the response; both
//! are handled here. The session id the server issues is echoed on every
//! later request and `close` ends the session with a DELETE. Stateless
//! servers never issue one; for those, losing the server after the first
//! answered request still counts as a dropped connection.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use {
    futures::StreamExt,
    reqwest::Response,
    tokio::sync::RwLock,
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
    url::Url,
};

use crate::{
    error::{TransportError, TransportResult},
    event_stream::EventStreamParser,
    traits::McpTransport,
    transport::{
        MCP_SESSION_ID_HEADER, STREAMABLE_ACCEPT_HEADER, TransportKind, TransportOptions,
        error_for_status, is_event_stream,
    },
    types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse},
};

pub struct HttpTransport {
    url: Url,
    options: TransportOptions,
    /// Session identifier issued by the server.
    session_id: RwLock<Option<String>>,
    /// Set once the server has answered a request successfully.
    established: AtomicBool,
    dropped: CancellationToken,
}

impl HttpTransport {
    #[must_use]
    pub fn new(url: &Url, options: TransportOptions) -> Arc<Self> {
        Arc::new(Self {
            url: url.clone(),
            options,
            session_id: RwLock::new(None),
            established: AtomicBool::new(false),
            dropped: CancellationToken::new(),
        })
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    async fn post<T: serde::Serialize + Sync>(&self, body: &T) -> TransportResult<Response> {
        if self.dropped.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let session_id = self.session_id.read().await.clone();
        let mut req = self
            .options
            .client
            .post(self.url.as_str())
            .timeout(self.options.request_timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, STREAMABLE_ACCEPT_HEADER);
        if let Some(session_id) = &session_id {
            req = req.header(MCP_SESSION_ID_HEADER, session_id);
        }
        req = self.options.apply(req);

        let resp = req.json(body).send().await.map_err(|e| {
            let err = TransportError::from_reqwest(e, self.options.request_timeout);
            let was_connected = session_id.is_some() || self.established.load(Ordering::Acquire);
            if was_connected && matches!(err, TransportError::Network(_)) {
                warn!(url = %self.url, error = %err, "MCP server unreachable, session lost");
                self.dropped.cancel();
            }
            err
        })?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND && session_id.is_some() {
            warn!(url = %self.url, "MCP server no longer knows our session");
            self.dropped.cancel();
        }

        self.store_session_id_from_response(&resp).await;
        let resp = error_for_status(resp).await?;
        self.established.store(true, Ordering::Release);
        Ok(resp)
    }

    async fn store_session_id_from_response(&self, response: &Response) {
        let Some(session_id) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|raw| raw.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
        else {
            return;
        };

        let mut slot = self.session_id.write().await;
        if slot.as_deref() != Some(session_id) {
            debug!(url = %self.url, session_id, "updated MCP streamable HTTP session id");
            *slot = Some(session_id.to_string());
        }
    }

    /// Read an event-stream body until the response with `id` arrives.
    async fn read_event_stream(
        &self,
        resp: Response,
        id: &serde_json::Value,
        method: &str,
    ) -> TransportResult<JsonRpcResponse> {
        let mut parser = EventStreamParser::new();
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| TransportError::from_reqwest(e, self.options.request_timeout))?;
            for event in parser.push(&chunk) {
                if let Some(found) = match_response(&event.data, id) {
                    return Ok(found);
                }
            }
        }
        if let Some(event) = parser.finish()
            && let Some(found) = match_response(&event.data, id)
        {
            return Ok(found);
        }

        Err(TransportError::Stream(format!(
            "event stream for '{method}' ended without a response"
        )))
    }
}

fn match_response(data: &str, id: &serde_json::Value) -> Option<JsonRpcResponse> {
    match JsonRpcResponse::parse(data) {
        Some(resp) if resp.id == *id => Some(resp),
        Some(resp) => {
            debug!(id = %resp.id, "skipping response for another request");
            None
        },
        None => {
            debug!("skipping server-initiated message on response stream");
            None
        },
    }
}

#[async_trait::async_trait]
impl McpTransport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn send(&self, request: JsonRpcRequest) -> TransportResult<JsonRpcResponse> {
        debug!(method = %request.method, id = %request.id, url = %self.url, "HTTP client -> server");

        let resp = self.post(&request).await?;

        if is_event_stream(&resp) {
            return self
                .read_event_stream(resp, &request.id, &request.method)
                .await;
        }

        let body = resp
            .text()
            .await
            .map_err(|e| TransportError::from_reqwest(e, self.options.request_timeout))?;
        if body.trim().is_empty() {
            return Err(TransportError::Stream(format!(
                "empty response body for '{}'",
                request.method
            )));
        }
        JsonRpcResponse::parse(&body)
            .filter(|resp| resp.id == request.id)
            .ok_or_else(|| {
                TransportError::Stream(format!(
                    "response to '{}' was not a matching JSON-RPC response",
                    request.method
                ))
            })
    }

    async fn notify(&self, notification: JsonRpcNotification) -> TransportResult<()> {
        debug!(method = %notification.method, url = %self.url, "HTTP client -> server (notification)");
        self.post(&notification).await?;
        Ok(())
    }

    fn dropped(&self) -> CancellationToken {
        self.dropped.clone()
    }

    async fn close(&self) {
        let Some(session_id) = self.session_id.write().await.take() else {
            return;
        };

        let req = self
            .options
            .client
            .delete(self.url.as_str())
            .timeout(std::time::Duration::from_secs(5))
            .header(MCP_SESSION_ID_HEADER, session_id);

        if let Err(e) = self.options.apply(req).send().await {
            warn!(url = %self.url, error = %e, "failed to close MCP streamable HTTP session");
        }
    }
}
