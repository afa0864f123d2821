//! Legacy HTTP+SSE transport.
//!
//! A long-lived GET receives server messages as events. The first `endpoint`
//! event names the URL that client messages are POSTed to; responses then
//! come back over the stream and are routed to waiters by request id.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};

use {
    futures::StreamExt,
    reqwest::Response,
    tokio::{
        sync::{Mutex, oneshot},
        task::JoinHandle,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
    url::Url,
};

use crate::{
    error::{TransportError, TransportResult},
    event_stream::{EventStreamParser, SseEvent},
    traits::McpTransport,
    transport::{EVENT_STREAM, TransportKind, TransportOptions, error_for_status, is_event_stream},
    types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse},
};

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>>;

pub struct SseTransport {
    stream_url: Url,
    /// POST target announced by the server.
    endpoint: Url,
    options: TransportOptions,
    pending: PendingMap,
    dropped: CancellationToken,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    /// Open the event stream and wait for the server to announce its endpoint.
    pub async fn open(url: &Url, options: TransportOptions) -> TransportResult<Arc<Self>> {
        // No reqwest timeout here: it would cut the stream off mid-session.
        let req = options.apply(
            options
                .client
                .get(url.as_str())
                .header(reqwest::header::ACCEPT, EVENT_STREAM),
        );
        let resp = tokio::time::timeout(options.request_timeout, req.send())
            .await
            .map_err(|_| TransportError::Timeout(options.request_timeout))?
            .map_err(|e| TransportError::from_reqwest(e, options.request_timeout))?;
        let resp = error_for_status(resp).await?;
        if !is_event_stream(&resp) {
            return Err(TransportError::Stream(format!(
                "{url} did not answer with an event stream"
            )));
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let dropped = CancellationToken::new();
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = tokio::spawn(read_stream(
            resp,
            url.clone(),
            Arc::clone(&pending),
            dropped.clone(),
            endpoint_tx,
        ));

        let endpoint = match tokio::time::timeout(options.request_timeout, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                reader.abort();
                return Err(TransportError::Stream(
                    "event stream closed before announcing an endpoint".into(),
                ));
            },
            Err(_) => {
                reader.abort();
                return Err(TransportError::Timeout(options.request_timeout));
            },
        };

        info!(url = %url, endpoint = %endpoint, "SSE stream open");

        Ok(Arc::new(Self {
            stream_url: url.clone(),
            endpoint,
            options,
            pending,
            dropped,
            reader: StdMutex::new(Some(reader)),
        }))
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn post<T: serde::Serialize + Sync>(&self, body: &T) -> TransportResult<Response> {
        if self.dropped.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let req = self
            .options
            .client
            .post(self.endpoint.as_str())
            .timeout(self.options.request_timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        let resp = self
            .options
            .apply(req)
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(e, self.options.request_timeout))?;
        error_for_status(resp).await
    }

    fn stop_reader(&self) {
        if let Ok(mut reader) = self.reader.lock()
            && let Some(handle) = reader.take()
        {
            handle.abort();
        }
    }
}

/// Resolve the `endpoint` event payload against the stream URL.
pub(crate) fn resolve_endpoint(stream_url: &Url, data: &str) -> Result<Url, url::ParseError> {
    stream_url.join(data.trim())
}

async fn read_stream(
    resp: Response,
    stream_url: Url,
    pending: PendingMap,
    dropped: CancellationToken,
    endpoint_tx: oneshot::Sender<Url>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut parser = EventStreamParser::new();
    let mut stream = resp.bytes_stream();

    let reason = loop {
        match stream.next().await {
            Some(Ok(chunk)) => {
                for event in parser.push(&chunk) {
                    dispatch(&event, &stream_url, &pending, &mut endpoint_tx).await;
                }
            },
            Some(Err(e)) => break format!("event stream error: {e}"),
            None => {
                if let Some(event) = std::mem::take(&mut parser).finish() {
                    dispatch(&event, &stream_url, &pending, &mut endpoint_tx).await;
                }
                break "event stream ended".to_string();
            },
        }
    };

    let waiting = {
        let mut pending = pending.lock().await;
        let waiting = pending.len();
        pending.clear();
        waiting
    };
    warn!(url = %stream_url, reason = %reason, waiting, "SSE stream lost");
    dropped.cancel();
}

async fn dispatch(
    event: &SseEvent,
    stream_url: &Url,
    pending: &PendingMap,
    endpoint_tx: &mut Option<oneshot::Sender<Url>>,
) {
    match event.event.as_str() {
        "endpoint" => {
            let Some(tx) = endpoint_tx.take() else {
                debug!(data = %event.data, "ignoring repeated endpoint event");
                return;
            };
            match resolve_endpoint(stream_url, &event.data) {
                Ok(endpoint) => {
                    let _ = tx.send(endpoint);
                },
                Err(e) => warn!(data = %event.data, error = %e, "unusable endpoint event"),
            }
        },
        "message" => {
            let Some(resp) = JsonRpcResponse::parse(&event.data) else {
                debug!("skipping server-initiated message on SSE stream");
                return;
            };
            let key = resp.id.to_string();
            match pending.lock().await.remove(&key) {
                Some(tx) => {
                    let _ = tx.send(resp);
                },
                None => debug!(id = %key, "response for unknown or abandoned request"),
            }
        },
        other => debug!(event = other, "ignoring SSE event"),
    }
}

#[async_trait::async_trait]
impl McpTransport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn send(&self, request: JsonRpcRequest) -> TransportResult<JsonRpcResponse> {
        debug!(method = %request.method, id = %request.id, endpoint = %self.endpoint, "SSE client -> server");

        let key = request.id.to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(key.clone(), tx);

        if let Err(e) = self.post(&request).await {
            self.pending.lock().await.remove(&key);
            return Err(e);
        }

        match tokio::time::timeout(self.options.request_timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(TransportError::Stream(format!(
                "stream lost before '{}' was answered",
                request.method
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&key);
                Err(TransportError::Timeout(self.options.request_timeout))
            },
        }
    }

    async fn notify(&self, notification: JsonRpcNotification) -> TransportResult<()> {
        debug!(method = %notification.method, endpoint = %self.endpoint, "SSE client -> server (notification)");
        self.post(&notification).await?;
        Ok(())
    }

    fn dropped(&self) -> CancellationToken {
        self.dropped.clone()
    }

    async fn close(&self) {
        self.stop_reader();
        self.pending.lock().await.clear();
        debug!(url = %self.stream_url, "SSE transport closed");
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.stop_reader();
    }
}
