#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]
//! In-process MCP server for integration tests.
//!
//! Serves streamable HTTP (`POST /mcp`), legacy SSE (`GET /mcp` plus
//! `POST /messages`) and, when enabled, an OAuth authorization server with
//! metadata, dynamic registration and a token endpoint.

use std::{
    collections::{HashMap, HashSet},
    convert::Infallible,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    axum::{
        Form, Json, Router,
        extract::{Query, State},
        http::{HeaderMap, HeaderValue, StatusCode, header},
        response::{
            IntoResponse, Response,
            sse::{Event, Sse},
        },
        routing::{get, post},
    },
    serde_json::{Value, json},
    tokio::{sync::mpsc, task::JoinHandle},
    tokio_stream::{StreamExt, wrappers::UnboundedReceiverStream},
    url::Url,
    usemcp::McpConfig,
    usemcp_oauth::{AuthCallback, CallbackBus, PopupFeatures, PopupLauncher, PopupWindow},
};

pub const WAIT: Duration = Duration::from_secs(10);
pub const CALLBACK_URL: &str = "http://127.0.0.1:9/oauth/callback";
pub const AUTH_CODE: &str = "test-code";
const REFRESH_TOKEN: &str = "test-refresh";
const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// Answer `POST /mcp` (streamable HTTP).
    pub streamable: bool,
    /// Answer `GET /mcp` with an event stream (legacy SSE).
    pub sse: bool,
    /// Streamable responses as `text/event-stream` instead of JSON.
    pub event_stream_responses: bool,
    /// Require a bearer token issued by the built-in authorization server.
    pub oauth: bool,
    /// Answer `prompts/list` with method-not-found.
    pub decline_prompts: bool,
    /// Never issue or check `Mcp-Session-Id`.
    pub stateless: bool,
    /// Hold the first `initialize` reply back this long.
    pub slow_first_initialize: Option<Duration>,
    /// Answer dynamic client registration with a server error.
    pub reject_registration: bool,
}

impl ServerOptions {
    pub fn streamable() -> Self {
        Self {
            streamable: true,
            sse: false,
            event_stream_responses: false,
            oauth: false,
            decline_prompts: false,
            stateless: false,
            slow_first_initialize: None,
            reject_registration: false,
        }
    }

    pub fn sse_only() -> Self {
        Self {
            streamable: false,
            sse: true,
            ..Self::streamable()
        }
    }

    pub fn protected() -> Self {
        Self {
            oauth: true,
            ..Self::streamable()
        }
    }
}

pub struct ServerState {
    base: String,
    opts: ServerOptions,
    next_id: AtomicU64,
    sessions: Mutex<HashSet<String>>,
    sse_clients: Mutex<HashMap<String, mpsc::UnboundedSender<Event>>>,
    issued_tokens: Mutex<HashSet<String>>,
    pub registrations: AtomicUsize,
    pub deletes: AtomicUsize,
    pub code_exchanges: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub initializes: AtomicUsize,
}

impl ServerState {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        if !self.opts.oauth {
            return true;
        }
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| self.issued_tokens.lock().unwrap().contains(token))
    }

    fn unauthorized(&self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            [(
                header::WWW_AUTHENTICATE,
                format!(
                    r#"Bearer resource_metadata="{}/.well-known/oauth-protected-resource""#,
                    self.base
                ),
            )],
            "unauthorized",
        )
            .into_response()
    }

    fn issue_token(&self) -> Value {
        let token = format!("token-{}", self.next_id());
        self.issued_tokens.lock().unwrap().insert(token.clone());
        json!({
            "access_token": token,
            "token_type": "Bearer",
            "refresh_token": REFRESH_TOKEN,
            "expires_in": 3600,
        })
    }

    fn reply(&self, id: Value, method: &str, params: &Value) -> Value {
        match handle_rpc(&self.opts, method, params) {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err((code, message)) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": code, "message": message },
            }),
        }
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub base: String,
    pub state: Arc<ServerState>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn spawn(opts: ServerOptions) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base = format!("http://{addr}");
        let state = Arc::new(ServerState {
            base: base.clone(),
            opts,
            next_id: AtomicU64::new(1),
            sessions: Mutex::new(HashSet::new()),
            sse_clients: Mutex::new(HashMap::new()),
            issued_tokens: Mutex::new(HashSet::new()),
            registrations: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            code_exchanges: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            initializes: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/mcp", post(mcp_post).get(mcp_get).delete(mcp_delete))
            .route("/messages", post(messages_post))
            .route(
                "/.well-known/oauth-protected-resource",
                get(resource_metadata),
            )
            .route(
                "/.well-known/oauth-authorization-server",
                get(authorization_server_metadata),
            )
            .route("/register", post(register))
            .route("/token", post(token))
            .with_state(Arc::clone(&state));

        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            base,
            state,
            task,
        }
    }

    pub fn url(&self) -> String {
        format!("{}/mcp", self.base)
    }

    /// End every open SSE stream.
    pub fn drop_sse_clients(&self) {
        self.state.sse_clients.lock().unwrap().clear();
    }

    /// Stop accepting connections. Connections already open stay up.
    pub fn stop(&self) {
        self.task.abort();
    }

    /// Invalidate every issued access token; refresh tokens stay valid.
    pub fn revoke_access_tokens(&self) {
        self.state.issued_tokens.lock().unwrap().clear();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Config pointing at `url` with short timeouts.
pub fn config(url: &str) -> McpConfig {
    McpConfig {
        callback_url: Some(CALLBACK_URL.into()),
        request_timeout_secs: 5,
        auth_timeout_secs: 10,
        ..McpConfig::new(url)
    }
}

pub fn state_param(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()?
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
}

// ── RPC ─────────────────────────────────────────────────────────────

fn handle_rpc(opts: &ServerOptions, method: &str, params: &Value) -> Result<Value, (i64, String)> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2025-06-18",
            "capabilities": { "tools": {}, "resources": {}, "prompts": {} },
            "serverInfo": { "name": "test-server", "version": "1.0.0" },
        })),
        "tools/list" => Ok(json!({ "tools": [
            {
                "name": "add",
                "description": "Add two numbers",
                "inputSchema": {
                    "type": "object",
                    "properties": { "a": { "type": "number" }, "b": { "type": "number" } },
                    "required": ["a", "b"],
                },
            },
            {
                "name": "greet",
                "description": "Say hello",
                "inputSchema": { "type": "object", "properties": { "name": { "type": "string" } } },
            },
        ]})),
        "tools/call" => {
            let args = &params["arguments"];
            match params["name"].as_str() {
                Some("add") => {
                    let sum = args["a"].as_f64().unwrap_or(0.0) + args["b"].as_f64().unwrap_or(0.0);
                    Ok(json!({ "content": [{ "type": "text", "text": format_number(sum) }] }))
                },
                Some("greet") => Ok(json!({ "content": [{
                    "type": "text",
                    "text": format!("Hello, {}!", args["name"].as_str().unwrap_or("world")),
                }]})),
                _ => Err((-32602, "unknown tool".into())),
            }
        },
        "resources/list" => Ok(json!({ "resources": [
            { "uri": "test://readme", "name": "readme", "mimeType": "text/plain" },
            { "uri": "test://config", "name": "config", "title": "Config", "mimeType": "application/json" },
        ]})),
        "resources/templates/list" => Ok(json!({ "resourceTemplates": [
            { "uriTemplate": "test://items/{id}", "name": "item", "mimeType": "application/json" },
        ]})),
        "resources/read" => {
            let uri = params["uri"].as_str().unwrap_or_default();
            Ok(json!({ "contents": [{ "uri": uri, "mimeType": "text/plain", "text": format!("contents of {uri}") }] }))
        },
        "prompts/list" if opts.decline_prompts => Err((-32601, "Method not found".into())),
        "prompts/list" => Ok(json!({ "prompts": [
            { "name": "summarize", "description": "Summarize text", "arguments": [{ "name": "text", "required": true }] },
            { "name": "ping", "description": "No arguments" },
        ]})),
        "prompts/get" => {
            let text = params["arguments"]["text"].as_str().unwrap_or("nothing");
            Ok(json!({
                "description": "Summarize text",
                "messages": [{ "role": "user", "content": { "type": "text", "text": format!("Summarize: {text}") } }],
            }))
        },
        _ => Err((-32601, "Method not found".into())),
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

// ── Handlers ────────────────────────────────────────────────────────

async fn mcp_post(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(msg): Json<Value>,
) -> Response {
    if !state.opts.streamable {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    if !state.authorized(&headers) {
        return state.unauthorized();
    }

    let method = msg["method"].as_str().unwrap_or_default().to_string();
    if method == "initialize" {
        let n = state.initializes.fetch_add(1, Ordering::SeqCst);
        if n == 0
            && let Some(delay) = state.opts.slow_first_initialize
        {
            tokio::time::sleep(delay).await;
        }
    } else if !state.opts.stateless {
        let Some(session) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) else {
            return (StatusCode::BAD_REQUEST, "missing session").into_response();
        };
        if !state.sessions.lock().unwrap().contains(session) {
            return (StatusCode::NOT_FOUND, "unknown session").into_response();
        }
    }

    let Some(id) = msg.get("id").cloned() else {
        return StatusCode::ACCEPTED.into_response();
    };
    let reply = state.reply(id, &method, &msg["params"]);

    let mut resp = if state.opts.event_stream_responses {
        let progress = json!({ "jsonrpc": "2.0", "method": "notifications/progress", "params": {} });
        (
            [(header::CONTENT_TYPE, "text/event-stream")],
            format!("event: message\ndata: {progress}\n\nevent: message\ndata: {reply}\n\n"),
        )
            .into_response()
    } else {
        Json(reply).into_response()
    };

    if method == "initialize" && !state.opts.stateless {
        let session = format!("session-{}", state.next_id());
        state.sessions.lock().unwrap().insert(session.clone());
        resp.headers_mut()
            .insert(SESSION_HEADER, HeaderValue::from_str(&session).unwrap());
    }
    resp
}

async fn mcp_delete(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> StatusCode {
    if let Some(session) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        state.sessions.lock().unwrap().remove(session);
    }
    state.deletes.fetch_add(1, Ordering::SeqCst);
    StatusCode::NO_CONTENT
}

async fn mcp_get(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    if !state.opts.sse {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    if !state.authorized(&headers) {
        return state.unauthorized();
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let session = state.next_id().to_string();
    tx.send(
        Event::default()
            .event("endpoint")
            .data(format!("/messages?sessionId={session}")),
    )
    .unwrap();
    state.sse_clients.lock().unwrap().insert(session, tx);

    Sse::new(UnboundedReceiverStream::new(rx).map(Ok::<_, Infallible>)).into_response()
}

async fn messages_post(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(msg): Json<Value>,
) -> Response {
    if !state.authorized(&headers) {
        return state.unauthorized();
    }
    let client = query
        .get("sessionId")
        .and_then(|id| state.sse_clients.lock().unwrap().get(id).cloned());
    let Some(client) = client else {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };

    if let Some(id) = msg.get("id").cloned() {
        let method = msg["method"].as_str().unwrap_or_default();
        let reply = state.reply(id, method, &msg["params"]);
        let _ = client.send(Event::default().event("message").data(reply.to_string()));
    }
    StatusCode::ACCEPTED.into_response()
}

async fn resource_metadata(State(state): State<Arc<ServerState>>) -> Json<Value> {
    Json(json!({
        "resource": format!("{}/mcp", state.base),
        "authorization_servers": [state.base],
        "scopes_supported": ["mcp"],
    }))
}

async fn authorization_server_metadata(State(state): State<Arc<ServerState>>) -> Json<Value> {
    Json(json!({
        "issuer": state.base,
        "authorization_endpoint": format!("{}/authorize", state.base),
        "token_endpoint": format!("{}/token", state.base),
        "registration_endpoint": format!("{}/register", state.base),
        "code_challenge_methods_supported": ["S256"],
    }))
}

async fn register(State(state): State<Arc<ServerState>>, Json(body): Json<Value>) -> Response {
    let n = state.registrations.fetch_add(1, Ordering::SeqCst) + 1;
    if state.opts.reject_registration {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "registration unavailable",
        )
            .into_response();
    }
    (
        StatusCode::CREATED,
        Json(json!({
            "client_id": format!("test-client-{n}"),
            "redirect_uris": body["redirect_uris"],
        })),
    )
        .into_response()
}

async fn token(
    State(state): State<Arc<ServerState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let grant = form.get("grant_type").map(String::as_str);
    match grant {
        Some("authorization_code")
            if form.get("code").map(String::as_str) == Some(AUTH_CODE)
                && form.contains_key("code_verifier") =>
        {
            state.code_exchanges.fetch_add(1, Ordering::SeqCst);
            Json(state.issue_token()).into_response()
        },
        Some("refresh_token") if form.get("refresh_token").map(String::as_str) == Some(REFRESH_TOKEN) => {
            state.refreshes.fetch_add(1, Ordering::SeqCst);
            Json(state.issue_token()).into_response()
        },
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_grant", "error_description": "bad code" })),
        )
            .into_response(),
    }
}

// ── Popups ──────────────────────────────────────────────────────────

/// Stands in for a browser: "visits" the authorization URL and publishes
/// the redirect straight to the bus.
pub struct AutoPopup {
    bus: CallbackBus,
    deny: bool,
    pub opened: AtomicUsize,
    pub closed: Arc<AtomicUsize>,
}

impl AutoPopup {
    pub fn approving(bus: CallbackBus) -> Arc<Self> {
        Arc::new(Self {
            bus,
            deny: false,
            opened: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn denying(bus: CallbackBus) -> Arc<Self> {
        Arc::new(Self {
            bus,
            deny: true,
            opened: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl PopupLauncher for AutoPopup {
    fn open(&self, url: &str, _features: &PopupFeatures) -> Option<Box<dyn PopupWindow>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let state = state_param(url)?;
        let callback = if self.deny {
            AuthCallback {
                state,
                code: None,
                error: Some("access_denied".into()),
                error_description: Some("user declined".into()),
            }
        } else {
            AuthCallback {
                state,
                code: Some(AUTH_CODE.into()),
                error: None,
                error_description: None,
            }
        };
        self.bus.publish(callback);
        Some(Box::new(FakeWindow {
            closed: AtomicBool::new(false),
            counter: Arc::clone(&self.closed),
        }))
    }
}

struct FakeWindow {
    closed: AtomicBool,
    counter: Arc<AtomicUsize>,
}

impl PopupWindow for FakeWindow {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
