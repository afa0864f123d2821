//! McpManager: the connection state machine for one MCP server.
//!
//! Each `connect` bumps the generation and spawns one attempt task. The task
//! walks the transports, hands 401s to the OAuth flow, discovers
//! capabilities and then watches the session until it drops. Transitions go
//! through one mutex (never held across an await) and every change
//! republishes an [`McpSnapshot`] on a watch channel. Results that arrive for
//! an older generation are discarded.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use {
    secrecy::Secret,
    tokio::{
        sync::{
            broadcast::{self, error::RecvError},
            watch,
        },
        task::JoinHandle,
    },
    tracing::{debug, info, warn},
    url::Url,
};

use usemcp_oauth::{
    AuthCallback, AuthStore, CALLBACK_PATH, CallbackBus, FileAuthStore, PopupFeatures,
    PopupLauncher, PopupWindow, SystemBrowser,
};

use crate::{
    auth::McpOAuthProvider,
    capability::{Capabilities, Prompt},
    config::McpConfig,
    discovery::discover,
    error::{Context, Error, Result},
    http_transport::HttpTransport,
    session::Session,
    sse_transport::SseTransport,
    state::{ConnectionState, LogBuffer, LogLevel, McpSnapshot, StateKind},
    traits::McpTransport,
    transport::{TransportKind, TransportOptions},
    types::{ClientInfo, InitializeResult, PromptGetResult, ResourceReadResult, ToolsCallResult},
};

/// Popups are centered on a screen of this size.
const ASSUMED_SCREEN: (u32, u32) = (1920, 1080);

/// How many abandoned authorization states are remembered.
const RETIRED_STATES: usize = 16;

/// Why an attempt stopped short of ready.
#[derive(Debug)]
enum AttemptError {
    /// Every transport failed at the transport level. Eligible for retry.
    Transport(Error),
    /// Authorization failures, rejected handshakes, discovery failures.
    Fatal(Error),
    /// A newer generation took over.
    Superseded,
}

struct PendingFlow {
    state: String,
    url: String,
}

struct Inner {
    state: ConnectionState,
    generation: u64,
    session: Option<Arc<Session>>,
    caps: Capabilities,
    log: LogBuffer,
    task: Option<JoinHandle<()>>,
    popup: Option<Box<dyn PopupWindow>>,
    pending: Option<PendingFlow>,
    retired: VecDeque<String>,
}

impl Inner {
    fn retire(&mut self, state: String) {
        while self.retired.len() >= RETIRED_STATES {
            self.retired.pop_front();
        }
        self.retired.push_back(state);
    }

    /// Close the popup and retire the pending state, if any.
    fn abandon_flow(&mut self) -> bool {
        if let Some(window) = self.popup.take() {
            window.close();
        }
        match self.pending.take() {
            Some(flow) => {
                self.retire(flow.state);
                true
            },
            None => false,
        }
    }
}

struct Shared {
    config: McpConfig,
    url: Url,
    store: Arc<dyn AuthStore>,
    auth: McpOAuthProvider,
    popup: Arc<dyn PopupLauncher>,
    bus: CallbackBus,
    http: reqwest::Client,
    inner: Mutex<Inner>,
    snapshot: watch::Sender<McpSnapshot>,
}

pub struct McpManager {
    shared: Arc<Shared>,
}

// ── Construction ────────────────────────────────────────────────────

pub struct McpManagerBuilder {
    config: McpConfig,
    store: Option<Arc<dyn AuthStore>>,
    popup: Option<Arc<dyn PopupLauncher>>,
    bus: Option<CallbackBus>,
    http: Option<reqwest::Client>,
}

impl McpManagerBuilder {
    #[must_use]
    pub fn store(mut self, store: Arc<dyn AuthStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn popup(mut self, popup: Arc<dyn PopupLauncher>) -> Self {
        self.popup = Some(popup);
        self
    }

    /// Share a bus with the host's callback route.
    #[must_use]
    pub fn callback_bus(mut self, bus: CallbackBus) -> Self {
        self.bus = Some(bus);
        self
    }

    #[must_use]
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http = Some(client);
        self
    }

    pub fn build(self) -> Result<McpManager> {
        let url = self.config.server_url()?;
        let store: Arc<dyn AuthStore> = match self.store {
            Some(store) => store,
            None => match &self.config.storage_path {
                Some(path) => Arc::new(FileAuthStore::with_path(path.clone())),
                None => Arc::new(FileAuthStore::new()?),
            },
        };
        let http = match self.http {
            Some(client) => client,
            None => reqwest::Client::builder()
                .build()
                .context("failed to build HTTP client")?,
        };
        let auth = McpOAuthProvider::new(
            url.clone(),
            Arc::clone(&store),
            http.clone(),
            self.config.client_name.clone(),
            self.config.client_uri.clone(),
        );

        let log = LogBuffer::new(self.config.log_capacity, self.config.debug);
        let caps = Capabilities::default();
        let state = ConnectionState::NotConnected;
        let (snapshot, _) = watch::channel(McpSnapshot::build(&state, &caps, &log));

        Ok(McpManager {
            shared: Arc::new(Shared {
                url,
                store,
                auth,
                popup: self.popup.unwrap_or_else(|| Arc::new(SystemBrowser)),
                bus: self.bus.unwrap_or_default(),
                http,
                inner: Mutex::new(Inner {
                    state,
                    generation: 0,
                    session: None,
                    caps,
                    log,
                    task: None,
                    popup: None,
                    pending: None,
                    retired: VecDeque::new(),
                }),
                snapshot,
                config: self.config,
            }),
        })
    }
}

// ── Public surface ──────────────────────────────────────────────────

impl McpManager {
    #[must_use]
    pub fn builder(config: McpConfig) -> McpManagerBuilder {
        McpManagerBuilder {
            config,
            store: None,
            popup: None,
            bus: None,
            http: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &McpConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    /// Bus the callback route publishes to.
    #[must_use]
    pub fn callback_bus(&self) -> &CallbackBus {
        &self.shared.bus
    }

    #[must_use]
    pub fn snapshot(&self) -> McpSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<McpSnapshot> {
        self.shared.snapshot.subscribe()
    }

    /// Attempt number of the current connection.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.shared.lock().generation
    }

    /// `initialize` result of the ready session.
    #[must_use]
    pub fn server_info(&self) -> Option<InitializeResult> {
        let inner = self.shared.lock();
        inner.session.as_ref()?.server_info().cloned()
    }

    /// Start a new connection attempt, superseding any in flight.
    pub fn connect(&self) {
        Shared::start_attempt(&self.shared, true);
    }

    /// The connect made when the hook mounts; honors `prevent_auto_auth`.
    pub(crate) fn mount(&self) {
        Shared::start_attempt(&self.shared, !self.shared.config.prevent_auto_auth);
    }

    /// Reconnect from `failed` or `not-connected`. Returns whether an
    /// attempt was started.
    pub fn retry(&self) -> bool {
        let kind = self.shared.lock().state.kind();
        if matches!(kind, StateKind::Failed | StateKind::NotConnected) {
            self.connect();
            true
        } else {
            debug!(server = %self.shared.url, state = %kind, "retry ignored");
            false
        }
    }

    /// Close the session, abandon any pending authorization and return to
    /// `not-connected`.
    pub async fn disconnect(&self) {
        let (task, session, had_flow) = {
            let mut inner = self.shared.lock();
            inner.generation += 1;
            let task = inner.task.take();
            let session = inner.session.take();
            inner.caps = Capabilities::default();
            let had_flow = inner.abandon_flow();
            inner.log.push(LogLevel::Info, "disconnecting");
            self.shared.set_state(&mut inner, ConnectionState::NotConnected);
            (task, session, had_flow)
        };

        if let Some(task) = task {
            task.abort();
        }
        if let Some(session) = session {
            session.close().await;
        }
        if had_flow && let Err(e) = self.shared.auth.abandon_pending() {
            warn!(server = %self.shared.url, error = %e, "failed to drop pending authorization");
        }
        info!(server = %self.shared.url, "disconnected");
    }

    /// Open the authorization popup by hand.
    ///
    /// In `pending-auth` this reopens the popup for the flow in progress; from
    /// `not-connected` or `failed` it starts a new interactive attempt.
    /// Returns the link to open manually when the popup could not be opened.
    pub fn authenticate(&self) -> Option<String> {
        let mut inner = self.shared.lock();
        match inner.state.kind() {
            StateKind::PendingAuth => {
                let url = inner.pending.as_ref()?.url.clone();
                let features = self.shared.popup_features();
                if let Some(old) = inner.popup.take() {
                    old.close();
                }
                match self.shared.popup.open(&url, &features) {
                    Some(window) => {
                        inner.popup = Some(window);
                        inner.log.push(LogLevel::Info, "authorization popup opened");
                        self.shared
                            .set_state(&mut inner, ConnectionState::PendingAuth { auth_url: None });
                        None
                    },
                    None => {
                        inner.log.push(
                            LogLevel::Warn,
                            "popup blocked; open the authorization link manually",
                        );
                        self.shared.set_state(&mut inner, ConnectionState::PendingAuth {
                            auth_url: Some(url.clone()),
                        });
                        Some(url)
                    },
                }
            },
            StateKind::NotConnected | StateKind::Failed => {
                drop(inner);
                self.connect();
                None
            },
            other => {
                debug!(server = %self.shared.url, state = %other, "authenticate ignored");
                None
            },
        }
    }

    /// Give up on the authorization in progress. Returns whether one was.
    pub fn cancel_authentication(&self) -> bool {
        {
            let mut inner = self.shared.lock();
            if !matches!(
                inner.state.kind(),
                StateKind::Authenticating | StateKind::PendingAuth
            ) {
                return false;
            }
            inner.generation += 1;
            if let Some(task) = inner.task.take() {
                task.abort();
            }
            inner.abandon_flow();
            self.shared.set_state(&mut inner, ConnectionState::Failed {
                error: "authentication cancelled".into(),
            });
        }
        if let Err(e) = self.shared.auth.abandon_pending() {
            warn!(server = %self.shared.url, error = %e, "failed to drop pending authorization");
        }
        true
    }

    fn ready_session(&self) -> Result<(Arc<Session>, Capabilities)> {
        let inner = self.shared.lock();
        match (&inner.state, &inner.session) {
            (ConnectionState::Ready { .. }, Some(session)) => {
                Ok((Arc::clone(session), inner.caps.clone()))
            },
            (state, _) => Err(Error::NotConnected(format!(
                "{} is {}",
                self.shared.url,
                state.kind()
            ))),
        }
    }

    /// Invoke a discovered tool. Fails with not-connected unless ready.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolsCallResult> {
        let (session, caps) = self.ready_session()?;
        if caps.tool(name).is_none() {
            return Err(Error::message(format!("server has no tool named '{name}'")));
        }
        debug!(server = %self.shared.url, tool = name, "calling tool");
        session.call_tool(name, arguments).await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ResourceReadResult> {
        let (session, _) = self.ready_session()?;
        session.read_resource(uri).await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<PromptGetResult> {
        let (_, caps) = self.ready_session()?;
        let prompt: Prompt = caps
            .prompt(name)
            .cloned()
            .with_context(|| format!("server has no prompt named '{name}'"))?;
        prompt.get(arguments).await
    }

    /// Delete the stored authorization for this server and disconnect.
    /// Returns whether anything was stored.
    pub async fn clear_storage(&self) -> Result<bool> {
        // The attempt task must be gone before the record is, or a token
        // exchange finishing elsewhere could write it back.
        self.disconnect().await;
        let removed = self.shared.auth.clear()?;
        {
            let mut inner = self.shared.lock();
            let message = if removed {
                format!("cleared stored authorization for {}", self.shared.auth.origin())
            } else {
                format!("no stored authorization for {}", self.shared.auth.origin())
            };
            inner.log.push(LogLevel::Info, message);
            self.shared.publish(&inner);
        }
        Ok(removed)
    }

    /// Wait until a snapshot satisfies `predicate`.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&McpSnapshot) -> bool,
        timeout: Duration,
    ) -> Result<McpSnapshot> {
        let mut rx = self.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|snapshot| predicate(snapshot))
                .await
                .map(|snapshot| snapshot.clone())
        })
        .await;

        match waited {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(_)) => Err(Error::Cancelled("manager dropped".into())),
            Err(_) => Err(Error::Timeout(format!(
                "waiting on {} (state {})",
                self.shared.url,
                self.snapshot().state
            ))),
        }
    }
}

impl Drop for McpManager {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        inner.generation += 1;
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        if let Some(window) = inner.popup.take() {
            window.close();
        }
    }
}

// ── State machine ───────────────────────────────────────────────────

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &Inner) {
        self.snapshot
            .send_replace(McpSnapshot::build(&inner.state, &inner.caps, &inner.log));
    }

    fn set_state(&self, inner: &mut Inner, next: ConnectionState) -> bool {
        let from = inner.state.kind();
        let to = next.kind();
        if !from.can_transition_to(to) {
            warn!(server = %self.url, from = %from, to = %to, "rejected state transition");
            return false;
        }
        let level = if to == StateKind::Failed {
            LogLevel::Error
        } else {
            LogLevel::Info
        };
        inner.log.push(level, format!("{from} -> {next}"));
        inner.state = next;
        self.publish(inner);
        true
    }

    /// Transition if `generation` is still current.
    fn transition(&self, generation: u64, next: ConnectionState) -> bool {
        let mut inner = self.lock();
        inner.generation == generation && self.set_state(&mut inner, next)
    }

    fn log(&self, generation: u64, level: LogLevel, message: impl Into<String>) {
        let mut inner = self.lock();
        if inner.generation == generation {
            inner.log.push(level, message);
            self.publish(&inner);
        }
    }

    fn fail(&self, generation: u64, error: &Error) {
        warn!(server = %self.url, error = %error, kind = ?error.kind(), "connection failed");
        self.transition(generation, ConnectionState::Failed {
            error: error.to_string(),
        });
    }

    fn popup_features(&self) -> PopupFeatures {
        PopupFeatures::parse(&self.config.popup_features)
            .centered(ASSUMED_SCREEN.0, ASSUMED_SCREEN.1)
    }

    fn redirect_uri(&self) -> String {
        self.config
            .callback_url
            .clone()
            .unwrap_or_else(|| format!("http://127.0.0.1{CALLBACK_PATH}"))
    }

    fn start_attempt(shared: &Arc<Self>, interactive: bool) {
        let mut inner = shared.lock();
        inner.generation += 1;
        let generation = inner.generation;
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        let previous = inner.session.take();
        inner.caps = Capabilities::default();
        inner.abandon_flow();

        if !inner.state.kind().can_transition_to(StateKind::Discovering) {
            shared.set_state(&mut inner, ConnectionState::NotConnected);
        }
        inner.log.push(
            LogLevel::Debug,
            format!("connecting to {} (generation {generation})", shared.url),
        );
        shared.set_state(&mut inner, ConnectionState::Discovering);

        let task = tokio::spawn(Arc::clone(shared).run(generation, interactive, previous));
        inner.task = Some(task);
    }

    async fn run(self: Arc<Self>, generation: u64, interactive: bool, previous: Option<Arc<Session>>) {
        if let Some(previous) = previous {
            previous.close().await;
        }

        let max_attempts = self.config.retry.max_attempts;
        let mut reconnecting = false;
        let mut attempt: u32 = 0;

        loop {
            match self.establish(generation, interactive).await {
                Ok(session) => {
                    session.dropped().cancelled().await;

                    let reconnect = self.config.auto_reconnect && max_attempts > 0;
                    let proceed = {
                        let mut inner = self.lock();
                        if inner.generation != generation {
                            false
                        } else {
                            inner.session = None;
                            inner.caps = Capabilities::default();
                            inner.log.push(LogLevel::Warn, "connection to server lost");
                            let next = if reconnect {
                                ConnectionState::Discovering
                            } else {
                                ConnectionState::Failed {
                                    error: "connection to server lost".into(),
                                }
                            };
                            self.set_state(&mut inner, next) && reconnect
                        }
                    };
                    session.close().await;
                    if !proceed {
                        return;
                    }

                    reconnecting = true;
                    attempt = 1;
                    let delay = self.config.retry.delay_for(attempt);
                    self.log(
                        generation,
                        LogLevel::Info,
                        format!(
                            "reconnecting in {}ms (attempt {attempt}/{max_attempts})",
                            delay.as_millis()
                        ),
                    );
                    tokio::time::sleep(delay).await;
                },
                Err(AttemptError::Superseded) => return,
                Err(AttemptError::Fatal(e)) => {
                    self.fail(generation, &e);
                    return;
                },
                Err(AttemptError::Transport(e)) => {
                    let allowed = if reconnecting {
                        self.config.auto_reconnect
                    } else {
                        self.config.auto_retry
                    };
                    attempt += 1;
                    if !allowed || attempt > max_attempts {
                        self.fail(generation, &e);
                        return;
                    }
                    if !self.transition(generation, ConnectionState::Discovering) {
                        return;
                    }
                    let delay = self.config.retry.delay_for(attempt);
                    self.log(
                        generation,
                        LogLevel::Warn,
                        format!(
                            "{e}; retrying in {}ms (attempt {attempt}/{max_attempts})",
                            delay.as_millis()
                        ),
                    );
                    tokio::time::sleep(delay).await;
                },
            }
        }
    }

    /// Walk the transports from `discovering` to `ready`.
    async fn establish(
        &self,
        generation: u64,
        interactive: bool,
    ) -> std::result::Result<Arc<Session>, AttemptError> {
        let order = self.config.transport_order();
        let mut opened = None;

        for (index, kind) in order.iter().copied().enumerate() {
            if index > 0 && !self.transition(generation, ConnectionState::Discovering) {
                return Err(AttemptError::Superseded);
            }
            if !self.transition(generation, ConnectionState::Connecting { transport: kind }) {
                return Err(AttemptError::Superseded);
            }
            match self.open_with_auth(generation, kind, interactive).await {
                Ok(session) => {
                    opened = Some(session);
                    break;
                },
                Err(AttemptError::Transport(e)) if index + 1 < order.len() => {
                    self.log(
                        generation,
                        LogLevel::Warn,
                        format!("{kind} transport failed ({e}); falling back to {}", order[index + 1]),
                    );
                },
                Err(e) => return Err(e),
            }
        }

        let session = opened.ok_or_else(|| {
            AttemptError::Fatal(Error::message("no transport configured"))
        })?;
        let kind = session.kind();

        if !self.transition(generation, ConnectionState::Loading { transport: kind }) {
            session.close().await;
            return Err(AttemptError::Superseded);
        }
        let caps = match discover(&session).await {
            Ok(caps) => caps,
            Err(e) => {
                session.close().await;
                return Err(AttemptError::Fatal(e));
            },
        };

        let installed = {
            let mut inner = self.lock();
            if inner.generation == generation {
                let summary = format!(
                    "{} tools, {} resources, {} resource templates, {} prompts",
                    caps.tools.len(),
                    caps.resources.len(),
                    caps.resource_templates.len(),
                    caps.prompts.len()
                );
                inner.session = Some(Arc::clone(&session));
                inner.caps = caps;
                inner.log.push(LogLevel::Info, summary);
                self.set_state(&mut inner, ConnectionState::Ready { transport: kind })
            } else {
                false
            }
        };
        if !installed {
            session.close().await;
            return Err(AttemptError::Superseded);
        }

        info!(server = %self.url, transport = %kind, generation, "MCP connection ready");
        Ok(session)
    }

    /// Open `kind`, authorizing on 401 and resuming on the same transport.
    async fn open_with_auth(
        &self,
        generation: u64,
        kind: TransportKind,
        interactive: bool,
    ) -> std::result::Result<Arc<Session>, AttemptError> {
        let mut token = self
            .auth
            .access_token()
            .await
            .map_err(|e| AttemptError::Fatal(e.into()))?;
        let mut refreshed = false;
        let mut authorized = false;

        loop {
            let err = match self.open_session(generation, kind, token.clone()).await {
                Ok(session) => return Ok(session),
                Err(e) => e,
            };
            let challenge = err.auth_challenge().map(|c| c.map(String::from));
            let Some(challenge) = challenge else {
                return Err(if err.is_transport_level() {
                    AttemptError::Transport(err)
                } else {
                    AttemptError::Fatal(err)
                });
            };

            if token.is_some() && !refreshed && !authorized {
                refreshed = true;
                self.log(generation, LogLevel::Info, "server rejected the stored token, refreshing");
                token = self
                    .auth
                    .refresh()
                    .await
                    .map_err(|e| AttemptError::Fatal(e.into()))?;
                if token.is_some() {
                    continue;
                }
            }
            if authorized {
                return Err(AttemptError::Fatal(Error::message(
                    "server rejected the token it just issued",
                )));
            }

            if !self.transition(generation, ConnectionState::Authenticating) {
                return Err(AttemptError::Superseded);
            }
            token = Some(
                self.authorize(generation, challenge.as_deref(), interactive)
                    .await?,
            );
            authorized = true;
            if !self.transition(generation, ConnectionState::Connecting { transport: kind }) {
                return Err(AttemptError::Superseded);
            }
        }
    }

    async fn open_session(
        &self,
        generation: u64,
        kind: TransportKind,
        token: Option<Secret<String>>,
    ) -> Result<Arc<Session>> {
        let options = TransportOptions::new(self.http.clone())
            .with_headers(self.config.headers.clone())
            .with_bearer(token)
            .with_request_timeout(self.config.request_timeout());

        let transport: Arc<dyn McpTransport> = match kind {
            TransportKind::Http => HttpTransport::new(&self.url, options),
            TransportKind::Sse => SseTransport::open(&self.url, options).await?,
        };

        let session = Arc::new(Session::new(generation, transport));
        let client_info = ClientInfo {
            name: self.config.client_name.clone(),
            version: env!("CARGO_PKG_VERSION").into(),
        };
        if let Err(e) = session.initialize(client_info).await {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    /// Run the interactive flow and return the new access token.
    async fn authorize(
        &self,
        generation: u64,
        www_authenticate: Option<&str>,
        interactive: bool,
    ) -> std::result::Result<Secret<String>, AttemptError> {
        let mut callbacks = self.bus.subscribe();
        let request = self
            .auth
            .start(&self.redirect_uri(), www_authenticate)
            .await
            .map_err(|e| AttemptError::Fatal(e.into()))?;

        let window = if interactive {
            self.popup.open(&request.url, &self.popup_features())
        } else {
            None
        };
        let auth_url = window.is_none().then(|| request.url.clone());

        {
            let mut inner = self.lock();
            if inner.generation != generation {
                if let Some(window) = window {
                    window.close();
                }
                return Err(AttemptError::Superseded);
            }
            let note = match (&window, interactive) {
                (Some(_), _) => (LogLevel::Info, "authorization popup opened"),
                (None, true) => (
                    LogLevel::Warn,
                    "popup blocked; open the authorization link manually",
                ),
                (None, false) => (LogLevel::Info, "waiting for authorization via link"),
            };
            inner.log.push(note.0, note.1);
            inner.popup = window;
            inner.pending = Some(PendingFlow {
                state: request.state.clone(),
                url: request.url.clone(),
            });
            self.set_state(&mut inner, ConnectionState::PendingAuth { auth_url });
        }

        let waited = tokio::time::timeout(
            self.config.auth_timeout(),
            self.await_callback(&mut callbacks, &request.state),
        )
        .await;

        {
            let mut inner = self.lock();
            if inner.generation != generation {
                return Err(AttemptError::Superseded);
            }
            inner.abandon_flow();
        }

        let code = match waited {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => {
                self.abandon_pending();
                return Err(AttemptError::Fatal(e));
            },
            Err(_) => {
                self.abandon_pending();
                return Err(AttemptError::Fatal(Error::Timeout(format!(
                    "authorization after {}s",
                    self.config.auth_timeout_secs
                ))));
            },
        };

        self.log(generation, LogLevel::Info, "authorization code received, exchanging");
        let tokens = self
            .auth
            .complete(&request.state, &code)
            .await
            .map_err(|e| AttemptError::Fatal(e.into()))?;
        Ok(tokens.access_token)
    }

    async fn await_callback(
        &self,
        callbacks: &mut broadcast::Receiver<AuthCallback>,
        state: &str,
    ) -> Result<String> {
        loop {
            match callbacks.recv().await {
                Ok(callback) if callback.state == state => {
                    return Ok(callback.into_code()?);
                },
                Ok(callback) => {
                    if self.is_retired(&callback.state) || self.belongs_elsewhere(&callback.state)
                    {
                        debug!(server = %self.url, "ignoring callback for another flow");
                        continue;
                    }
                    return Err(usemcp_oauth::Error::StateMismatch.into());
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(server = %self.url, skipped, "callback bus lagged");
                },
                Err(RecvError::Closed) => {
                    return Err(Error::Cancelled("callback bus closed".into()));
                },
            }
        }
    }

    fn is_retired(&self, state: &str) -> bool {
        self.lock().retired.iter().any(|s| s == state)
    }

    /// Whether `state` is pending for another origin in the shared store.
    fn belongs_elsewhere(&self, state: &str) -> bool {
        let Ok(origins) = self.store.list() else {
            return false;
        };
        origins
            .iter()
            .filter(|origin| origin.as_str() != self.auth.origin())
            .any(|origin| {
                matches!(
                    self.store.load(origin),
                    Ok(Some(record)) if record.pending.as_ref().is_some_and(|p| p.state == state)
                )
            })
    }

    fn abandon_pending(&self) {
        if let Err(e) = self.auth.abandon_pending() {
            warn!(server = %self.url, error = %e, "failed to drop pending authorization");
        }
    }
}
