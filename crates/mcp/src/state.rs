//! Connection states, the transition table and the published snapshot.

use std::{collections::VecDeque, fmt};

use {
    serde::Serialize,
    tracing::{debug, error, info, warn},
    usemcp_common::time::unix_now_millis,
};

use crate::{
    capability::{Capabilities, Prompt, Resource, ResourceTemplate, Tool},
    transport::TransportKind,
};

/// Fieldless mirror of [`ConnectionState`] used for transition checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StateKind {
    NotConnected,
    Discovering,
    Authenticating,
    PendingAuth,
    Connecting,
    Loading,
    Ready,
    Failed,
}

impl StateKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotConnected => "not-connected",
            Self::Discovering => "discovering",
            Self::Authenticating => "authenticating",
            Self::PendingAuth => "pending-auth",
            Self::Connecting => "connecting",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    /// Whether the machine may move from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use StateKind::*;

        if next == NotConnected {
            return true;
        }
        matches!(
            (self, next),
            (NotConnected | Failed, Discovering)
                | (Discovering, Connecting | Failed)
                | (Connecting, Loading | Authenticating | Discovering | Failed)
                | (Authenticating, PendingAuth | Failed)
                | (PendingAuth, PendingAuth | Connecting | Failed)
                | (Loading, Ready | Failed)
                | (Ready, Discovering | Failed)
        )
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum ConnectionState {
    NotConnected,
    Discovering,
    Authenticating,
    /// Waiting for the authorization callback. `auth_url` is set when the
    /// user has to open the link themselves.
    PendingAuth { auth_url: Option<String> },
    Connecting { transport: TransportKind },
    Loading { transport: TransportKind },
    Ready { transport: TransportKind },
    Failed { error: String },
}

impl ConnectionState {
    #[must_use]
    pub fn kind(&self) -> StateKind {
        match self {
            Self::NotConnected => StateKind::NotConnected,
            Self::Discovering => StateKind::Discovering,
            Self::Authenticating => StateKind::Authenticating,
            Self::PendingAuth { .. } => StateKind::PendingAuth,
            Self::Connecting { .. } => StateKind::Connecting,
            Self::Loading { .. } => StateKind::Loading,
            Self::Ready { .. } => StateKind::Ready,
            Self::Failed { .. } => StateKind::Failed,
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting { transport }
            | Self::Loading { transport }
            | Self::Ready { transport } => write!(f, "{} ({transport})", self.kind()),
            Self::Failed { error } => write!(f, "failed: {error}"),
            _ => f.write_str(self.kind().as_str()),
        }
    }
}

// ── Diagnostic log ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    /// Unix milliseconds.
    pub timestamp_ms: u64,
}

/// Bounded ring of diagnostic entries, mirrored to `tracing`.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    debug: bool,
}

impl LogBuffer {
    #[must_use]
    pub fn new(capacity: usize, debug: bool) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
            debug,
        }
    }

    pub fn push(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => debug!(target: "usemcp::log", "{message}"),
            LogLevel::Info => info!(target: "usemcp::log", "{message}"),
            LogLevel::Warn => warn!(target: "usemcp::log", "{message}"),
            LogLevel::Error => error!(target: "usemcp::log", "{message}"),
        }
        if level == LogLevel::Debug && !self.debug {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            level,
            message,
            timestamp_ms: unix_now_millis(),
        });
    }

    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Snapshot ────────────────────────────────────────────────────────

/// Immutable view published on every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpSnapshot {
    pub state: ConnectionState,
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub resource_templates: Vec<ResourceTemplate>,
    pub prompts: Vec<Prompt>,
    /// Set only in `failed`.
    pub error: Option<String>,
    /// Set only while pending authorization needs a manual link.
    pub auth_url: Option<String>,
    pub log: Vec<LogEntry>,
}

impl McpSnapshot {
    pub(crate) fn build(state: &ConnectionState, caps: &Capabilities, log: &LogBuffer) -> Self {
        let error = match state {
            ConnectionState::Failed { error } => Some(error.clone()),
            _ => None,
        };
        let auth_url = match state {
            ConnectionState::PendingAuth { auth_url } => auth_url.clone(),
            _ => None,
        };
        Self {
            state: state.clone(),
            tools: caps.tools.clone(),
            resources: caps.resources.clone(),
            resource_templates: caps.resource_templates.clone(),
            prompts: caps.prompts.clone(),
            error,
            auth_url,
            log: log.entries(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> StateKind {
        self.state.kind()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    #[must_use]
    pub fn tool(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|t| t.name == name)
    }
}

impl Default for McpSnapshot {
    fn default() -> Self {
        Self::build(
            &ConnectionState::NotConnected,
            &Capabilities::default(),
            &LogBuffer::new(1, false),
        )
    }
}
