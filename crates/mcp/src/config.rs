//! Manager configuration: TOML file, `${VAR}` substitution and `USEMCP_*`
//! environment overrides.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use {
    serde::{Deserialize, Serialize},
    tracing::debug,
    url::Url,
    usemcp_oauth::DEFAULT_POPUP_FEATURES,
};

use crate::{
    error::{Context, Error, Result},
    transport::TransportKind,
};

/// Which transports the manager may try.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Streamable HTTP, then SSE when `sse_fallback` is on.
    #[default]
    Auto,
    Http,
    Sse,
}

impl std::str::FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "http" => Ok(Self::Http),
            "sse" => Ok(Self::Sse),
            other => Err(format!(
                "unknown transport '{other}' (expected auto, http or sse)"
            )),
        }
    }
}

/// Capped exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let delay = self.initial_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    /// MCP server endpoint.
    pub url: String,
    pub transport: TransportMode,
    /// Record debug-level entries in the snapshot log.
    pub debug: bool,
    /// Retry a failed initial connect with the retry policy.
    pub auto_retry: bool,
    /// Reconnect after a ready session drops.
    pub auto_reconnect: bool,
    /// Let `auto` fall back from streamable HTTP to SSE.
    pub sse_fallback: bool,
    /// `window.open`-style features for the authorization popup.
    pub popup_features: String,
    /// Skip the popup on the connect made at mount.
    pub prevent_auto_auth: bool,
    pub client_name: String,
    pub client_uri: Option<String>,
    /// Redirect URI registered with the authorization server.
    pub callback_url: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub retry: RetryPolicy,
    pub auth_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub log_capacity: usize,
    /// Auth store file; defaults to the user config directory.
    pub storage_path: Option<PathBuf>,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            transport: TransportMode::Auto,
            debug: false,
            auto_retry: false,
            auto_reconnect: true,
            sse_fallback: true,
            popup_features: DEFAULT_POPUP_FEATURES.to_string(),
            prevent_auto_auth: false,
            client_name: "usemcp".to_string(),
            client_uri: None,
            callback_url: None,
            headers: BTreeMap::new(),
            retry: RetryPolicy::default(),
            auth_timeout_secs: 300,
            request_timeout_secs: 30,
            log_capacity: 500,
            storage_path: None,
        }
    }
}

impl McpConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Parse TOML after replacing `${VAR}` placeholders from the environment.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let substituted = substitute_env_with(raw, |name| std::env::var(name).ok());
        Ok(toml::from_str(&substituted)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        debug!(path = %path.display(), "loaded usemcp config");
        Self::from_toml_str(&raw)
    }

    /// Apply `USEMCP_URL`, `USEMCP_TRANSPORT` and `USEMCP_DEBUG`.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_env(|name| std::env::var(name).ok())
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup("USEMCP_URL").filter(|v| !v.trim().is_empty()) {
            self.url = url.trim().to_string();
        }
        if let Some(transport) = lookup("USEMCP_TRANSPORT") {
            self.transport = transport.parse().map_err(Error::message)?;
        }
        if let Some(debug) = lookup("USEMCP_DEBUG") {
            self.debug = matches!(
                debug.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        Ok(())
    }

    pub fn server_url(&self) -> Result<Url> {
        if self.url.trim().is_empty() {
            return Err(Error::message("no MCP server URL configured"));
        }
        Url::parse(self.url.trim()).with_context(|| format!("invalid MCP server URL '{}'", self.url))
    }

    /// Transports to try, in order.
    #[must_use]
    pub fn transport_order(&self) -> Vec<TransportKind> {
        match self.transport {
            TransportMode::Http => vec![TransportKind::Http],
            TransportMode::Sse => vec![TransportKind::Sse],
            TransportMode::Auto if self.sse_fallback => {
                vec![TransportKind::Http, TransportKind::Sse]
            },
            TransportMode::Auto => vec![TransportKind::Http],
        }
    }

    #[must_use]
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Replace `${NAME}` with `lookup(NAME)`. Unknown names stay literal.
fn substitute_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if end > 0 => {
                let name = &after[..end];
                match lookup(name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    },
                }
                rest = &after[end + 1..];
            },
            _ => {
                out.push_str("${");
                rest = after;
            },
        }
    }
    out.push_str(rest);
    out
}
