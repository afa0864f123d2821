//! Pieces shared by the HTTP and SSE transports.

use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

use {
    reqwest::{Client, RequestBuilder, Response},
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

use crate::{error::TransportError, types::PROTOCOL_VERSION};

pub(crate) const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
pub(crate) const MCP_SESSION_ID_HEADER: &str = "Mcp-Session-Id";
pub(crate) const STREAMABLE_ACCEPT_HEADER: &str = "application/json, text/event-stream";
pub(crate) const EVENT_STREAM: &str = "text/event-stream";

/// Which wire transport a session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Streamable HTTP: one POST round trip per message.
    Http,
    /// Legacy HTTP+SSE: a GET event stream plus a POST endpoint.
    Sse,
}

impl TransportKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Sse => "sse",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "sse" => Ok(Self::Sse),
            other => Err(format!("unknown transport '{other}' (expected http or sse)")),
        }
    }
}

/// Per-connection settings handed to a transport when it is opened.
#[derive(Clone)]
pub struct TransportOptions {
    pub client: Client,
    /// Extra headers attached to every request.
    pub headers: BTreeMap<String, String>,
    pub bearer: Option<Secret<String>>,
    pub request_timeout: Duration,
}

impl TransportOptions {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            headers: BTreeMap::new(),
            bearer: None,
            request_timeout: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn with_bearer(mut self, token: Option<Secret<String>>) -> Self {
        self.bearer = token;
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Protocol version, custom headers and `Authorization`.
    pub(crate) fn apply(&self, mut req: RequestBuilder) -> RequestBuilder {
        req = req.header(MCP_PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION);
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(token) = &self.bearer {
            req = req.header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", token.expose_secret()),
            );
        }
        req
    }
}

impl fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportOptions")
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("bearer", &self.bearer.as_ref().map(|_| "[REDACTED]"))
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

pub(crate) fn www_authenticate(resp: &Response) -> Option<String> {
    resp.headers()
        .get(reqwest::header::WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

pub(crate) fn is_event_stream(resp: &Response) -> bool {
    resp.headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|ct| ct.split(';').next())
        .is_some_and(|base| base.trim().eq_ignore_ascii_case(EVENT_STREAM))
}

/// Turn a non-success response into the matching error. 401 keeps its
/// challenge; everything else carries status and body.
pub(crate) async fn error_for_status(resp: Response) -> Result<Response, TransportError> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(TransportError::Unauthorized {
            www_authenticate: www_authenticate(&resp),
        });
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(TransportError::Http {
            status: status.as_u16(),
            body,
        });
    }
    Ok(resp)
}
