use std::{error::Error as StdError, time::Duration};

use {serde::Serialize, usemcp_common::FromMessage};

/// Failure of a single wire transport. Uniform across HTTP and SSE.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("event stream error: {0}")]
    Stream(String),
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("server requires authorization")]
    Unauthorized { www_authenticate: Option<String> },
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Map a reqwest failure, keeping timeouts distinct.
    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout)
        } else {
            Self::Network(err)
        }
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Coarse classification used by the state machine and surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    TransportError,
    AuthRequired,
    AuthError,
    CapabilityError,
    Timeout,
    Cancelled,
    NotConnected,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    UrlParse(#[from] url::ParseError),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    OAuth(#[from] usemcp_oauth::Error),
    /// The server answered with a JSON-RPC error object.
    #[error("'{method}' failed: {message} (code {code})")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },
    #[error("not connected: {0}")]
    NotConnected(String),
    #[error("{0} timed out")]
    Timeout(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("{message}")]
    Message { message: String },
    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn external<E>(context: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(TransportError::Unauthorized { .. }) => ErrorKind::AuthRequired,
            Self::Transport(TransportError::Timeout(_)) | Self::Timeout(_) => ErrorKind::Timeout,
            Self::Transport(_) | Self::UrlParse(_) => ErrorKind::TransportError,
            Self::OAuth(_) => ErrorKind::AuthError,
            Self::NotConnected(_) => ErrorKind::NotConnected,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Rpc { .. }
            | Self::SerdeJson(_)
            | Self::Io(_)
            | Self::Toml(_)
            | Self::Message { .. }
            | Self::External { .. } => ErrorKind::CapabilityError,
        }
    }

    /// Failures eligible for transport fallback and bounded retry.
    #[must_use]
    pub fn is_transport_level(&self) -> bool {
        matches!(
            self,
            Self::Transport(
                TransportError::Http { .. }
                    | TransportError::Stream(_)
                    | TransportError::Timeout(_)
                    | TransportError::Network(_)
                    | TransportError::Closed
            )
        )
    }

    /// The `WWW-Authenticate` challenge when the server asked for authorization.
    #[must_use]
    pub fn auth_challenge(&self) -> Option<Option<&str>> {
        match self {
            Self::Transport(TransportError::Unauthorized { www_authenticate }) => {
                Some(www_authenticate.as_deref())
            },
            _ => None,
        }
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

usemcp_common::impl_context!();
