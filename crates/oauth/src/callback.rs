//! Relay for the OAuth redirect: the page (or local route) that receives the
//! redirect publishes an [`AuthCallback`] on a [`CallbackBus`], and the flow
//! waiting on that bus picks out the message carrying its `state`.

use std::{collections::HashMap, net::SocketAddr};

use {
    axum::{Router, extract::Query, response::Html, routing::get},
    serde::{Deserialize, Serialize},
    tokio::{
        net::TcpListener,
        sync::{broadcast, oneshot},
        task::JoinHandle,
    },
    tracing::{debug, info, warn},
    url::Url,
};

use crate::{Context, Error, Result};

/// Route that receives the authorization server redirect.
pub const CALLBACK_PATH: &str = "/oauth/callback";

const BUS_CAPACITY: usize = 16;

/// One redirect, as relayed to the waiting flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCallback {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl AuthCallback {
    /// Build from redirect query parameters. `None` without a `state`.
    #[must_use]
    pub fn from_query(params: &HashMap<String, String>) -> Option<Self> {
        let state = params.get("state").filter(|s| !s.is_empty())?.clone();
        Some(Self {
            state,
            code: params.get("code").cloned(),
            error: params.get("error").cloned(),
            error_description: params.get("error_description").cloned(),
        })
    }

    /// Parse a full redirect URL (`...?code=...&state=...`).
    pub fn from_redirect_url(url: &str) -> Result<Self> {
        let url = Url::parse(url)?;
        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        Self::from_query(&params).context("authorization redirect is missing the state parameter")
    }

    /// The authorization code, or the error the server redirected with.
    pub fn into_code(self) -> Result<String> {
        if let Some(error) = self.error {
            return Err(Error::AuthorizationDenied {
                error,
                description: self.error_description,
            });
        }
        self.code
            .filter(|c| !c.is_empty())
            .context("authorization redirect carried neither a code nor an error")
    }
}

/// Broadcast channel carrying [`AuthCallback`]s to every waiting flow.
#[derive(Debug, Clone)]
pub struct CallbackBus {
    tx: broadcast::Sender<AuthCallback>,
}

impl CallbackBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish a callback. Returns how many subscribers received it.
    pub fn publish(&self, callback: AuthCallback) -> usize {
        debug!(state = %callback.state, has_code = callback.code.is_some(), "relaying OAuth callback");
        self.tx.send(callback).unwrap_or(0)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AuthCallback> {
        self.tx.subscribe()
    }
}

impl Default for CallbackBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the redirect URL the callback page was loaded with and relay it.
pub fn on_mcp_authorization(url: &str, bus: &CallbackBus) -> Result<()> {
    let callback = AuthCallback::from_redirect_url(url)?;
    if bus.publish(callback) == 0 {
        warn!("OAuth callback received but no flow is waiting for it");
    }
    Ok(())
}

/// `GET /oauth/callback` relaying to `bus` and rendering a closing page.
pub fn callback_router(bus: CallbackBus) -> Router {
    Router::new().route(
        CALLBACK_PATH,
        get(move |Query(params): Query<HashMap<String, String>>| {
            let bus = bus.clone();
            async move {
                let Some(callback) = AuthCallback::from_query(&params) else {
                    return Html(page(
                        "Authentication failed",
                        "The redirect did not include a state parameter.",
                    ));
                };
                let failure = callback.error.clone().map(|error| {
                    match callback.error_description.as_deref() {
                        Some(description) => format!("{error}: {description}"),
                        None => error,
                    }
                });
                bus.publish(callback);
                match failure {
                    Some(reason) => Html(page("Authentication failed", &reason)),
                    None => Html(page(
                        "Authentication successful",
                        "You can close this window and return to the application.",
                    )),
                }
            }
        }),
    )
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!doctype html><html><head><title>{title}</title></head>\
         <body><h1>{title}</h1><p>{}</p></body></html>",
        escape_html(body)
    )
}

fn escape_html(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '<' => "&lt;".to_string(),
            '>' => "&gt;".to_string(),
            '&' => "&amp;".to_string(),
            '"' => "&quot;".to_string(),
            '\'' => "&#39;".to_string(),
            other => other.to_string(),
        })
        .collect()
}

// ── Local callback server ───────────────────────────────────────────────────

/// Loopback HTTP server hosting [`callback_router`], for native clients that
/// have no page of their own to receive the redirect.
pub struct CallbackServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl CallbackServer {
    /// Bind `addr` (e.g. `127.0.0.1:0`) and start serving.
    pub async fn bind(addr: SocketAddr, bus: CallbackBus) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let app = callback_router(bus);
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "OAuth callback server exited");
            }
        });

        info!(addr = %local_addr, "OAuth callback server listening");
        Ok(Self {
            local_addr,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Redirect URI to register with the authorization server.
    pub fn redirect_uri(&self) -> String {
        format!("http://{}{CALLBACK_PATH}", self.local_addr)
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
