//! OAuth 2.1 provider for one MCP server origin.
//!
//! Follows the MCP authorization flow (2025-06-18): resource and
//! authorization server metadata discovery, dynamic client registration,
//! then a PKCE authorization code flow driven by the redirect callback.
//! Everything it learns is persisted in the [`AuthStore`] under the origin.

use std::sync::Arc;

use {
    secrecy::{ExposeSecret, Secret},
    tracing::{debug, info, warn},
    url::Url,
};

use {
    usemcp_common::time::unix_now_secs,
    usemcp_oauth::{
        AuthRecord, AuthStore, AuthorizationRequest, Context, Error, OAuthFlow, OAuthTokens,
        PendingAuthorization, Result, StoredRegistration, discover_endpoints, origin_of,
        register_client,
    },
};

/// Access tokens this close to expiry are refreshed before use.
pub const EXPIRY_SKEW_SECS: u64 = 60;

pub struct McpOAuthProvider {
    server_url: Url,
    origin: String,
    store: Arc<dyn AuthStore>,
    http: reqwest::Client,
    client_name: String,
    client_uri: Option<String>,
}

impl McpOAuthProvider {
    pub fn new(
        server_url: Url,
        store: Arc<dyn AuthStore>,
        http: reqwest::Client,
        client_name: impl Into<String>,
        client_uri: Option<String>,
    ) -> Self {
        let origin = origin_of(&server_url);
        Self {
            server_url,
            origin,
            store,
            http,
            client_name: client_name.into(),
            client_uri,
        }
    }

    /// Storage key for this server.
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    fn record(&self) -> Result<AuthRecord> {
        Ok(self.store.load(&self.origin)?.unwrap_or_default())
    }

    fn persist(&self, record: &AuthRecord) -> Result<()> {
        if record.is_empty() {
            self.store.delete(&self.origin)?;
            Ok(())
        } else {
            self.store.save(&self.origin, record)
        }
    }

    /// A usable access token, refreshing it first when it is about to expire.
    ///
    /// Returns `None` when there is nothing to send; a failed refresh drops
    /// the stored tokens so the next attempt authorizes from scratch.
    pub async fn access_token(&self) -> Result<Option<Secret<String>>> {
        let record = self.record()?;
        let Some(tokens) = &record.tokens else {
            return Ok(None);
        };
        if !tokens.expires_within(unix_now_secs(), EXPIRY_SKEW_SECS) {
            return Ok(Some(tokens.access_token.clone()));
        }

        debug!(origin = %self.origin, "access token expiring, refreshing");
        self.refresh_record(record).await
    }

    /// Force a refresh after the server rejected the current token.
    pub async fn refresh(&self) -> Result<Option<Secret<String>>> {
        let record = self.record()?;
        if record.tokens.is_none() {
            return Ok(None);
        }
        self.refresh_record(record).await
    }

    async fn refresh_record(&self, mut record: AuthRecord) -> Result<Option<Secret<String>>> {
        let refresh_token = record
            .tokens
            .as_ref()
            .and_then(|t| t.refresh_token.clone());

        let refreshed = match (refresh_token, &record.registration) {
            (Some(refresh_token), Some(registration)) => {
                let flow = OAuthFlow::with_client(registration.oauth_config(), self.http.clone());
                match flow.refresh(refresh_token.expose_secret()).await {
                    Ok(tokens) => Some(tokens),
                    Err(e) => {
                        warn!(origin = %self.origin, error = %e, "token refresh failed");
                        None
                    },
                }
            },
            _ => {
                debug!(origin = %self.origin, "no refresh token or registration, dropping tokens");
                None
            },
        };

        let access = refreshed.as_ref().map(|t| t.access_token.clone());
        if access.is_some() {
            info!(origin = %self.origin, "access token refreshed");
        }
        record.tokens = refreshed;
        self.persist(&record)?;
        Ok(access)
    }

    /// Discover endpoints, register if needed and build the authorization URL.
    ///
    /// An existing registration is reused when it was made for the same
    /// redirect URI and token endpoint. The PKCE verifier and state are
    /// persisted so completion can happen from a fresh provider.
    pub async fn start(
        &self,
        redirect_uri: &str,
        www_authenticate: Option<&str>,
    ) -> Result<AuthorizationRequest> {
        let endpoints = discover_endpoints(&self.http, &self.server_url, www_authenticate).await?;
        debug!(
            origin = %self.origin,
            issuer = %endpoints.metadata.issuer,
            auth_endpoint = %endpoints.metadata.authorization_endpoint,
            token_endpoint = %endpoints.metadata.token_endpoint,
            registration = ?endpoints.metadata.registration_endpoint,
            resource = %endpoints.resource,
            "resolved OAuth endpoints"
        );

        let mut record = self.record()?;
        let registration = match record.registration.take() {
            Some(existing)
                if existing.redirect_uri == redirect_uri
                    && existing.token_endpoint == endpoints.metadata.token_endpoint =>
            {
                debug!(origin = %self.origin, client_id = %existing.client_id, "reusing client registration");
                existing
            },
            _ => {
                let registration_endpoint = endpoints
                    .metadata
                    .registration_endpoint
                    .as_deref()
                    .context("authorization server does not support dynamic client registration")?;
                let registered = register_client(
                    &self.http,
                    registration_endpoint,
                    vec![redirect_uri.to_string()],
                    &self.client_name,
                    self.client_uri.as_deref(),
                )
                .await?;
                StoredRegistration {
                    client_id: registered.client_id,
                    redirect_uri: redirect_uri.to_string(),
                    authorization_endpoint: endpoints.metadata.authorization_endpoint.clone(),
                    token_endpoint: endpoints.metadata.token_endpoint.clone(),
                    resource: Some(endpoints.resource.clone()),
                    scopes: endpoints.scopes.clone(),
                    registered_at: unix_now_secs(),
                }
            },
        };

        let flow = OAuthFlow::with_client(registration.oauth_config(), self.http.clone());
        let request = flow.start()?;

        record.registration = Some(registration);
        record.pending = Some(PendingAuthorization {
            state: request.state.clone(),
            code_verifier: request.pkce.verifier.clone(),
        });
        self.persist(&record)?;

        info!(origin = %self.origin, "authorization flow started");
        Ok(request)
    }

    /// Exchange the authorization code and store the tokens.
    pub async fn complete(&self, state: &str, code: &str) -> Result<OAuthTokens> {
        let mut record = self.record()?;
        let pending = record.pending.take().context("no authorization in progress")?;
        if pending.state != state {
            return Err(Error::StateMismatch);
        }
        let registration = record
            .registration
            .as_ref()
            .context("authorization in progress without a client registration")?;

        let flow = OAuthFlow::with_client(registration.oauth_config(), self.http.clone());
        let tokens = match flow.exchange(code, &pending.code_verifier).await {
            Ok(tokens) => tokens,
            Err(e) => {
                self.persist(&record)?;
                return Err(e);
            },
        };

        record.tokens = Some(tokens.clone());
        self.persist(&record)?;
        info!(origin = %self.origin, "authorization complete");
        Ok(tokens)
    }

    /// Forget the pending verifier and state, keeping registration and tokens.
    pub fn abandon_pending(&self) -> Result<()> {
        let mut record = self.record()?;
        if record.pending.take().is_some() {
            self.persist(&record)?;
        }
        Ok(())
    }

    /// Remove everything stored for this origin. Returns whether anything was there.
    pub fn clear(&self) -> Result<bool> {
        self.store.delete(&self.origin)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, mockito::Matcher, usemcp_oauth::MemoryAuthStore};

    const REDIRECT: &str = "http://127.0.0.1:9000/oauth/callback";

    fn provider(server: &mockito::Server, store: Arc<dyn AuthStore>) -> McpOAuthProvider {
        let url = Url::parse(&format!("{}/mcp", server.url())).unwrap();
        McpOAuthProvider::new(url, store, reqwest::Client::new(), "usemcp-test", None)
    }

    async fn mock_metadata(server: &mut mockito::Server) -> Vec<mockito::Mock> {
        let base = server.url();
        vec![
            server
                .mock("GET", "/mcp/.well-known/oauth-protected-resource")
                .with_status(404)
                .create_async()
                .await,
            server
                .mock("GET", "/.well-known/oauth-protected-resource")
                .with_status(200)
                .with_header("content-type", "application/json")
                .with_body(
                    serde_json::json!({
                        "resource": format!("{base}/mcp"),
                        "authorization_servers": [base],
                        "scopes_supported": ["mcp"],
                    })
                    .to_string(),
                )
                .create_async()
                .await,
            server
                .mock("GET", "/.well-known/oauth-authorization-server")
                .with_status(200)
                .with_header("content-type", "application/json")
                .with_body(
                    serde_json::json!({
                        "issuer": base,
                        "authorization_endpoint": format!("{base}/authorize"),
                        "token_endpoint": format!("{base}/token"),
                        "registration_endpoint": format!("{base}/register"),
                    })
                    .to_string(),
                )
                .create_async()
                .await,
        ]
    }

    fn stored_tokens(expires_at: Option<u64>, refresh: Option<&str>) -> OAuthTokens {
        OAuthTokens {
            access_token: Secret::new("at-old".into()),
            refresh_token: refresh.map(|r| Secret::new(r.to_string())),
            token_type: Some("Bearer".into()),
            scope: None,
            expires_at,
        }
    }

    fn registration(server: &mockito::Server) -> StoredRegistration {
        StoredRegistration {
            client_id: "client-1".into(),
            redirect_uri: REDIRECT.into(),
            authorization_endpoint: format!("{}/authorize", server.url()),
            token_endpoint: format!("{}/token", server.url()),
            resource: None,
            scopes: Vec::new(),
            registered_at: 1,
        }
    }

    #[tokio::test]
    async fn no_record_means_no_token() {
        let server = mockito::Server::new_async().await;
        let provider = provider(&server, Arc::new(MemoryAuthStore::new()));
        assert!(provider.access_token().await.unwrap().is_none());
        assert!(provider.refresh().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fresh_token_returned_without_network() {
        let server = mockito::Server::new_async().await;
        let store = Arc::new(MemoryAuthStore::new());
        let provider = provider(&server, store.clone());
        store
            .save(provider.origin(), &AuthRecord {
                tokens: Some(stored_tokens(Some(unix_now_secs() + 3600), None)),
                ..Default::default()
            })
            .unwrap();

        let token = provider.access_token().await.unwrap().unwrap();
        assert_eq!(token.expose_secret(), "at-old");
    }

    #[tokio::test]
    async fn expiring_token_is_refreshed_and_saved() {
        let mut server = mockito::Server::new_async().await;
        let refresh = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded(
                "grant_type".into(),
                "refresh_token".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"at-new","expires_in":3600}"#)
            .create_async()
            .await;

        let store = Arc::new(MemoryAuthStore::new());
        let provider = provider(&server, store.clone());
        store
            .save(provider.origin(), &AuthRecord {
                registration: Some(registration(&server)),
                tokens: Some(stored_tokens(Some(unix_now_secs() + 10), Some("rt-1"))),
                ..Default::default()
            })
            .unwrap();

        let token = provider.access_token().await.unwrap().unwrap();
        assert_eq!(token.expose_secret(), "at-new");
        refresh.assert_async().await;

        let saved = store.load(provider.origin()).unwrap().unwrap();
        let tokens = saved.tokens.unwrap();
        assert_eq!(tokens.access_token.expose_secret(), "at-new");
        assert_eq!(
            tokens.refresh_token.unwrap().expose_secret(),
            "rt-1",
            "refresh token carried over"
        );
    }

    #[tokio::test]
    async fn failed_refresh_drops_tokens_but_keeps_registration() {
        let mut server = mockito::Server::new_async().await;
        let _refresh = server
            .mock("POST", "/token")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let store = Arc::new(MemoryAuthStore::new());
        let provider = provider(&server, store.clone());
        store
            .save(provider.origin(), &AuthRecord {
                registration: Some(registration(&server)),
                tokens: Some(stored_tokens(Some(1), Some("rt-1"))),
                ..Default::default()
            })
            .unwrap();

        assert!(provider.access_token().await.unwrap().is_none());
        let saved = store.load(provider.origin()).unwrap().unwrap();
        assert!(saved.tokens.is_none());
        assert!(saved.registration.is_some());
    }

    #[tokio::test]
    async fn start_registers_and_complete_exchanges() {
        let mut server = mockito::Server::new_async().await;
        let _meta = mock_metadata(&mut server).await;
        let register = server
            .mock("POST", "/register")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "redirect_uris": [REDIRECT],
                "client_name": "usemcp-test",
                "token_endpoint_auth_method": "none",
            })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"client_id":"dyn-client"}"#)
            .expect(1)
            .create_async()
            .await;
        let token = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "code-1".into()),
                Matcher::UrlEncoded("client_id".into(), "dyn-client".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"at-1","refresh_token":"rt-1","expires_in":3600}"#)
            .create_async()
            .await;

        let store = Arc::new(MemoryAuthStore::new());
        let provider = provider(&server, store.clone());
        let request = provider.start(REDIRECT, None).await.unwrap();

        let url = Url::parse(&request.url).unwrap();
        let query: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(url.path(), "/authorize");
        assert_eq!(query["client_id"], "dyn-client");
        assert_eq!(query["code_challenge_method"], "S256");
        assert_eq!(query["state"], request.state);
        assert_eq!(query["scope"], "mcp");
        let pending = store.load(provider.origin()).unwrap().unwrap().pending;
        assert_eq!(pending.unwrap().state, request.state);

        // A second start reuses the registration.
        let second = provider.start(REDIRECT, None).await.unwrap();
        register.assert_async().await;

        let tokens = provider.complete(&second.state, "code-1").await.unwrap();
        assert_eq!(tokens.access_token.expose_secret(), "at-1");
        token.assert_async().await;

        let saved = store.load(provider.origin()).unwrap().unwrap();
        assert!(saved.pending.is_none());
        assert_eq!(saved.registration.unwrap().client_id, "dyn-client");
        assert_eq!(
            provider.access_token().await.unwrap().unwrap().expose_secret(),
            "at-1"
        );
    }

    #[tokio::test]
    async fn complete_rejects_foreign_state() {
        let server = mockito::Server::new_async().await;
        let store = Arc::new(MemoryAuthStore::new());
        let provider = provider(&server, store.clone());
        store
            .save(provider.origin(), &AuthRecord {
                registration: Some(registration(&server)),
                pending: Some(PendingAuthorization {
                    state: "expected".into(),
                    code_verifier: "v".into(),
                }),
                tokens: None,
            })
            .unwrap();

        let err = provider.complete("other", "code").await.unwrap_err();
        assert!(matches!(err, Error::StateMismatch));
        let saved = store.load(provider.origin()).unwrap().unwrap();
        assert_eq!(saved.pending.unwrap().state, "expected");
    }

    #[tokio::test]
    async fn missing_registration_endpoint_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let _resource = server
            .mock("GET", Matcher::Regex("oauth-protected-resource".into()))
            .with_status(404)
            .create_async()
            .await;
        let _as = server
            .mock("GET", "/.well-known/oauth-authorization-server")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                serde_json::json!({
                    "issuer": base,
                    "authorization_endpoint": format!("{base}/authorize"),
                    "token_endpoint": format!("{base}/token"),
                })
                .to_string(),
            )
            .create_async()
            .await;

        let provider = provider(&server, Arc::new(MemoryAuthStore::new()));
        let err = provider.start(REDIRECT, None).await.unwrap_err();
        assert!(err.to_string().contains("dynamic client registration"));
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let server = mockito::Server::new_async().await;
        let store = Arc::new(MemoryAuthStore::new());
        let provider = provider(&server, store.clone());
        store
            .save(provider.origin(), &AuthRecord {
                tokens: Some(stored_tokens(None, None)),
                ..Default::default()
            })
            .unwrap();

        assert!(provider.clear().unwrap());
        assert!(!provider.clear().unwrap());
        assert!(provider.access_token().await.unwrap().is_none());
    }
}
