use {
    secrecy::Secret,
    serde::Deserialize,
    tracing::{debug, warn},
    url::Url,
};

use usemcp_common::time::unix_now_secs;

use crate::{
    Error, Result,
    pkce::{generate_pkce, generate_state},
    types::{OAuthConfig, OAuthTokens, PkceChallenge},
};

/// Manages the OAuth 2.0 authorization code flow with PKCE.
pub struct OAuthFlow {
    config: OAuthConfig,
    client: reqwest::Client,
}

/// Result of starting the OAuth flow.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub pkce: PkceChallenge,
    pub state: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl OAuthFlow {
    pub fn new(config: OAuthConfig) -> Self {
        Self::with_client(config, reqwest::Client::new())
    }

    pub fn with_client(config: OAuthConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Build the authorization URL and generate PKCE + state.
    pub fn start(&self) -> Result<AuthorizationRequest> {
        let pkce = generate_pkce();
        let state = generate_state();

        let mut url = Url::parse(&self.config.auth_url)
            .map_err(|source| Error::external("invalid authorization endpoint", source))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", &state);

        if let Some(resource) = &self.config.resource {
            url.query_pairs_mut().append_pair("resource", resource);
        }

        if !self.config.scopes.is_empty() {
            url.query_pairs_mut()
                .append_pair("scope", &self.config.scopes.join(" "));
        }

        Ok(AuthorizationRequest {
            url: url.to_string(),
            pkce,
            state,
        })
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange(&self, code: &str, verifier: &str) -> Result<OAuthTokens> {
        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", self.config.redirect_uri.clone()),
            ("client_id", self.config.client_id.clone()),
            ("code_verifier", verifier.to_string()),
        ];
        if let Some(resource) = &self.config.resource {
            form.push(("resource", resource.clone()));
        }

        debug!(token_url = %self.config.token_url, "exchanging authorization code");
        self.token_request(&form).await
    }

    /// Refresh an access token. Servers that don't rotate refresh tokens omit
    /// one from the response; the old one is carried over.
    pub async fn refresh(&self, refresh_token: &str) -> Result<OAuthTokens> {
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("client_id", self.config.client_id.clone()),
        ];
        if let Some(resource) = &self.config.resource {
            form.push(("resource", resource.clone()));
        }

        debug!(token_url = %self.config.token_url, "refreshing access token");
        let mut tokens = self.token_request(&form).await?;
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(Secret::new(refresh_token.to_string()));
        }
        Ok(tokens)
    }

    async fn token_request(&self, form: &[(&str, String)]) -> Result<OAuthTokens> {
        let resp = self
            .client
            .post(&self.config.token_url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            let rejected = match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(parsed) => Error::TokenRejected {
                    status: status.as_u16(),
                    error: parsed.error,
                    description: parsed.error_description,
                },
                Err(_) => Error::TokenRejected {
                    status: status.as_u16(),
                    error: "server_error".to_string(),
                    description: (!body.is_empty()).then_some(body),
                },
            };
            warn!(status = status.as_u16(), error = %rejected, "token request failed");
            return Err(rejected);
        }

        parse_token_response(&body)
    }
}

fn parse_token_response(body: &str) -> Result<OAuthTokens> {
    let resp: TokenResponse = serde_json::from_str(body)
        .map_err(|source| Error::external("invalid token response", source))?;

    let expires_at = resp
        .expires_in
        .map(|secs| unix_now_secs().saturating_add(secs));

    Ok(OAuthTokens {
        access_token: Secret::new(resp.access_token),
        refresh_token: resp.refresh_token.map(Secret::new),
        token_type: resp.token_type,
        scope: resp.scope,
        expires_at,
    })
}
