//! OAuth 2.1 metadata discovery for MCP servers.
//!
//! Implements:
//! - RFC 9728: OAuth 2.0 Protected Resource Metadata
//! - RFC 8414: OAuth 2.0 Authorization Server Metadata
//! - RFC 7591: OAuth 2.0 Dynamic Client Registration

use {
    reqwest::Client,
    serde::{Deserialize, Serialize},
    tracing::{debug, info},
    url::Url,
};

use crate::{Context, Error, Result};

// ── Protected Resource Metadata (RFC 9728) ─────────────────────────────────

/// Metadata returned by `/.well-known/oauth-protected-resource`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    /// The resource server's identifier (its base URL).
    pub resource: String,
    /// Authorization server(s) that can issue tokens for this resource.
    #[serde(default)]
    pub authorization_servers: Vec<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub bearer_methods_supported: Vec<String>,
}

/// Fetch protected resource metadata. `url` is either a full metadata URL
/// (from a `WWW-Authenticate` link) or a base URL the well-known suffix is
/// appended to.
pub async fn fetch_resource_metadata(
    client: &Client,
    url: &Url,
) -> Result<ProtectedResourceMetadata> {
    let target = if url.path().contains("/.well-known/") {
        url.clone()
    } else {
        build_well_known_url(url, "oauth-protected-resource")?
    };

    debug!(url = %target, "fetching protected resource metadata");

    let resp = client
        .get(target.as_str())
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(|source| Error::external("failed to fetch protected resource metadata", source))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::message(format!(
            "protected resource metadata returned HTTP {status}: {body}"
        )));
    }

    let meta: ProtectedResourceMetadata = resp
        .json()
        .await
        .map_err(|source| Error::external("failed to parse protected resource metadata", source))?;

    info!(resource = %meta.resource, servers = meta.authorization_servers.len(), "fetched resource metadata");

    Ok(meta)
}

// ── Authorization Server Metadata (RFC 8414) ───────────────────────────────

/// Metadata returned by `/.well-known/oauth-authorization-server`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    #[serde(default)]
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub response_types_supported: Vec<String>,
    #[serde(default)]
    pub grant_types_supported: Vec<String>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

/// Fetch authorization server metadata from `{as_url}/.well-known/oauth-authorization-server`.
pub async fn fetch_as_metadata(
    client: &Client,
    as_url: &Url,
) -> Result<AuthorizationServerMetadata> {
    let well_known = build_well_known_url(as_url, "oauth-authorization-server")?;

    debug!(url = %well_known, "fetching authorization server metadata");

    let resp = client
        .get(well_known.as_str())
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(|source| {
            Error::external("failed to fetch authorization server metadata", source)
        })?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::message(format!(
            "authorization server metadata returned HTTP {status}: {body}"
        )));
    }

    let meta: AuthorizationServerMetadata = resp.json().await.map_err(|source| {
        Error::external("failed to parse authorization server metadata", source)
    })?;

    info!(issuer = %meta.issuer, "fetched AS metadata");

    Ok(meta)
}

/// Endpoints resolved for one MCP server.
#[derive(Debug, Clone)]
pub struct DiscoveredEndpoints {
    pub metadata: AuthorizationServerMetadata,
    /// RFC 8707 resource indicator to request tokens for.
    pub resource: String,
    /// Scopes advertised by the resource (preferred) or the AS.
    pub scopes: Vec<String>,
}

/// Resolve the authorization server for `server_url`.
///
/// Order: the `resource_metadata` link from `WWW-Authenticate`, protected
/// resource metadata at the path-aware URL then at the origin, and finally
/// authorization server metadata directly at the server origin.
pub async fn discover_endpoints(
    client: &Client,
    server_url: &Url,
    www_authenticate: Option<&str>,
) -> Result<DiscoveredEndpoints> {
    let origin = origin_url(server_url);
    let has_path = server_url.path() != "/" && !server_url.path().is_empty();

    let resource_meta = if let Some(link) = www_authenticate.and_then(parse_www_authenticate) {
        debug!(url = %link, "using resource_metadata URL from WWW-Authenticate");
        let link = Url::parse(&link)
            .context("invalid resource_metadata URL in WWW-Authenticate header")?;
        fetch_resource_metadata(client, &link).await
    } else {
        let result = fetch_resource_metadata(client, server_url).await;
        if result.is_err() && has_path {
            fetch_resource_metadata(client, &origin).await.or(result)
        } else {
            result
        }
    };

    match resource_meta {
        Ok(resource_meta) => {
            let as_url_str = resource_meta
                .authorization_servers
                .first()
                .context("no authorization_servers in protected resource metadata")?;
            let as_url = Url::parse(as_url_str)
                .with_context(|| format!("invalid authorization server URL: {as_url_str}"))?;
            let metadata = fetch_as_metadata(client, &as_url).await?;
            let scopes = if resource_meta.scopes_supported.is_empty() {
                metadata.scopes_supported.clone()
            } else {
                resource_meta.scopes_supported.clone()
            };
            Ok(DiscoveredEndpoints {
                metadata,
                resource: resource_meta.resource,
                scopes,
            })
        },
        Err(e) => {
            debug!(
                server = %server_url,
                error = %e,
                "RFC 9728 resource metadata unavailable, trying RFC 8414 at origin"
            );
            let metadata = fetch_as_metadata(client, &origin).await?;
            let scopes = metadata.scopes_supported.clone();
            Ok(DiscoveredEndpoints {
                metadata,
                resource: origin_of(server_url),
                scopes,
            })
        },
    }
}

// ── Dynamic Client Registration (RFC 7591) ─────────────────────────────────

/// Request body for dynamic client registration.
#[derive(Debug, Clone, Serialize)]
pub struct ClientRegistrationRequest {
    pub redirect_uris: Vec<String>,
    pub client_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_uri: Option<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub token_endpoint_auth_method: String,
}

/// Successful registration response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRegistrationResponse {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub client_id_issued_at: Option<u64>,
    #[serde(default)]
    pub client_secret_expires_at: Option<u64>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

/// Register a public client (no secret, `token_endpoint_auth_method = none`).
pub async fn register_client(
    client: &Client,
    registration_endpoint: &str,
    redirect_uris: Vec<String>,
    client_name: &str,
    client_uri: Option<&str>,
) -> Result<ClientRegistrationResponse> {
    debug!(endpoint = %registration_endpoint, client_name, "registering dynamic OAuth client");

    let req = ClientRegistrationRequest {
        redirect_uris,
        client_name: client_name.to_string(),
        client_uri: client_uri.map(ToString::to_string),
        grant_types: vec![
            "authorization_code".to_string(),
            "refresh_token".to_string(),
        ],
        response_types: vec!["code".to_string()],
        token_endpoint_auth_method: "none".to_string(),
    };

    let resp = client
        .post(registration_endpoint)
        .header("Content-Type", "application/json")
        .json(&req)
        .send()
        .await
        .map_err(|source| Error::external("failed to register OAuth client", source))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::message(format!(
            "dynamic client registration returned HTTP {status}: {body}"
        )));
    }

    let reg: ClientRegistrationResponse = resp.json().await.map_err(|source| {
        Error::external("failed to parse client registration response", source)
    })?;

    info!(client_id = %reg.client_id, "registered dynamic OAuth client");

    Ok(reg)
}

// ── WWW-Authenticate header parsing ────────────────────────────────────────

/// Parse the `resource_metadata` URL from a `WWW-Authenticate: Bearer ...` header.
#[must_use]
pub fn parse_www_authenticate(header: &str) -> Option<String> {
    let stripped = header
        .strip_prefix("Bearer")
        .or_else(|| header.strip_prefix("bearer"))?;

    stripped
        .split(',')
        .map(str::trim)
        .filter_map(|part| {
            let (key, value) = part.split_once('=')?;
            (key.trim() == "resource_metadata").then(|| value.trim().trim_matches('"'))
        })
        .find(|value| !value.is_empty())
        .map(ToString::to_string)
}

// ── Helpers ────────────────────────────────────────────────────────────────

/// `scheme://host[:port]` of a URL, without a trailing slash. This is the key
/// auth records are stored under.
#[must_use]
pub fn origin_of(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}://{host}:{port}", url.scheme()),
        (Some(host), None) => format!("{}://{host}", url.scheme()),
        _ => url.to_string(),
    }
}

fn origin_url(url: &Url) -> Url {
    let mut origin = url.clone();
    origin.set_path("/");
    origin.set_query(None);
    origin.set_fragment(None);
    origin
}

/// Build a `/.well-known/<suffix>` URL following RFC 8615 path conventions.
fn build_well_known_url(base: &Url, suffix: &str) -> Result<Url> {
    let mut url = base.clone();
    url.set_query(None);
    url.set_fragment(None);
    if !url.path().ends_with('/') {
        url.set_path(&format!("{}/", url.path()));
    }
    url.join(&format!(".well-known/{suffix}"))
        .map_err(|source| {
            Error::external(
                format!("failed to build .well-known/{suffix} URL from {base}"),
                source,
            )
        })
}
