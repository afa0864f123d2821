//! OAuth 2.1 authorization for remote MCP servers.
//!
//! - Metadata discovery (RFC 9728, RFC 8414) and dynamic client registration (RFC 7591)
//! - PKCE authorization code flow and token refresh
//! - Per-origin [`AuthRecord`] persistence
//! - Popup launching and callback relay from the redirect page back to the waiting client

pub mod callback;
mod config_dir;
pub mod discovery;
pub mod error;
pub mod flow;
pub mod pkce;
pub mod popup;
pub mod store;
pub mod types;

pub use {
    callback::{
        AuthCallback, CALLBACK_PATH, CallbackBus, CallbackServer, callback_router,
        on_mcp_authorization,
    },
    config_dir::default_store_path,
    discovery::{
        AuthorizationServerMetadata, ClientRegistrationResponse, DiscoveredEndpoints,
        ProtectedResourceMetadata, discover_endpoints, fetch_as_metadata, fetch_resource_metadata,
        origin_of, parse_www_authenticate, register_client,
    },
    error::{Context, Error, Result},
    flow::{AuthorizationRequest, OAuthFlow},
    popup::{
        BlockedPopup, DEFAULT_POPUP_FEATURES, PopupFeatures, PopupLauncher, PopupWindow,
        SystemBrowser,
    },
    store::{
        AuthRecord, AuthStore, FileAuthStore, MemoryAuthStore, PendingAuthorization,
        StoredRegistration,
    },
    types::{OAuthConfig, OAuthTokens, PkceChallenge, serialize_option_secret, serialize_secret},
};
