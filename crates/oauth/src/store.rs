use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use {
    serde::{Deserialize, Serialize},
    tracing::{debug, info, warn},
};

use crate::{
    Error, Result,
    config_dir::default_store_path,
    types::{OAuthConfig, OAuthTokens},
};

/// A dynamically registered client plus the endpoints it was registered
/// against, so token refresh works without repeating discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRegistration {
    pub client_id: String,
    pub redirect_uri: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Unix seconds.
    #[serde(default)]
    pub registered_at: u64,
}

impl StoredRegistration {
    #[must_use]
    pub fn oauth_config(&self) -> OAuthConfig {
        OAuthConfig {
            client_id: self.client_id.clone(),
            auth_url: self.authorization_endpoint.clone(),
            token_url: self.token_endpoint.clone(),
            redirect_uri: self.redirect_uri.clone(),
            resource: self.resource.clone(),
            scopes: self.scopes.clone(),
        }
    }
}

/// An authorization that was started but has not been exchanged yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAuthorization {
    pub state: String,
    pub code_verifier: String,
}

/// Everything persisted for one server origin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration: Option<StoredRegistration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingAuthorization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<OAuthTokens>,
}

impl AuthRecord {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registration.is_none() && self.pending.is_none() && self.tokens.is_none()
    }
}

/// Persistence for [`AuthRecord`]s keyed by server origin.
///
/// Shared between managers; writes are last-writer-wins.
pub trait AuthStore: Send + Sync {
    fn load(&self, origin: &str) -> Result<Option<AuthRecord>>;
    fn save(&self, origin: &str, record: &AuthRecord) -> Result<()>;
    /// Remove the record. Removing a missing origin is not an error; the
    /// return value says whether anything was deleted.
    fn delete(&self, origin: &str) -> Result<bool>;
    fn list(&self) -> Result<Vec<String>>;
}

// ── File store ──────────────────────────────────────────────────────────────

/// File-based store: one JSON object mapping origin to record, written 0600.
#[derive(Debug)]
pub struct FileAuthStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileAuthStore {
    /// Store at `<config dir>/usemcp/auth_records.json`.
    pub fn new() -> Result<Self> {
        let path = default_store_path()
            .ok_or_else(|| Error::message("could not determine a config directory"))?;
        Ok(Self::with_path(path))
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<HashMap<String, AuthRecord>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "auth store file not found");
                return Ok(HashMap::new());
            },
            Err(e) => return Err(e.into()),
        };
        if data.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&data).map_err(|source| {
            warn!(path = %self.path.display(), error = %source, "auth store parse failed");
            Error::external(
                format!("failed to parse auth store {}", self.path.display()),
                source,
            )
        })
    }

    fn write_map(&self, map: &HashMap<String, AuthRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let data = serde_json::to_string_pretty(map)?;
        std::fs::write(&self.path, data)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl AuthStore for FileAuthStore {
    fn load(&self, origin: &str) -> Result<Option<AuthRecord>> {
        let _guard = self.guard();
        let record = self.read_map()?.remove(origin);
        debug!(
            path = %self.path.display(),
            origin,
            found = record.is_some(),
            "auth record loaded"
        );
        Ok(record)
    }

    fn save(&self, origin: &str, record: &AuthRecord) -> Result<()> {
        let _guard = self.guard();
        let mut map = self.read_map()?;
        map.insert(origin.to_string(), record.clone());
        self.write_map(&map)?;
        info!(path = %self.path.display(), origin, "auth record saved");
        Ok(())
    }

    fn delete(&self, origin: &str) -> Result<bool> {
        let _guard = self.guard();
        let mut map = self.read_map()?;
        if map.remove(origin).is_none() {
            debug!(origin, "no auth record to delete");
            return Ok(false);
        }
        self.write_map(&map)?;
        info!(path = %self.path.display(), origin, "auth record deleted");
        Ok(true)
    }

    fn list(&self) -> Result<Vec<String>> {
        let _guard = self.guard();
        let mut origins: Vec<String> = self.read_map()?.into_keys().collect();
        origins.sort();
        Ok(origins)
    }
}

// ── In-memory store ─────────────────────────────────────────────────────────

/// Process-local store, for tests and ephemeral clients.
#[derive(Debug, Default)]
pub struct MemoryAuthStore {
    records: Mutex<HashMap<String, AuthRecord>>,
}

impl MemoryAuthStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, AuthRecord>> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl AuthStore for MemoryAuthStore {
    fn load(&self, origin: &str) -> Result<Option<AuthRecord>> {
        Ok(self.records().get(origin).cloned())
    }

    fn save(&self, origin: &str, record: &AuthRecord) -> Result<()> {
        self.records().insert(origin.to_string(), record.clone());
        Ok(())
    }

    fn delete(&self, origin: &str) -> Result<bool> {
        Ok(self.records().remove(origin).is_some())
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut origins: Vec<String> = self.records().keys().cloned().collect();
        origins.sort();
        Ok(origins)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, secrecy::Secret};

    fn record() -> AuthRecord {
        AuthRecord {
            registration: Some(StoredRegistration {
                client_id: "client-1".into(),
                redirect_uri: "http://127.0.0.1:3000/oauth/callback".into(),
                authorization_endpoint: "https://auth.example.com/authorize".into(),
                token_endpoint: "https://auth.example.com/token".into(),
                resource: Some("https://mcp.example.com".into()),
                scopes: vec!["mcp".into()],
                registered_at: 1_700_000_000,
            }),
            pending: None,
            tokens: Some(OAuthTokens {
                access_token: Secret::new("at".into()),
                refresh_token: Some(Secret::new("rt".into())),
                token_type: Some("Bearer".into()),
                scope: None,
                expires_at: Some(1_700_003_600),
            }),
        }
    }

    #[test]
    fn file_store_round_trips_by_origin() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAuthStore::with_path(dir.path().join("nested/auth.json"));

        assert!(store.load("https://mcp.example.com").unwrap().is_none());
        store.save("https://mcp.example.com", &record()).unwrap();
        store
            .save("https://other.example.com", &AuthRecord::default())
            .unwrap();

        let loaded = store.load("https://mcp.example.com").unwrap().unwrap();
        assert_eq!(loaded.registration, record().registration);
        assert_eq!(
            store.list().unwrap(),
            vec!["https://mcp.example.com", "https://other.example.com"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn file_store_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = FileAuthStore::with_path(dir.path().join("auth.json"));
        store.save("https://mcp.example.com", &record()).unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAuthStore::with_path(dir.path().join("auth.json"));
        store.save("https://mcp.example.com", &record()).unwrap();

        assert!(store.delete("https://mcp.example.com").unwrap());
        assert!(!store.delete("https://mcp.example.com").unwrap());
        assert!(store.load("https://mcp.example.com").unwrap().is_none());
    }

    #[test]
    fn delete_without_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAuthStore::with_path(dir.path().join("missing.json"));
        assert!(!store.delete("https://mcp.example.com").unwrap());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = FileAuthStore::with_path(path);
        assert!(store.load("https://mcp.example.com").is_err());
    }

    #[test]
    fn memory_store_behaves_like_file_store() {
        let store = MemoryAuthStore::new();
        store.save("https://mcp.example.com", &record()).unwrap();
        assert!(store.load("https://mcp.example.com").unwrap().is_some());
        assert!(store.delete("https://mcp.example.com").unwrap());
        assert!(!store.delete("https://mcp.example.com").unwrap());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn registration_converts_to_flow_config() {
        let config = record().registration.unwrap().oauth_config();
        assert_eq!(config.client_id, "client-1");
        assert_eq!(config.token_url, "https://auth.example.com/token");
        assert_eq!(config.resource.as_deref(), Some("https://mcp.example.com"));
    }

    #[test]
    fn empty_record_detection() {
        assert!(AuthRecord::default().is_empty());
        assert!(!record().is_empty());
    }
}
