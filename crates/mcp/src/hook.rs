//! `use_mcp`: build a manager from config and connect it right away.

use std::{ops::Deref, sync::Arc};

use {
    tracing::info,
    usemcp_oauth::{AuthStore, CallbackBus, PopupLauncher},
};

use crate::{
    capability::{Prompt, Resource, ResourceTemplate, Tool},
    config::McpConfig,
    error::Result,
    manager::McpManager,
    state::{ConnectionState, LogEntry},
};

/// A mounted manager. Derefs to [`McpManager`] for the actions.
pub struct UseMcp {
    manager: McpManager,
}

/// Build a manager with the default store, system browser and a fresh
/// callback bus, and start connecting.
pub fn use_mcp(config: McpConfig) -> Result<UseMcp> {
    Ok(UseMcp::mount(McpManager::builder(config).build()?))
}

/// Like [`use_mcp`] with the collaborators supplied by the host.
pub fn use_mcp_with(
    config: McpConfig,
    store: Arc<dyn AuthStore>,
    popup: Arc<dyn PopupLauncher>,
    bus: CallbackBus,
) -> Result<UseMcp> {
    let manager = McpManager::builder(config)
        .store(store)
        .popup(popup)
        .callback_bus(bus)
        .build()?;
    Ok(UseMcp::mount(manager))
}

impl UseMcp {
    #[must_use]
    pub fn mount(manager: McpManager) -> Self {
        info!(server = %manager.url(), "mounting MCP connection");
        manager.mount();
        Self { manager }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.manager.snapshot().state
    }

    #[must_use]
    pub fn tools(&self) -> Vec<Tool> {
        self.manager.snapshot().tools
    }

    #[must_use]
    pub fn resources(&self) -> Vec<Resource> {
        self.manager.snapshot().resources
    }

    #[must_use]
    pub fn resource_templates(&self) -> Vec<ResourceTemplate> {
        self.manager.snapshot().resource_templates
    }

    #[must_use]
    pub fn prompts(&self) -> Vec<Prompt> {
        self.manager.snapshot().prompts
    }

    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.manager.snapshot().error
    }

    #[must_use]
    pub fn auth_url(&self) -> Option<String> {
        self.manager.snapshot().auth_url
    }

    #[must_use]
    pub fn log(&self) -> Vec<LogEntry> {
        self.manager.snapshot().log
    }

    #[must_use]
    pub fn into_manager(self) -> McpManager {
        self.manager
    }
}

impl Deref for UseMcp {
    type Target = McpManager;

    fn deref(&self) -> &Self::Target {
        &self.manager
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::state::StateKind,
        std::time::Duration,
        usemcp_oauth::{BlockedPopup, MemoryAuthStore},
    };

    #[tokio::test]
    async fn mounting_starts_a_connection() {
        let hook = use_mcp_with(
            McpConfig {
                transport: crate::config::TransportMode::Http,
                ..McpConfig::new("http://127.0.0.1:1/mcp")
            },
            Arc::new(MemoryAuthStore::new()),
            Arc::new(BlockedPopup),
            CallbackBus::new(),
        )
        .unwrap();
        assert_ne!(hook.state(), ConnectionState::NotConnected);

        hook.wait_for(|s| s.kind() == StateKind::Failed, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(hook.error().is_some());
        assert!(hook.tools().is_empty());
        assert!(!hook.log().is_empty());
    }
}
