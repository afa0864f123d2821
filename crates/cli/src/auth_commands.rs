use {
    anyhow::{Context, Result},
    clap::Subcommand,
    usemcp::McpConfig,
    usemcp_common::time::unix_now_secs,
    usemcp_oauth::{AuthStore, FileAuthStore, origin_of},
};

use crate::mcp_commands::{self, ConnectArgs};

#[derive(Subcommand)]
pub enum AuthAction {
    /// Authorize against the server given by --url.
    Login,
    /// Show stored authorization for every server.
    Status,
    /// Forget the stored authorization for the server given by --url.
    Logout,
}

pub async fn handle_auth(action: AuthAction, args: &ConnectArgs) -> Result<()> {
    match action {
        AuthAction::Login => mcp_commands::connect(args).await,
        AuthAction::Status => status(args),
        AuthAction::Logout => logout(args),
    }
}

fn store_for(config: &McpConfig) -> Result<FileAuthStore> {
    Ok(match &config.storage_path {
        Some(path) => FileAuthStore::with_path(path.clone()),
        None => FileAuthStore::new()?,
    })
}

fn status(args: &ConnectArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => McpConfig::load(path)?,
        None => McpConfig::default(),
    };
    let store = store_for(&config)?;
    let origins = store.list()?;
    if origins.is_empty() {
        println!("No stored authorizations ({}).", store.path().display());
        return Ok(());
    }

    let now = unix_now_secs();
    for origin in origins {
        let Some(record) = store.load(&origin)? else {
            continue;
        };
        let client = record
            .registration
            .as_ref()
            .map_or("unregistered", |r| r.client_id.as_str());
        let tokens = match &record.tokens {
            Some(t) if t.expires_within(now, 0) => match t.refresh_token {
                Some(_) => "expired (refreshable)".to_string(),
                None => "expired".to_string(),
            },
            Some(t) => match t.expires_at {
                Some(at) => format!("valid for {}s", at.saturating_sub(now)),
                None => "valid".to_string(),
            },
            None => "no tokens".to_string(),
        };
        let pending = if record.pending.is_some() {
            ", authorization pending"
        } else {
            ""
        };
        println!("  {origin}: client {client}, {tokens}{pending}");
    }
    Ok(())
}

fn logout(args: &ConnectArgs) -> Result<()> {
    let config = mcp_commands::load_config(args)?;
    let url = config.server_url()?;
    let origin = origin_of(&url);
    let store = store_for(&config)?;
    let removed = store
        .delete(&origin)
        .with_context(|| format!("failed to update {}", store.path().display()))?;
    if removed {
        println!("Removed stored authorization for {origin}");
    } else {
        println!("Nothing stored for {origin}");
    }
    Ok(())
}
