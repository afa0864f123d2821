use std::{net::SocketAddr, path::PathBuf, time::Duration};

use {
    anyhow::{Context, Result, anyhow, bail},
    clap::Args,
    tracing::{debug, info},
    usemcp::{McpConfig, McpManager, McpSnapshot, StateKind, TransportMode, types::ToolContent},
    usemcp_oauth::{CallbackBus, CallbackServer},
};

/// Callback listener port used when `--callback-port` is not given. Fixed so
/// the registered redirect URI stays the same across runs.
const DEFAULT_CALLBACK_PORT: u16 = 33418;

#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// MCP server URL.
    #[arg(long, global = true, env = "USEMCP_URL")]
    pub url: Option<String>,
    /// TOML config file.
    #[arg(long, global = true, env = "USEMCP_CONFIG")]
    pub config: Option<PathBuf>,
    /// Transport: auto, http or sse.
    #[arg(long, global = true)]
    pub transport: Option<TransportMode>,
    /// Do not fall back to SSE when streamable HTTP fails.
    #[arg(long, global = true, default_value_t = false)]
    pub no_sse_fallback: bool,
    /// Port for the local OAuth callback listener.
    #[arg(long, global = true, default_value_t = DEFAULT_CALLBACK_PORT)]
    pub callback_port: u16,
    /// Seconds to wait for the connection, including authorization.
    #[arg(long, global = true, default_value_t = 120)]
    pub wait_secs: u64,
    /// Record debug entries in the connection log.
    #[arg(long, global = true, default_value_t = false)]
    pub debug: bool,
}

/// Config file, then `USEMCP_*` variables, then flags.
pub fn load_config(args: &ConnectArgs) -> Result<McpConfig> {
    let mut config = match &args.config {
        Some(path) => McpConfig::load(path)?,
        None => McpConfig::default(),
    };
    config.apply_env_overrides()?;

    if let Some(url) = &args.url {
        config.url = url.clone();
    }
    if let Some(transport) = args.transport {
        config.transport = transport;
    }
    if args.no_sse_fallback {
        config.sse_fallback = false;
    }
    if args.debug {
        config.debug = true;
    }
    if config.url.trim().is_empty() {
        bail!("no server URL; pass --url or set USEMCP_URL");
    }
    Ok(config)
}

pub fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// A ready manager plus the callback listener its redirects land on.
struct Connection {
    manager: McpManager,
    callback: CallbackServer,
}

impl Connection {
    async fn open(args: &ConnectArgs) -> Result<Self> {
        let mut config = load_config(args)?;
        let bus = CallbackBus::new();
        let callback =
            CallbackServer::bind(SocketAddr::from(([127, 0, 0, 1], args.callback_port)), bus.clone())
                .await?;
        if config.callback_url.is_none() {
            config.callback_url = Some(callback.redirect_uri());
        }
        debug!(redirect_uri = ?config.callback_url, "callback listener ready");

        let manager = McpManager::builder(config).callback_bus(bus).build()?;
        manager.connect();

        let conn = Self { manager, callback };
        match wait_ready(&conn.manager, Duration::from_secs(args.wait_secs)).await {
            Ok(_) => Ok(conn),
            Err(e) => {
                conn.close().await;
                Err(e)
            },
        }
    }

    async fn close(self) {
        self.manager.disconnect().await;
        self.callback.shutdown().await;
    }
}

/// Follow the snapshot until ready or failed, printing the authorization
/// link once when the popup could not be opened.
async fn wait_ready(manager: &McpManager, timeout: Duration) -> Result<McpSnapshot> {
    let mut rx = manager.subscribe();
    let deadline = tokio::time::Instant::now() + timeout;
    let mut announced = false;

    loop {
        let snapshot = rx.borrow_and_update().clone();
        match snapshot.kind() {
            StateKind::Ready => return Ok(snapshot),
            StateKind::Failed => {
                return Err(anyhow!(
                    "{}: {}",
                    manager.url(),
                    snapshot.error.unwrap_or_default()
                ));
            },
            StateKind::PendingAuth => {
                if let Some(url) = snapshot.auth_url.as_deref()
                    && !announced
                {
                    eprintln!("Could not open a browser. Open this link to authorize:\n{url}");
                    announced = true;
                }
            },
            _ => {},
        }

        tokio::time::timeout_at(deadline, rx.changed())
            .await
            .with_context(|| format!("timed out connecting to {} ({})", manager.url(), snapshot.state))?
            .context("connection manager stopped")?;
    }
}

pub async fn connect(args: &ConnectArgs) -> Result<()> {
    let conn = Connection::open(args).await?;
    let snapshot = conn.manager.snapshot();

    if let Some(init) = conn.manager.server_info() {
        println!(
            "Connected to {} {} ({})",
            init.server_info.name,
            init.server_info.version.as_deref().unwrap_or(""),
            snapshot.state
        );
        if let Some(instructions) = init.instructions {
            println!("\n{instructions}\n");
        }
    }
    println!("  tools:              {}", snapshot.tools.len());
    println!("  resources:          {}", snapshot.resources.len());
    println!("  resource templates: {}", snapshot.resource_templates.len());
    println!("  prompts:            {}", snapshot.prompts.len());

    conn.close().await;
    Ok(())
}

pub async fn tools(args: &ConnectArgs) -> Result<()> {
    let conn = Connection::open(args).await?;
    let snapshot = conn.manager.snapshot();
    if snapshot.tools.is_empty() {
        println!("No tools.");
    }
    for tool in &snapshot.tools {
        println!("  {}: {}", tool.name, tool.description.as_deref().unwrap_or(""));
    }
    conn.close().await;
    Ok(())
}

pub async fn resources(args: &ConnectArgs) -> Result<()> {
    let conn = Connection::open(args).await?;
    let snapshot = conn.manager.snapshot();
    if snapshot.resources.is_empty() && snapshot.resource_templates.is_empty() {
        println!("No resources.");
    }
    for resource in &snapshot.resources {
        println!(
            "  {} ({}) {}",
            resource.uri,
            resource.name,
            resource.mime_type.as_deref().unwrap_or("")
        );
    }
    for template in &snapshot.resource_templates {
        println!("  {} ({}) [template]", template.uri_template, template.name);
    }
    conn.close().await;
    Ok(())
}

pub async fn prompts(args: &ConnectArgs) -> Result<()> {
    let conn = Connection::open(args).await?;
    let snapshot = conn.manager.snapshot();
    if snapshot.prompts.is_empty() {
        println!("No prompts.");
    }
    for prompt in &snapshot.prompts {
        let arguments: Vec<String> = prompt
            .arguments
            .iter()
            .map(|a| {
                if a.required {
                    a.name.clone()
                } else {
                    format!("{}?", a.name)
                }
            })
            .collect();
        println!(
            "  {}({}): {}",
            prompt.name,
            arguments.join(", "),
            prompt.description.as_deref().unwrap_or("")
        );
    }
    conn.close().await;
    Ok(())
}

pub async fn call(args: &ConnectArgs, tool: &str, arguments: &str) -> Result<()> {
    let arguments: serde_json::Value =
        serde_json::from_str(arguments).context("tool arguments must be JSON")?;
    if !arguments.is_object() {
        bail!("tool arguments must be a JSON object");
    }

    let conn = Connection::open(args).await?;
    info!(tool, "calling tool");
    let result = conn.manager.call_tool(tool, arguments).await;
    conn.close().await;
    let result = result?;

    let text = result.text();
    if result.is_error {
        bail!("{tool} reported an error: {text}");
    }
    if !text.is_empty() {
        println!("{text}");
    }
    if let Some(structured) = &result.structured_content {
        println!("{}", serde_json::to_string_pretty(structured)?);
    }
    Ok(())
}

pub async fn read(args: &ConnectArgs, uri: &str) -> Result<()> {
    let conn = Connection::open(args).await?;
    let result = conn.manager.read_resource(uri).await;
    conn.close().await;

    for contents in result?.contents {
        match (contents.text, contents.blob) {
            (Some(text), _) => println!("{text}"),
            (None, Some(blob)) => println!(
                "<{} base64 characters of {}>",
                blob.len(),
                contents.mime_type.as_deref().unwrap_or("binary data")
            ),
            (None, None) => println!("<empty {}>", contents.uri),
        }
    }
    Ok(())
}

pub async fn prompt(args: &ConnectArgs, name: &str, pairs: Vec<(String, String)>) -> Result<()> {
    let arguments = (!pairs.is_empty()).then(|| {
        pairs
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect::<serde_json::Map<_, _>>()
    });

    let conn = Connection::open(args).await?;
    let result = conn.manager.get_prompt(name, arguments).await;
    conn.close().await;
    let result = result?;

    if let Some(description) = &result.description {
        println!("# {description}");
    }
    for message in &result.messages {
        match &message.content {
            ToolContent::Text { text } => println!("[{}] {text}", message.role),
            other => println!("[{}] {}", message.role, serde_json::to_string(other)?),
        }
    }
    Ok(())
}
