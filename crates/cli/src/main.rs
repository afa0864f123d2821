mod auth_commands;
mod mcp_commands;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    usemcp_common::telemetry::{LogFormat, init_tracing},
};

#[derive(Parser)]
#[command(name = "usemcp", about = "usemcp: talk to MCP servers from the terminal", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    #[command(flatten)]
    connection: mcp_commands::ConnectArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, authorizing if needed, and print what the server offers.
    Connect,
    /// List the server's tools.
    Tools,
    /// List the server's resources and resource templates.
    Resources,
    /// List the server's prompts.
    Prompts,
    /// Call a tool with JSON arguments.
    Call {
        tool: String,
        /// Arguments as a JSON object.
        #[arg(default_value = "{}")]
        arguments: String,
    },
    /// Read a resource by URI.
    Read { uri: String },
    /// Render a prompt.
    Prompt {
        name: String,
        /// Prompt argument as key=value. Repeatable.
        #[arg(long = "arg", value_parser = mcp_commands::parse_key_val)]
        args: Vec<(String, String)>,
    },
    /// Forget the stored authorization for the server given by --url.
    ClearAuth,
    /// Stored authorization management.
    Auth {
        #[command(subcommand)]
        action: auth_commands::AuthAction,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    init_tracing(&cli.log_level, format)?;

    info!(version = env!("CARGO_PKG_VERSION"), "usemcp starting");

    let args = cli.connection;
    match cli.command {
        Commands::Connect => mcp_commands::connect(&args).await,
        Commands::Tools => mcp_commands::tools(&args).await,
        Commands::Resources => mcp_commands::resources(&args).await,
        Commands::Prompts => mcp_commands::prompts(&args).await,
        Commands::Call { tool, arguments } => mcp_commands::call(&args, &tool, &arguments).await,
        Commands::Read { uri } => mcp_commands::read(&args, &uri).await,
        Commands::Prompt { name, args: pairs } => {
            mcp_commands::prompt(&args, &name, pairs).await
        },
        Commands::ClearAuth => {
            auth_commands::handle_auth(auth_commands::AuthAction::Logout, &args).await
        },
        Commands::Auth { action } => auth_commands::handle_auth(action, &args).await,
    }
}
