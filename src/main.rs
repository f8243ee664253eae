//! mcp-voice: command-line MCP client
//!
//! Connects to an MCP server (or the built-in simulator), then runs one
//! command: inspect the server, call a tool, read a resource, or stream a
//! transcription session.
//!
//! Usage:
//!   mcp-voice info                                  # Server name, version, tools
//!   mcp-voice --server ws://host:8080 tools         # Tool names only
//!   mcp-voice call createNote --params '{"title":"a","content":"b"}'
//!   mcp-voice resource notes://welcome
//!   mcp-voice --simulate transcribe --chunks 10     # Simulated speech session

use std::path::PathBuf;

use anyhow::{Context, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use mcp_client::{ClientConfig, McpClient};
use mcp_protocol::{EventCategory, McpEvent, ToolParameters};
use mcp_sim::{RandomFaults, SimServer};
use mcp_transport::{McpTransport, TranscriptionBackend, WsTransport, WsTransportConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mcp-voice", about = "MCP client with streaming transcription")]
struct Cli {
    /// Server URL (overrides the settings file)
    #[arg(long)]
    server: Option<String>,

    /// Settings file (defaults to ~/.mcp-voice/settings.json when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Talk to the in-process simulated server instead of a real one
    #[arg(long)]
    simulate: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Write logs to a file (defaults to ~/.mcp-voice/logs/client.log if no path given)
    #[arg(long, default_missing_value = "DEFAULT", num_args = 0..=1)]
    log_file: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print server metadata
    Info,
    /// List the tools the server offers
    Tools,
    /// Invoke a tool
    Call {
        name: String,
        /// Tool parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,
        /// Make a single attempt
        #[arg(long)]
        no_retry: bool,
    },
    /// Read a resource
    Resource { uri: String },
    /// Stream silent audio through a transcription session
    Transcribe {
        #[arg(long, default_value = "5")]
        chunks: usize,
        /// Bytes per chunk
        #[arg(long, default_value = "3200")]
        chunk_size: usize,
    },
}

fn init_logging(verbose: bool, log_file: Option<&str>) -> anyhow::Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    if let Some(log_file_arg) = log_file {
        let log_path = if log_file_arg == "DEFAULT" {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".mcp-voice/logs/client.log")
        } else {
            PathBuf::from(log_file_arg)
        };

        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();

        eprintln!("Logging to {}", log_path.display());
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_file.as_deref())?;

    let mut config = ClientConfig::load_or_default(cli.config.as_deref())?;
    if let Some(server) = cli.server {
        config.server_url = server;
    }

    if cli.simulate {
        info!("Using the simulated server");
        run(McpClient::new(SimServer::new(RandomFaults::default()), config), cli.command).await
    } else {
        run(McpClient::new(WsTransport::new(WsTransportConfig::default()), config), cli.command).await
    }
}

async fn run<T>(client: McpClient<T>, command: Command) -> anyhow::Result<()>
where
    T: McpTransport + TranscriptionBackend,
{
    let errors = client.subscribe(EventCategory::Error, |event| {
        if let McpEvent::Error(e) = event {
            warn!("Server error event: [{}] {}", e.code, e.message);
        }
    });

    let url = client.config().server_url.clone();
    if !client.connect().await? {
        bail!("{url} declined the connection");
    }

    let outcome = execute(&client, command).await;

    errors.unsubscribe();
    if let Err(e) = client.disconnect().await {
        warn!("{e}");
    }
    client.cleanup().await;
    outcome
}

async fn execute<T>(client: &McpClient<T>, command: Command) -> anyhow::Result<()>
where
    T: McpTransport + TranscriptionBackend,
{
    match command {
        Command::Info => {
            let info = client.get_server_info().await.context("Server info unavailable")?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Tools => {
            for name in client.list_tool_names().await {
                println!("{name}");
            }
        }
        Command::Call { name, params, no_retry } => {
            let params: ToolParameters =
                serde_json::from_str(&params).context("--params must be a JSON object")?;
            let response = client.call_tool_with(&name, &params, !no_retry).await?;
            println!("{}", response.joined_text());
        }
        Command::Resource { uri } => {
            let response = client.request_resource(&uri).await?;
            for content in response.contents {
                println!("{}", content.text);
            }
        }
        Command::Transcribe { chunks, chunk_size } => {
            let mut session = client.start_session().await?;
            let id = session.id().to_string();
            info!("Streaming {chunks} chunks of {chunk_size} bytes to {id}");

            for _ in 0..chunks {
                client.send_chunk(&id, Bytes::from(vec![0u8; chunk_size])).await?;
            }
            let ended = client.end_session(&id).await;

            while let Some(event) = session.next_event().await {
                println!("{}", serde_json::to_string(&event)?);
            }

            let result = ended?;
            println!();
            println!("  Transcription: {}", result.transcription);
            if let Some(target) = result.target_system {
                println!("  Target:        {target}");
            }
            if let Some(operation) = result.operation {
                println!("  Operation:     {operation}");
            }
        }
    }
    Ok(())
}
