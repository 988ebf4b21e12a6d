//! hubrpc command line tool - talk to a hub from the shell.
//!
//! ```text
//! hubrpc invoke http://localhost:5000/chat Echo '"hello"'
//! hubrpc --transport long-polling stream http://localhost:5000/chat Counter 5 100
//! hubrpc listen http://localhost:5000/chat ReceiveMessage
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures_util::StreamExt;
use hubrpc::{HubConnection, HubConnectionBuilder, TransportKind};
use serde_json::Value;

// CLI
#[derive(Parser)]
#[command(name = "hubrpc")]
#[command(version)]
#[command(about = "Call hub methods and watch hub traffic from the command line")]
struct Cli {
    /// Transport to use (auto lets negotiation decide)
    #[arg(long, value_enum, default_value_t = TransportArg::Auto, global = true)]
    transport: TransportArg,

    /// Bearer token sent with every request
    #[arg(long, global = true)]
    access_token: Option<String>,

    /// Extra request header as NAME:VALUE (repeatable)
    #[arg(long = "header", value_parser = parse_header, global = true)]
    headers: Vec<(String, String)>,

    /// Connect straight to the WebSocket endpoint
    #[arg(long, global = true)]
    skip_negotiation: bool,

    /// Reconnect automatically when the connection drops
    #[arg(long, global = true)]
    reconnect: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum TransportArg {
    Auto,
    Websockets,
    Sse,
    LongPolling,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a hub method and print its result
    Invoke {
        /// Hub URL
        url: String,
        /// Hub method name
        method: String,
        /// Arguments (parsed as JSON, falling back to plain strings)
        args: Vec<String>,
    },
    /// Call a hub method without waiting for a result
    Send {
        /// Hub URL
        url: String,
        /// Hub method name
        method: String,
        /// Arguments (parsed as JSON, falling back to plain strings)
        args: Vec<String>,
    },
    /// Call a streaming hub method and print each item
    Stream {
        /// Hub URL
        url: String,
        /// Hub method name
        method: String,
        /// Arguments (parsed as JSON, falling back to plain strings)
        args: Vec<String>,
    },
    /// Print every invocation of the given client methods until Ctrl-C
    Listen {
        /// Hub URL
        url: String,
        /// Client method names to print
        #[arg(required = true)]
        methods: Vec<String>,
    },
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected NAME:VALUE, got '{raw}'"))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

fn parse_args(raw: &[String]) -> Vec<Value> {
    raw.iter()
        .map(|arg| serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.clone())))
        .collect()
}

fn connect_builder(cli: &Cli, url: &str) -> HubConnectionBuilder {
    let mut builder = HubConnection::builder()
        .with_url(url)
        .skip_negotiation(cli.skip_negotiation);

    builder = match cli.transport {
        TransportArg::Auto => builder,
        TransportArg::Websockets => builder.with_transports([TransportKind::WebSockets]),
        TransportArg::Sse => builder.with_transports([TransportKind::ServerSentEvents]),
        TransportArg::LongPolling => builder.with_transports([TransportKind::LongPolling]),
    };
    if let Some(token) = &cli.access_token {
        builder = builder.with_access_token(token.clone());
    }
    for (name, value) in &cli.headers {
        builder = builder.with_header(name.clone(), value.clone());
    }
    if cli.reconnect {
        builder = builder.with_automatic_reconnect();
    }
    builder
}

async fn run(cli: Cli) -> Result<()> {
    let url = match &cli.command {
        Commands::Invoke { url, .. }
        | Commands::Send { url, .. }
        | Commands::Stream { url, .. }
        | Commands::Listen { url, .. } => url.clone(),
    };
    let connection = connect_builder(&cli, &url).build()?;

    if let Commands::Listen { methods, .. } = &cli.command {
        for method in methods {
            let name = method.clone();
            connection.on(method, move |arguments: Vec<Value>| {
                let name = name.clone();
                async move {
                    println!("{name} {}", Value::Array(arguments));
                }
            });
        }
    }
    connection.on_reconnecting(|error| match error {
        Some(e) => log::warn!("Reconnecting: {}", e),
        None => log::warn!("Reconnecting"),
    });

    connection
        .start()
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;
    log::info!("Connected (id: {:?})", connection.connection_id());

    // Stop gracefully whatever the command's outcome.
    let outcome = execute(&connection, cli.command).await;
    connection.stop().await?;
    outcome
}

/// Run one command against a started connection.
async fn execute(connection: &HubConnection, command: Commands) -> Result<()> {
    match command {
        Commands::Invoke { method, args, .. } => {
            let result: Value = connection.invoke(&method, parse_args(&args)).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Commands::Send { method, args, .. } => {
            connection.send(&method, parse_args(&args)).await?;
            Ok(())
        }
        Commands::Stream { method, args, .. } => {
            let mut items = connection
                .stream::<Value, _>(&method, parse_args(&args))
                .await?;
            while let Some(item) = items.next().await {
                println!("{}", item?);
            }
            Ok(())
        }
        Commands::Listen { .. } => {
            let mut state = connection.subscribe_state();
            tokio::select! {
                result = tokio::signal::ctrl_c() => result.context("Failed to wait for Ctrl-C"),
                _ = state.wait_for(|state| *state == hubrpc::ConnectionState::Stopped) => {
                    anyhow::bail!("Connection closed by the server")
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp_secs()
        .init();

    run(Cli::parse()).await
}
