//! Standalone Rift harness server.
//!
//! Runs a mock or proxy `AsyncServer` over TCP, optionally dropping or
//! delaying selected message types, until Ctrl-C.
//!
//! Usage:
//!   rift-harness --listen 127.0.0.1:9000 --target 127.0.0.1:9001 --drop Heartbeat
//!   rift-harness --config harness.yaml --delay OrderCreated=250

use anyhow::Context;
use clap::Parser;
use rift_harness::config::{HarnessConfig, LogFormat, ServerConfig, TargetConfig};
use rift_harness::logging::init_tracing;
use rift_harness::transport::TcpTransport;
use rift_harness::{AsyncServer, Component, HookTarget};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "rift-harness")]
#[command(author, version, about = "Hook-driven mock and proxy server")]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "RIFT_HARNESS_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the configuration file
    #[arg(short, long)]
    listen: Option<String>,

    /// Forward to this address (proxy mode)
    #[arg(short, long)]
    target: Option<String>,

    /// Bound on establishing a session's outbound connection
    #[arg(long)]
    proxy_timeout_ms: Option<u64>,

    /// Drop every message of this type (repeatable)
    #[arg(long = "drop", value_name = "TYPE")]
    drops: Vec<String>,

    /// Delay messages of a type, as TYPE=MS (repeatable)
    #[arg(long = "delay", value_name = "TYPE=MS", value_parser = parse_delay)]
    delays: Vec<(String, u64)>,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,
}

fn parse_delay(raw: &str) -> Result<(String, u64), String> {
    let (message_type, ms) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected TYPE=MS, got '{raw}'"))?;
    if message_type.trim().is_empty() {
        return Err(format!("missing message type in '{raw}'"));
    }
    let ms = ms
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("invalid delay in '{raw}': {e}"))?;
    Ok((message_type.trim().to_string(), ms))
}

fn load_config(args: &Args) -> anyhow::Result<HarnessConfig> {
    let mut config = match args.config {
        Some(ref path) => HarnessConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => {
            let listen = args
                .listen
                .clone()
                .context("either --config or --listen is required")?;
            HarnessConfig {
                server: ServerConfig::mock(listen),
                executor: Default::default(),
                logging: Default::default(),
            }
        }
    };

    if let Some(ref listen) = args.listen {
        config.server.listen.address = listen.clone();
    }
    if let Some(ref target) = args.target {
        config.server.target = Some(TargetConfig::new(target.clone()));
    }
    if let Some(ms) = args.proxy_timeout_ms {
        config.server.proxy_connection_timeout_ms = ms;
    }
    if args.json_logs {
        config.logging.format = LogFormat::Json;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config.logging)?;

    let server = Arc::new(AsyncServer::new(
        "rift-harness",
        config.server.clone(),
        Arc::new(TcpTransport::new()),
    )?);

    for message_type in &args.drops {
        server.on_message(message_type.as_str()).drop().register_persistent();
        info!("Dropping '{}' messages", message_type);
    }
    for (message_type, ms) in &args.delays {
        server
            .on_message(message_type.as_str())
            .delay(Duration::from_millis(*ms))
            .register_persistent();
        info!("Delaying '{}' messages by {}ms", message_type, ms);
    }

    server.start().await?;
    tokio::signal::ctrl_c().await.ok();

    info!("Shutting down");
    let failures = server.unhandled_errors();
    if !failures.is_empty() {
        info!("{} unhandled hook error(s) during the run", failures.len());
    }
    server.stop().await?;
    Ok(())
}
