mod demo;

use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::{SinkExt, StreamExt};
use popcorn_protocol::{handshake, Frame};
use popcorn_server::{sender, ServerConfig, SubscribePolicy};
use popcorn_telemetry::{init_telemetry, TelemetryConfig};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "popcorn", version, about = "Live state-tree broker")]
struct Cli {
    /// Log as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the broker.
    Serve {
        /// JSON config file.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        app_port: Option<u16>,
        #[arg(long)]
        client_port: Option<u16>,
        #[arg(long)]
        admin_port: Option<u16>,
        /// Keep subscriptions to unknown machines until they are provided.
        #[arg(long)]
        pending_subscriptions: bool,
    },
    /// Send one transaction to the app port.
    Send {
        #[arg(long, default_value = "127.0.0.1:8001")]
        addr: String,
        /// Do not wait for a reply.
        #[arg(long)]
        fire_and_forget: bool,
        /// Transaction file, or `-` for stdin.
        #[arg(default_value = "-")]
        file: String,
    },
    /// Run the demo producer.
    Demo {
        #[arg(long, default_value = "127.0.0.1:8001")]
        addr: String,
        #[arg(long, default_value_t = 2)]
        interval_secs: u64,
    },
    /// Subscribe to a machine and print every frame.
    Watch {
        #[arg(long, default_value = "127.0.0.1:8000")]
        addr: String,
        machine: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let telemetry = init_telemetry(TelemetryConfig {
        json: cli.json_logs,
        ..TelemetryConfig::default()
    });

    match cli.command {
        Command::Serve {
            config,
            host,
            app_port,
            client_port,
            admin_port,
            pending_subscriptions,
        } => {
            let mut config = match config {
                Some(path) => ServerConfig::load(&path)?,
                None => ServerConfig::default(),
            };
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = app_port {
                config.app_port = port;
            }
            if let Some(port) = client_port {
                config.client_port = port;
            }
            if admin_port.is_some() {
                config.admin_port = admin_port;
            }
            if pending_subscriptions {
                config.subscribe_policy = SubscribePolicy::Pending;
            }
            serve(config, telemetry.metrics()).await
        }
        Command::Send {
            addr,
            fire_and_forget,
            file,
        } => {
            let payload = read_payload(&file)?;
            if fire_and_forget {
                sender::fire_and_forget(&addr, &payload).await?;
            } else {
                sender::send_one_shot(&addr, &payload).await?;
                println!("ok");
            }
            Ok(())
        }
        Command::Demo {
            addr,
            interval_secs,
        } => {
            let cancel = CancellationToken::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                ctrl_c.cancel();
            });
            demo::run(&addr, Duration::from_secs(interval_secs.max(1)), cancel).await
        }
        Command::Watch { addr, machine } => watch(&addr, &machine).await,
    }
}

async fn serve(
    config: ServerConfig,
    metrics: Option<std::sync::Arc<popcorn_telemetry::MetricsRecorder>>,
) -> anyhow::Result<()> {
    let handle = popcorn_server::start(config, metrics)
        .await
        .context("starting server")?;
    tracing::info!(
        app = %handle.app_addr,
        client = %handle.client_addr,
        "popcorn ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl-c")?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

fn read_payload(file: &str) -> anyhow::Result<String> {
    if file == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading stdin")?;
        Ok(buf)
    } else {
        std::fs::read_to_string(file).with_context(|| format!("reading {file}"))
    }
}

async fn watch(addr: &str, machine: &str) -> anyhow::Result<()> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to {addr}"))?;
    let mut ws = handshake::connect(stream, addr, &format!("/{machine}")).await?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                ws.send(Frame::close(popcorn_protocol::frame::CLOSE_NORMAL, "")).await.ok();
                break;
            }
            frame = ws.next() => match frame.transpose()? {
                Some(Frame::Text(text)) => println!("{text}\n"),
                Some(Frame::Ping(data)) => ws.send(Frame::Pong(data)).await?,
                Some(Frame::Pong(_)) => {}
                Some(Frame::Close { code, reason }) => {
                    tracing::info!(?code, reason = %reason, "server closed connection");
                    break;
                }
                None => break,
            },
        }
    }
    Ok(())
}
