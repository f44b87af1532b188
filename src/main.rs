use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use heartline::config::HeartlineConfig;
use heartline::gateway::GatewayServer;
use heartline::push::{HandleUnavailable, HttpRegistrationClient, PushRegistrar, StaticHandle};
use heartline::realtime::{realtime_endpoint, RealtimeConnectionManager, RealtimeEvent, WsTransport};

#[derive(Parser, Debug)]
#[command(name = "heartline", version, about = "Heartline admission gateway and client resilience tools")]
struct Cli {
    /// Configuration file (YAML or TOML)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the rate-limiting gateway in front of the API
    Serve {
        #[arg(long)]
        listen: Option<SocketAddr>,
        #[arg(long)]
        upstream: Option<String>,
    },
    /// Register a device push handle for a session
    RegisterPush {
        /// REST base URL, e.g. https://api.heartline.app/api
        #[arg(long)]
        base_url: Option<String>,
        /// Session auth token
        #[arg(long)]
        token: String,
        /// Device push handle; without one registration is skipped
        #[arg(long)]
        push_token: Option<String>,
    },
    /// Hold a realtime connection open and print what arrives
    Listen {
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        token: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = HeartlineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { listen, upstream } => {
            if let Some(listen) = listen {
                config.server.listen_addr = listen;
            }
            if let Some(upstream) = upstream {
                config.server.upstream_url = upstream;
            }

            info!("Starting Heartline gateway");
            GatewayServer::new(config)
                .serve_with_shutdown(shutdown_signal())
                .await?;
            info!("Heartline gateway stopped");
        }
        Command::RegisterPush {
            base_url,
            token,
            push_token,
        } => {
            let push = config.push;
            let base_url = base_url.unwrap_or(push.base_url.clone());
            let client = HttpRegistrationClient::new(&base_url, push.request_timeout())?;
            let provider = match push_token {
                Some(handle) => StaticHandle::new(handle),
                None => StaticHandle::unavailable(HandleUnavailable::Unsupported),
            };

            let registrar = PushRegistrar::new(
                Arc::new(provider),
                Arc::new(client),
                push.backoff(),
                push.max_attempts,
            );
            let outcome = registrar.register_now(&token).await;
            info!(?outcome, "Push registration finished");
        }
        Command::Listen { base_url, token } => {
            let realtime = config.realtime;
            let base_url = base_url.unwrap_or(config.push.base_url);
            let endpoint = realtime_endpoint(&base_url, &realtime.strip_suffix);

            let manager = RealtimeConnectionManager::new(
                &endpoint,
                Arc::new(WsTransport::new(&realtime.ws_path, realtime.connect_timeout())),
                realtime.backoff(),
                realtime.max_attempts,
            );
            let mut events = manager.subscribe();
            manager.connect(&token);
            info!(endpoint = %endpoint, "Listening for realtime events");

            let shutdown = shutdown_signal();
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    event = events.recv() => match event {
                        Ok(RealtimeEvent::Message(text)) => println!("{}", text),
                        Ok(RealtimeEvent::Status(status)) => info!(?status, "Connection status changed"),
                        Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped realtime events"),
                        Err(RecvError::Closed) => break,
                    },
                }
            }

            manager.disconnect();
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
