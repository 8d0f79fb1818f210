//! Switchyard gateway binary.
//!
//! Loads the TOML configuration, builds the server and serves until
//! interrupted. SIGHUP triggers a registry hot-reload: the config file
//! is re-read, re-validated and the catalog snapshot swapped atomically
//! while in-flight requests finish against the old one.

use std::net::SocketAddr;

use clap::Parser;

use switchyard_gateway::{create_server, reload_registry, Config};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Override the configured server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the configured bind address
    #[arg(long)]
    host: Option<String>,

    /// Logging filter, e.g. "info" or "switchyard_core=debug"
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    let mut config = Config::load(&args.config)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    let (app, state) = create_server(config)?;

    #[cfg(unix)]
    {
        let state = state.clone();
        let config_path = args.config.clone();
        tokio::spawn(async move {
            let mut hangup = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::hangup(),
            ) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::error!(error = %e, "failed to install SIGHUP handler");
                    return;
                }
            };
            while hangup.recv().await.is_some() {
                if let Err(e) = reload_registry(&state, &config_path) {
                    tracing::error!(error = %e, "config reload failed; keeping old snapshot");
                }
            }
        });
    }

    tracing::info!(%addr, "starting switchyard gateway");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    Ok(())
}
