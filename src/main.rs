//! Dialback CLI - Reach services behind NAT through a public broker
//!
//! `dialback broker` runs the public side, `dialback agent` runs next to the
//! service that cannot accept inbound connections.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialback_lib::{
    parse_duration, Address, AgentConfig, AgentConnector, Broker, BrokerConfig, BrokerServer,
    BrokerServerConfig, DialProxy, TcpForwarder, DEFAULT_REGISTRATION_PATH, TRANSPORT_TCP,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dialback - Reach services behind NAT through a public broker
#[derive(Parser, Debug)]
#[command(name = "dialback")]
#[command(about = "Dialback - Reach services behind NAT through a public broker")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info", env = "DIALBACK_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public broker that agents register with
    #[command(long_about = r#"
Run the public broker. Agents keep connections parked here under a name;
each dial for that name hands one of them out.

EXAMPLES:
  # Accept registrations on port 7000
  dialback broker --listen 0.0.0.0:7000

  # Also expose the agent named "db" on local port 5433
  dialback broker --listen 0.0.0.0:7000 --expose db=127.0.0.1:5433

ENVIRONMENT VARIABLES:
  DIALBACK_LISTEN        Broker listen address
  DIALBACK_PATH          Registration path
    "#)]
    Broker {
        /// Address to accept agent registrations on
        #[arg(short, long, default_value = "0.0.0.0:7000", env = "DIALBACK_LISTEN")]
        listen: SocketAddr,

        /// Registration path agents must use
        #[arg(long, default_value = DEFAULT_REGISTRATION_PATH, env = "DIALBACK_PATH")]
        path: String,

        /// Parked connections kept per name
        #[arg(long, default_value = "100")]
        queue_capacity: usize,

        /// How long a registration waits for a free slot (e.g. "2s", "500ms")
        #[arg(long, default_value = "2s", value_parser = parse_duration)]
        registration_timeout: Duration,

        /// How long a dial waits for a parked connection
        #[arg(long, default_value = "20s", value_parser = parse_duration)]
        dial_timeout: Duration,

        /// Expose a tunnel name on a local address (name=host:port, repeatable)
        #[arg(long = "expose", value_name = "NAME=ADDR", value_parser = parse_expose)]
        expose: Vec<(String, SocketAddr)>,
    },

    /// Register with a broker and forward tunnel connections to a local service
    #[command(long_about = r#"
Keep connections parked at a broker under a name and forward every dialed
connection to the target service.

EXAMPLES:
  # Make local PostgreSQL reachable as "db"
  dialback agent --broker relay.example.com:7000 --name db \
    --target 127.0.0.1:5432

ENVIRONMENT VARIABLES:
  DIALBACK_BROKER        Broker address
  DIALBACK_NAME          Tunnel name
  DIALBACK_TARGET        Target address to forward to
    "#)]
    Agent {
        /// Broker address (e.g., relay.example.com:7000)
        #[arg(long, env = "DIALBACK_BROKER")]
        broker: String,

        /// Name to register under
        #[arg(long, env = "DIALBACK_NAME")]
        name: String,

        /// Address every tunnel connection is forwarded to
        #[arg(long, env = "DIALBACK_TARGET")]
        target: String,

        /// Registration path on the broker
        #[arg(long, default_value = DEFAULT_REGISTRATION_PATH, env = "DIALBACK_PATH")]
        path: String,

        /// Connections kept parked at the broker (0 selects the default)
        #[arg(long, default_value = "10")]
        threads: usize,

        /// How long a dialed connection waits to be accepted
        #[arg(long, default_value = "2s", value_parser = parse_duration)]
        handoff_timeout: Duration,
    },
}

fn parse_expose(value: &str) -> Result<(String, SocketAddr), String> {
    let (name, addr) = value
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=ADDR, got '{}'", value))?;
    if name.is_empty() {
        return Err("tunnel name must not be empty".to_string());
    }
    let addr = addr
        .parse()
        .map_err(|e| format!("invalid address '{}': {}", addr, e))?;
    Ok((name.to_string(), addr))
}

/// Setup logging; RUST_LOG wins over the command line
fn setup_logging(verbose: bool, log_level: &str) {
    let log_level = if verbose {
        "info,dialback=debug,dialback_proto=debug,dialback_broker=debug,dialback_agent=debug"
    } else {
        log_level
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

async fn run_broker(
    listen: SocketAddr,
    config: BrokerConfig,
    expose: Vec<(String, SocketAddr)>,
) -> Result<()> {
    let broker = Arc::new(Broker::new(config));
    let server = BrokerServer::new(BrokerServerConfig { bind_addr: listen }, broker.clone());

    for (name, addr) in expose {
        let proxy = DialProxy::new(broker.clone(), name);
        tokio::spawn(async move {
            if let Err(e) = proxy.start(addr).await {
                error!(name = %proxy.name(), "Failed to expose tunnel: {}", e);
            }
        });
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let result = tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        result = server.start() => result.context("Broker server failed"),
    };

    broker.close().await;
    result
}

async fn run_agent(config: AgentConfig, target: String) -> Result<()> {
    let connector = AgentConnector::listen_with_config(config)
        .context("Failed to start agent connector")?;
    let forwarder = Arc::new(TcpForwarder::new(target));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let result = tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        result = forwarder.serve(&connector) => result.context("Agent stopped accepting"),
    };

    connector.close();
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, &cli.log_level);

    match cli.command {
        Commands::Broker {
            listen,
            path,
            queue_capacity,
            registration_timeout,
            dial_timeout,
            expose,
        } => {
            let config = BrokerConfig::default()
                .with_registration_path(path)
                .with_queue_capacity(queue_capacity)
                .with_registration_timeout(registration_timeout)
                .with_dial_timeout(dial_timeout);

            info!("Listen: {}", listen);
            info!("Registration path: {}", config.registration_path);
            run_broker(listen, config, expose).await
        }
        Commands::Agent {
            broker,
            name,
            target,
            path,
            threads,
            handoff_timeout,
        } => {
            let address = Address::for_name(TRANSPORT_TCP, broker, &path, &name);
            let config = AgentConfig::from_address(address)
                .with_threads(threads)
                .with_handoff_timeout(handoff_timeout);

            info!("Broker: {}", config.address);
            info!("Target address: {}", target);
            run_agent(config, target).await
        }
    }
}
