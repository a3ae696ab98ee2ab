use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use wyoming_edge::{
    BusEvent, Connectable, Endpoint, EventKind, HandlerSet, Server, ServiceConfig,
};
use wyoming_protocol::WyomingClient;

#[derive(Parser)]
#[command(name = "wyoming-edge")]
#[command(about = "Wyoming protocol server and one-shot client")]
#[command(long_about = "
Wyoming protocol server and one-shot client.

EXAMPLES:
  # Serve on the default URI (or $WYOMING_URI)
  wyoming-edge serve

  # Serve on two ports with a 5 second handler timeout
  wyoming-edge serve --uri tcp://0.0.0.0:10300 --uri tcp://127.0.0.1:10301 --handler-timeout-ms 5000

  # Check a running service
  wyoming-edge ping --address 127.0.0.1:10300
  wyoming-edge describe --address tcp://127.0.0.1:10300
")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a server until Ctrl+C
    Serve {
        /// URI to listen on, may be repeated (overrides WYOMING_URI)
        #[arg(long = "uri")]
        uris: Vec<String>,

        /// Give up on a handler call after this many milliseconds
        #[arg(long)]
        handler_timeout_ms: Option<u64>,
    },
    /// Send a ping and print the pong text
    Ping {
        /// Server address, host:port or tcp://host:port
        #[arg(long, default_value = "127.0.0.1:10300")]
        address: String,

        #[arg(long)]
        text: Option<String>,
    },
    /// Print the server's capability description as JSON
    Describe {
        /// Server address, host:port or tcp://host:port
        #[arg(long, default_value = "127.0.0.1:10300")]
        address: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Command::Serve {
            uris,
            handler_timeout_ms,
        } => serve(uris, handler_timeout_ms).await,
        Command::Ping { address, text } => {
            let address = socket_address(&address)?;
            let pong = tokio::task::spawn_blocking(move || {
                WyomingClient::connect(&address)?.ping(text)
            })
            .await??;
            match pong {
                Some(pong) => println!("🏓 {}", pong.text.unwrap_or_default()),
                None => anyhow::bail!("server closed the connection without answering"),
            }
            Ok(())
        }
        Command::Describe { address } => {
            let address = socket_address(&address)?;
            let info = tokio::task::spawn_blocking(move || {
                WyomingClient::connect(&address)?.describe()
            })
            .await??
            .context("server closed the connection without describing itself")?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
    }
}

async fn serve(uris: Vec<String>, handler_timeout_ms: Option<u64>) -> anyhow::Result<()> {
    let mut config = ServiceConfig::load()?;
    if !uris.is_empty() {
        config.endpoints = uris
            .iter()
            .map(|uri| Endpoint::parse_uri(uri))
            .collect::<Result<_, _>>()?;
    }
    if let Some(millis) = handler_timeout_ms {
        config.handler_timeout = Some(Duration::from_millis(millis));
    }

    info!("🚀 Initializing wyoming-edge");
    let server = Server::with_options(
        config.adapters(),
        HandlerSet::new(),
        config.server_options(),
    )?;
    server.on(
        EventKind::Error,
        Arc::new(|event: &BusEvent| {
            if let BusEvent::Error(e) = event {
                warn!("⚠️ {}", e);
            }
        }),
    );

    server.start().await?;
    for endpoint in &config.endpoints {
        info!("🎧 Serving on {}", endpoint);
    }
    println!("   Press Ctrl+C to exit");

    tokio::signal::ctrl_c().await?;
    info!("🛑 Received shutdown signal");
    server.stop().await?;
    Ok(())
}

/// Accept both `host:port` and `tcp://host:port`
fn socket_address(address: &str) -> anyhow::Result<String> {
    if address.contains("://") {
        Ok(Endpoint::parse_uri(address)?.address())
    } else {
        Ok(address.to_string())
    }
}
