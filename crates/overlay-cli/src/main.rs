//! overlay — CLI for the overlay-net transport client.
//!
//! Generates visor identities and exercises the client core directly:
//! `listen` opens one overlay port and echoes back whatever it receives,
//! `dial` connects to a peer's overlay port, sends one message, and prints
//! the reply.

mod client_setup;
mod commands;
mod keystore;

use clap::{Parser, Subcommand};
use overlay_net::CarrierType;
use tracing::error;

#[derive(Parser)]
#[command(name = "overlay", version = "0.1.0", about = "overlay-net transport client CLI")]
struct Cli {
    /// Identity to use (see `overlay keygen`)
    #[arg(short = 'i', long = "identity", global = true, default_value = "default")]
    identity: String,

    /// Config file path (TOML)
    #[arg(long = "config", global = true)]
    config: Option<String>,

    /// Override the configured carrier (stcp, stcpr, sudph)
    #[arg(long = "carrier", global = true)]
    carrier: Option<CarrierType>,

    /// Override the configured bind address
    #[arg(long = "bind", global = true)]
    bind: Option<String>,

    /// Override the configured resolver URL (stcpr/sudph)
    #[arg(long = "resolver-url", global = true)]
    resolver_url: Option<String>,

    /// Static `pk=host:port` table entries, for the stcp carrier (repeatable)
    #[arg(long = "peer", global = true)]
    peer: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a new Ed25519 identity
    Keygen {
        #[arg(default_value = "default")]
        name: String,
    },

    /// List stored identities
    Keys,

    /// Listen on an overlay port and echo back whatever is received
    Listen {
        /// Overlay port to listen on
        port: u16,
    },

    /// Dial a peer's overlay port and exchange one message
    Dial {
        /// Peer public key (hex)
        peer_pk: String,
        /// Peer's overlay port
        port: u16,
        /// Message to send
        #[arg(default_value = "hello from overlay")]
        message: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt().with_env_filter("overlay=debug,overlay_net=debug,overlay_core=debug").init();
    } else {
        tracing_subscriber::fmt().with_env_filter("overlay=info,overlay_net=warn").with_target(false).init();
    }

    let result = match &cli.command {
        Command::Keygen { name } => commands::keygen::run(name).await,
        Command::Keys => commands::keys::run().await,
        Command::Listen { port } => {
            commands::listen::run(
                &cli.identity,
                *port,
                cli.config.as_deref(),
                cli.carrier,
                cli.bind.clone(),
                cli.resolver_url.clone(),
                &cli.peer,
            )
            .await
        }
        Command::Dial { peer_pk, port, message } => {
            commands::dial::run(
                &cli.identity,
                peer_pk,
                *port,
                message,
                cli.config.as_deref(),
                cli.carrier,
                cli.bind.clone(),
                cli.resolver_url.clone(),
                &cli.peer,
            )
            .await
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("overlay: {e:#}");
        std::process::exit(1);
    }
}
