//! vigild: the Vigil supervisor daemon.
//!
//! ```bash
//! # Validate a configuration file
//! vigild check-config /etc/vigil/vigil.conf
//!
//! # Run a supervisor
//! vigild run /etc/vigil/vigil.conf --port 26379 --announce-ip 10.0.0.10
//! ```

use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::RngCore;
use tracing_subscriber::EnvFilter;

use vigil_server::{Server, ServerConfig};
use vigil_types::{constants, Address, RunId};

/// Vigil - high-availability supervisor for primary/replica stores.
#[derive(Parser)]
#[command(name = "vigild")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor.
    Run {
        /// Path to the configuration file.
        config: String,

        /// Port for the peer RPC listener.
        #[arg(long, default_value_t = constants::DEFAULT_PORT)]
        port: u16,

        /// Address to bind the listener to.
        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,

        /// IP to advertise to peers in hello gossip.
        #[arg(long, default_value = "127.0.0.1")]
        announce_ip: String,
    },

    /// Parse and validate a configuration file, then exit.
    CheckConfig {
        /// Path to the configuration file.
        config: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Commands::CheckConfig { config } => {
            let parsed = vigil_config::load_file(&config)?;
            println!(
                "{}: ok ({} monitored primaries)",
                config,
                parsed.primaries.len()
            );
            Ok(())
        }
        Commands::Run {
            config,
            port,
            bind,
            announce_ip,
        } => run(&config, port, bind, &announce_ip).await,
    }
}

async fn run(config_path: &str, port: u16, bind: IpAddr, announce_ip: &str) -> Result<()> {
    let config = vigil_config::load_file(config_path)?;

    let announce = Address::resolve(announce_ip, u32::from(port))
        .with_context(|| format!("resolving announce address {announce_ip}:{port}"))?;

    let mut rng = rand::thread_rng();
    let mut id_bytes = [0u8; 20];
    rng.fill_bytes(&mut id_bytes);
    let run_id = RunId::generate(id_bytes);

    let server_config = ServerConfig {
        listen: SocketAddr::new(bind, port),
        announce,
        primaries: config.primaries,
        rng_seed: rng.next_u64(),
    };

    let listen = server_config.listen;
    let server = Server::new(&server_config, run_id)?;
    server.run(listen).await
}
