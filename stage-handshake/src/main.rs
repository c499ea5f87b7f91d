//! Entry point for `stage-handshake`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client** mode.
//! All protocol work is delegated to library modules; `main.rs` owns only
//! process setup (logging, argument parsing).

use std::net::IpAddr;

use anyhow::Context;
use clap::{Parser, Subcommand};

use stage_handshake::ack_policy::DEFAULT_ACK_PROBABILITY;
use stage_handshake::client::{Client, Secrets};
use stage_handshake::config::{ClientConfig, ServerConfig, DEFAULT_PORT};
use stage_handshake::packet::DEFAULT_SESSION_TAG;
use stage_handshake::server::Server;

/// Four-stage UDP/TCP handshake server and client.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Listen for stage-A requests and run one session per request.
    Server {
        /// Well-known UDP port for stage A.
        #[arg(default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Local address to bind.
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: IpAddr,
        /// Probability of acknowledging each stage-B packet.
        #[arg(long, default_value_t = DEFAULT_ACK_PROBABILITY, value_parser = parse_probability)]
        ack_probability: f64,
        /// Seed for session parameters, for reproducible runs.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Run all four stages against a server and print the secrets.
    Client {
        /// Server host name or address.
        #[arg(long, default_value = "localhost")]
        host: String,
        /// Server stage-A port.
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Session tag carried in every envelope.
        #[arg(long, default_value_t = DEFAULT_SESSION_TAG)]
        tag: u16,
        /// Give up on a stage-B packet after this many sends.
        #[arg(long)]
        max_retransmits: Option<u32>,
    },
}

fn parse_probability(s: &str) -> Result<f64, String> {
    let p: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if (0.0..=1.0).contains(&p) {
        Ok(p)
    } else {
        Err(format!("{p} is not in [0, 1]"))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Server {
            port,
            bind,
            ack_probability,
            seed,
        } => {
            let config = ServerConfig {
                bind,
                port,
                ack_probability,
                seed,
                ..ServerConfig::default()
            };
            let server = Server::bind(config)
                .await
                .with_context(|| format!("binding {bind}:{port}"))?;
            server.run().await;
        }
        Mode::Client {
            host,
            port,
            tag,
            max_retransmits,
        } => {
            let config = ClientConfig {
                host,
                port,
                session_tag: tag,
                max_retransmits,
                ..ClientConfig::default()
            };
            let client = Client::connect(config).await?;
            log::info!("Starting client, server at {}", client.server_addr());
            let params = client.run().await.context("handshake failed")?;
            let secrets = Secrets::from(&params);
            println!("secret A: {}", secrets.a);
            println!("secret B: {}", secrets.b);
            println!("secret C: {}", secrets.c);
            println!("secret D: {}", secrets.d);
        }
    }
    Ok(())
}
