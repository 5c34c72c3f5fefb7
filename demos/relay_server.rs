//! Signaling and ingest relay example
//!
//! Run with: cargo run --example relay_server [BIND_ADDR] [--peer-only]
//!
//! Examples:
//!   cargo run --example relay_server                     # binds to 0.0.0.0:8080
//!   cargo run --example relay_server localhost:9000      # binds to 127.0.0.1:9000
//!   cargo run --example relay_server --peer-only         # anonymous peers only
//!
//! ## Publishing
//!
//! A browser registers with `{"type":"register","username":"alice","isStreamer":true}`,
//! sends `{"type":"start-stream"}` and then MediaRecorder chunks as binary
//! frames. ffmpeg writes HLS to `media/live/alice/index.m3u8`.
//!
//! ## Viewing
//!
//! `{"type":"viewer-join","username":"vic"}` answers with the live streams;
//! serve `media/live` with any static file server.

use std::net::SocketAddr;

use signal_relay::server::config::DEFAULT_PORT;
use signal_relay::{RouterConfig, ServerConfig, SignalServer, SignalingProfile};

/// Parse bind address from command line argument.
///
/// Accepts "localhost", "localhost:PORT", "IP" or "IP:PORT".
fn parse_bind_addr(arg: &str) -> Result<SocketAddr, String> {
    let normalized = arg.replace("localhost", "127.0.0.1");

    if let Ok(addr) = normalized.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = normalized.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    Err(format!(
        "Invalid bind address: '{}'. Expected format: IP:PORT or IP or 'localhost'",
        arg
    ))
}

fn print_usage() {
    eprintln!("Usage: relay_server [BIND_ADDR] [--peer-only]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  BIND_ADDR    Address to bind to (default: 0.0.0.0:{})", DEFAULT_PORT);
    eprintln!("  --peer-only  Serve anonymous peer-to-peer rooms instead of publish/view");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let profile = if args.iter().any(|a| a == "--peer-only") {
        SignalingProfile::PeerOnly
    } else {
        SignalingProfile::Multiplexed
    };

    let mut config = ServerConfig::default().router(RouterConfig::for_profile(profile));
    if let Some(addr) = args.iter().find(|a| !a.starts_with("--")) {
        match parse_bind_addr(addr) {
            Ok(addr) => config = config.bind(addr),
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("signal_relay=debug".parse()?)
                .add_directive("relay_server=debug".parse()?),
        )
        .init();

    println!("Starting relay on ws://{} ({:?})", config.bind_addr, profile);

    let server = SignalServer::new(config);
    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    println!("Relay stopped");
    Ok(())
}
