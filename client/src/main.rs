use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tunnelsnake_shared::protocol::COMMANDS;
use tunnelsnake_shared::{parse_line, Mode, Status};

mod config;
mod tunnel;

use config::TunnelsnakeConfig;
use tunnel::{ReceivedPacket, Tunnel, TunnelEvent};

/// Lines that end the session
const QUIT_WORDS: [&str; 3] = ["quit", "bye", "leave"];

#[derive(Parser)]
#[command(name = "tunnelsnake")]
#[command(version)]
#[command(about = "Interactive command tunnel to networked Guardian devices", long_about = None)]
struct Cli {
    /// Guardian device IP or hostname
    #[arg(short, long)]
    address: Option<String>,

    /// Guardian device port
    #[arg(short, long)]
    port: Option<u16>,

    /// Local port to listen on (defaults to the device port)
    #[arg(long)]
    bind_port: Option<u16>,

    /// Transport mode: udp, tcp or serial
    #[arg(short, long)]
    mode: Option<Mode>,

    /// Config file (defaults to tunnelsnake.yml in the current or home directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    let file_config = match cli.config.clone().or_else(TunnelsnakeConfig::find_config) {
        Some(path) => {
            info!("Loading config from {}", path.display());
            TunnelsnakeConfig::load(&path)?
        }
        None => TunnelsnakeConfig::default(),
    };
    let mut config = file_config.merge(cli.mode, cli.address, cli.port, cli.bind_port);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    // Ask for whatever the flags and config file left out
    if config.mode == Mode::Udp {
        if config.address.is_none() {
            config.address = Some(prompt(&mut lines, "Guardian device IP: ").await?);
        }
        if config.port.is_none() {
            let port = prompt(&mut lines, "Guardian device port: ").await?;
            config.port = Some(
                port.parse()
                    .with_context(|| format!("Invalid device port: {}", port))?,
            );
        }
    }
    config.validate()?;

    let mut tunnel = Tunnel::new(config.mode, config.address.as_deref(), config.port)?;
    if let Some(bind_port) = config.bind_port {
        tunnel = tunnel.with_bind_port(bind_port);
    }

    let opened = tunnel.open().await;
    if let Err(e) = &opened {
        error!("Failed to open tunnel ({}): {}", Status::from(&opened), e);
        if let Some((host, port)) = tunnel.tcp_relay() {
            info!("TCP relay {}:{} is configured but not implemented", host, port);
        }
    }
    opened.context("Failed to open tunnel")?;

    if let Some((address, port)) = tunnel.peer() {
        info!(
            "Tunnel open to {}:{} (listening on {}), type 'help' for commands",
            address,
            port,
            tunnel.local_addr()?
        );
    }
    info!("Waiting for packet to send...");

    run_session(&tunnel, &mut lines).await?;

    if tunnel.is_open() {
        if let Err(e) = tunnel.close().await {
            warn!("Failed to close tunnel: {}", e);
        }
    }
    info!("Tunnelsnake (v{}) session ended", env!("CARGO_PKG_VERSION"));

    Ok(())
}

/// Read command lines and print received packets until the operator quits
async fn run_session(tunnel: &Tunnel, lines: &mut Lines<BufReader<Stdin>>) -> Result<()> {
    let mut events = tunnel.subscribe();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if !handle_line(tunnel, line.trim()).await {
                            break;
                        }
                    }
                    // stdin closed
                    None => break,
                }
            }
            event = events.recv() => {
                match event {
                    Ok(TunnelEvent::Packet(packet)) => print_packet(&packet),
                    Ok(TunnelEvent::Malformed { from, len, reason }) => {
                        println!();
                        println!(
                            "Discarded malformed packet (from {}, {} bytes): {}",
                            from, len, reason
                        );
                        println!();
                    }
                    Err(RecvError::Lagged(n)) => warn!("Skipped {} received packets", n),
                    Err(RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Exit requested");
                break;
            }
        }
    }

    Ok(())
}

/// Handle one operator line. Returns false when the session should end.
async fn handle_line(tunnel: &Tunnel, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }

    let lower = line.to_lowercase();
    if QUIT_WORDS.contains(&lower.as_str()) {
        info!("Exit requested");
        return false;
    }
    if lower == "help" {
        print_help();
        return true;
    }

    // Raw JSON goes out untouched, anything else is a mnemonic
    let packet = if line.starts_with('{') {
        Ok(line.to_string())
    } else {
        parse_line(line)
    };

    let result = match packet {
        Ok(packet) => tunnel.send_packet(packet.as_bytes()).await,
        Err(e) => Err(e),
    };
    if let Err(e) = &result {
        warn!("{} ({})", e, Status::from(&result));
    }
    if !tunnel.is_listening() {
        warn!("UDP listener is no longer running, responses will not be shown");
    }

    true
}

async fn prompt(lines: &mut Lines<BufReader<Stdin>>, label: &str) -> Result<String> {
    print!("{}", label);
    std::io::stdout().flush()?;

    let line = lines
        .next_line()
        .await?
        .context("stdin closed before input was given")?;
    Ok(line.trim().to_string())
}

fn print_packet(packet: &ReceivedPacket) {
    let body = serde_json::to_string_pretty(&packet.payload)
        .unwrap_or_else(|_| packet.payload.to_string());

    println!();
    println!(
        "Received packet (from {}) at {}:",
        packet.from,
        packet.received_at.format("%H:%M:%S%.3f")
    );
    println!("---");
    println!("{}", body);
    println!();
}

fn print_help() {
    println!();
    println!("Commands:");
    for spec in COMMANDS {
        println!("  {:<28} {}", spec.usage(), spec.description);
    }
    println!("  {:<28} {}", "{...}", "Send raw JSON packet");
    println!("  {:<28} {}", QUIT_WORDS.join(" | "), "End session");
    println!();
}
