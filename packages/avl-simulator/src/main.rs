//! main.rs — AVL fleet simulator entry point
//!
//! Drives N synthetic trucks against a running roadsense backend: each
//! truck opens its own TCP connection, performs the identification
//! handshake, then streams Codec8 (or Codec8-Extended) packets at the
//! configured cadence and verifies every record-count acknowledgement —
//! the same contract a real tracker on the haul road follows.

mod tcp_tx;
mod truck_sim;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use avl_types::Codec;
use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};

use tcp_tx::TcpTransmitter;
use truck_sim::{TruckSim, TruckSpec};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "avl-sim", about = "Roadsense AVL fleet simulator")]
struct Args {
    /// Backend ingestion address
    #[arg(long, default_value = "127.0.0.1:5027")]
    server: String,
    /// Fleet config file (TOML); omit to generate a fleet
    #[arg(short, long)]
    fleet: Option<String>,
    /// Number of generated trucks when no fleet file is given
    #[arg(long, default_value = "4")]
    trucks: usize,
    /// Milliseconds between samples
    #[arg(long, default_value = "1000")]
    interval_ms: u64,
    /// AVL records batched per packet
    #[arg(long, default_value = "4")]
    records_per_packet: usize,
    /// Use Codec8-Extended framing
    #[arg(long)]
    extended: bool,
    /// Stop each truck after this many packets (default: run forever)
    #[arg(long)]
    packets: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FleetConfig {
    trucks: Vec<TruckSpec>,
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "avl_simulator=info".into()),
        )
        .init();

    let args = Args::parse();
    let codec = if args.extended { Codec::Codec8Ext } else { Codec::Codec8 };

    let fleet = match &args.fleet {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str::<FleetConfig>(&raw)?.trucks
        }
        None => generated_fleet(args.trucks),
    };

    info!(
        "🚚 AVL simulator starting — {} truck(s) → {} ({:?}, {} rec/pkt)",
        fleet.len(),
        args.server,
        codec,
        args.records_per_packet
    );

    let mut tasks = Vec::new();
    for (i, spec) in fleet.into_iter().enumerate() {
        let server = args.server.clone();
        let interval = args.interval_ms;
        let per_packet = args.records_per_packet.max(1);
        let limit = args.packets;
        tasks.push(tokio::spawn(async move {
            if let Err(e) = run_truck(server, spec, i as u64, codec, interval, per_packet, limit)
                .await
            {
                warn!("truck {i}: stopped: {e}");
            }
        }));
    }
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

fn generated_fleet(n: usize) -> Vec<TruckSpec> {
    (0..n)
        .map(|i| TruckSpec {
            identifier: format!("3563070424410{:02}", i + 1),
            lat: -26.31 - 0.002 * i as f64,
            lon: 27.94,
            heading_deg: 90.0,
            speed_kmh: 35.0 + 5.0 * (i % 3) as f64,
            loaded: i % 2 == 0,
        })
        .collect()
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Per-truck loop ────────────────────────────────────────────────────────────

async fn run_truck(
    server: String,
    spec: TruckSpec,
    seed: u64,
    codec: Codec,
    interval_ms: u64,
    records_per_packet: usize,
    packet_limit: Option<u64>,
) -> anyhow::Result<()> {
    let identifier = spec.identifier.clone();
    let mut tx = TcpTransmitter::connect(&server, &identifier).await?;
    let mut sim = TruckSim::new(spec, seed);
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
    let dt_s = interval_ms as f64 / 1000.0;

    let mut packets_sent = 0u64;
    loop {
        let mut records = Vec::with_capacity(records_per_packet);
        for _ in 0..records_per_packet {
            ticker.tick().await;
            records.push(sim.tick(dt_s, now_ms()));
        }

        let acked = tx.send_packet(codec, &records).await?;
        if acked as usize != records.len() {
            // Per protocol the device retransmits an unacknowledged packet.
            warn!(
                "{identifier}: ack mismatch ({acked} of {}), resending",
                records.len()
            );
            tx.send_packet(codec, &records).await?;
        }

        packets_sent += 1;
        if packets_sent % 10 == 0 {
            info!("{identifier}: {packets_sent} packet(s) acked");
        }
        if packet_limit.is_some_and(|limit| packets_sent >= limit) {
            info!("{identifier}: done after {packets_sent} packet(s)");
            return Ok(());
        }
    }
}
