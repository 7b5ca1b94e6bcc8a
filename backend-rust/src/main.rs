mod aggregator;
mod config;
mod counters;
mod detector;
mod device_cache;
mod ingest;
mod models;
mod repository;
mod roughness;
mod segments;
mod server;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tracing::info;

use aggregator::StatsAggregator;
use config::Config;
use counters::Counters;
use detector::{EventDetector, Thresholds};
use device_cache::DeviceCache;
use ingest::IngestService;
use repository::{PgRepository, PgSegmentLookup, SegmentLookup, TelemetryRepository};
use roughness::IriConfig;
use segments::SegmentResolver;
use server::SessionServer;

// ─── Global startup time (for uptime reporting) ──────────────────────────────
static STARTUP_MS: AtomicU64 = AtomicU64::new(0);

// ─── Health Endpoint ──────────────────────────────────────────────────────────
// GET /health → { status, version, uptimeSecs, counters }

async fn health_check(State(counters): State<Arc<Counters>>) -> axum::Json<serde_json::Value> {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let startup = STARTUP_MS.load(Ordering::Relaxed);
    let uptime_secs = if startup > 0 { (now_ms - startup) / 1000 } else { 0 };
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": uptime_secs,
        "counters": counters.snapshot(),
    }))
}

// ─── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Record startup time for uptime reporting
    let startup_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    STARTUP_MS.store(startup_ms, Ordering::Relaxed);

    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roadsense_backend=info,sqlx=warn".into()),
        )
        .init();

    let config = Config::from_env();
    info!(
        "🚚 Roadsense Backend (Rust) v{} starting — ingest :{}, health :{}",
        env!("CARGO_PKG_VERSION"),
        config.tcp_port,
        config.http_port
    );

    // Persistence
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    let repo: Arc<dyn TelemetryRepository> = Arc::new(PgRepository::new(pool.clone()));
    let spatial: Arc<dyn SegmentLookup> = Arc::new(PgSegmentLookup::new(pool));

    let counters = Arc::new(Counters::default());

    // Ingestion pipeline: validate → map → resolve → persist
    let ingest = Arc::new(IngestService::new(
        repo.clone(),
        DeviceCache::new(
            repo.clone(),
            Duration::from_millis(config.imei_cache_ttl_ms),
            config.imei_cache_max,
        ),
        SegmentResolver::new(spatial, config.segment_proximity_m, config.segment_cache_max),
        counters.clone(),
        config.max_future_skew_ms,
        config.load_state_from_din1,
    ));

    // TCP session server
    let listener = TcpListener::bind(("0.0.0.0", config.tcp_port)).await?;
    info!("📡 AVL ingestion listening on 0.0.0.0:{}", config.tcp_port);
    let server = Arc::new(SessionServer::new(ingest, counters.clone(), &config));
    tokio::spawn(server.serve(listener));

    // Event detector (every EVENT_INTERVAL_MS)
    let detector = EventDetector::new(
        repo.clone(),
        counters.clone(),
        Thresholds {
            medium_mg: config.roughness_medium_mg,
            high_mg: config.roughness_high_mg,
            critical_mg: config.roughness_critical_mg,
        },
        config.event_batch,
    );
    tokio::spawn(detector.run(config.event_interval_ms));

    // Daily statistics aggregator
    let aggregator = StatsAggregator::new(
        repo,
        IriConfig {
            k: config.iri_k,
            speed_baseline_kmh: config.iri_speed_baseline_kmh,
            good: config.iri_good,
            fair: config.iri_fair,
            poor: config.iri_poor,
        },
    );
    let aggregate_at = config.aggregate_at.clone();
    tokio::spawn(async move { aggregator.run(&aggregate_at).await });

    // Health endpoint
    let app = Router::new()
        .route("/health", get(health_check))
        .with_state(counters);
    let http = TcpListener::bind(("0.0.0.0", config.http_port)).await?;
    info!("🩺 Health endpoint on 0.0.0.0:{}", config.http_port);
    axum::serve(http, app).await?;

    Ok(())
}
