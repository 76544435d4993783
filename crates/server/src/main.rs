//! crash-signals: host process for the round signal engine
//!
//! Usage:
//!   crash-signals serve --port 3001          : HTTP ingest + query API
//!   crash-signals replay --file rounds.json  : run a recorded feed offline
//!   crash-signals stats --channel 3          : signal bookkeeping from the DB

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use engine::{
    now_millis, parse_multiplier, sanitize_multiplier, BroadcastNotifier, EngineConfig,
    LogNotifier, MemoryStore, Notifier, Outcome, PatternMatcher, PatternRule, ProcessReport,
    RecordingNotifier, SignalEngine, SignalEvent, SignalStatus, SqliteStore,
};
use persistence::repository::{GameRoundRecord, RoundRepository, SignalRepository};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_DB_PATH: &str = "data/signals.db";

#[derive(Parser)]
#[command(name = "crash-signals")]
#[command(about = "Pattern signals and gale tracking for crash-game round feeds", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON file overriding engine settings and/or the pattern rule table
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the HTTP server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3001)]
        port: u16,
    },
    /// Replay a JSON array of rounds (oldest first) through an in-memory engine
    Replay {
        #[arg(long)]
        file: PathBuf,
    },
    /// Print signal statistics from the database
    Stats {
        /// Restrict to one channel
        #[arg(long)]
        channel: Option<i64>,
    },
}

/// Optional overrides loaded from `--config`
#[derive(Debug, Default, Deserialize)]
struct HostConfig {
    #[serde(default)]
    engine: EngineConfig,
    #[serde(default)]
    patterns: Option<Vec<PatternRule>>,
}

#[derive(Clone)]
struct AppState {
    db: Arc<persistence::Database>,
    engine: Arc<SignalEngine>,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,crash_signals=debug,sqlx=warn")
    } else {
        EnvFilter::new("info,engine=info,crash_signals=info,sqlx=warn")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<(EngineConfig, PatternMatcher)> {
    let host = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path.display(), e))?;
            serde_json::from_str::<HostConfig>(&raw)
                .map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e))?
        }
        None => HostConfig::default(),
    };

    let matcher = match host.patterns {
        Some(rules) => PatternMatcher::new(rules)?,
        None => PatternMatcher::default(),
    };
    Ok((host.engine, matcher))
}

fn db_path() -> String {
    std::env::var("CRASH_SIGNALS_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string())
}

/// Feed multipliers arrive as numbers or as text like "1.85x"
fn multiplier_from_json(value: &serde_json::Value) -> f64 {
    match value {
        serde_json::Value::Number(n) => n.as_f64().map(sanitize_multiplier).unwrap_or(0.0),
        serde_json::Value::String(s) => parse_multiplier(s),
        _ => 0.0,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    let (config, matcher) = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => cmd_serve(&host, port, config, matcher).await?,
        Commands::Replay { file } => cmd_replay(&file, config, matcher).await?,
        Commands::Stats { channel } => cmd_stats(channel).await?,
    }

    Ok(())
}

// ============================================================================
// Serve command: Axum web server
// ============================================================================

async fn cmd_serve(
    host: &str,
    port: u16,
    config: EngineConfig,
    matcher: PatternMatcher,
) -> anyhow::Result<()> {
    info!("crash-signals v{} starting...", APP_VERSION);

    let db_path = db_path();
    let db = persistence::Database::new(&db_path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })?;
    info!("Database initialized: {}", db_path);

    let store = Arc::new(SqliteStore::new(db.pool_clone()));
    let notifier = BroadcastNotifier::default();
    spawn_event_forwarder(notifier.subscribe(), Arc::new(LogNotifier));

    let engine = SignalEngine::new(config, store.clone(), store, Arc::new(notifier))
        .with_matcher(matcher);
    match engine.restore().await {
        Ok(n) if n > 0 => info!(restored = n, "Resuming open signals"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Could not restore open signals"),
    }

    let state = AppState {
        db: Arc::new(db),
        engine: Arc::new(engine),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(api_health))
        .route("/rounds", post(api_ingest_round))
        .route("/signals/open", get(api_open_signals))
        .route("/signals/recent", get(api_recent_signals))
        .route("/signals/stats", get(api_signal_stats))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== crash-signals v{} ===", APP_VERSION);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /api/health           - Health check");
    println!("  POST /api/rounds           - Record a round and run the engine");
    println!("  GET  /api/signals/open     - Channels with an open signal");
    println!("  GET  /api/signals/recent   - Latest signals");
    println!("  GET  /api/signals/stats    - Win/loss statistics");
    println!("\n  Database: {}", db_path);
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Forward every broadcast lifecycle event to `sink`
fn spawn_event_forwarder(
    mut rx: tokio::sync::broadcast::Receiver<SignalEvent>,
    sink: Arc<dyn Notifier>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(e) = sink.publish(&event) {
                        warn!(signal_id = event.signal_id(), error = %e, "Event sink failed");
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event forwarder lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

// ============================================================================
// Replay command: offline run over a recorded feed
// ============================================================================

#[derive(Debug, Deserialize)]
struct ReplayRound {
    channel_id: i64,
    round_id: String,
    multiplier: serde_json::Value,
    #[serde(default)]
    timestamp: Option<i64>,
}

async fn cmd_replay(file: &Path, config: EngineConfig, matcher: PatternMatcher) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file)?;
    let rounds: Vec<ReplayRound> = serde_json::from_str(&raw)?;
    println!("\n=== crash-signals v{}: replay ===", APP_VERSION);
    println!("Rounds: {} from {}", rounds.len(), file.display());

    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let engine = SignalEngine::new(config, store.clone(), store.clone(), notifier.clone())
        .with_matcher(matcher);

    let mut duplicates = 0usize;
    for (i, round) in rounds.into_iter().enumerate() {
        let multiplier = multiplier_from_json(&round.multiplier);
        store.push_outcome(Outcome {
            channel_id: round.channel_id,
            round_id: round.round_id.clone(),
            multiplier,
            timestamp: round.timestamp.unwrap_or(i as i64),
        });
        let report = engine
            .process_new_result(round.channel_id, &round.round_id, multiplier)
            .await;
        if report == ProcessReport::Duplicate {
            duplicates += 1;
        }
    }

    let signals = store.signals();
    let count = |status: SignalStatus| signals.iter().filter(|s| s.status == status).count();
    let won = count(SignalStatus::Won);
    let lost = count(SignalStatus::Lost);
    let won_gale = signals
        .iter()
        .filter(|s| s.status == SignalStatus::Won && s.second_attempt_result.is_some())
        .count();
    let open = signals.iter().filter(|s| s.status.is_open()).count();
    let win_rate = if won + lost > 0 {
        won as f64 / (won + lost) as f64 * 100.0
    } else {
        0.0
    };

    println!("Duplicates skipped: {}", duplicates);
    println!("Events published:   {}", notifier.events().len());
    println!("\n  {:<10} {:>6}", "Signals", signals.len());
    println!("  {}", "-".repeat(17));
    println!("  {:<10} {:>6}", "Won", won);
    println!("  {:<10} {:>6}", " on gale", won_gale);
    println!("  {:<10} {:>6}", "Lost", lost);
    println!("  {:<10} {:>6}", "Open", open);
    println!("  {:<10} {:>5.1}%", "Win rate", win_rate);

    Ok(())
}

// ============================================================================
// Stats command
// ============================================================================

async fn cmd_stats(channel: Option<i64>) -> anyhow::Result<()> {
    let db_path = db_path();
    let db = persistence::Database::new(&db_path)
        .await
        .map_err(|e| anyhow::anyhow!("Database initialization failed: {}", e))?;

    let stats = SignalRepository::new(db.pool()).get_stats(channel).await?;
    println!("\n=== crash-signals v{} ===", APP_VERSION);
    println!(
        "Database: {} | Channel: {}",
        db_path,
        channel.map(|c| c.to_string()).unwrap_or_else(|| "all".into())
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health
async fn api_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "crash-signals",
        "version": APP_VERSION,
        "open_signals": state.engine.open_signals().len(),
        "win_threshold": state.engine.config().win_threshold,
        "patterns": state.engine.matcher().rules().iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
    }))
}

#[derive(Debug, Deserialize)]
struct RoundInput {
    channel_id: i64,
    round_id: String,
    multiplier: serde_json::Value,
    bets_count: Option<i64>,
    total_bet_amount: Option<f64>,
    online_players: Option<i64>,
    total_cashout: Option<f64>,
    casino_profit: Option<f64>,
    loss_percentage: Option<f64>,
    timestamp: Option<i64>,
}

/// POST /api/rounds: persist a round, then let the engine process it
async fn api_ingest_round(
    State(state): State<AppState>,
    Json(input): Json<RoundInput>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let multiplier = multiplier_from_json(&input.multiplier);

    let record = GameRoundRecord {
        bets_count: input.bets_count,
        total_bet_amount: input.total_bet_amount,
        online_players: input.online_players,
        total_cashout: input.total_cashout,
        casino_profit: input.casino_profit,
        loss_percentage: input.loss_percentage,
        ..GameRoundRecord::new(
            input.channel_id,
            input.round_id.clone(),
            multiplier,
            input.timestamp.unwrap_or_else(now_millis),
        )
    };

    if let Err(e) = RoundRepository::new(state.db.pool()).add_round(&record).await {
        error!(channel = input.channel_id, round = %input.round_id, error = %e, "Failed to store round");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    let report = state
        .engine
        .process_new_result(input.channel_id, &input.round_id, multiplier)
        .await;

    Ok(Json(serde_json::json!({
        "success": true,
        "report": report,
    })))
}

/// GET /api/signals/open
async fn api_open_signals(State(state): State<AppState>) -> Json<serde_json::Value> {
    let open: Vec<_> = state
        .engine
        .open_signals()
        .into_iter()
        .map(|(channel_id, signal_id)| {
            serde_json::json!({ "channel_id": channel_id, "signal_id": signal_id })
        })
        .collect();

    Json(serde_json::json!({
        "success": true,
        "data": open,
        "total": open.len(),
    }))
}

/// GET /api/signals/recent: latest signals, optional `channel` and `limit`
async fn api_recent_signals(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let limit: i64 = params
        .get("limit")
        .and_then(|s| s.parse().ok())
        .unwrap_or(20);
    let channel: Option<i64> = params.get("channel").and_then(|s| s.parse().ok());

    let repo = SignalRepository::new(state.db.pool());
    match repo.get_recent(channel, limit).await {
        Ok(records) => Json(serde_json::json!({
            "success": true,
            "data": records,
            "total": records.len(),
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to query signals: {}", e),
            "data": [],
            "total": 0,
        })),
    }
}

/// GET /api/signals/stats: optional `channel`
async fn api_signal_stats(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let channel: Option<i64> = params.get("channel").and_then(|s| s.parse().ok());

    let repo = SignalRepository::new(state.db.pool());
    match repo.get_stats(channel).await {
        Ok(stats) => Json(serde_json::json!({
            "success": true,
            "stats": stats,
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to get signal stats: {}", e),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiplier_from_json() {
        assert_eq!(multiplier_from_json(&serde_json::json!(1.85)), 1.85);
        assert_eq!(multiplier_from_json(&serde_json::json!("2.10x")), 2.10);
        assert_eq!(multiplier_from_json(&serde_json::json!("n/a")), 0.0);
        assert_eq!(multiplier_from_json(&serde_json::json!(null)), 0.0);
        assert_eq!(multiplier_from_json(&serde_json::json!(-4)), 0.0);
    }

    #[test]
    fn test_host_config_overrides() {
        let host: HostConfig = serde_json::from_str(
            r#"{"engine": {"win_threshold": 1.4},
                "patterns": [{"name": "high", "conditions": [{"above": 5.0}]}]}"#,
        )
        .unwrap();
        assert_eq!(host.engine.win_threshold, 1.4);
        assert_eq!(host.engine.history_limit, 70);
        assert_eq!(host.patterns.unwrap()[0].name, "high");
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let (config, matcher) = load_config(None).unwrap();
        assert_eq!(config.win_threshold, 1.50);
        assert_eq!(matcher.rules().len(), 4);
    }

    #[tokio::test]
    async fn test_event_forwarder_drains_until_closed() {
        let broadcast = BroadcastNotifier::new(8);
        let sink = Arc::new(RecordingNotifier::new());
        let handle = spawn_event_forwarder(broadcast.subscribe(), sink.clone());

        let event = SignalEvent::SignalEmitted {
            signal_id: 7,
            channel_id: 3,
            pattern: vec![1.6, 1.7, 1.9],
            timestamp: 0,
        };
        broadcast.publish(&event).unwrap();
        drop(broadcast);
        handle.await.unwrap();

        assert_eq!(sink.events(), vec![event]);
    }

    #[tokio::test]
    async fn test_health_reports_engine_settings() {
        let db = persistence::Database::in_memory().await.unwrap();
        let store = Arc::new(SqliteStore::new(db.pool_clone()));
        let config = EngineConfig {
            win_threshold: 1.4,
            ..EngineConfig::default()
        };
        let engine = SignalEngine::new(config, store.clone(), store, Arc::new(LogNotifier));
        let state = AppState {
            db: Arc::new(db),
            engine: Arc::new(engine),
        };

        let Json(body) = api_health(State(state)).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["win_threshold"], 1.4);
        assert_eq!(body["open_signals"], 0);
        assert_eq!(body["patterns"][0], "patron_3_signals");
        assert_eq!(body["patterns"].as_array().unwrap().len(), 4);
    }
}
