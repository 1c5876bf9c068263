// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Three endpoints:
//   POST /trade    — inbound signal, fanned out to every configured user
//   POST /guardian — guardian action envelope
//   GET  /health   — liveness
//
// Wire-level validation (direction and price ordering) happens BEFORE any
// fan-out; violations return 4xx with a descriptive detail. Per-user
// failures are reported inline in the results array with HTTP 200.
//
// CORS is configured permissively for development; tighten
// `allowed_origins` in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::app_state::AppState;
use crate::exec::{ExecStep, OpenResult};
use crate::guardian::GuardianEnvelope;
use crate::rules::RuleEngine;
use crate::store::StoredRules;
use crate::types::{Direction, GrokMeta, Signal};

// =============================================================================
// Router construction
// =============================================================================

/// Build the REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/trade", post(trade))
        .route("/guardian", post(guardian))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    total_users: usize,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        total_users: state.fleet.len(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        server_time: Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// POST /trade
// =============================================================================

/// Inbound signal as the analyzer sends it. The direction field is named
/// `trade` on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeRequest {
    pub symbol: String,
    pub trade: Direction,
    pub entry: f64,
    pub stop: f64,
    pub target: f64,
    pub rr: f64,
    pub probability: f64,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default)]
    pub ev: Option<f64>,
    #[serde(default)]
    pub simulated_probability: Option<f64>,
    #[serde(flatten)]
    pub grok: GrokMeta,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

fn default_strategy() -> String {
    "archer_model".to_string()
}

impl TradeRequest {
    fn into_signal(self) -> Signal {
        Signal {
            symbol: self.symbol.to_uppercase(),
            direction: self.trade,
            entry: self.entry,
            stop: self.stop,
            target: self.target,
            rr: self.rr,
            probability: self.probability,
            strategy: self.strategy,
            ev: self.ev,
            simulated_probability: self.simulated_probability,
            grok: self.grok,
            timestamp: self.timestamp,
        }
    }
}

/// Wire-shape validation run before any fan-out.
pub fn validate_trade_request(req: &TradeRequest) -> Result<(), String> {
    if req.entry <= 0.0 || req.stop <= 0.0 || req.target <= 0.0 {
        return Err("entry, stop and target must be positive".to_string());
    }
    if req.rr <= 0.0 {
        return Err("rr must be positive".to_string());
    }
    if !(0.0..=100.0).contains(&req.probability) {
        return Err(format!("probability {} outside [0, 100]", req.probability));
    }

    let ordered = match req.trade {
        Direction::Buy => req.stop < req.entry && req.entry < req.target,
        Direction::Sell => req.target < req.entry && req.entry < req.stop,
    };
    if !ordered {
        return Err(match req.trade {
            Direction::Buy => format!(
                "invalid price ordering for BUY: require stop < entry < target (got {} / {} / {})",
                req.stop, req.entry, req.target
            ),
            Direction::Sell => format!(
                "invalid price ordering for SELL: require target < entry < stop (got {} / {} / {})",
                req.target, req.entry, req.stop
            ),
        });
    }

    Ok(())
}

/// Per-user entry in the trade response.
#[derive(Debug, Clone, Serialize)]
pub struct UserTradeOutcome {
    pub user_id: String,
    #[serde(flatten)]
    pub outcome: OpenResult,
}

/// Aggregate trade response.
#[derive(Debug, Clone, Serialize)]
pub struct TradeSummary {
    pub status: &'static str,
    pub symbol: String,
    pub direction: Direction,
    pub successful: usize,
    pub failed: usize,
    pub total_users: usize,
    pub results: Vec<UserTradeOutcome>,
}

async fn trade(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TradeRequest>,
) -> Result<Json<TradeSummary>, (StatusCode, Json<serde_json::Value>)> {
    if let Err(detail) = validate_trade_request(&request) {
        warn!(symbol = %request.symbol, detail = %detail, "trade request rejected at the wire");
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": "validation", "detail": detail })),
        ));
    }

    let signal = request.into_signal();
    info!(
        symbol = %signal.symbol,
        direction = %signal.direction,
        strategy = %signal.strategy,
        users = state.fleet.len(),
        "signal accepted, fanning out"
    );

    Ok(Json(run_trade_fanout(&state, signal).await))
}

/// Run RuleEngine → PositionGuard for every user concurrently and collect
/// the per-user outcomes.
pub async fn run_trade_fanout(state: &Arc<AppState>, signal: Signal) -> TradeSummary {
    let mut set = JoinSet::new();
    for idx in 0..state.fleet.users.len() {
        let state = state.clone();
        let signal = signal.clone();
        set.spawn(async move {
            let user = &state.fleet.users[idx];
            let outcome = process_user_trade(&state, idx, &signal).await;
            UserTradeOutcome {
                user_id: user.user_id.clone(),
                outcome,
            }
        });
    }

    let mut results = Vec::with_capacity(state.fleet.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => error!(error = %e, "trade worker panicked"),
        }
    }

    // Stable output order regardless of completion order.
    results.sort_by(|a, b| a.user_id.cmp(&b.user_id));

    let successful = results.iter().filter(|r| r.outcome.success).count();
    TradeSummary {
        status: "completed",
        symbol: signal.symbol.clone(),
        direction: signal.direction,
        successful,
        failed: results.len() - successful,
        total_users: state.fleet.len(),
        results,
    }
}

async fn process_user_trade(state: &Arc<AppState>, idx: usize, signal: &Signal) -> OpenResult {
    let user = &state.fleet.users[idx];

    // A user without a rules row gets the defaults, which are disabled.
    let stored = match state.rules.user_rules(&user.user_id, &signal.strategy) {
        Ok(Some(stored)) => stored,
        Ok(None) => StoredRules::default(),
        Err(e) => {
            warn!(user_id = %user.user_id, error = %e, "rules load failed");
            StoredRules::default()
        }
    };

    if stored
        .banned_symbols
        .iter()
        .any(|s| s.eq_ignore_ascii_case(&signal.symbol))
    {
        return OpenResult::rejected(ExecStep::Validation, "symbol_banned");
    }

    let verdict = RuleEngine::validate(
        state.history.as_ref(),
        user.venue.as_ref(),
        &user.user_id,
        &signal.strategy,
        &stored.rules,
        signal,
        Utc::now(),
    )
    .await;

    match verdict {
        crate::rules::Verdict::Rejected(code) => {
            info!(user_id = %user.user_id, symbol = %signal.symbol, code = %code, "trade rejected by rules");
            OpenResult::rejected(ExecStep::Validation, code)
        }
        crate::rules::Verdict::Approved => {
            state
                .guard
                .open_trade(user.venue.as_ref(), &user.user_id, &stored.rules, signal)
                .await
        }
    }
}

// =============================================================================
// POST /guardian
// =============================================================================

async fn guardian(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<GuardianEnvelope>,
) -> impl IntoResponse {
    Json(state.dispatcher.dispatch(envelope).await)
}
