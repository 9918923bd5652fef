//! HTTP boundary
//!
//! Webhook surface the alert source posts into. Handlers stay thin: decode
//! the optional alert body, pick the desk, call one façade operation, wrap
//! the result in the timestamped reply envelope. Trade routes error at the
//! handler level only for a disconnected gateway or an unparseable alert
//! body; everything else comes back as a structured outcome with a 200.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;
use tracing::info;

use crate::execution::{CloseReport, TradeOutcome};
use crate::models::{AlertPayload, AlertResponse};
use crate::trading::TradingDesk;

#[derive(Clone)]
pub struct AppState {
    pub futures: Arc<TradingDesk>,
    pub options: Arc<TradingDesk>,
    pub equity: Arc<TradingDesk>,
}

impl AppState {
    fn desk(&self, name: &str) -> Option<Arc<TradingDesk>> {
        match name {
            "futures" => Some(Arc::clone(&self.futures)),
            "options" => Some(Arc::clone(&self.options)),
            "equity" => Some(Arc::clone(&self.equity)),
            _ => None,
        }
    }

    fn all(&self) -> [Arc<TradingDesk>; 3] {
        [
            Arc::clone(&self.futures),
            Arc::clone(&self.options),
            Arc::clone(&self.equity),
        ]
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/status", get(status))
        .route("/bid-ask", get(bid_ask))
        .route("/:desk/buy", post(buy))
        .route("/:desk/sell", post(sell))
        .route("/:desk/buy-limit", post(buy_limit))
        .route("/:desk/sell-limit", post(sell_limit))
        .route("/:desk/close", post(close))
        .route("/:desk/close-limit", post(close_limit))
        .with_state(state)
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn err(status: StatusCode, detail: impl Into<String>) -> ApiError {
    (status, Json(json!({ "detail": detail.into() })))
}

async fn resolve_desk(state: &AppState, name: &str) -> Result<Arc<TradingDesk>, ApiError> {
    let desk = state
        .desk(name)
        .ok_or_else(|| err(StatusCode::NOT_FOUND, format!("Unknown desk: {name}")))?;
    if !desk.is_connected().await {
        return Err(err(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Not connected to broker gateway",
        ));
    }
    Ok(desk)
}

/// An absent body is a valid empty alert; a present body must parse.
/// Trading a desk's default size off a typo'd alert is worse than bouncing
/// the request.
fn parse_alert(body: &Bytes) -> Result<AlertPayload, ApiError> {
    if body.is_empty() {
        return Ok(AlertPayload::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| err(StatusCode::BAD_REQUEST, format!("Invalid alert body: {e}")))
}

type TradeReply = Json<AlertResponse<TradeOutcome>>;
type CloseReply = Json<AlertResponse<CloseReport>>;

async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "service": "osprey",
        "message": "Alert relay running",
        "timestamp": Utc::now(),
    }))
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut desks = Vec::new();
    let mut positions = Vec::new();
    for desk in state.all() {
        desks.push(desk.status().await);
        if desk.is_connected().await {
            if let Ok(mut found) = desk.positions().await {
                positions.append(&mut found);
            }
        }
    }
    let connected = state.futures.is_connected().await;
    let account = if connected {
        state.futures.account_summary().await.ok()
    } else {
        None
    };
    Json(json!({
        "connected": connected,
        "desks": desks,
        "positions": positions,
        "account": account,
        "timestamp": Utc::now(),
    }))
}

async fn bid_ask(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let desk = resolve_desk(&state, "futures").await?;
    let snapshot = desk
        .snapshot()
        .await
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")))?;
    Ok(Json(json!({
        "bid": snapshot.bid,
        "ask": snapshot.ask,
        "last": snapshot.last,
        "spread": snapshot.spread(),
        "timestamp": Utc::now(),
    })))
}

async fn buy(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<TradeReply, ApiError> {
    let desk = resolve_desk(&state, &name).await?;
    let alert = parse_alert(&body)?;
    info!("📥 Buy alert received on {} desk", desk.label());
    let outcome = desk.buy(alert.quantity).await;
    Ok(Json(AlertResponse::new("Buy alert processed", outcome)))
}

async fn sell(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<TradeReply, ApiError> {
    let desk = resolve_desk(&state, &name).await?;
    let alert = parse_alert(&body)?;
    info!("📥 Sell alert received on {} desk", desk.label());
    let outcome = desk.sell(alert.quantity).await;
    Ok(Json(AlertResponse::new("Sell alert processed", outcome)))
}

async fn buy_limit(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<TradeReply, ApiError> {
    let desk = resolve_desk(&state, &name).await?;
    let alert = parse_alert(&body)?;
    info!("📥 Buy-limit alert received on {} desk", desk.label());
    let outcome = desk.buy_limit(alert.quantity, alert.price).await;
    Ok(Json(AlertResponse::new("Buy limit alert processed", outcome)))
}

async fn sell_limit(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<TradeReply, ApiError> {
    let desk = resolve_desk(&state, &name).await?;
    let alert = parse_alert(&body)?;
    info!("📥 Sell-limit alert received on {} desk", desk.label());
    let outcome = desk.sell_limit(alert.quantity, alert.price).await;
    Ok(Json(AlertResponse::new("Sell limit alert processed", outcome)))
}

async fn close(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<CloseReply, ApiError> {
    let desk = resolve_desk(&state, &name).await?;
    info!("📥 Close alert received on {} desk", desk.label());
    let report = desk.close_all().await;
    Ok(Json(AlertResponse::new("Close alert processed", report)))
}

async fn close_limit(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<CloseReply, ApiError> {
    let desk = resolve_desk(&state, &name).await?;
    let alert = parse_alert(&body)?;
    info!("📥 Close-limit alert received on {} desk", desk.label());
    let report = desk.close_all_limit(alert.price).await;
    Ok(Json(AlertResponse::new("Close limit alert processed", report)))
}
