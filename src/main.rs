use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use mirrorbot::config::AppConfig;
use mirrorbot::domain::entities::signal::{CloseSignal, OpenSignal};
use mirrorbot::domain::entities::user::ExchangeCredentials;
use mirrorbot::domain::errors::{EngineError, LedgerError, SettlementError};
use mirrorbot::domain::services::position_sizer::PositionSizer;
use mirrorbot::domain::services::settlement::{SettlementConfig, SettlementReconciler};
use mirrorbot::domain::services::subscription_ledger::SubscriptionLedger;
use mirrorbot::domain::services::trade_engine::{EngineConfig, TradeEngine};
use mirrorbot::domain::services::BalanceLocks;
use mirrorbot::infrastructure::exchange_client_factory::ExchangeClientFactory;
use mirrorbot::persistence::repository::{
    SqliteSubscriptionStore, SqliteTradeStore, SqliteUserStore,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct AppState {
    engine: Arc<TradeEngine>,
    reconciler: Arc<SettlementReconciler>,
    ledger: Arc<SubscriptionLedger>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env();
    let pool = mirrorbot::persistence::init_pool(&config.database_url).await?;

    let http = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()?;
    let connector = Arc::new(ExchangeClientFactory::new(
        http,
        &config.bybit_base_url,
        &config.okx_base_url,
        &config.recv_window,
        config.okx_simulated,
    ));

    let users = Arc::new(SqliteUserStore::new(pool.clone()));
    let subscriptions = Arc::new(SqliteSubscriptionStore::new(pool.clone()));
    let trades = Arc::new(SqliteTradeStore::new(pool));
    let locks = Arc::new(BalanceLocks::new());

    let engine = Arc::new(TradeEngine::new(
        connector.clone(),
        users.clone(),
        subscriptions.clone(),
        trades.clone(),
        PositionSizer::new(config.min_notional_usdt),
        EngineConfig {
            max_concurrent_subscribers: config.max_concurrent_subscribers,
            leverage_override: config.leverage_override,
        },
    ));
    let reconciler = Arc::new(SettlementReconciler::new(
        connector.clone(),
        users.clone(),
        subscriptions.clone(),
        trades.clone(),
        locks.clone(),
        SettlementConfig {
            poll_attempts: config.settlement_poll_attempts,
            poll_base_delay: config.settlement_poll_base_delay,
        },
    ));
    let ledger = Arc::new(SubscriptionLedger::new(
        connector,
        users,
        subscriptions,
        trades,
        locks,
    ));

    let state = AppState {
        engine,
        reconciler,
        ledger,
    };
    let app = Router::new()
        .route("/health", get(health))
        .route("/open_trade", post(open_trade))
        .route("/close_trade", post(close_trade))
        .route("/exchange/connect", post(connect_exchange))
        .route("/exchange/disconnect", post(disconnect_exchange))
        .route("/subscription/create", post(create_subscription))
        .route("/subscription/delete", post(delete_subscription))
        .route("/subscription/status/:user_id", get(subscription_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn open_trade(
    State(state): State<AppState>,
    Json(signal): Json<OpenSignal>,
) -> Response {
    match state.engine.open_trade(&signal).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => engine_error(e),
    }
}

async fn close_trade(
    State(state): State<AppState>,
    Json(signal): Json<CloseSignal>,
) -> Response {
    match state.reconciler.close_trade(&signal).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => settlement_error(e),
    }
}

#[derive(Deserialize)]
struct ConnectRequest {
    user_id: String,
    exchange: String,
    api_key: String,
    api_secret: String,
    passphrase: Option<String>,
}

async fn connect_exchange(
    State(state): State<AppState>,
    Json(req): Json<ConnectRequest>,
) -> Response {
    let creds = ExchangeCredentials::new(
        &req.exchange,
        &req.api_key,
        &req.api_secret,
        req.passphrase.as_deref(),
    );
    match state.ledger.connect_exchange(&req.user_id, creds).await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "connected"}))).into_response(),
        Err(e) => ledger_error(e),
    }
}

#[derive(Deserialize)]
struct UserRequest {
    user_id: String,
}

async fn disconnect_exchange(
    State(state): State<AppState>,
    Json(req): Json<UserRequest>,
) -> Response {
    match state.ledger.disconnect_exchange(&req.user_id).await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "disconnected"}))).into_response(),
        Err(e) => ledger_error(e),
    }
}

#[derive(Deserialize)]
struct SubscribeRequest {
    user_id: String,
    bot_name: String,
    amount: f64,
}

async fn create_subscription(
    State(state): State<AppState>,
    Json(req): Json<SubscribeRequest>,
) -> Response {
    match state
        .ledger
        .subscribe(&req.user_id, &req.bot_name, req.amount)
        .await
    {
        Ok(sub) => (StatusCode::CREATED, Json(sub)).into_response(),
        Err(e) => ledger_error(e),
    }
}

#[derive(Deserialize)]
struct UnsubscribeRequest {
    user_id: String,
    bot_name: String,
}

async fn delete_subscription(
    State(state): State<AppState>,
    Json(req): Json<UnsubscribeRequest>,
) -> Response {
    match state.ledger.unsubscribe(&req.user_id, &req.bot_name).await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "unsubscribed"}))).into_response(),
        Err(e) => ledger_error(e),
    }
}

async fn subscription_status(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Response {
    let (user, subscriptions) = match state.ledger.account_status(&user_id).await {
        Ok(status) => status,
        Err(e) => return ledger_error(e),
    };
    let open_trades = match state.ledger.open_trades(&user_id).await {
        Ok(trades) => trades,
        Err(e) => return ledger_error(e),
    };
    let body = json!({
        "user_id": user.id,
        "exchange_connected": user.credentials.is_some(),
        "balance_allocated_to_bots": user.balance_allocated_to_bots,
        "user_current_balance": user.user_current_balance,
        "subscriptions": subscriptions,
        "open_trades": open_trades,
    });
    (StatusCode::OK, Json(body)).into_response()
}

fn engine_error(err: EngineError) -> Response {
    let status = match err {
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}

fn settlement_error(err: SettlementError) -> Response {
    let status = match err {
        SettlementError::Validation(_) => StatusCode::BAD_REQUEST,
        SettlementError::SubscriptionNotFound(_)
        | SettlementError::UserNotFound(_)
        | SettlementError::OpenTradeNotFound { .. } => StatusCode::NOT_FOUND,
        SettlementError::CredentialsMissing(_) => StatusCode::BAD_REQUEST,
        SettlementError::Exchange(_) | SettlementError::Store(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, err.to_string())
}

fn ledger_error(err: LedgerError) -> Response {
    let status = match err {
        LedgerError::Validation(_)
        | LedgerError::CredentialsMissing(_)
        | LedgerError::InsufficientBalance { .. } => StatusCode::BAD_REQUEST,
        LedgerError::CredentialsRejected => StatusCode::UNAUTHORIZED,
        LedgerError::UserNotFound(_) | LedgerError::SubscriptionNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        LedgerError::AlreadySubscribed { .. }
        | LedgerError::ActiveSubscriptions(_)
        | LedgerError::OpenTradeExists { .. } => StatusCode::CONFLICT,
        LedgerError::Exchange(_) | LedgerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}
