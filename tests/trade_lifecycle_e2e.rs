//! End-to-end lifecycle tests over in-memory stores and a scripted exchange:
//! subscribe, fan out an open signal, settle a close signal, verify ledgers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mirrorbot::domain::entities::signal::{
    CloseSignal, OpenSignal, SettlementOutcome, SubscriberResult,
};
use mirrorbot::domain::entities::subscription::Subscription;
use mirrorbot::domain::entities::trade::{Direction, Trade, STATUS_OPEN};
use mirrorbot::domain::entities::user::{ExchangeCredentials, User};
use mirrorbot::domain::errors::{ExchangeError, ExchangeResult, LedgerError, SettlementError};
use mirrorbot::domain::repositories::exchange_api::{
    AccountBalance, ClosedPnlRecord, ExchangeApi, ExchangeConnector, InstrumentInfo,
    MarketOrderRequest, PositionInfo,
};
use mirrorbot::domain::repositories::stores::{
    StoreError, StoreResult, SubscriptionStore, TradeStore, UserStore,
};
use mirrorbot::domain::services::position_sizer::PositionSizer;
use mirrorbot::domain::services::settlement::{SettlementConfig, SettlementReconciler};
use mirrorbot::domain::services::subscription_ledger::SubscriptionLedger;
use mirrorbot::domain::services::trade_engine::{EngineConfig, TradeEngine};
use mirrorbot::domain::services::BalanceLocks;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// scripted exchange

#[derive(Default)]
struct ExchangeScript {
    /// API keys whose order placement is rejected.
    failing_keys: Mutex<HashSet<String>>,
    entry_price: Mutex<f64>,
    closed_pnl: Mutex<Vec<ClosedPnlRecord>>,
    orders: Mutex<Vec<MarketOrderRequest>>,
    order_counter: AtomicU64,
}

struct MockConnector {
    script: Arc<ExchangeScript>,
}

impl MockConnector {
    fn new(entry_price: f64) -> Self {
        let script = Arc::new(ExchangeScript::default());
        *script.entry_price.lock().unwrap() = entry_price;
        Self { script }
    }

    fn fail_orders_for(&self, api_key: &str) {
        self.script
            .failing_keys
            .lock()
            .unwrap()
            .insert(api_key.to_string());
    }

    fn push_closed_pnl(&self, avg_entry_price: f64, closed_pnl: f64) {
        self.script
            .closed_pnl
            .lock()
            .unwrap()
            .push(ClosedPnlRecord {
                symbol: "BTCUSDT".to_string(),
                side: "Sell".to_string(),
                avg_entry_price,
                closed_pnl,
            });
    }

    fn placed_orders(&self) -> Vec<MarketOrderRequest> {
        self.script.orders.lock().unwrap().clone()
    }
}

impl ExchangeConnector for MockConnector {
    fn connect(&self, creds: &ExchangeCredentials) -> ExchangeResult<Arc<dyn ExchangeApi>> {
        Ok(Arc::new(MockExchange {
            script: self.script.clone(),
            api_key: creds.api_key.clone(),
        }))
    }
}

struct MockExchange {
    script: Arc<ExchangeScript>,
    api_key: String,
}

#[async_trait]
impl ExchangeApi for MockExchange {
    fn name(&self) -> &str {
        "mock"
    }

    async fn test_connection(&self) -> bool {
        true
    }

    async fn fetch_balance(&self) -> ExchangeResult<Vec<AccountBalance>> {
        Ok(vec![AccountBalance {
            currency: "USDT".to_string(),
            available: 10_000.0,
            total: 10_000.0,
        }])
    }

    async fn server_time_ms(&self) -> ExchangeResult<i64> {
        Ok(1_700_000_000_000)
    }

    async fn instrument_info(&self, _symbol: &str) -> ExchangeResult<InstrumentInfo> {
        Ok(InstrumentInfo {
            qty_step: 0.01,
            min_order_qty: 0.01,
            max_leverage: 50.0,
        })
    }

    async fn last_price(&self, _symbol: &str) -> ExchangeResult<f64> {
        Ok(*self.script.entry_price.lock().unwrap())
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: &str) -> ExchangeResult<()> {
        Ok(())
    }

    async fn place_market_order(&self, order: &MarketOrderRequest) -> ExchangeResult<String> {
        if self.script.failing_keys.lock().unwrap().contains(&self.api_key) {
            return Err(ExchangeError::ApiRejection {
                code: 110007,
                message: "ab not enough for new order".to_string(),
            });
        }
        self.script.orders.lock().unwrap().push(order.clone());
        let n = self.script.order_counter.fetch_add(1, Ordering::SeqCst);
        Ok(format!("ord-{}", n))
    }

    async fn position_info(&self, symbol: &str) -> ExchangeResult<PositionInfo> {
        Ok(PositionInfo {
            symbol: symbol.to_string(),
            direction: Direction::Long,
            size: "0.83".to_string(),
            avg_price: *self.script.entry_price.lock().unwrap(),
            created_time_ms: 1_700_000_000_000,
            leverage: 50.0,
            initial_margin: 10.0,
            stop_loss: None,
            take_profit: None,
        })
    }

    async fn closed_pnl(&self, _symbol: &str) -> ExchangeResult<Vec<ClosedPnlRecord>> {
        Ok(self.script.closed_pnl.lock().unwrap().clone())
    }
}

// ---------------------------------------------------------------------------
// in-memory stores

#[derive(Default)]
struct MemoryUserStore {
    users: Mutex<HashMap<String, User>>,
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn insert(&self, user: &User) -> StoreResult<()> {
        self.users
            .lock()
            .unwrap()
            .insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn get(&self, user_id: &str) -> StoreResult<Option<User>> {
        Ok(self.users.lock().unwrap().get(user_id).cloned())
    }

    async fn set_credentials(
        &self,
        user_id: &str,
        creds: Option<&ExchangeCredentials>,
    ) -> StoreResult<()> {
        let mut users = self.users.lock().unwrap();
        let user = users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))?;
        user.credentials = creds.cloned();
        Ok(())
    }

    async fn adjust_allocated(&self, user_id: &str, delta: f64) -> StoreResult<f64> {
        let mut users = self.users.lock().unwrap();
        let user = users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))?;
        user.balance_allocated_to_bots = (user.balance_allocated_to_bots + delta).max(0.0);
        Ok(user.balance_allocated_to_bots)
    }

    async fn adjust_current_balance(&self, user_id: &str, delta: f64) -> StoreResult<f64> {
        let mut users = self.users.lock().unwrap();
        let user = users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))?;
        user.user_current_balance += delta;
        Ok(user.user_current_balance)
    }
}

#[derive(Default)]
struct MemorySubscriptionStore {
    subs: Mutex<Vec<Subscription>>,
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn insert(&self, sub: &Subscription) -> StoreResult<()> {
        let mut subs = self.subs.lock().unwrap();
        if subs
            .iter()
            .any(|s| s.user_id == sub.user_id && s.bot_name == sub.bot_name)
        {
            return Err(StoreError::Backend("unique constraint".to_string()));
        }
        subs.push(sub.clone());
        Ok(())
    }

    async fn find(&self, user_id: &str, bot_name: &str) -> StoreResult<Option<Subscription>> {
        Ok(self
            .subs
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.user_id == user_id && s.bot_name == bot_name)
            .cloned())
    }

    async fn find_by_user(&self, user_id: &str) -> StoreResult<Vec<Subscription>> {
        Ok(self
            .subs
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn find_by_symbol(&self, symbol: &str) -> StoreResult<Vec<Subscription>> {
        Ok(self
            .subs
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.symbol == symbol)
            .cloned()
            .collect())
    }

    async fn delete(&self, user_id: &str, bot_name: &str) -> StoreResult<()> {
        let mut subs = self.subs.lock().unwrap();
        let before = subs.len();
        subs.retain(|s| !(s.user_id == user_id && s.bot_name == bot_name));
        if subs.len() == before {
            return Err(StoreError::NotFound(format!(
                "subscription {}/{}",
                user_id, bot_name
            )));
        }
        Ok(())
    }

    async fn adjust_bot_balance(
        &self,
        user_id: &str,
        bot_name: &str,
        delta: f64,
    ) -> StoreResult<f64> {
        let mut subs = self.subs.lock().unwrap();
        let sub = subs
            .iter_mut()
            .find(|s| s.user_id == user_id && s.bot_name == bot_name)
            .ok_or_else(|| {
                StoreError::NotFound(format!("subscription {}/{}", user_id, bot_name))
            })?;
        sub.bot_current_balance = (sub.bot_current_balance + delta).max(0.0);
        Ok(sub.bot_current_balance)
    }
}

#[derive(Default)]
struct MemoryTradeStore {
    trades: Mutex<Vec<Trade>>,
}

#[async_trait]
impl TradeStore for MemoryTradeStore {
    async fn insert(&self, trade: &Trade) -> StoreResult<()> {
        self.trades.lock().unwrap().push(trade.clone());
        Ok(())
    }

    async fn find_open(
        &self,
        user_id: &str,
        symbol: &str,
        direction: Direction,
    ) -> StoreResult<Vec<Trade>> {
        let mut open: Vec<Trade> = self
            .trades
            .lock()
            .unwrap()
            .iter()
            .filter(|t| {
                t.user_id == user_id
                    && t.symbol == symbol
                    && t.direction == direction
                    && t.status == STATUS_OPEN
            })
            .cloned()
            .collect();
        open.sort_by(|a, b| b.entry_time.cmp(&a.entry_time));
        Ok(open)
    }

    async fn close(
        &self,
        trade_id: &str,
        reason: &str,
        exit_time: DateTime<Utc>,
        pnl: Option<f64>,
    ) -> StoreResult<bool> {
        let mut trades = self.trades.lock().unwrap();
        let trade = trades
            .iter_mut()
            .find(|t| t.id == trade_id)
            .ok_or_else(|| StoreError::NotFound(format!("trade {}", trade_id)))?;
        if trade.status != STATUS_OPEN {
            return Ok(false);
        }
        trade.status = reason.to_string();
        trade.exit_time = Some(exit_time);
        trade.pnl = pnl;
        Ok(true)
    }
}

/// Delegates to the in-memory store but refuses balance writes, modeling a
/// storage fault during the ledger-side half of settlement.
struct BalanceWriteOutage {
    inner: Arc<MemorySubscriptionStore>,
}

#[async_trait]
impl SubscriptionStore for BalanceWriteOutage {
    async fn insert(&self, sub: &Subscription) -> StoreResult<()> {
        self.inner.insert(sub).await
    }

    async fn find(&self, user_id: &str, bot_name: &str) -> StoreResult<Option<Subscription>> {
        self.inner.find(user_id, bot_name).await
    }

    async fn find_by_user(&self, user_id: &str) -> StoreResult<Vec<Subscription>> {
        self.inner.find_by_user(user_id).await
    }

    async fn find_by_symbol(&self, symbol: &str) -> StoreResult<Vec<Subscription>> {
        self.inner.find_by_symbol(symbol).await
    }

    async fn delete(&self, user_id: &str, bot_name: &str) -> StoreResult<()> {
        self.inner.delete(user_id, bot_name).await
    }

    async fn adjust_bot_balance(&self, _: &str, _: &str, _: f64) -> StoreResult<f64> {
        Err(StoreError::Backend("disk I/O error".to_string()))
    }
}

/// A trade store whose close always reports the row already flipped, like a
/// concurrent settlement winning the race between lookup and update.
struct LostRaceTradeStore {
    inner: Arc<MemoryTradeStore>,
}

#[async_trait]
impl TradeStore for LostRaceTradeStore {
    async fn insert(&self, trade: &Trade) -> StoreResult<()> {
        self.inner.insert(trade).await
    }

    async fn find_open(
        &self,
        user_id: &str,
        symbol: &str,
        direction: Direction,
    ) -> StoreResult<Vec<Trade>> {
        self.inner.find_open(user_id, symbol, direction).await
    }

    async fn close(
        &self,
        _trade_id: &str,
        _reason: &str,
        _exit_time: DateTime<Utc>,
        _pnl: Option<f64>,
    ) -> StoreResult<bool> {
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// harness

struct Harness {
    users: Arc<MemoryUserStore>,
    subs: Arc<MemorySubscriptionStore>,
    trades: Arc<MemoryTradeStore>,
    connector: Arc<MockConnector>,
    engine: TradeEngine,
    reconciler: SettlementReconciler,
    ledger: SubscriptionLedger,
}

fn harness(entry_price: f64) -> Harness {
    let users = Arc::new(MemoryUserStore::default());
    let subs = Arc::new(MemorySubscriptionStore::default());
    let trades = Arc::new(MemoryTradeStore::default());
    let connector = Arc::new(MockConnector::new(entry_price));
    let locks = Arc::new(BalanceLocks::new());

    let engine = TradeEngine::new(
        connector.clone(),
        users.clone(),
        subs.clone(),
        trades.clone(),
        PositionSizer::default(),
        EngineConfig::default(),
    );
    let reconciler = SettlementReconciler::new(
        connector.clone(),
        users.clone(),
        subs.clone(),
        trades.clone(),
        locks.clone(),
        SettlementConfig {
            poll_attempts: 2,
            poll_base_delay: Duration::from_millis(1),
        },
    );
    let ledger = SubscriptionLedger::new(
        connector.clone(),
        users.clone(),
        subs.clone(),
        trades.clone(),
        locks,
    );

    Harness {
        users,
        subs,
        trades,
        connector,
        engine,
        reconciler,
        ledger,
    }
}

async fn connected_subscriber(h: &Harness, user_id: &str, amount: f64) {
    let creds = ExchangeCredentials::new("bybit", &format!("key-{}", user_id), "secret", None);
    h.ledger.connect_exchange(user_id, creds).await.unwrap();
    h.ledger
        .subscribe(user_id, "BTC_USDT", amount)
        .await
        .unwrap();
}

fn open_signal() -> OpenSignal {
    OpenSignal {
        symbol: "BTC/USDT".to_string(),
        direction: "long".to_string(),
        stop_loss: Some(580.0),
        take_profit: Some(650.0),
        investment_per_trade: 1.0,
        amount_multiplier: 50.0,
    }
}

fn close_signal(reason: &str) -> CloseSignal {
    CloseSignal {
        symbol: "BTC/USDT".to_string(),
        direction: "long".to_string(),
        reason: reason.to_string(),
    }
}

// ---------------------------------------------------------------------------
// open fan-out

#[tokio::test]
async fn open_signal_fans_out_to_every_subscriber() {
    let h = harness(600.0);
    for user in ["u1", "u2", "u3"] {
        connected_subscriber(&h, user, 1000.0).await;
    }

    let report = h.engine.open_trade(&open_signal()).await.unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(report.successes(), 3);

    // capital 1000, 1% at x50, price 600, step 0.01 -> "0.83"
    for outcome in &report.outcomes {
        match &outcome.result {
            SubscriberResult::Success { qty, entry_price, .. } => {
                assert_eq!(qty, "0.83");
                assert_eq!(*entry_price, 600.0);
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    for user in ["u1", "u2", "u3"] {
        let open = h
            .trades
            .find_open(user, "BTCUSDT", Direction::Long)
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].status, STATUS_OPEN);
    }
}

#[tokio::test]
async fn one_failing_subscriber_does_not_stop_the_others() {
    let h = harness(600.0);
    for user in ["u1", "u2", "u3"] {
        connected_subscriber(&h, user, 1000.0).await;
    }
    h.connector.fail_orders_for("key-u2");

    let report = h.engine.open_trade(&open_signal()).await.unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(report.successes(), 2);
    assert_eq!(report.failures(), 1);

    let failed = report
        .outcomes
        .iter()
        .find(|o| o.user_id == "u2")
        .unwrap();
    match &failed.result {
        SubscriberResult::Failed { reason } => assert!(reason.contains("110007")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(h
        .trades
        .find_open("u2", "BTCUSDT", Direction::Long)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn duplicate_open_is_refused_per_subscriber() {
    let h = harness(600.0);
    connected_subscriber(&h, "u1", 1000.0).await;

    let first = h.engine.open_trade(&open_signal()).await.unwrap();
    assert_eq!(first.successes(), 1);

    let second = h.engine.open_trade(&open_signal()).await.unwrap();
    assert_eq!(second.failures(), 1);
    match &second.outcomes[0].result {
        SubscriberResult::Failed { reason } => assert!(reason.contains("already open")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(
        h.trades
            .find_open("u1", "BTCUSDT", Direction::Long)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn invalid_direction_rejects_the_whole_signal() {
    let h = harness(600.0);
    connected_subscriber(&h, "u1", 1000.0).await;

    let mut signal = open_signal();
    signal.direction = "sideways".to_string();
    assert!(h.engine.open_trade(&signal).await.is_err());
    assert!(h
        .trades
        .find_open("u1", "BTCUSDT", Direction::Long)
        .await
        .unwrap()
        .is_empty());
}

// ---------------------------------------------------------------------------
// settlement

#[tokio::test]
async fn losing_trade_floors_bot_balance_and_debits_user() {
    let h = harness(600.0);
    connected_subscriber(&h, "u1", 100.0).await;
    // 10% at x50 keeps the small bot above the notional threshold.
    h.engine
        .open_trade(&OpenSignal {
            investment_per_trade: 10.0,
            ..open_signal()
        })
        .await
        .unwrap();

    h.connector.push_closed_pnl(600.0, -150.0);
    let report = h.reconciler.close_trade(&close_signal("SL")).await.unwrap();
    match report.outcome {
        SettlementOutcome::Settled {
            pnl,
            balances_updated,
            ..
        } => {
            assert_eq!(pnl, -150.0);
            assert!(balances_updated);
        }
        other => panic!("expected settled, got {:?}", other),
    }

    let sub = h.subs.find("u1", "BTC_USDT").await.unwrap().unwrap();
    assert_eq!(sub.bot_current_balance, 0.0);
    let user = h.users.get("u1").await.unwrap().unwrap();
    assert_eq!(user.user_current_balance, -150.0);
}

#[tokio::test]
async fn settlement_is_idempotent() {
    let h = harness(600.0);
    connected_subscriber(&h, "u1", 1000.0).await;
    h.engine.open_trade(&open_signal()).await.unwrap();
    h.connector.push_closed_pnl(600.0, 42.0);

    let first = h.reconciler.close_trade(&close_signal("TP")).await.unwrap();
    assert!(matches!(first.outcome, SettlementOutcome::Settled { .. }));

    // The trade is closed now, so a repeat finds nothing open.
    let err = h.reconciler.close_trade(&close_signal("TP")).await.unwrap_err();
    assert!(matches!(err, SettlementError::OpenTradeNotFound { .. }));

    let user = h.users.get("u1").await.unwrap().unwrap();
    assert_eq!(user.user_current_balance, 42.0);
    let sub = h.subs.find("u1", "BTC_USDT").await.unwrap().unwrap();
    assert_eq!(sub.bot_current_balance, 1042.0);
}

#[tokio::test]
async fn pnl_match_tie_breaks_to_first_record() {
    let h = harness(84258.89);
    connected_subscriber(&h, "u1", 1000.0).await;
    h.engine
        .open_trade(&OpenSignal {
            investment_per_trade: 100.0,
            ..open_signal()
        })
        .await
        .unwrap();

    // Both records truncate to 84258.8, like the trade's entry price.
    h.connector.push_closed_pnl(84258.81, 5.0);
    h.connector.push_closed_pnl(84258.89, 9.0);

    let report = h.reconciler.close_trade(&close_signal("TP")).await.unwrap();
    match report.outcome {
        SettlementOutcome::Settled { pnl, .. } => assert_eq!(pnl, 5.0),
        other => panic!("expected settled, got {:?}", other),
    }
}

#[tokio::test]
async fn no_matching_pnl_still_closes_the_trade() {
    let h = harness(600.0);
    connected_subscriber(&h, "u1", 1000.0).await;
    h.engine.open_trade(&open_signal()).await.unwrap();
    h.connector.push_closed_pnl(999.9, 7.0);

    let report = h.reconciler.close_trade(&close_signal("TP")).await.unwrap();
    assert!(matches!(
        report.outcome,
        SettlementOutcome::ClosedNoMatch { .. }
    ));

    // Balances untouched without a conclusive match.
    let user = h.users.get("u1").await.unwrap().unwrap();
    assert_eq!(user.user_current_balance, 0.0);
    assert!(h
        .trades
        .find_open("u1", "BTCUSDT", Direction::Long)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn ledger_write_failure_reports_partial_settlement() {
    let h = harness(600.0);
    connected_subscriber(&h, "u1", 1000.0).await;
    h.engine.open_trade(&open_signal()).await.unwrap();
    h.connector.push_closed_pnl(600.0, 42.0);

    let reconciler = SettlementReconciler::new(
        h.connector.clone(),
        h.users.clone(),
        Arc::new(BalanceWriteOutage {
            inner: h.subs.clone(),
        }),
        h.trades.clone(),
        Arc::new(BalanceLocks::new()),
        SettlementConfig {
            poll_attempts: 2,
            poll_base_delay: Duration::from_millis(1),
        },
    );

    let report = reconciler.close_trade(&close_signal("TP")).await.unwrap();
    match report.outcome {
        SettlementOutcome::Settled {
            pnl,
            balances_updated,
            ..
        } => {
            assert_eq!(pnl, 42.0);
            assert!(!balances_updated);
        }
        other => panic!("expected partial settlement, got {:?}", other),
    }

    // The trade still closes; the bot balance stays put while the user-side
    // write, which did not fail, lands.
    assert!(h
        .trades
        .find_open("u1", "BTCUSDT", Direction::Long)
        .await
        .unwrap()
        .is_empty());
    let sub = h.subs.find("u1", "BTC_USDT").await.unwrap().unwrap();
    assert_eq!(sub.bot_current_balance, 1000.0);
    let user = h.users.get("u1").await.unwrap().unwrap();
    assert_eq!(user.user_current_balance, 42.0);
}

#[tokio::test]
async fn settlement_losing_the_close_race_reports_already_closed() {
    let h = harness(600.0);
    connected_subscriber(&h, "u1", 1000.0).await;
    h.engine.open_trade(&open_signal()).await.unwrap();
    h.connector.push_closed_pnl(600.0, 42.0);

    let reconciler = SettlementReconciler::new(
        h.connector.clone(),
        h.users.clone(),
        h.subs.clone(),
        Arc::new(LostRaceTradeStore {
            inner: h.trades.clone(),
        }),
        Arc::new(BalanceLocks::new()),
        SettlementConfig {
            poll_attempts: 2,
            poll_base_delay: Duration::from_millis(1),
        },
    );

    let report = reconciler.close_trade(&close_signal("TP")).await.unwrap();
    assert!(matches!(report.outcome, SettlementOutcome::AlreadyClosed));

    // The losing settlement must not touch any balance.
    let user = h.users.get("u1").await.unwrap().unwrap();
    assert_eq!(user.user_current_balance, 0.0);
    let sub = h.subs.find("u1", "BTC_USDT").await.unwrap().unwrap();
    assert_eq!(sub.bot_current_balance, 1000.0);
}

#[tokio::test]
async fn close_without_open_trade_is_an_error() {
    let h = harness(600.0);
    connected_subscriber(&h, "u1", 1000.0).await;
    let err = h.reconciler.close_trade(&close_signal("TP")).await.unwrap_err();
    assert!(matches!(err, SettlementError::OpenTradeNotFound { .. }));
}

#[tokio::test]
async fn closing_order_is_reduce_only() {
    let h = harness(600.0);
    connected_subscriber(&h, "u1", 1000.0).await;
    h.engine.open_trade(&open_signal()).await.unwrap();
    h.connector.push_closed_pnl(600.0, 1.0);
    h.reconciler.close_trade(&close_signal("TP")).await.unwrap();

    let orders = h.connector.placed_orders();
    assert_eq!(orders.len(), 2);
    assert!(!orders[0].reduce_only);
    assert!(orders[1].reduce_only);
    assert_eq!(orders[1].direction, Direction::Short);
}

// ---------------------------------------------------------------------------
// ledger

#[tokio::test]
async fn subscribe_requires_free_balance() {
    let h = harness(600.0);
    let creds = ExchangeCredentials::new("bybit", "key-u1", "secret", None);
    h.ledger.connect_exchange("u1", creds).await.unwrap();

    // Mock exchange reports 10 000 USDT available.
    let err = h
        .ledger
        .subscribe("u1", "BTC_USDT", 20_000.0)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientBalance { .. }));

    h.ledger.subscribe("u1", "BTC_USDT", 9_000.0).await.unwrap();
    let err = h
        .ledger
        .subscribe("u1", "ETH_USDT", 2_000.0)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
}

#[tokio::test]
async fn duplicate_subscription_is_refused() {
    let h = harness(600.0);
    connected_subscriber(&h, "u1", 1000.0).await;
    let err = h
        .ledger
        .subscribe("u1", "BTC_USDT", 500.0)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::AlreadySubscribed { .. }));
}

#[tokio::test]
async fn unsubscribe_releases_the_allocation() {
    let h = harness(600.0);
    connected_subscriber(&h, "u1", 1000.0).await;
    let user = h.users.get("u1").await.unwrap().unwrap();
    assert_eq!(user.balance_allocated_to_bots, 1000.0);

    h.ledger.unsubscribe("u1", "BTC_USDT").await.unwrap();
    let user = h.users.get("u1").await.unwrap().unwrap();
    assert_eq!(user.balance_allocated_to_bots, 0.0);
    assert!(h.subs.find("u1", "BTC_USDT").await.unwrap().is_none());
}

#[tokio::test]
async fn unsubscribe_refused_while_a_trade_is_open() {
    let h = harness(600.0);
    connected_subscriber(&h, "u1", 1000.0).await;
    h.engine.open_trade(&open_signal()).await.unwrap();

    let err = h.ledger.unsubscribe("u1", "BTC_USDT").await.unwrap_err();
    assert!(matches!(err, LedgerError::OpenTradeExists { .. }));
    assert!(h.subs.find("u1", "BTC_USDT").await.unwrap().is_some());
    let user = h.users.get("u1").await.unwrap().unwrap();
    assert_eq!(user.balance_allocated_to_bots, 1000.0);

    // Settling the trade unblocks the teardown.
    h.connector.push_closed_pnl(600.0, 1.0);
    h.reconciler.close_trade(&close_signal("TP")).await.unwrap();
    h.ledger.unsubscribe("u1", "BTC_USDT").await.unwrap();
    assert!(h.subs.find("u1", "BTC_USDT").await.unwrap().is_none());
}

#[tokio::test]
async fn disconnect_refused_while_subscribed() {
    let h = harness(600.0);
    connected_subscriber(&h, "u1", 1000.0).await;

    let err = h.ledger.disconnect_exchange("u1").await.unwrap_err();
    match err {
        LedgerError::ActiveSubscriptions(bots) => assert_eq!(bots, vec!["BTC_USDT".to_string()]),
        other => panic!("expected active-subscriptions error, got {:?}", other),
    }

    h.ledger.unsubscribe("u1", "BTC_USDT").await.unwrap();
    h.ledger.disconnect_exchange("u1").await.unwrap();
    let user = h.users.get("u1").await.unwrap().unwrap();
    assert!(user.credentials.is_none());
}
