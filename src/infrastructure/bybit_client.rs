//! Bybit v5 REST client
//!
//! Signs private requests with HMAC-SHA256 over
//! `timestamp + api_key + recv_window + payload`, where payload is the query
//! string for GET and the compact JSON body for POST. POST bodies serialize
//! with sorted keys so the signed bytes match the sent bytes.

use crate::domain::entities::trade::Direction;
use crate::domain::errors::{ExchangeError, ExchangeResult};
use crate::domain::repositories::exchange_api::{
    AccountBalance, ClosedPnlRecord, ExchangeApi, InstrumentInfo, MarketOrderRequest, PositionInfo,
};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, warn};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

const CATEGORY_LINEAR: &str = "linear";
/// "Leverage not modified" is returned when the requested leverage is
/// already set. Not a failure.
const RET_LEVERAGE_NOT_MODIFIED: i64 = 110043;

pub struct BybitClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: Zeroizing<String>,
    recv_window: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ListResult<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct TimeResult {
    #[serde(rename = "timeNano")]
    time_nano: String,
}

#[derive(Debug, Deserialize)]
struct WalletEntry {
    coin: Vec<CoinEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CoinEntry {
    coin: String,
    wallet_balance: String,
    #[serde(default)]
    available_to_withdraw: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentEntry {
    lot_size_filter: LotSizeFilter,
    leverage_filter: LeverageFilter,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LotSizeFilter {
    qty_step: String,
    min_order_qty: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeverageFilter {
    max_leverage: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerEntry {
    last_price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResult {
    order_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionEntry {
    symbol: String,
    side: String,
    size: String,
    avg_price: String,
    leverage: String,
    #[serde(rename = "positionIM", default)]
    position_im: String,
    created_time: String,
    #[serde(default)]
    stop_loss: String,
    #[serde(default)]
    take_profit: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClosedPnlEntry {
    symbol: String,
    side: String,
    avg_entry_price: String,
    closed_pnl: String,
}

impl BybitClient {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        api_key: &str,
        api_secret: &str,
        recv_window: &str,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: Zeroizing::new(api_secret.to_string()),
            recv_window: recv_window.to_string(),
        }
    }

    fn sign(&self, timestamp: &str, payload: &str) -> ExchangeResult<String> {
        let message = format!("{}{}{}{}", timestamp, self.api_key, self.recv_window, payload);
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Signing(e.to_string()))?;
        mac.update(message.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Millisecond timestamp for request signing. The exchange clock wins;
    /// the local clock covers a failed time query.
    async fn timestamp_ms(&self) -> String {
        match self.query_server_time().await {
            Ok(ms) => ms.to_string(),
            Err(e) => {
                warn!(error = %e, "server time unavailable, using local clock");
                Utc::now().timestamp_millis().to_string()
            }
        }
    }

    async fn query_server_time(&self) -> ExchangeResult<i64> {
        let result: TimeResult = self.public_get("/v5/market/time", &[]).await?;
        let nanos: i64 = result
            .time_nano
            .parse()
            .map_err(|_| ExchangeError::Decode(format!("timeNano '{}'", result.time_nano)))?;
        Ok(nanos / 1_000_000)
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> ExchangeResult<T> {
        let url = format!("{}{}{}", self.base_url, path, query_suffix(query));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;
        decode(response).await
    }

    async fn signed_get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> ExchangeResult<T> {
        let query_string = encode_query(query);
        let timestamp = self.timestamp_ms().await;
        let signature = self.sign(&timestamp, &query_string)?;
        let url = format!("{}{}{}", self.base_url, path, query_suffix(query));
        debug!(path, "signed GET");
        let response = self
            .http
            .get(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", &self.recv_window)
            .header("X-BAPI-SIGN", signature)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;
        decode(response).await
    }

    async fn signed_post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> ExchangeResult<Envelope<T>> {
        // serde_json maps are ordered; to_string yields compact sorted JSON,
        // which is exactly what gets signed and sent.
        let payload = body.to_string();
        let timestamp = self.timestamp_ms().await;
        let signature = self.sign(&timestamp, &payload)?;
        debug!(path, "signed POST");
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", &self.recv_window)
            .header("X-BAPI-SIGN", signature)
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;
        response
            .json::<Envelope<T>>()
            .await
            .map_err(|e| ExchangeError::Decode(e.to_string()))
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> ExchangeResult<T> {
    let envelope: Envelope<T> = response
        .json()
        .await
        .map_err(|e| ExchangeError::Decode(e.to_string()))?;
    unwrap_envelope(envelope)
}

fn unwrap_envelope<T>(envelope: Envelope<T>) -> ExchangeResult<T> {
    if envelope.ret_code != 0 {
        return Err(ExchangeError::ApiRejection {
            code: envelope.ret_code,
            message: envelope.ret_msg,
        });
    }
    envelope
        .result
        .ok_or_else(|| ExchangeError::MissingData("missing result".to_string()))
}

fn query_suffix(query: &[(&str, &str)]) -> String {
    if query.is_empty() {
        String::new()
    } else {
        format!("?{}", encode_query(query))
    }
}

fn encode_query(query: &[(&str, &str)]) -> String {
    query
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn parse_f64(value: &str, field: &str) -> ExchangeResult<f64> {
    value
        .parse()
        .map_err(|_| ExchangeError::Decode(format!("{} '{}' is not a number", field, value)))
}

/// Bybit sends "" or "0" for an unset trigger price.
fn optional_price(value: &str) -> Option<f64> {
    match value.parse::<f64>() {
        Ok(v) if v > 0.0 => Some(v),
        _ => None,
    }
}

#[async_trait]
impl ExchangeApi for BybitClient {
    fn name(&self) -> &str {
        "bybit"
    }

    async fn test_connection(&self) -> bool {
        self.fetch_balance().await.is_ok()
    }

    async fn fetch_balance(&self) -> ExchangeResult<Vec<AccountBalance>> {
        let result: ListResult<WalletEntry> = self
            .signed_get("/v5/account/wallet-balance", &[("accountType", "UNIFIED")])
            .await?;
        let mut balances = Vec::new();
        for wallet in result.list {
            for coin in wallet.coin {
                let total = parse_f64(&coin.wallet_balance, "walletBalance")?;
                let available = if coin.available_to_withdraw.is_empty() {
                    total
                } else {
                    parse_f64(&coin.available_to_withdraw, "availableToWithdraw")?
                };
                balances.push(AccountBalance {
                    currency: coin.coin,
                    available,
                    total,
                });
            }
        }
        Ok(balances)
    }

    async fn server_time_ms(&self) -> ExchangeResult<i64> {
        self.query_server_time().await
    }

    async fn instrument_info(&self, symbol: &str) -> ExchangeResult<InstrumentInfo> {
        let result: ListResult<InstrumentEntry> = self
            .public_get(
                "/v5/market/instruments-info",
                &[("category", CATEGORY_LINEAR), ("symbol", symbol)],
            )
            .await?;
        let entry = result
            .list
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::MissingData(format!("no instrument for {}", symbol)))?;
        Ok(InstrumentInfo {
            qty_step: parse_f64(&entry.lot_size_filter.qty_step, "qtyStep")?,
            min_order_qty: parse_f64(&entry.lot_size_filter.min_order_qty, "minOrderQty")?,
            max_leverage: parse_f64(&entry.leverage_filter.max_leverage, "maxLeverage")?,
        })
    }

    async fn last_price(&self, symbol: &str) -> ExchangeResult<f64> {
        let result: ListResult<TickerEntry> = self
            .public_get(
                "/v5/market/tickers",
                &[("category", CATEGORY_LINEAR), ("symbol", symbol)],
            )
            .await?;
        let entry = result
            .list
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::MissingData(format!("no ticker for {}", symbol)))?;
        parse_f64(&entry.last_price, "lastPrice")
    }

    async fn set_leverage(&self, symbol: &str, leverage: &str) -> ExchangeResult<()> {
        let body = json!({
            "category": CATEGORY_LINEAR,
            "symbol": symbol,
            "buyLeverage": leverage,
            "sellLeverage": leverage,
        });
        let envelope: Envelope<Value> = self.signed_post("/v5/position/set-leverage", &body).await?;
        match envelope.ret_code {
            0 | RET_LEVERAGE_NOT_MODIFIED => Ok(()),
            code => Err(ExchangeError::ApiRejection {
                code,
                message: envelope.ret_msg,
            }),
        }
    }

    async fn place_market_order(&self, order: &MarketOrderRequest) -> ExchangeResult<String> {
        let mut body = json!({
            "category": CATEGORY_LINEAR,
            "symbol": order.symbol,
            "side": order.direction.order_side(),
            "orderType": "Market",
            "qty": order.qty,
            "positionIdx": order.position_idx,
        });
        if order.reduce_only {
            body["reduceOnly"] = json!(true);
        }
        if let Some(stop_loss) = order.stop_loss {
            body["stopLoss"] = json!(stop_loss.to_string());
        }
        if let Some(take_profit) = order.take_profit {
            body["takeProfit"] = json!(take_profit.to_string());
        }
        let envelope: Envelope<OrderResult> = self.signed_post("/v5/order/create", &body).await?;
        Ok(unwrap_envelope(envelope)?.order_id)
    }

    async fn position_info(&self, symbol: &str) -> ExchangeResult<PositionInfo> {
        let result: ListResult<PositionEntry> = self
            .signed_get(
                "/v5/position/list",
                &[("category", CATEGORY_LINEAR), ("symbol", symbol)],
            )
            .await?;
        let entry = result
            .list
            .into_iter()
            .find(|p| p.size != "0" && !p.size.is_empty())
            .ok_or_else(|| ExchangeError::MissingData(format!("no open position for {}", symbol)))?;
        Ok(PositionInfo {
            symbol: entry.symbol,
            direction: Direction::from_position_side(&entry.side),
            size: entry.size,
            avg_price: parse_f64(&entry.avg_price, "avgPrice")?,
            created_time_ms: entry.created_time.parse().unwrap_or(0),
            leverage: parse_f64(&entry.leverage, "leverage")?,
            initial_margin: entry.position_im.parse().unwrap_or(0.0),
            stop_loss: optional_price(&entry.stop_loss),
            take_profit: optional_price(&entry.take_profit),
        })
    }

    async fn closed_pnl(&self, symbol: &str) -> ExchangeResult<Vec<ClosedPnlRecord>> {
        let result: ListResult<ClosedPnlEntry> = self
            .signed_get(
                "/v5/position/closed-pnl",
                &[("category", CATEGORY_LINEAR), ("symbol", symbol), ("limit", "50")],
            )
            .await?;
        result
            .list
            .into_iter()
            .map(|entry| {
                Ok(ClosedPnlRecord {
                    symbol: entry.symbol,
                    side: entry.side,
                    avg_entry_price: parse_f64(&entry.avg_entry_price, "avgEntryPrice")?,
                    closed_pnl: parse_f64(&entry.closed_pnl, "closedPnl")?,
                })
            })
            .collect()
    }
}
