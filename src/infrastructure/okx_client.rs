//! OKX v5 REST client
//!
//! Serves the account-level subset: credential probing, balances and market
//! orders. Market metadata, leverage and PnL reconciliation are routed to
//! Bybit only, so those calls report `Unsupported`.
//!
//! Signing: base64 HMAC-SHA256 over
//! `timestamp + METHOD + request_path + body`, with the timestamp in
//! ISO-8601 UTC at millisecond precision.

use crate::domain::errors::{ExchangeError, ExchangeResult};
use crate::domain::repositories::exchange_api::{
    AccountBalance, ClosedPnlRecord, ExchangeApi, InstrumentInfo, MarketOrderRequest, PositionInfo,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

const EXCHANGE_NAME: &str = "okx";

pub struct OkxClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: Zeroizing<String>,
    passphrase: Zeroizing<String>,
    simulated: bool,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct BalanceData {
    details: Vec<BalanceDetail>,
}

#[derive(Debug, Deserialize)]
struct BalanceDetail {
    ccy: String,
    #[serde(rename = "availBal")]
    avail_bal: String,
    #[serde(rename = "cashBal")]
    cash_bal: String,
}

#[derive(Debug, Deserialize)]
struct OrderData {
    #[serde(rename = "ordId")]
    ord_id: String,
}

impl OkxClient {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        api_key: &str,
        api_secret: &str,
        passphrase: &str,
        simulated: bool,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: Zeroizing::new(api_secret.to_string()),
            passphrase: Zeroizing::new(passphrase.to_string()),
            simulated,
        }
    }

    fn sign(&self, timestamp: &str, method: &str, request_path: &str, body: &str) -> ExchangeResult<String> {
        let message = format!("{}{}{}{}", timestamp, method, request_path, body);
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Signing(e.to_string()))?;
        mac.update(message.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    async fn signed_request<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        request_path: &str,
        body: Option<String>,
    ) -> ExchangeResult<Vec<T>> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let body_str = body.unwrap_or_default();
        let signature = self.sign(&timestamp, method.as_str(), request_path, &body_str)?;

        debug!(path = request_path, method = %method, "signed request");
        let mut request = self
            .http
            .request(method, format!("{}{}", self.base_url, request_path))
            .header("OK-ACCESS-KEY", &self.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", &timestamp)
            .header("OK-ACCESS-PASSPHRASE", self.passphrase.as_str())
            .header("Content-Type", "application/json");
        if self.simulated {
            request = request.header("x-simulated-trading", "1");
        }
        if !body_str.is_empty() {
            request = request.body(body_str);
        }

        let envelope: Envelope<T> = request
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| ExchangeError::Decode(e.to_string()))?;

        if envelope.code != "0" {
            let code = envelope.code.parse().unwrap_or(-1);
            return Err(ExchangeError::ApiRejection {
                code,
                message: envelope.msg,
            });
        }
        Ok(envelope.data)
    }
}

fn parse_f64(value: &str, field: &str) -> ExchangeResult<f64> {
    value
        .parse()
        .map_err(|_| ExchangeError::Decode(format!("{} '{}' is not a number", field, value)))
}

#[async_trait]
impl ExchangeApi for OkxClient {
    fn name(&self) -> &str {
        EXCHANGE_NAME
    }

    async fn test_connection(&self) -> bool {
        self.fetch_balance().await.is_ok()
    }

    async fn fetch_balance(&self) -> ExchangeResult<Vec<AccountBalance>> {
        let data: Vec<BalanceData> = self
            .signed_request(reqwest::Method::GET, "/api/v5/account/balance", None)
            .await?;
        let mut balances = Vec::new();
        for account in data {
            for detail in account.details {
                balances.push(AccountBalance {
                    currency: detail.ccy,
                    available: parse_f64(&detail.avail_bal, "availBal")?,
                    total: parse_f64(&detail.cash_bal, "cashBal")?,
                });
            }
        }
        Ok(balances)
    }

    async fn server_time_ms(&self) -> ExchangeResult<i64> {
        Err(ExchangeError::unsupported(EXCHANGE_NAME, "server_time_ms"))
    }

    async fn instrument_info(&self, _symbol: &str) -> ExchangeResult<InstrumentInfo> {
        Err(ExchangeError::unsupported(EXCHANGE_NAME, "instrument_info"))
    }

    async fn last_price(&self, _symbol: &str) -> ExchangeResult<f64> {
        Err(ExchangeError::unsupported(EXCHANGE_NAME, "last_price"))
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: &str) -> ExchangeResult<()> {
        Err(ExchangeError::unsupported(EXCHANGE_NAME, "set_leverage"))
    }

    async fn place_market_order(&self, order: &MarketOrderRequest) -> ExchangeResult<String> {
        let body = json!({
            "instId": order.symbol,
            "tdMode": "cross",
            "side": order.direction.order_side().to_lowercase(),
            "ordType": "market",
            "sz": order.qty,
            "reduceOnly": order.reduce_only,
        })
        .to_string();
        let data: Vec<OrderData> = self
            .signed_request(reqwest::Method::POST, "/api/v5/trade/order", Some(body))
            .await?;
        data.into_iter()
            .next()
            .map(|o| o.ord_id)
            .ok_or_else(|| ExchangeError::MissingData("order response empty".to_string()))
    }

    async fn position_info(&self, _symbol: &str) -> ExchangeResult<PositionInfo> {
        Err(ExchangeError::unsupported(EXCHANGE_NAME, "position_info"))
    }

    async fn closed_pnl(&self, _symbol: &str) -> ExchangeResult<Vec<ClosedPnlRecord>> {
        Err(ExchangeError::unsupported(EXCHANGE_NAME, "closed_pnl"))
    }
}
