//! Builds per-user exchange clients from stored credentials.

use crate::domain::entities::user::ExchangeCredentials;
use crate::domain::errors::{ExchangeError, ExchangeResult};
use crate::domain::repositories::exchange_api::{ExchangeApi, ExchangeConnector};
use crate::infrastructure::bybit_client::BybitClient;
use crate::infrastructure::okx_client::OkxClient;
use std::sync::Arc;

pub struct ExchangeClientFactory {
    http: reqwest::Client,
    bybit_base_url: String,
    okx_base_url: String,
    recv_window: String,
    okx_simulated: bool,
}

impl ExchangeClientFactory {
    pub fn new(
        http: reqwest::Client,
        bybit_base_url: &str,
        okx_base_url: &str,
        recv_window: &str,
        okx_simulated: bool,
    ) -> Self {
        Self {
            http,
            bybit_base_url: bybit_base_url.to_string(),
            okx_base_url: okx_base_url.to_string(),
            recv_window: recv_window.to_string(),
            okx_simulated,
        }
    }
}

impl ExchangeConnector for ExchangeClientFactory {
    fn connect(&self, creds: &ExchangeCredentials) -> ExchangeResult<Arc<dyn ExchangeApi>> {
        match creds.exchange.to_lowercase().as_str() {
            "bybit" => Ok(Arc::new(BybitClient::new(
                self.http.clone(),
                &self.bybit_base_url,
                &creds.api_key,
                &creds.api_secret,
                &self.recv_window,
            ))),
            "okx" => {
                let passphrase = creds
                    .passphrase
                    .as_ref()
                    .ok_or_else(|| ExchangeError::Signing("okx credentials require a passphrase".to_string()))?;
                Ok(Arc::new(OkxClient::new(
                    self.http.clone(),
                    &self.okx_base_url,
                    &creds.api_key,
                    &creds.api_secret,
                    passphrase,
                    self.okx_simulated,
                )))
            }
            other => Err(ExchangeError::unsupported(other, "exchange integration")),
        }
    }
}
