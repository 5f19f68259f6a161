//! Secondary venue REST client.

use super::traits::HedgeVenue;
use super::types::*;
use crate::config::HedgeVenueConfig;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{header::CONTENT_TYPE, Client, Method};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use tracing::{debug, info, instrument};

/// Authenticated REST client for the hedge venue.
pub struct HedgeVenueClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    subaccount: Option<String>,
}

impl HedgeVenueClient {
    pub fn new(config: &HedgeVenueConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            subaccount: config.subaccount.clone().filter(|s| !s.is_empty()),
        })
    }

    /// Hex HMAC-SHA256 of `timestamp + METHOD + path + body`.
    fn sign(&self, payload: &str) -> Result<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| anyhow!("invalid API secret: {}", e))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
    ) -> Result<T> {
        let timestamp = Utc::now().timestamp_millis();
        let body = body.unwrap_or_default();
        let signature = self.sign(&format!("{}{}{}{}", timestamp, method.as_str(), path, body))?;

        let mut request = self
            .http
            .request(method.clone(), format!("{}{}", self.base_url, path))
            .header("API-KEY", &self.api_key)
            .header("API-SIGN", signature)
            .header("API-TS", timestamp.to_string());
        if let Some(subaccount) = &self.subaccount {
            request = request.header("API-SUBACCOUNT", urlencoding::encode(subaccount).into_owned());
        }
        if !body.is_empty() {
            request = request.header(CONTENT_TYPE, "application/json").body(body);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to call {} {}", method, path))?;
        let status = response.status();
        let envelope: VenueResponse<T> = response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} {} response", method, path))?;

        if !envelope.success {
            bail!(
                "{} {} failed ({}): {}",
                method,
                path,
                status,
                envelope.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }
        envelope
            .result
            .with_context(|| format!("{} {} returned no result", method, path))
    }
}

#[async_trait]
impl HedgeVenue for HedgeVenueClient {
    #[instrument(skip(self))]
    async fn get_market(&self, market: &str) -> Result<HedgeMarket> {
        let path = format!("/api/markets/{}", urlencoding::encode(market));
        let raw: VenueMarket = self.request(Method::GET, &path, None).await?;

        let price = raw
            .price
            .or(raw.last)
            .with_context(|| format!("market {} has no price", raw.name))?;
        Ok(HedgeMarket {
            name: raw.name,
            price,
            min_order_size: raw.min_provide_size,
            size_increment: raw.size_increment,
        })
    }

    #[instrument(skip(self))]
    async fn position_size(&self, market: &str) -> Result<Decimal> {
        let positions: Vec<VenuePosition> = self.request(Method::GET, "/api/positions", None).await?;
        let size = positions
            .into_iter()
            .find(|p| p.future == market)
            .map(|p| p.net_size)
            .unwrap_or_default();
        debug!(%market, %size, "Fetched hedge position");
        Ok(size)
    }

    #[instrument(skip(self))]
    async fn margin_fraction(&self) -> Result<Option<Decimal>> {
        let account: VenueAccount = self.request(Method::GET, "/api/account", None).await?;
        debug!(
            collateral = %account.collateral,
            free_collateral = %account.free_collateral,
            margin_fraction = ?account.margin_fraction,
            "Fetched hedge account"
        );
        Ok(account.margin_fraction)
    }

    #[instrument(skip(self))]
    async fn place_market_order(&self, order: &HedgeOrder) -> Result<HedgeOrderResponse> {
        let body = serde_json::to_string(&VenueOrderRequest {
            market: &order.market,
            side: order.side,
            price: None,
            order_type: "market",
            size: order.size,
            reduce_only: order.reduce_only,
        })
        .context("Failed to encode order")?;

        let response: HedgeOrderResponse = self.request(Method::POST, "/api/orders", Some(body)).await?;
        info!(
            id = response.id,
            market = %response.market,
            side = ?response.side,
            size = %response.size,
            status = %response.status,
            "Hedge order placed"
        );
        Ok(response)
    }
}
