use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::blocking::Client;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::driver::{Algorithm, Market, MarketplaceDriver, NewOrder, OrderSnapshot, OrderType};
use crate::clock::Timestamp;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_BASE_URL: &str = "https://api2.nicehash.com";

const ORDER_PATH: &str = "/main/api/v2/hashpower/order";
const MY_ORDERS_PATH: &str = "/main/api/v2/hashpower/myOrders";

// SHA256 limits are expressed in TH/s.
const DISPLAY_MARKET_FACTOR: &str = "TH";
const MARKET_FACTOR: &str = "1000000000000";

/// NiceHash API key triple.
#[derive(Debug, Clone)]
pub struct NiceHashCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub organization_id: String,
}

impl NiceHashCredentials {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("SMARTMINER_NICEHASH_API_KEY").ok()?;
        let api_secret = std::env::var("SMARTMINER_NICEHASH_API_SECRET").ok()?;
        let organization_id = std::env::var("SMARTMINER_NICEHASH_ORGANIZATION_ID").ok()?;

        if api_key.is_empty() || api_secret.is_empty() || organization_id.is_empty() {
            return None;
        }

        Some(Self {
            api_key,
            api_secret,
            organization_id,
        })
    }
}

/// HMAC-SHA256 request signature, hex encoded.
///
/// The signed message is the NUL-joined sequence
/// `key, time, nonce, "", org, "", method, path, query` followed by
/// `NUL body` when a body is sent.
pub fn sign_request(
    creds: &NiceHashCredentials,
    time_ms: &str,
    nonce: &str,
    method: &str,
    path: &str,
    query: &str,
    body: Option<&str>,
) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(creds.api_secret.as_bytes())
        .map_err(|e| anyhow!("HMAC key error: {}", e))?;

    let parts = [
        creds.api_key.as_str(),
        time_ms,
        nonce,
        "",
        creds.organization_id.as_str(),
        "",
        method,
        path,
        query,
    ];
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            mac.update(&[0u8]);
        }
        mac.update(part.as_bytes());
    }
    if let Some(body) = body {
        mac.update(&[0u8]);
        mac.update(body.as_bytes());
    }

    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Live marketplace driver over the NiceHash REST API.
///
/// The API only accepts absolute limit/price updates, so `apply_delta`
/// reads the order first and posts `current + delta`.
pub struct NiceHashDriver {
    client: Client,
    base_url: String,
    creds: NiceHashCredentials,
}

impl NiceHashDriver {
    pub fn new(base_url: impl Into<String>, creds: NiceHashCredentials) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            creds,
        })
    }

    /// Signed request. `Ok(None)` on 404.
    fn call(&self, method: Method, path: &str, query: &str, body: Option<&Value>) -> Result<Option<Value>> {
        let body = body
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize request body")?;
        let time_ms = Utc::now().timestamp_millis().to_string();
        let nonce = Uuid::new_v4().to_string();
        let signature = sign_request(
            &self.creds,
            &time_ms,
            &nonce,
            method.as_str(),
            path,
            query,
            body.as_deref(),
        )?;

        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        debug!(method = %method, url = %url, "NiceHash request");

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header("X-Time", &time_ms)
            .header("X-Nonce", &nonce)
            .header("X-Organization-Id", &self.creds.organization_id)
            .header("X-Request-Id", Uuid::new_v4().to_string())
            .header("X-Auth", format!("{}:{}", self.creds.api_key, signature));
        if let Some(body) = body {
            request = request.header("Content-Type", "application/json").body(body);
        }

        let response = request
            .send()
            .with_context(|| format!("NiceHash {} {} failed", method, path))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let text = response.text().context("failed to read NiceHash response")?;
        if !status.is_success() {
            warn!(status = %status, path, error = %text, "NiceHash request rejected");
            bail!("NiceHash {} {} rejected ({}): {}", method, path, status, text);
        }
        if text.trim().is_empty() {
            return Ok(Some(Value::Null));
        }
        let value = serde_json::from_str(&text).context("failed to parse NiceHash response")?;
        Ok(Some(value))
    }

    fn update_price_and_limit(&self, order_id: &str, limit: f64, price: f64) -> Result<bool> {
        let path = format!("{}/{}/updatePriceAndLimit", ORDER_PATH, order_id);
        let body = json!({
            "price": format!("{:.4}", price),
            "limit": format!("{:.4}", limit),
            "displayMarketFactor": DISPLAY_MARKET_FACTOR,
            "marketFactor": MARKET_FACTOR,
        });
        Ok(self.call(Method::POST, &path, "", Some(&body))?.is_some())
    }
}

impl MarketplaceDriver for NiceHashDriver {
    fn get_order(&self, order_id: &str) -> Result<Option<OrderSnapshot>> {
        let path = format!("{}/{}", ORDER_PATH, order_id);
        match self.call(Method::GET, &path, "", None)? {
            Some(value) => parse_order(&value).map(Some),
            None => Ok(None),
        }
    }

    fn apply_delta(
        &self,
        order_id: &str,
        limit_delta: f64,
        price_delta: f64,
        timestamp: Timestamp,
    ) -> Result<bool> {
        let Some(current) = self.get_order(order_id)? else {
            return Ok(false);
        };
        let limit = (current.limit + limit_delta).max(0.0);
        let price = current.price + price_delta;
        let updated = self.update_price_and_limit(order_id, limit, price)?;
        info!(
            order_id,
            limit_delta,
            price_delta,
            limit,
            price,
            timestamp,
            "NiceHash order updated"
        );
        Ok(updated)
    }

    fn create_order(&self, order: NewOrder) -> Result<OrderSnapshot> {
        if order.order_id.is_some() {
            debug!("NiceHash assigns order ids, ignoring the requested one");
        }
        let body = json!({
            "market": order.market.as_str(),
            "algorithm": order.algorithm.as_str(),
            "displayMarketFactor": DISPLAY_MARKET_FACTOR,
            "marketFactor": MARKET_FACTOR,
            "amount": format!("{:.8}", order.amount),
            "price": format!("{:.4}", order.price),
            "poolId": order.pool_id,
            "limit": format!("{:.4}", order.limit),
            "type": order.order_type.as_str(),
        });
        let value = self
            .call(Method::POST, ORDER_PATH, "", Some(&body))?
            .ok_or_else(|| anyhow!("NiceHash order endpoint not found"))?;
        let snapshot = parse_order(&value)?;
        info!(order_id = %snapshot.order_id, limit = order.limit, price = order.price, "NiceHash order created");
        Ok(snapshot)
    }

    fn close_order(&self, order_id: &str) -> Result<bool> {
        let path = format!("{}/{}", ORDER_PATH, order_id);
        let closed = self.call(Method::DELETE, &path, "", None)?.is_some();
        if closed {
            info!(order_id, "NiceHash order closed");
        }
        Ok(closed)
    }

    fn list_orders(&self) -> Result<Vec<OrderSnapshot>> {
        let query = format!(
            "algorithm={}&active=true&op=LE&limit=100&ts={}",
            Algorithm::Sha256.as_str(),
            Utc::now().timestamp_millis()
        );
        let Some(value) = self.call(Method::GET, MY_ORDERS_PATH, &query, None)? else {
            return Ok(Vec::new());
        };
        value
            .get("list")
            .and_then(Value::as_array)
            .map(|list| list.iter().map(parse_order).collect::<Result<Vec<_>>>())
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    fn refill_order(&self, order_id: &str, amount: f64, _timestamp: Timestamp) -> Result<bool> {
        let path = format!("{}/{}/refill", ORDER_PATH, order_id);
        let body = json!({ "amount": format!("{:.8}", amount) });
        Ok(self.call(Method::POST, &path, "", Some(&body))?.is_some())
    }
}

/// NiceHash sends most numbers as strings.
fn number(value: &Value, key: &str) -> f64 {
    match value.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn timestamp(value: &Value, key: &str) -> Timestamp {
    value
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp())
        .unwrap_or(0)
}

fn parse_order(value: &Value) -> Result<OrderSnapshot> {
    let order_id = value
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("NiceHash order without id: {}", value))?
        .to_string();

    let market = value
        .get("market")
        .and_then(Value::as_str)
        .and_then(Market::parse)
        .unwrap_or_default();
    let order_type = match value
        .pointer("/type/code")
        .or_else(|| value.get("type"))
        .and_then(Value::as_str)
    {
        Some("FIXED") => OrderType::Fixed,
        _ => OrderType::Standard,
    };
    let pool_id = value
        .pointer("/pool/id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let created_at = timestamp(value, "createdTs");
    let updated_at = match timestamp(value, "updatedTs") {
        0 => created_at,
        ts => ts,
    };

    let limit = number(value, "limit");
    let effective_limit = match value.get("acceptedCurrentSpeed") {
        Some(_) => number(value, "acceptedCurrentSpeed"),
        None => limit,
    };

    Ok(OrderSnapshot {
        order_id,
        created_at,
        updated_at,
        limit,
        effective_limit,
        price: number(value, "price"),
        budget_left: number(value, "availableAmount"),
        pool_id,
        market,
        algorithm: Algorithm::Sha256,
        order_type,
    })
}
