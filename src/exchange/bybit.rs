//! Bybit v5 linear (USDT perpetual) connector
//!
//! Conditional market orders carry fixed stops and take-profits. Bybit's
//! trailing stop is a position attribute set through `/v5/position/trading-stop`
//! as an absolute price distance, so it has no order id of its own; the
//! connector reports it under a synthetic id derived from symbol and side.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::stream::{reconnecting_stream, SessionPlan, StreamSession};
use super::symbols::{SymbolRules, SymbolRulesCache};
use super::traits::{ConnectorResult, VenueConnector};
use crate::config::VenueConfig;
use crate::domain::{
    OrderHandle, OrderKind, OrderStatus, PositionEvent, ProtectiveOrderSpec, RemotePosition, Side,
    Trigger, Venue, VenueOrder,
};
use crate::error::ConnectorError;
use crate::signing::ApiCredentials;

pub const DEFAULT_BYBIT_REST: &str = "https://api.bybit.com";
pub const DEFAULT_BYBIT_WS: &str = "wss://stream.bybit.com/v5/private";
const TESTNET_BYBIT_REST: &str = "https://api-testnet.bybit.com";
const TESTNET_BYBIT_WS: &str = "wss://stream-testnet.bybit.com/v5/private";

const REQUEST_TIMEOUT_SECS: u64 = 10;
const CATEGORY: &str = "linear";
const SETTLE_COIN: &str = "USDT";
const TRAILING_ID_PREFIX: &str = "trailing:";

/// Bybit retCodes with engine-relevant meaning
const RET_OK: i64 = 0;
const RET_TIMESTAMP_INVALID: i64 = 10002;
const RET_INVALID_API_KEY: i64 = 10003;
const RET_SIGN_ERROR: i64 = 10004;
const RET_PERMISSION_DENIED: i64 = 10005;
const RET_TOO_MANY_VISITS: i64 = 10006;
const RET_SERVER_ERROR: i64 = 10016;
const RET_IP_RATE_LIMIT: i64 = 10018;
const RET_ORDER_NOT_EXISTS: i64 = 110001;
const RET_DUPLICATE_LINK_ID: i64 = 110072;
const RET_NOT_MODIFIED: i64 = 34040;

pub struct BybitConnector {
    http: Client,
    base_url: String,
    ws_url: String,
    credentials: ApiCredentials,
    recv_window_ms: u64,
    hedge_mode: bool,
    rules: SymbolRulesCache,
}

impl BybitConnector {
    pub fn new(config: &VenueConfig, credentials: ApiCredentials) -> ConnectorResult<Self> {
        let (default_rest, default_ws) = if config.testnet {
            (TESTNET_BYBIT_REST, TESTNET_BYBIT_WS)
        } else {
            (DEFAULT_BYBIT_REST, DEFAULT_BYBIT_WS)
        };

        let http = Client::builder()
            .user_agent("warden-bybit/0.1")
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| ConnectorError::TransientNetwork(format!("http client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(default_rest)
                .trim_end_matches('/')
                .to_string(),
            ws_url: config.ws_url.as_deref().unwrap_or(default_ws).to_string(),
            credentials,
            recv_window_ms: config.recv_window_ms,
            hedge_mode: config.hedge_mode,
            rules: SymbolRulesCache::new(),
        })
    }

    fn auth_headers(&self, payload: &str) -> ConnectorResult<HeaderMap> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let recv_window = self.recv_window_ms.to_string();
        let sign_payload = format!(
            "{}{}{}{}",
            timestamp, self.credentials.api_key, recv_window, payload
        );
        let signature = self.credentials.sign_hex(&sign_payload)?;

        let header = |value: &str| {
            HeaderValue::from_str(value)
                .map_err(|e| ConnectorError::AuthFailure(format!("invalid header value: {}", e)))
        };

        let mut headers = HeaderMap::new();
        headers.insert("X-BAPI-API-KEY", header(&self.credentials.api_key)?);
        headers.insert("X-BAPI-SIGN", header(&signature)?);
        headers.insert("X-BAPI-SIGN-TYPE", HeaderValue::from_static("2"));
        headers.insert("X-BAPI-TIMESTAMP", header(&timestamp)?);
        headers.insert("X-BAPI-RECV-WINDOW", header(&recv_window)?);
        Ok(headers)
    }

    async fn get(&self, path: &str, params: &[(&str, String)], signed: bool) -> ConnectorResult<Value> {
        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let mut req = self.http.get(&url);
        if signed {
            req = req.headers(self.auth_headers(&query)?);
        }
        self.send(req, &Method::GET, path).await
    }

    async fn post(&self, path: &str, body: Value) -> ConnectorResult<Value> {
        let body_text = body.to_string();
        let req = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .headers(self.auth_headers(&body_text)?)
            .header(CONTENT_TYPE, "application/json")
            .body(body_text);
        self.send(req, &Method::POST, path).await
    }

    async fn send(
        &self,
        req: reqwest::RequestBuilder,
        method: &Method,
        path: &str,
    ) -> ConnectorResult<Value> {
        let resp = req.send().await?;
        let status = resp.status();
        let reset_hint = rate_limit_reset(resp.headers());
        let text = resp.text().await?;

        match status.as_u16() {
            401 => return Err(ConnectorError::AuthFailure(text)),
            // Bybit answers 403 when the IP rate limit is breached
            403 | 429 => return Err(ConnectorError::RateLimited { retry_after: reset_hint }),
            500..=599 => {
                return Err(ConnectorError::TransientNetwork(format!(
                    "server error {}: {}",
                    status, text
                )))
            }
            _ => {}
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| ConnectorError::TransientNetwork(format!("invalid Bybit JSON: {}", e)))?;
        let ret_code = value.get("retCode").and_then(Value::as_i64).unwrap_or(-1);
        if ret_code != RET_OK {
            let ret_msg = value
                .get("retMsg")
                .and_then(Value::as_str)
                .unwrap_or_default();
            debug!("Bybit {} {} failed: retCode={} retMsg={}", method, path, ret_code, ret_msg);
            return Err(map_ret_code(ret_code, ret_msg, reset_hint));
        }

        Ok(value.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn symbol_rules(&self, symbol: &str) -> ConnectorResult<Option<SymbolRules>> {
        if let Some(rules) = self.rules.get(symbol) {
            return Ok(Some(rules));
        }
        let result = self
            .get(
                "/v5/market/instruments-info",
                &[("category", CATEGORY.to_string()), ("symbol", symbol.to_string())],
                false,
            )
            .await?;
        let rules = result
            .pointer("/list/0")
            .and_then(parse_instrument_rules);
        if let Some(rules) = rules {
            self.rules.insert(symbol, rules);
        }
        Ok(rules)
    }

    fn position_idx(&self, side: Side) -> u8 {
        match (self.hedge_mode, side) {
            (false, _) => 0,
            (true, Side::Long) => 1,
            (true, Side::Short) => 2,
        }
    }

    async fn place_conditional(
        &self,
        spec: &ProtectiveOrderSpec,
        trigger_price: Decimal,
        rules: Option<SymbolRules>,
    ) -> ConnectorResult<OrderHandle> {
        let trigger_price = rules.map(|r| r.round_price(trigger_price)).unwrap_or(trigger_price);
        let quantity = rules
            .map(|r| r.round_quantity(spec.quantity))
            .unwrap_or(spec.quantity);
        if quantity <= Decimal::ZERO {
            return Err(ConnectorError::rejected(
                "qty",
                format!("quantity {} below step size", spec.quantity),
            ));
        }

        let body = json!({
            "category": CATEGORY,
            "symbol": spec.symbol,
            "side": closing_side(spec.position_side),
            "orderType": "Market",
            "qty": quantity.normalize().to_string(),
            "triggerPrice": trigger_price.normalize().to_string(),
            "triggerDirection": trigger_direction(spec.position_side, spec.kind),
            "triggerBy": "MarkPrice",
            "reduceOnly": true,
            "closeOnTrigger": spec.kind == OrderKind::StopLoss,
            "orderLinkId": spec.idempotency_key,
            "positionIdx": self.position_idx(spec.position_side),
        });

        let trigger = Trigger::Fixed { trigger_price };
        let order_id = match self.post("/v5/order/create", body).await {
            Ok(result) => result
                .get("orderId")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    ConnectorError::TransientNetwork("orderId missing from response".to_string())
                })?,
            Err(err) if ret_code(&err) == Some(RET_DUPLICATE_LINK_ID) => {
                warn!(
                    symbol = %spec.symbol,
                    order_link_id = %spec.idempotency_key,
                    "Duplicate orderLinkId, resolving existing order"
                );
                self.order_id_by_link_id(&spec.symbol, &spec.idempotency_key)
                    .await?
            }
            Err(err) => return Err(err),
        };

        info!(symbol = %spec.symbol, kind = %spec.kind, order_id = %order_id, "Bybit protective order placed");
        Ok(OrderHandle {
            venue_order_id: order_id,
            client_order_id: spec.idempotency_key.clone(),
            status: OrderStatus::Active,
            trigger,
            quantity,
        })
    }

    async fn order_id_by_link_id(&self, symbol: &str, link_id: &str) -> ConnectorResult<String> {
        let result = self
            .get(
                "/v5/order/realtime",
                &[
                    ("category", CATEGORY.to_string()),
                    ("symbol", symbol.to_string()),
                    ("orderLinkId", link_id.to_string()),
                ],
                true,
            )
            .await?;
        result
            .pointer("/list/0/orderId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ConnectorError::rejected("link", format!("no order for {}", link_id)))
    }

    async fn set_trailing_stop(
        &self,
        spec: &ProtectiveOrderSpec,
        activation_price: Decimal,
        callback_rate: Decimal,
        rules: Option<SymbolRules>,
    ) -> ConnectorResult<OrderHandle> {
        let activation_price = rules
            .map(|r| r.round_price(activation_price))
            .unwrap_or(activation_price);
        let offset = trailing_offset(activation_price, callback_rate, rules);
        if offset <= Decimal::ZERO {
            return Err(ConnectorError::rejected(
                "trailing",
                format!("trailing distance rounds to zero at {}", activation_price),
            ));
        }

        let body = json!({
            "category": CATEGORY,
            "symbol": spec.symbol,
            "tpslMode": "Full",
            "trailingStop": offset.normalize().to_string(),
            "activePrice": activation_price.normalize().to_string(),
            "positionIdx": self.position_idx(spec.position_side),
        });

        match self.post("/v5/position/trading-stop", body).await {
            Ok(_) => {}
            Err(err) if ret_code(&err) == Some(RET_NOT_MODIFIED) => {
                debug!(symbol = %spec.symbol, "Trailing stop already set");
            }
            Err(err) => return Err(err),
        }

        info!(symbol = %spec.symbol, offset = %offset, "Bybit trailing stop set");
        Ok(OrderHandle {
            venue_order_id: trailing_order_id(&spec.symbol, spec.position_side),
            client_order_id: spec.idempotency_key.clone(),
            status: OrderStatus::Active,
            trigger: Trigger::Trailing {
                activation_price,
                callback_rate: offset_to_rate(offset, activation_price),
            },
            quantity: spec.quantity,
        })
    }
}

/// Absolute trailing distance: `activation × callback% / 100`, rounded to tick
fn trailing_offset(
    activation_price: Decimal,
    callback_rate: Decimal,
    rules: Option<SymbolRules>,
) -> Decimal {
    let raw = activation_price * callback_rate / dec!(100);
    rules.map(|r| r.round_price(raw)).unwrap_or(raw)
}

fn offset_to_rate(offset: Decimal, activation_price: Decimal) -> Decimal {
    if activation_price.is_zero() {
        return Decimal::ZERO;
    }
    (offset / activation_price * dec!(100)).round_dp(4)
}

fn trailing_order_id(symbol: &str, side: Side) -> String {
    format!("{}{}:{}", TRAILING_ID_PREFIX, symbol, side)
}

fn closing_side(side: Side) -> &'static str {
    match side {
        Side::Long => "Sell",
        Side::Short => "Buy",
    }
}

/// 1 = triggered when price rises to the trigger, 2 = when it falls
fn trigger_direction(side: Side, kind: OrderKind) -> u8 {
    match (side, kind) {
        (Side::Long, OrderKind::TakeProfit) | (Side::Short, OrderKind::StopLoss) => 1,
        _ => 2,
    }
}

fn rate_limit_reset(headers: &HeaderMap) -> Option<Duration> {
    let reset_ms = headers
        .get("X-Bapi-Limit-Reset-Timestamp")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())?;
    let wait_ms = reset_ms - Utc::now().timestamp_millis();
    Some(Duration::from_millis(wait_ms.max(0) as u64))
}

fn map_ret_code(code: i64, msg: &str, reset_hint: Option<Duration>) -> ConnectorError {
    match code {
        RET_INVALID_API_KEY | RET_SIGN_ERROR | RET_PERMISSION_DENIED | 33004 => {
            ConnectorError::AuthFailure(format!("[{}] {}", code, msg))
        }
        RET_TOO_MANY_VISITS | RET_IP_RATE_LIMIT => ConnectorError::RateLimited {
            retry_after: reset_hint,
        },
        RET_TIMESTAMP_INVALID | RET_SERVER_ERROR => {
            ConnectorError::TransientNetwork(format!("[{}] {}", code, msg))
        }
        _ => ConnectorError::rejected(code.to_string(), msg),
    }
}

fn ret_code(err: &ConnectorError) -> Option<i64> {
    match err {
        ConnectorError::VenueRejected { code, .. } => code.parse().ok(),
        _ => None,
    }
}

fn decimal_field(value: &Value, key: &str) -> Option<Decimal> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse::<Decimal>().ok())
}

fn parse_instrument_rules(entry: &Value) -> Option<SymbolRules> {
    Some(SymbolRules {
        tick_size: entry
            .pointer("/priceFilter/tickSize")?
            .as_str()?
            .parse()
            .ok()?,
        step_size: entry
            .pointer("/lotSizeFilter/qtyStep")?
            .as_str()?
            .parse()
            .ok()?,
        min_qty: entry
            .pointer("/lotSizeFilter/minOrderQty")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default(),
    })
}

/// Side from Bybit's `positionIdx` (hedge) or `side` (one-way)
fn parse_side(entry: &Value) -> Option<Side> {
    match entry.get("positionIdx").and_then(Value::as_i64) {
        Some(1) => return Some(Side::Long),
        Some(2) => return Some(Side::Short),
        _ => {}
    }
    match entry.get("side").and_then(Value::as_str) {
        Some("Buy") => Some(Side::Long),
        Some("Sell") => Some(Side::Short),
        _ => None,
    }
}

fn millis_field(entry: &Value, key: &str) -> Option<DateTime<Utc>> {
    entry
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
}

fn parse_position(entry: &Value) -> Option<RemotePosition> {
    let size = decimal_field(entry, "size")?;
    if size.is_zero() {
        return None;
    }
    let entry_price = decimal_field(entry, "avgPrice")
        .or_else(|| decimal_field(entry, "entryPrice"))
        .unwrap_or_default();
    Some(RemotePosition {
        venue: Venue::Bybit,
        symbol: entry.get("symbol")?.as_str()?.to_string(),
        side: parse_side(entry)?,
        quantity: size.abs(),
        entry_price,
        mark_price: decimal_field(entry, "markPrice").unwrap_or(entry_price),
        leverage: decimal_field(entry, "leverage")
            .and_then(|l| l.to_u32())
            .unwrap_or(1),
        opened_at: millis_field(entry, "createdTime"),
    })
}

/// A position's trailing stop, if set, reported as a venue order
fn trailing_from_position(entry: &Value, position: &RemotePosition) -> Option<VenueOrder> {
    let offset = decimal_field(entry, "trailingStop").filter(|d| !d.is_zero())?;
    let activation_price = decimal_field(entry, "activePrice").unwrap_or(position.entry_price);
    Some(VenueOrder {
        venue_order_id: trailing_order_id(&position.symbol, position.side),
        client_order_id: None,
        symbol: position.symbol.clone(),
        position_side: position.side,
        kind: OrderKind::TrailingStop,
        trigger: Trigger::Trailing {
            activation_price,
            callback_rate: offset_to_rate(offset, activation_price),
        },
        quantity: position.quantity,
    })
}

fn parse_conditional_order(entry: &Value, hedge_mode: bool) -> Option<VenueOrder> {
    if entry.get("reduceOnly").and_then(Value::as_bool) == Some(false) {
        return None;
    }
    let trigger_price = decimal_field(entry, "triggerPrice").filter(|p| !p.is_zero())?;
    let order_side = entry.get("side").and_then(Value::as_str)?;
    let position_side = match (hedge_mode, entry.get("positionIdx").and_then(Value::as_i64)) {
        (true, Some(1)) => Side::Long,
        (true, Some(2)) => Side::Short,
        _ if order_side == "Sell" => Side::Long,
        _ => Side::Short,
    };
    let direction = entry.get("triggerDirection").and_then(Value::as_i64)?;
    let kind = match (position_side, direction) {
        (Side::Long, 2) | (Side::Short, 1) => OrderKind::StopLoss,
        _ => OrderKind::TakeProfit,
    };

    Some(VenueOrder {
        venue_order_id: entry.get("orderId")?.as_str()?.to_string(),
        client_order_id: entry
            .get("orderLinkId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        symbol: entry.get("symbol")?.as_str()?.to_string(),
        position_side,
        kind,
        trigger: Trigger::Fixed { trigger_price },
        quantity: decimal_field(entry, "qty").unwrap_or_default(),
    })
}

#[async_trait]
impl VenueConnector for BybitConnector {
    fn venue(&self) -> Venue {
        Venue::Bybit
    }

    async fn list_positions(&self) -> ConnectorResult<Vec<RemotePosition>> {
        let result = self
            .get(
                "/v5/position/list",
                &[
                    ("category", CATEGORY.to_string()),
                    ("settleCoin", SETTLE_COIN.to_string()),
                ],
                true,
            )
            .await?;
        Ok(result
            .get("list")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(parse_position).collect())
            .unwrap_or_default())
    }

    async fn get_mark_price(&self, symbol: &str) -> ConnectorResult<Decimal> {
        let result = self
            .get(
                "/v5/market/tickers",
                &[("category", CATEGORY.to_string()), ("symbol", symbol.to_string())],
                false,
            )
            .await?;
        result
            .pointer("/list/0")
            .and_then(|t| decimal_field(t, "markPrice"))
            .ok_or_else(|| ConnectorError::rejected("ticker", format!("no mark price for {}", symbol)))
    }

    async fn place_protective_order(
        &self,
        spec: &ProtectiveOrderSpec,
    ) -> ConnectorResult<OrderHandle> {
        let rules = self.symbol_rules(&spec.symbol).await?;
        match (spec.kind, spec.trigger) {
            (OrderKind::StopLoss | OrderKind::TakeProfit, Trigger::Fixed { trigger_price }) => {
                self.place_conditional(spec, trigger_price, rules).await
            }
            (
                OrderKind::TrailingStop,
                Trigger::Trailing {
                    activation_price,
                    callback_rate,
                },
            ) => {
                self.set_trailing_stop(spec, activation_price, callback_rate, rules)
                    .await
            }
            (kind, trigger) => Err(ConnectorError::rejected(
                "invalid_trigger",
                format!("{} cannot use trigger {:?}", kind, trigger),
            )),
        }
    }

    async fn cancel_order(&self, symbol: &str, venue_order_id: &str) -> ConnectorResult<bool> {
        if let Some(rest) = venue_order_id.strip_prefix(TRAILING_ID_PREFIX) {
            let side = rest
                .rsplit(':')
                .next()
                .and_then(|s| Side::try_from(s).ok())
                .unwrap_or(Side::Long);
            let body = json!({
                "category": CATEGORY,
                "symbol": symbol,
                "tpslMode": "Full",
                "trailingStop": "0",
                "positionIdx": self.position_idx(side),
            });
            return match self.post("/v5/position/trading-stop", body).await {
                Ok(_) => Ok(true),
                Err(err) if ret_code(&err) == Some(RET_NOT_MODIFIED) => Ok(false),
                Err(err) => Err(err),
            };
        }

        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "orderId": venue_order_id,
        });
        match self.post("/v5/order/cancel", body).await {
            Ok(_) => Ok(true),
            Err(err) if ret_code(&err) == Some(RET_ORDER_NOT_EXISTS) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn list_protective_orders(&self) -> ConnectorResult<Vec<VenueOrder>> {
        let result = self
            .get(
                "/v5/order/realtime",
                &[
                    ("category", CATEGORY.to_string()),
                    ("settleCoin", SETTLE_COIN.to_string()),
                    ("orderFilter", "StopOrder".to_string()),
                ],
                true,
            )
            .await?;
        let mut orders: Vec<VenueOrder> = result
            .get("list")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|o| parse_conditional_order(o, self.hedge_mode))
                    .collect()
            })
            .unwrap_or_default();

        let positions = self
            .get(
                "/v5/position/list",
                &[
                    ("category", CATEGORY.to_string()),
                    ("settleCoin", SETTLE_COIN.to_string()),
                ],
                true,
            )
            .await?;
        if let Some(list) = positions.get("list").and_then(Value::as_array) {
            for entry in list {
                if let Some(position) = parse_position(entry) {
                    orders.extend(trailing_from_position(entry, &position));
                }
            }
        }
        Ok(orders)
    }

    fn stream_position_events(&self) -> BoxStream<'static, PositionEvent> {
        reconnecting_stream(Arc::new(BybitPrivateStream {
            ws_url: self.ws_url.clone(),
            credentials: self.credentials.clone(),
        }))
    }
}

/// Private WebSocket session subscribed to `position.linear`
struct BybitPrivateStream {
    ws_url: String,
    credentials: ApiCredentials,
}

#[async_trait]
impl StreamSession for BybitPrivateStream {
    fn label(&self) -> &'static str {
        "bybit-private"
    }

    async fn prepare(&self) -> ConnectorResult<SessionPlan> {
        let expires = Utc::now().timestamp_millis() + 10_000;
        let signature = self
            .credentials
            .sign_hex(&format!("GET/realtime{}", expires))?;
        Ok(SessionPlan {
            url: self.ws_url.clone(),
            handshake: vec![
                json!({"op": "auth", "args": [self.credentials.api_key, expires, signature]})
                    .to_string(),
                json!({"op": "subscribe", "args": ["position.linear"]}).to_string(),
            ],
        })
    }

    fn ping_frame(&self) -> tokio_tungstenite::tungstenite::Message {
        tokio_tungstenite::tungstenite::Message::Text(json!({"op": "ping"}).to_string())
    }

    fn parse(&self, text: &str) -> Vec<PositionEvent> {
        parse_position_message(text)
    }
}

fn parse_position_message(text: &str) -> Vec<PositionEvent> {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return Vec::new();
    };
    if let Some(op) = value.get("op").and_then(Value::as_str) {
        if op == "auth" && value.get("success").and_then(Value::as_bool) == Some(false) {
            warn!("Bybit private stream authentication rejected");
        }
        return Vec::new();
    }
    if value.get("topic").and_then(Value::as_str) != Some("position.linear") {
        return Vec::new();
    }

    let event_time = value
        .get("creationTime")
        .and_then(Value::as_i64)
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    let mut events = Vec::new();
    for entry in value.get("data").and_then(Value::as_array).into_iter().flatten() {
        let Some(symbol) = entry.get("symbol").and_then(Value::as_str) else {
            continue;
        };
        let size = decimal_field(entry, "size").unwrap_or_default();
        let entry_price = decimal_field(entry, "entryPrice")
            .or_else(|| decimal_field(entry, "avgPrice"))
            .unwrap_or_default();
        let mark_price = decimal_field(entry, "markPrice");

        // One-way closes arrive with an empty side
        let sides = match parse_side(entry) {
            Some(side) => vec![side],
            None => vec![Side::Long, Side::Short],
        };
        for side in sides {
            events.push(PositionEvent {
                venue: Venue::Bybit,
                symbol: symbol.to_string(),
                side,
                quantity: size.abs(),
                entry_price,
                mark_price,
                event_time,
            });
        }
    }
    events
}
