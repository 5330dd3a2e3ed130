//! Binance USDⓈ-M futures connector
//!
//! REST endpoints under `/fapi`, HMAC-SHA256 query signing, and the user-data
//! WebSocket stream (listen key) for `ACCOUNT_UPDATE` position changes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
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

pub const DEFAULT_BINANCE_REST: &str = "https://fapi.binance.com";
pub const DEFAULT_BINANCE_WS: &str = "wss://fstream.binance.com/ws";
const TESTNET_BINANCE_REST: &str = "https://testnet.binancefuture.com";
const TESTNET_BINANCE_WS: &str = "wss://stream.binancefuture.com/ws";

const REQUEST_TIMEOUT_SECS: u64 = 10;
const LISTEN_KEY_KEEPALIVE: Duration = Duration::from_secs(25 * 60);

/// Binance error codes with engine-relevant meaning
const CODE_TIMESTAMP_OUTSIDE_WINDOW: i64 = -1021;
const CODE_TOO_MANY_REQUESTS: i64 = -1003;
const CODE_INVALID_SIGNATURE: i64 = -1022;
const CODE_UNKNOWN_ORDER: i64 = -2011;
const CODE_ORDER_DOES_NOT_EXIST: i64 = -2013;
const CODE_INVALID_API_KEY: i64 = -2014;
const CODE_REJECTED_API_KEY: i64 = -2015;
const CODE_DUPLICATE_CLIENT_ID: i64 = -4116;

#[derive(Debug, Deserialize)]
struct BinanceErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    position_amt: Decimal,
    entry_price: Decimal,
    mark_price: Decimal,
    #[serde(default)]
    leverage: Option<Decimal>,
    #[serde(default)]
    position_side: Option<String>,
    #[serde(default)]
    update_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PremiumIndex {
    mark_price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceOrder {
    order_id: i64,
    client_order_id: String,
    symbol: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    #[serde(default)]
    position_side: Option<String>,
    #[serde(default)]
    orig_qty: Option<Decimal>,
    #[serde(default)]
    stop_price: Option<Decimal>,
    #[serde(default)]
    activate_price: Option<Decimal>,
    #[serde(default)]
    price_rate: Option<Decimal>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenKey {
    listen_key: String,
}

pub struct BinanceConnector {
    http: Client,
    base_url: String,
    ws_url: String,
    credentials: ApiCredentials,
    recv_window_ms: u64,
    hedge_mode: bool,
    rules: SymbolRulesCache,
}

impl BinanceConnector {
    pub fn new(config: &VenueConfig, credentials: ApiCredentials) -> ConnectorResult<Self> {
        let (default_rest, default_ws) = if config.testnet {
            (TESTNET_BINANCE_REST, TESTNET_BINANCE_WS)
        } else {
            (DEFAULT_BINANCE_REST, DEFAULT_BINANCE_WS)
        };

        let http = Client::builder()
            .user_agent("warden-binance/0.1")
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
            ws_url: config
                .ws_url
                .as_deref()
                .unwrap_or(default_ws)
                .trim_end_matches('/')
                .to_string(),
            credentials,
            recv_window_ms: config.recv_window_ms,
            hedge_mode: config.hedge_mode,
            rules: SymbolRulesCache::new(),
        })
    }

    fn api_key_header(&self) -> ConnectorResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-MBX-APIKEY",
            HeaderValue::from_str(&self.credentials.api_key)
                .map_err(|e| ConnectorError::AuthFailure(format!("invalid API key header: {}", e)))?,
        );
        Ok(headers)
    }

    fn encode_query(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }

    async fn signed(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> ConnectorResult<Value> {
        params.push(("recvWindow", self.recv_window_ms.to_string()));
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));
        let query = Self::encode_query(&params);
        let signature = self.credentials.sign_hex(&query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let req = self
            .http
            .request(method.clone(), &url)
            .headers(self.api_key_header()?);
        self.send(req, &method, path).await
    }

    async fn public(&self, path: &str, params: &[(&str, String)]) -> ConnectorResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let req = self.http.get(&url).query(params);
        self.send(req, &Method::GET, path).await
    }

    async fn send(
        &self,
        req: reqwest::RequestBuilder,
        method: &Method,
        path: &str,
    ) -> ConnectorResult<Value> {
        let resp = req.send().await?;
        let status = resp.status();
        let retry_after = parse_retry_after(resp.headers());
        let text = resp.text().await?;

        if !status.is_success() {
            debug!("Binance {} {} failed: status={} body={}", method, path, status, text);
            return Err(map_error(status, &text, retry_after));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| ConnectorError::TransientNetwork(format!("invalid Binance JSON: {}", e)))
    }

    async fn symbol_rules(&self, symbol: &str) -> ConnectorResult<Option<SymbolRules>> {
        if let Some(rules) = self.rules.get(symbol) {
            return Ok(Some(rules));
        }

        let info = self.public("/fapi/v1/exchangeInfo", &[]).await?;
        let symbols = info
            .get("symbols")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for entry in symbols {
            if let Some((name, rules)) = parse_symbol_rules(entry) {
                self.rules.insert(name, rules);
            }
        }
        info!(symbols = self.rules.len(), "Loaded Binance symbol rules");

        Ok(self.rules.get(symbol))
    }

    async fn order_by_client_id(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> ConnectorResult<BinanceOrder> {
        let value = self
            .signed(
                Method::GET,
                "/fapi/v1/order",
                vec![
                    ("symbol", symbol.to_string()),
                    ("origClientOrderId", client_order_id.to_string()),
                ],
            )
            .await?;
        serde_json::from_value(value)
            .map_err(|e| ConnectorError::TransientNetwork(format!("invalid order payload: {}", e)))
    }

    fn order_params(
        &self,
        spec: &ProtectiveOrderSpec,
        rules: Option<SymbolRules>,
    ) -> ConnectorResult<Vec<(&'static str, String)>> {
        let round_price = |p: Decimal| rules.map(|r| r.round_price(p)).unwrap_or(p);
        let quantity = rules
            .map(|r| r.round_quantity(spec.quantity))
            .unwrap_or(spec.quantity);
        if quantity <= Decimal::ZERO {
            return Err(ConnectorError::rejected(
                "qty",
                format!("quantity {} below step size", spec.quantity),
            ));
        }

        let mut params: Vec<(&'static str, String)> = vec![
            ("symbol", spec.symbol.clone()),
            ("side", spec.position_side.closing_order_side().to_string()),
            ("quantity", quantity.normalize().to_string()),
            ("newClientOrderId", spec.idempotency_key.clone()),
            ("workingType", "MARK_PRICE".to_string()),
        ];
        if self.hedge_mode {
            params.push(("positionSide", spec.position_side.as_str().to_string()));
        } else {
            params.push(("reduceOnly", "true".to_string()));
        }

        match (spec.kind, spec.trigger) {
            (OrderKind::StopLoss, Trigger::Fixed { trigger_price }) => {
                params.push(("type", "STOP_MARKET".to_string()));
                params.push(("stopPrice", round_price(trigger_price).normalize().to_string()));
            }
            (OrderKind::TakeProfit, Trigger::Fixed { trigger_price }) => {
                params.push(("type", "TAKE_PROFIT_MARKET".to_string()));
                params.push(("stopPrice", round_price(trigger_price).normalize().to_string()));
            }
            (
                OrderKind::TrailingStop,
                Trigger::Trailing {
                    activation_price,
                    callback_rate,
                },
            ) => {
                params.push(("type", "TRAILING_STOP_MARKET".to_string()));
                params.push((
                    "activationPrice",
                    round_price(activation_price).normalize().to_string(),
                ));
                // Binance accepts callbackRate in [0.1, 5] with one decimal
                params.push(("callbackRate", callback_rate.round_dp(1).normalize().to_string()));
            }
            (kind, trigger) => {
                return Err(ConnectorError::rejected(
                    "invalid_trigger",
                    format!("{} cannot use trigger {:?}", kind, trigger),
                ))
            }
        }
        Ok(params)
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map a non-2xx Binance response onto the connector taxonomy
fn map_error(status: StatusCode, body: &str, retry_after: Option<Duration>) -> ConnectorError {
    let parsed = serde_json::from_str::<BinanceErrorBody>(body).ok();

    match status.as_u16() {
        418 | 429 => return ConnectorError::RateLimited { retry_after },
        401 => return ConnectorError::AuthFailure(body.to_string()),
        408 => return ConnectorError::TransientNetwork("request timeout".to_string()),
        500..=599 => {
            return ConnectorError::TransientNetwork(format!("server error {}: {}", status, body))
        }
        _ => {}
    }

    match parsed {
        Some(err) => match err.code {
            CODE_TIMESTAMP_OUTSIDE_WINDOW => ConnectorError::TransientNetwork(err.msg),
            CODE_TOO_MANY_REQUESTS => ConnectorError::RateLimited { retry_after },
            CODE_INVALID_SIGNATURE | CODE_INVALID_API_KEY | CODE_REJECTED_API_KEY => {
                ConnectorError::AuthFailure(err.msg)
            }
            code => ConnectorError::rejected(code.to_string(), err.msg),
        },
        None if status == StatusCode::FORBIDDEN => ConnectorError::AuthFailure(body.to_string()),
        None => ConnectorError::rejected(status.as_str(), body.to_string()),
    }
}

fn venue_code(err: &ConnectorError) -> Option<i64> {
    match err {
        ConnectorError::VenueRejected { code, .. } => code.parse().ok(),
        _ => None,
    }
}

fn parse_symbol_rules(entry: &Value) -> Option<(String, SymbolRules)> {
    let symbol = entry.get("symbol")?.as_str()?.to_string();
    let filters = entry.get("filters")?.as_array()?;
    let mut tick_size = None;
    let mut step_size = None;
    let mut min_qty = Decimal::ZERO;

    for filter in filters {
        let decimal = |key: &str| {
            filter
                .get(key)
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<Decimal>().ok())
        };
        match filter.get("filterType").and_then(Value::as_str) {
            Some("PRICE_FILTER") => tick_size = decimal("tickSize"),
            Some("LOT_SIZE") => {
                step_size = decimal("stepSize");
                min_qty = decimal("minQty").unwrap_or_default();
            }
            _ => {}
        }
    }

    Some((
        symbol,
        SymbolRules {
            tick_size: tick_size?,
            step_size: step_size?,
            min_qty,
        },
    ))
}

/// Position side from Binance's `positionSide` (hedge mode) or the amount's sign (one-way)
fn position_side(position_side: Option<&str>, amount: Decimal) -> Option<Side> {
    match position_side {
        Some("LONG") => Some(Side::Long),
        Some("SHORT") => Some(Side::Short),
        _ if amount > Decimal::ZERO => Some(Side::Long),
        _ if amount < Decimal::ZERO => Some(Side::Short),
        _ => None,
    }
}

fn millis_to_utc(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

impl BinanceOrder {
    fn kind(&self) -> Option<OrderKind> {
        match self.order_type.as_str() {
            "STOP_MARKET" | "STOP" => Some(OrderKind::StopLoss),
            "TRAILING_STOP_MARKET" => Some(OrderKind::TrailingStop),
            "TAKE_PROFIT_MARKET" | "TAKE_PROFIT" => Some(OrderKind::TakeProfit),
            _ => None,
        }
    }

    fn trigger(&self) -> Option<Trigger> {
        match self.kind()? {
            OrderKind::TrailingStop => Some(Trigger::Trailing {
                activation_price: self.activate_price.unwrap_or_default(),
                callback_rate: self.price_rate?,
            }),
            _ => Some(Trigger::Fixed {
                trigger_price: self.stop_price?,
            }),
        }
    }

    /// Side of the position this order protects
    fn protected_side(&self) -> Side {
        match self.position_side.as_deref() {
            Some("LONG") => Side::Long,
            Some("SHORT") => Side::Short,
            _ if self.side == "SELL" => Side::Long,
            _ => Side::Short,
        }
    }

    fn status(&self) -> OrderStatus {
        match self.status.as_deref() {
            Some("FILLED") => OrderStatus::Filled,
            Some("CANCELED") | Some("EXPIRED") => OrderStatus::Cancelled,
            Some("REJECTED") => OrderStatus::Rejected,
            _ => OrderStatus::Active,
        }
    }

    fn into_handle(self, fallback: Trigger, quantity: Decimal) -> OrderHandle {
        OrderHandle {
            venue_order_id: self.order_id.to_string(),
            client_order_id: self.client_order_id.clone(),
            status: self.status(),
            trigger: self.trigger().unwrap_or(fallback),
            quantity: self.orig_qty.filter(|q| !q.is_zero()).unwrap_or(quantity),
        }
    }

    fn into_venue_order(self) -> Option<VenueOrder> {
        let kind = self.kind()?;
        let trigger = self.trigger()?;
        Some(VenueOrder {
            venue_order_id: self.order_id.to_string(),
            client_order_id: Some(self.client_order_id.clone()),
            symbol: self.symbol.clone(),
            position_side: self.protected_side(),
            kind,
            trigger,
            quantity: self.orig_qty.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl VenueConnector for BinanceConnector {
    fn venue(&self) -> Venue {
        Venue::Binance
    }

    async fn list_positions(&self) -> ConnectorResult<Vec<RemotePosition>> {
        let value = self
            .signed(Method::GET, "/fapi/v2/positionRisk", Vec::new())
            .await?;
        let rows: Vec<PositionRisk> = serde_json::from_value(value).map_err(|e| {
            ConnectorError::TransientNetwork(format!("invalid positionRisk payload: {}", e))
        })?;

        Ok(rows
            .into_iter()
            .filter(|p| !p.position_amt.is_zero())
            .filter_map(|p| {
                let side = position_side(p.position_side.as_deref(), p.position_amt)?;
                Some(RemotePosition {
                    venue: Venue::Binance,
                    symbol: p.symbol,
                    side,
                    quantity: p.position_amt.abs(),
                    entry_price: p.entry_price,
                    mark_price: p.mark_price,
                    leverage: p.leverage.and_then(|l| l.to_u32()).unwrap_or(1),
                    opened_at: p.update_time.and_then(millis_to_utc),
                })
            })
            .collect())
    }

    async fn get_mark_price(&self, symbol: &str) -> ConnectorResult<Decimal> {
        let value = self
            .public("/fapi/v1/premiumIndex", &[("symbol", symbol.to_string())])
            .await?;
        let index: PremiumIndex = serde_json::from_value(value).map_err(|e| {
            ConnectorError::TransientNetwork(format!("invalid premiumIndex payload: {}", e))
        })?;
        Ok(index.mark_price)
    }

    async fn place_protective_order(
        &self,
        spec: &ProtectiveOrderSpec,
    ) -> ConnectorResult<OrderHandle> {
        let rules = self.symbol_rules(&spec.symbol).await?;
        let params = self.order_params(spec, rules)?;

        match self.signed(Method::POST, "/fapi/v1/order", params).await {
            Ok(value) => {
                let order: BinanceOrder = serde_json::from_value(value).map_err(|e| {
                    ConnectorError::TransientNetwork(format!("invalid order payload: {}", e))
                })?;
                info!(
                    symbol = %spec.symbol,
                    kind = %spec.kind,
                    order_id = order.order_id,
                    "Binance protective order placed"
                );
                Ok(order.into_handle(spec.trigger, spec.quantity))
            }
            Err(err) if venue_code(&err) == Some(CODE_DUPLICATE_CLIENT_ID) => {
                warn!(
                    symbol = %spec.symbol,
                    client_order_id = %spec.idempotency_key,
                    "Duplicate client order id, resolving existing order"
                );
                let existing = self
                    .order_by_client_id(&spec.symbol, &spec.idempotency_key)
                    .await?;
                Ok(existing.into_handle(spec.trigger, spec.quantity))
            }
            Err(err) => Err(err),
        }
    }

    async fn cancel_order(&self, symbol: &str, venue_order_id: &str) -> ConnectorResult<bool> {
        let result = self
            .signed(
                Method::DELETE,
                "/fapi/v1/order",
                vec![
                    ("symbol", symbol.to_string()),
                    ("orderId", venue_order_id.to_string()),
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(err)
                if matches!(
                    venue_code(&err),
                    Some(CODE_UNKNOWN_ORDER) | Some(CODE_ORDER_DOES_NOT_EXIST)
                ) =>
            {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn list_protective_orders(&self) -> ConnectorResult<Vec<VenueOrder>> {
        let value = self
            .signed(Method::GET, "/fapi/v1/openOrders", Vec::new())
            .await?;
        let orders: Vec<BinanceOrder> = serde_json::from_value(value).map_err(|e| {
            ConnectorError::TransientNetwork(format!("invalid openOrders payload: {}", e))
        })?;
        Ok(orders
            .into_iter()
            .filter_map(BinanceOrder::into_venue_order)
            .collect())
    }

    fn stream_position_events(&self) -> BoxStream<'static, PositionEvent> {
        let session = BinanceUserStream {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            ws_url: self.ws_url.clone(),
            credentials: self.credentials.clone(),
        };
        reconnecting_stream(Arc::new(session))
    }
}

/// User-data stream session (listen key + `ACCOUNT_UPDATE`)
struct BinanceUserStream {
    http: Client,
    base_url: String,
    ws_url: String,
    credentials: ApiCredentials,
}

impl BinanceUserStream {
    async fn listen_key(&self, method: Method) -> ConnectorResult<Option<String>> {
        let resp = self
            .http
            .request(method, format!("{}/fapi/v1/listenKey", self.base_url))
            .header("X-MBX-APIKEY", &self.credentials.api_key)
            .send()
            .await?;
        let status = resp.status();
        let retry_after = parse_retry_after(resp.headers());
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(map_error(status, &text, retry_after));
        }
        Ok(serde_json::from_str::<ListenKey>(&text)
            .ok()
            .map(|k| k.listen_key))
    }
}

#[async_trait]
impl StreamSession for BinanceUserStream {
    fn label(&self) -> &'static str {
        "binance-user-data"
    }

    async fn prepare(&self) -> ConnectorResult<SessionPlan> {
        let key = self.listen_key(Method::POST).await?.ok_or_else(|| {
            ConnectorError::TransientNetwork("listenKey missing from response".to_string())
        })?;
        Ok(SessionPlan {
            url: format!("{}/{}", self.ws_url, key),
            handshake: Vec::new(),
        })
    }

    async fn keepalive(&self) -> ConnectorResult<()> {
        self.listen_key(Method::PUT).await.map(|_| ())
    }

    fn keepalive_interval(&self) -> Duration {
        LISTEN_KEY_KEEPALIVE
    }

    fn parse(&self, text: &str) -> Vec<PositionEvent> {
        parse_account_update(text)
    }
}

/// Decode `ACCOUNT_UPDATE` position entries.
///
/// In one-way mode a closed position arrives with `ps = BOTH` and zero
/// amount, so its side is unknown; both sides are reported as closed.
fn parse_account_update(text: &str) -> Vec<PositionEvent> {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return Vec::new();
    };
    if value.get("e").and_then(Value::as_str) != Some("ACCOUNT_UPDATE") {
        return Vec::new();
    }

    let event_time = value
        .get("E")
        .and_then(Value::as_i64)
        .and_then(millis_to_utc)
        .unwrap_or_else(Utc::now);
    let Some(positions) = value.pointer("/a/P").and_then(Value::as_array) else {
        return Vec::new();
    };

    let decimal = |v: &Value, key: &str| {
        v.get(key)
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<Decimal>().ok())
    };

    let mut events = Vec::new();
    for entry in positions {
        let Some(symbol) = entry.get("s").and_then(Value::as_str) else {
            continue;
        };
        let amount = decimal(entry, "pa").unwrap_or_default();
        let entry_price = decimal(entry, "ep").unwrap_or_default();
        let ps = entry.get("ps").and_then(Value::as_str);

        let sides: Vec<Side> = match position_side(ps, amount) {
            Some(side) => vec![side],
            None => vec![Side::Long, Side::Short],
        };
        for side in sides {
            events.push(PositionEvent {
                venue: Venue::Binance,
                symbol: symbol.to_string(),
                side,
                quantity: amount.abs(),
                entry_price,
                mark_price: None,
                event_time,
            });
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn maps_binance_error_codes() {
        let err = map_error(
            StatusCode::BAD_REQUEST,
            r#"{"code":-2021,"msg":"Order would immediately trigger."}"#,
            None,
        );
        assert_eq!(err, ConnectorError::rejected("-2021", "Order would immediately trigger."));

        let err = map_error(
            StatusCode::BAD_REQUEST,
            r#"{"code":-1021,"msg":"Timestamp for this request is outside of the recvWindow."}"#,
            None,
        );
        assert!(err.is_retryable());

        let err = map_error(
            StatusCode::UNAUTHORIZED,
            r#"{"code":-2015,"msg":"Invalid API-key, IP, or permissions for action."}"#,
            None,
        );
        assert!(err.is_fatal());

        let err = map_error(
            StatusCode::TOO_MANY_REQUESTS,
            "",
            Some(Duration::from_secs(7)),
        );
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));

        let err = map_error(StatusCode::BAD_GATEWAY, "upstream", None);
        assert!(matches!(err, ConnectorError::TransientNetwork(_)));
    }

    #[test]
    fn side_from_amount_or_position_side() {
        assert_eq!(position_side(Some("BOTH"), dec!(0.5)), Some(Side::Long));
        assert_eq!(position_side(Some("BOTH"), dec!(-2)), Some(Side::Short));
        assert_eq!(position_side(Some("SHORT"), dec!(-2)), Some(Side::Short));
        assert_eq!(position_side(Some("BOTH"), Decimal::ZERO), None);
    }

    #[test]
    fn parses_symbol_filters() {
        let entry: Value = serde_json::json!({
            "symbol": "BTCUSDT",
            "filters": [
                {"filterType": "PRICE_FILTER", "tickSize": "0.10", "minPrice": "556.80"},
                {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001"}
            ]
        });
        let (symbol, rules) = parse_symbol_rules(&entry).unwrap();
        assert_eq!(symbol, "BTCUSDT");
        assert_eq!(rules.tick_size, dec!(0.10));
        assert_eq!(rules.step_size, dec!(0.001));
    }

    #[test]
    fn parses_open_trailing_order() {
        let order: BinanceOrder = serde_json::from_value(serde_json::json!({
            "orderId": 283194212,
            "clientOrderId": "wd-abc",
            "symbol": "BTCUSDT",
            "side": "SELL",
            "type": "TRAILING_STOP_MARKET",
            "positionSide": "BOTH",
            "origQty": "0.600",
            "stopPrice": "0",
            "activatePrice": "103000",
            "priceRate": "0.5",
            "status": "NEW"
        }))
        .unwrap();

        let venue_order = order.into_venue_order().unwrap();
        assert_eq!(venue_order.kind, OrderKind::TrailingStop);
        assert_eq!(venue_order.position_side, Side::Long);
        assert_eq!(
            venue_order.trigger,
            Trigger::Trailing {
                activation_price: dec!(103000),
                callback_rate: dec!(0.5)
            }
        );
    }

    #[test]
    fn parses_account_update_close_in_one_way_mode() {
        let text = r#"{"e":"ACCOUNT_UPDATE","E":1564745798939,"T":1564745798938,
            "a":{"m":"ORDER","B":[],"P":[
              {"s":"SOLUSDT","pa":"0","ep":"0.0","up":"0","mt":"cross","ps":"BOTH"},
              {"s":"BTCUSDT","pa":"0.6","ep":"100000","up":"0","mt":"cross","ps":"BOTH"}
            ]}}"#;
        let events = parse_account_update(text);
        assert_eq!(events.len(), 3);
        assert!(events
            .iter()
            .filter(|e| e.symbol == "SOLUSDT")
            .all(|e| e.quantity.is_zero()));
        let btc = events.iter().find(|e| e.symbol == "BTCUSDT").unwrap();
        assert_eq!(btc.side, Side::Long);
        assert_eq!(btc.quantity, dec!(0.6));
    }

    #[test]
    fn ignores_other_user_data_events() {
        assert!(parse_account_update(r#"{"e":"ORDER_TRADE_UPDATE","E":1}"#).is_empty());
        assert!(parse_account_update("not json").is_empty());
    }
}
