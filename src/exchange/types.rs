//! Type definitions for Binance Futures API payloads and the venue-neutral
//! shapes the engine works with.

use super::error::ExchangeError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The side that closes a position opened with `self`.
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(OrderSide::Buy),
            "SELL" => Ok(OrderSide::Sell),
            other => Err(format!("unknown order side: {other}")),
        }
    }
}

/// Per-symbol margin mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarginType {
    #[serde(rename = "ISOLATED", alias = "isolated")]
    Isolated,
    #[serde(rename = "CROSSED", alias = "cross", alias = "CROSS", alias = "crossed")]
    Cross,
}

impl MarginType {
    /// Value expected by the `marginType` request parameter.
    pub fn as_param(&self) -> &'static str {
        match self {
            MarginType::Isolated => "ISOLATED",
            MarginType::Cross => "CROSSED",
        }
    }
}

impl fmt::Display for MarginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_param())
    }
}

/// Venue order type as sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
    StopMarket,
    TakeProfitMarket,
}

impl OrderType {
    pub fn as_param(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }
}

/// Time in force for limit orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc, // Good Till Cancel
    Ioc, // Immediate or Cancel
    Fok, // Fill or Kill
    Gtx, // Post Only (Good Till Crossing)
}

/// Kind of order the engine schedules.
///
/// Take-profit and stop-loss are conditional ("algo") orders: they live on a
/// separate API surface with their own identifier, query and cancel calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Market,
    Limit,
    TakeProfit,
    StopLoss,
}

impl OrderKind {
    pub fn is_conditional(&self) -> bool {
        matches!(self, OrderKind::TakeProfit | OrderKind::StopLoss)
    }

    pub fn wire_type(&self) -> OrderType {
        match self {
            OrderKind::Market => OrderType::Market,
            OrderKind::Limit => OrderType::Limit,
            OrderKind::TakeProfit => OrderType::TakeProfitMarket,
            OrderKind::StopLoss => OrderType::StopMarket,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Market => "market",
            OrderKind::Limit => "limit",
            OrderKind::TakeProfit => "take_profit",
            OrderKind::StopLoss => "stop_loss",
        }
    }
}

impl FromStr for OrderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "market" => Ok(OrderKind::Market),
            "limit" => Ok(OrderKind::Limit),
            "take_profit" => Ok(OrderKind::TakeProfit),
            "stop_loss" => Ok(OrderKind::StopLoss),
            other => Err(format!("unknown order kind: {other}")),
        }
    }
}

/// Regular order status codes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    ExpiredInMatch,
    Unknown(String),
}

impl From<String> for OrderStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "NEW" => OrderStatus::New,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" | "CANCELLED" => OrderStatus::Canceled,
            "REJECTED" => OrderStatus::Rejected,
            "EXPIRED" => OrderStatus::Expired,
            "EXPIRED_IN_MATCH" => OrderStatus::ExpiredInMatch,
            _ => OrderStatus::Unknown(raw),
        }
    }
}

impl OrderStatus {
    /// Venue status code as received.
    pub fn code(&self) -> &str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Expired => "EXPIRED",
            OrderStatus::ExpiredInMatch => "EXPIRED_IN_MATCH",
            OrderStatus::Unknown(raw) => raw,
        }
    }

    pub fn normalize(&self) -> ExchangeOrderState {
        match self {
            OrderStatus::New => ExchangeOrderState::Open,
            OrderStatus::PartiallyFilled => ExchangeOrderState::PartiallyFilled,
            OrderStatus::Filled => ExchangeOrderState::Executed,
            OrderStatus::Canceled => ExchangeOrderState::Cancelled,
            OrderStatus::Rejected => ExchangeOrderState::Rejected,
            OrderStatus::Expired | OrderStatus::ExpiredInMatch => ExchangeOrderState::Expired,
            OrderStatus::Unknown(raw) => ExchangeOrderState::Unrecognized(raw.clone()),
        }
    }
}

/// Conditional (algo) order status codes.
///
/// `FINISHED` and `TRIGGERED` are the conditional-order equivalents of a
/// regular `FILLED`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum AlgoStatus {
    New,
    Triggering,
    Triggered,
    Finished,
    Canceled,
    Rejected,
    Expired,
    Unknown(String),
}

impl From<String> for AlgoStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "NEW" => AlgoStatus::New,
            "TRIGGERING" => AlgoStatus::Triggering,
            "TRIGGERED" => AlgoStatus::Triggered,
            "FINISHED" => AlgoStatus::Finished,
            "CANCELED" | "CANCELLED" => AlgoStatus::Canceled,
            "REJECTED" => AlgoStatus::Rejected,
            "EXPIRED" => AlgoStatus::Expired,
            _ => AlgoStatus::Unknown(raw),
        }
    }
}

impl AlgoStatus {
    /// Venue status code as received.
    pub fn code(&self) -> &str {
        match self {
            AlgoStatus::New => "NEW",
            AlgoStatus::Triggering => "TRIGGERING",
            AlgoStatus::Triggered => "TRIGGERED",
            AlgoStatus::Finished => "FINISHED",
            AlgoStatus::Canceled => "CANCELED",
            AlgoStatus::Rejected => "REJECTED",
            AlgoStatus::Expired => "EXPIRED",
            AlgoStatus::Unknown(raw) => raw,
        }
    }

    pub fn normalize(&self) -> ExchangeOrderState {
        match self {
            AlgoStatus::New | AlgoStatus::Triggering => ExchangeOrderState::Open,
            AlgoStatus::Triggered | AlgoStatus::Finished => ExchangeOrderState::Executed,
            AlgoStatus::Canceled => ExchangeOrderState::Cancelled,
            AlgoStatus::Rejected => ExchangeOrderState::Rejected,
            AlgoStatus::Expired => ExchangeOrderState::Expired,
            AlgoStatus::Unknown(raw) => ExchangeOrderState::Unrecognized(raw.clone()),
        }
    }
}

/// Exchange-reported order state after normalization across the regular and
/// conditional order surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ExchangeOrderState {
    Open,
    PartiallyFilled,
    Executed,
    Cancelled,
    Rejected,
    Expired,
    /// A code this build does not know. Never acted upon.
    Unrecognized(String),
}

impl ExchangeOrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExchangeOrderState::Executed
                | ExchangeOrderState::Cancelled
                | ExchangeOrderState::Rejected
                | ExchangeOrderState::Expired
        )
    }

    pub fn is_executed(&self) -> bool {
        matches!(self, ExchangeOrderState::Executed)
    }
}

/// Venue-neutral order submission request.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub quantity: Decimal,
    /// Limit price for limit orders.
    pub price: Option<Decimal>,
    /// Trigger price for conditional orders.
    pub trigger_price: Option<Decimal>,
    pub reduce_only: bool,
    pub client_order_id: String,
}

/// How an existing order is looked up on the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderLookup {
    ExchangeId(String),
    ClientId(String),
}

/// Normalized view of an order as the exchange reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSnapshot {
    /// Regular order id, or the algo id for conditional orders.
    pub exchange_order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub state: ExchangeOrderState,
    /// Raw venue status code, kept for audit logs.
    pub raw_status: String,
    pub executed_qty: Decimal,
    pub avg_price: Decimal,
}

/// Open position as reported by the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionInfo {
    pub symbol: String,
    /// Signed quantity: positive = long, negative = short.
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub margin_type: Option<MarginType>,
    pub leverage: Option<u32>,
}

/// Typed trading constraints for a symbol, parsed once at the adapter
/// boundary from the venue's free-form filter list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolFilters {
    pub step_size: Decimal,
    pub min_notional: Decimal,
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    pub tick_size: Decimal,
}

impl SymbolFilters {
    /// Parse the `filters` array of an exchangeInfo symbol entry.
    pub fn from_raw(symbol: &str, filters: &[Value]) -> Result<Self, ExchangeError> {
        let mut step_size = None;
        let mut min_qty = None;
        let mut max_qty = None;
        let mut min_notional = None;
        let mut tick_size = None;

        for filter in filters {
            let Some(kind) = filter.get("filterType").and_then(Value::as_str) else {
                continue;
            };
            match kind {
                "LOT_SIZE" => {
                    step_size = decimal_field(filter, "stepSize");
                    min_qty = decimal_field(filter, "minQty");
                    max_qty = decimal_field(filter, "maxQty");
                }
                // Futures uses "notional", spot used "minNotional"
                "MIN_NOTIONAL" => {
                    min_notional = decimal_field(filter, "notional")
                        .or_else(|| decimal_field(filter, "minNotional"));
                }
                "PRICE_FILTER" => {
                    tick_size = decimal_field(filter, "tickSize");
                }
                _ => {}
            }
        }

        let missing = |field: &str| {
            ExchangeError::Decode(format!("{symbol}: filter field {field} missing or invalid"))
        };

        let filters = Self {
            step_size: step_size.ok_or_else(|| missing("LOT_SIZE.stepSize"))?,
            min_qty: min_qty.ok_or_else(|| missing("LOT_SIZE.minQty"))?,
            max_qty: max_qty.ok_or_else(|| missing("LOT_SIZE.maxQty"))?,
            min_notional: min_notional.unwrap_or(Decimal::ZERO),
            tick_size: tick_size.unwrap_or(Decimal::ZERO),
        };

        if filters.step_size <= Decimal::ZERO {
            return Err(missing("LOT_SIZE.stepSize"));
        }

        Ok(filters)
    }
}

fn decimal_field(filter: &Value, key: &str) -> Option<Decimal> {
    match filter.get(key)? {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

// ==================== Binance wire payloads ====================

/// Error body returned by the REST API on failures.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    pub msg: String,
}

/// Regular order response from the exchange.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: i64,
    pub symbol: String,
    pub status: OrderStatus,
    pub client_order_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub avg_price: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::str")]
    pub orig_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub executed_qty: Decimal,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub time_in_force: Option<TimeInForce>,
    #[serde(default)]
    pub update_time: i64,
}

impl From<OrderResponse> for OrderSnapshot {
    fn from(r: OrderResponse) -> Self {
        let raw_status = r.status.code().to_string();
        Self {
            exchange_order_id: r.order_id.to_string(),
            client_order_id: r.client_order_id,
            symbol: r.symbol,
            state: r.status.normalize(),
            raw_status,
            executed_qty: r.executed_qty,
            avg_price: r.avg_price.unwrap_or(r.price),
        }
    }
}

/// Conditional (algo) order response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgoOrderResponse {
    pub algo_id: i64,
    pub client_algo_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub algo_status: AlgoStatus,
    #[serde(with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub trigger_price: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub actual_price: Option<Decimal>,
    #[serde(default)]
    pub update_time: i64,
}

impl From<AlgoOrderResponse> for OrderSnapshot {
    fn from(r: AlgoOrderResponse) -> Self {
        let state = r.algo_status.normalize();
        let raw_status = r.algo_status.code().to_string();
        let executed_qty = if state.is_executed() {
            r.quantity
        } else {
            Decimal::ZERO
        };
        Self {
            exchange_order_id: r.algo_id.to_string(),
            client_order_id: r.client_algo_id,
            symbol: r.symbol,
            state,
            raw_status,
            executed_qty,
            avg_price: r.actual_price.unwrap_or(r.trigger_price),
        }
    }
}

/// Position risk entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRisk {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub position_amt: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub entry_price: Decimal,
    #[serde(default)]
    pub margin_type: Option<MarginType>,
    #[serde(default)]
    pub leverage: Option<String>,
}

impl From<PositionRisk> for PositionInfo {
    fn from(p: PositionRisk) -> Self {
        Self {
            symbol: p.symbol,
            quantity: p.position_amt,
            entry_price: p.entry_price,
            margin_type: p.margin_type,
            leverage: p.leverage.and_then(|l| l.parse().ok()),
        }
    }
}

/// Exchange information for futures.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuturesExchangeInfo {
    pub symbols: Vec<FuturesSymbolInfo>,
}

/// Symbol entry in exchangeInfo, with its filters left untyped until
/// `SymbolFilters::from_raw` parses them.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuturesSymbolInfo {
    pub symbol: String,
    pub status: String,
    #[serde(default)]
    pub filters: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_parse_symbol_filters() {
        let raw = vec![
            json!({"filterType": "PRICE_FILTER", "tickSize": "0.0001", "minPrice": "0.0001"}),
            json!({"filterType": "LOT_SIZE", "stepSize": "1", "minQty": "1", "maxQty": "1000000"}),
            json!({"filterType": "MARKET_LOT_SIZE", "stepSize": "1", "minQty": "1", "maxQty": "50000"}),
            json!({"filterType": "MIN_NOTIONAL", "notional": "5"}),
        ];

        let filters = SymbolFilters::from_raw("DOGEUSDT", &raw).unwrap();
        assert_eq!(filters.step_size, dec!(1));
        assert_eq!(filters.min_qty, dec!(1));
        assert_eq!(filters.max_qty, dec!(1000000));
        assert_eq!(filters.min_notional, dec!(5));
        assert_eq!(filters.tick_size, dec!(0.0001));
    }

    #[test]
    fn test_missing_lot_size_is_decode_error() {
        let raw = vec![json!({"filterType": "MIN_NOTIONAL", "notional": "5"})];
        let err = SymbolFilters::from_raw("BTCUSDT", &raw).unwrap_err();
        assert!(matches!(err, ExchangeError::Decode(_)));
    }

    #[test]
    fn test_algo_terminal_codes_are_executed() {
        assert!(AlgoStatus::from("FINISHED".to_string()).normalize().is_executed());
        assert!(AlgoStatus::from("TRIGGERED".to_string()).normalize().is_executed());
        assert!(OrderStatus::from("FILLED".to_string()).normalize().is_executed());
        assert_eq!(
            AlgoStatus::from("CANCELED".to_string()).normalize(),
            ExchangeOrderState::Cancelled
        );
    }

    #[test]
    fn test_unknown_status_is_not_terminal() {
        let state = AlgoStatus::from("SOMETHING_NEW".to_string()).normalize();
        assert!(!state.is_terminal());
        assert_eq!(
            state,
            ExchangeOrderState::Unrecognized("SOMETHING_NEW".to_string())
        );
    }

    #[test]
    fn test_order_response_to_snapshot() {
        let body = json!({
            "orderId": 22542179,
            "symbol": "BTCUSDT",
            "status": "FILLED",
            "clientOrderId": "os-alpha-7-E",
            "price": "0",
            "avgPrice": "50010.5",
            "origQty": "0.010",
            "executedQty": "0.010",
            "side": "BUY",
            "type": "MARKET",
            "timeInForce": "GTC",
            "updateTime": 1700000000000i64
        });
        let response: OrderResponse = serde_json::from_value(body).unwrap();
        let snapshot = OrderSnapshot::from(response);
        assert_eq!(snapshot.exchange_order_id, "22542179");
        assert_eq!(snapshot.state, ExchangeOrderState::Executed);
        assert_eq!(snapshot.avg_price, dec!(50010.5));
    }

    #[test]
    fn test_margin_type_aliases() {
        let cross: MarginType = serde_json::from_value(json!("cross")).unwrap();
        let isolated: MarginType = serde_json::from_value(json!("ISOLATED")).unwrap();
        assert_eq!(cross, MarginType::Cross);
        assert_eq!(isolated, MarginType::Isolated);
        assert_eq!(MarginType::Cross.as_param(), "CROSSED");
    }
}
