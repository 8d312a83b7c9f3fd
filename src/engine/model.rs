//! Persisted order, bracket and execution records, and the decision shape
//! consumed from strategies.

use crate::exchange::{ExchangeOrderState, MarginType, OrderKind, OrderSide};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Venue limit on client order id length.
pub const MAX_CLIENT_ORDER_ID_LEN: usize = 36;
const CLIENT_ID_PREFIX: &str = "os";
const STRATEGY_DIGEST_LEN: usize = 10;

/// Role of an order inside a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderLeg {
    Entry,
    Exit,
    TakeProfit,
    StopLoss,
}

impl OrderLeg {
    pub fn suffix(&self) -> &'static str {
        match self {
            OrderLeg::Entry => "E",
            OrderLeg::Exit => "X",
            OrderLeg::TakeProfit => "TP",
            OrderLeg::StopLoss => "SL",
        }
    }

    pub fn from_suffix(s: &str) -> Option<Self> {
        match s {
            "E" => Some(OrderLeg::Entry),
            "X" => Some(OrderLeg::Exit),
            "TP" => Some(OrderLeg::TakeProfit),
            "SL" => Some(OrderLeg::StopLoss),
            _ => None,
        }
    }
}

/// Derive the client order id for one leg of one decision.
///
/// The same `(strategy, sequence, leg)` always yields the same id, which is
/// what makes resubmission a no-op at the exchange.
pub fn client_order_id(strategy_id: &str, sequence: u64, leg: OrderLeg) -> String {
    let sanitized: String = strategy_id
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect();

    let candidate = format!(
        "{CLIENT_ID_PREFIX}-{sanitized}-{sequence}-{}",
        leg.suffix()
    );
    if !sanitized.is_empty()
        && sanitized.len() == strategy_id.len()
        && candidate.len() <= MAX_CLIENT_ORDER_ID_LEN
    {
        return candidate;
    }

    // Lossy or too long: fall back to a digest so distinct strategies never collide
    let digest = hex::encode(Sha256::digest(strategy_id.as_bytes()));
    let tail = format!("-{sequence}-{}", leg.suffix());
    // Large sequences eat into the digest; u64::MAX still leaves 9 hex chars
    let room = MAX_CLIENT_ORDER_ID_LEN - CLIENT_ID_PREFIX.len() - 1 - tail.len();
    format!(
        "{CLIENT_ID_PREFIX}-{}{tail}",
        &digest[..STRATEGY_DIGEST_LEN.min(room)]
    )
}

/// Local lifecycle of a scheduled order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Submitted,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    /// Local terminal status implied by an exchange state, if any.
    pub fn from_exchange(state: &ExchangeOrderState) -> Option<Self> {
        match state {
            ExchangeOrderState::Executed => Some(OrderStatus::Filled),
            ExchangeOrderState::Cancelled | ExchangeOrderState::Expired => {
                Some(OrderStatus::Cancelled)
            }
            ExchangeOrderState::Rejected => Some(OrderStatus::Rejected),
            ExchangeOrderState::Open
            | ExchangeOrderState::PartiallyFilled
            | ExchangeOrderState::Unrecognized(_) => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Submitted => "submitted",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "submitted" => Ok(OrderStatus::Submitted),
            "filled" => Ok(OrderStatus::Filled),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "rejected" => Ok(OrderStatus::Rejected),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// Take-profit / stop-loss distances, in percent of the entry fill price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BracketSpec {
    pub tp_percent: Decimal,
    pub sl_percent: Decimal,
}

/// A single exchange order intent and its observed lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledOrder {
    pub id: i64,
    pub client_order_id: String,
    /// Regular order id, or algo id for conditional legs.
    pub exchange_order_id: Option<String>,
    pub execution_id: i64,
    pub strategy_id: String,
    pub sequence: u64,
    pub leg: OrderLeg,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub requested_qty: Decimal,
    /// Quantity after exchange filter normalization.
    pub adjusted_qty: Option<Decimal>,
    pub executed_qty: Decimal,
    /// Reference price for market orders, limit price for limit orders.
    pub price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
    pub avg_fill_price: Option<Decimal>,
    pub leverage: u32,
    /// Margin the strategy intended to commit.
    pub intended_margin: Option<Decimal>,
    /// adjusted notional / leverage, i.e. the margin actually committed.
    pub effective_margin: Option<Decimal>,
    pub reduce_only: bool,
    pub bracket: Option<BracketSpec>,
    /// Entry order this TP/SL leg protects.
    pub parent_order_id: Option<i64>,
    pub status: OrderStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledOrder {
    /// Quantity sent (or to be sent) to the exchange.
    pub fn order_qty(&self) -> Decimal {
        self.adjusted_qty.unwrap_or(self.requested_qty)
    }
}

/// Insert shape for a scheduled order.
#[derive(Debug, Clone, PartialEq)]
pub struct NewScheduledOrder {
    pub client_order_id: String,
    pub execution_id: i64,
    pub strategy_id: String,
    pub sequence: u64,
    pub leg: OrderLeg,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub requested_qty: Decimal,
    pub price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
    pub leverage: u32,
    pub intended_margin: Option<Decimal>,
    pub reduce_only: bool,
    pub bracket: Option<BracketSpec>,
    pub parent_order_id: Option<i64>,
}

/// Lifecycle of a bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BracketStatus {
    /// Entry submitted, legs not yet placed.
    Created,
    /// Entry filled, TP and SL live.
    Active,
    /// One leg executed and the sibling is confirmed gone.
    Closed,
    /// A leg executed but the sibling could not be cancelled yet.
    Orphaned,
    /// Entry never filled, or a leg was refused by the exchange.
    Aborted,
}

impl BracketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BracketStatus::Created => "created",
            BracketStatus::Active => "active",
            BracketStatus::Closed => "closed",
            BracketStatus::Orphaned => "orphaned",
            BracketStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BracketStatus::Closed | BracketStatus::Aborted)
    }
}

impl fmt::Display for BracketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BracketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(BracketStatus::Created),
            "active" => Ok(BracketStatus::Active),
            "closed" => Ok(BracketStatus::Closed),
            "orphaned" => Ok(BracketStatus::Orphaned),
            "aborted" => Ok(BracketStatus::Aborted),
            other => Err(format!("unknown bracket status: {other}")),
        }
    }
}

/// Aggregate tying one entry order to its take-profit and stop-loss legs.
#[derive(Debug, Clone, PartialEq)]
pub struct BracketLink {
    pub id: i64,
    pub execution_id: i64,
    pub symbol: String,
    pub entry_client_id: String,
    pub tp_client_id: String,
    pub sl_client_id: String,
    pub status: BracketStatus,
    pub realized_pnl: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BracketLink {
    /// Client id of the other protective leg.
    pub fn sibling_of(&self, client_order_id: &str) -> Option<&str> {
        if client_order_id == self.tp_client_id {
            Some(&self.sl_client_id)
        } else if client_order_id == self.sl_client_id {
            Some(&self.tp_client_id)
        } else {
            None
        }
    }
}

/// Status of one scheduling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// One scheduling run for one strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyExecution {
    pub id: i64,
    pub strategy_id: String,
    pub status: ExecutionStatus,
    pub orders_total: u32,
    pub orders_filled: u32,
    pub orders_failed: u32,
    pub realized_pnl: Decimal,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// What a decision asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    /// Open (or add to) a position on `side`.
    Open,
    /// Flatten the current position in the symbol.
    Close,
}

/// How large the entry should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sizing {
    /// Quote-currency margin; quantity = margin × leverage / price.
    Margin(Decimal),
    /// Base-asset quantity.
    Quantity(Decimal),
}

/// Decision record produced by a strategy per scan cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeDecision {
    /// Scan cycle number; together with the strategy id it identifies the
    /// logical decision across re-triggers.
    pub sequence: u64,
    pub symbol: String,
    pub side: OrderSide,
    pub action: DecisionAction,
    pub sizing: Sizing,
    /// Price used for sizing and notional checks.
    pub reference_price: Decimal,
    /// Submit as a limit order at this price instead of market.
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default)]
    pub margin_mode: Option<MarginType>,
    #[serde(default)]
    pub bracket: Option<BracketSpec>,
}

impl TradeDecision {
    /// Requested base quantity and the margin the strategy intends to commit.
    pub fn requested_quantity(&self, leverage: u32) -> (Decimal, Option<Decimal>) {
        let leverage = Decimal::from(leverage.max(1));
        match self.sizing {
            Sizing::Quantity(qty) => (qty, None),
            Sizing::Margin(margin) if self.reference_price > Decimal::ZERO => {
                (margin * leverage / self.reference_price, Some(margin))
            }
            Sizing::Margin(margin) => (Decimal::ZERO, Some(margin)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_client_order_id_is_deterministic() {
        let a = client_order_id("alpha", 42, OrderLeg::Entry);
        let b = client_order_id("alpha", 42, OrderLeg::Entry);
        assert_eq!(a, b);
        assert_eq!(a, "os-alpha-42-E");
        assert_ne!(a, client_order_id("alpha", 42, OrderLeg::TakeProfit));
        assert_ne!(a, client_order_id("alpha", 43, OrderLeg::Entry));
    }

    #[test]
    fn test_client_order_id_digest_for_long_or_lossy_ids() {
        let long = client_order_id("a-very-long-strategy-name-indeed", 1_700_000_000, OrderLeg::StopLoss);
        assert!(long.len() <= MAX_CLIENT_ORDER_ID_LEN);
        assert!(long.ends_with("-1700000000-SL"));

        let widest = client_order_id("a-very-long-strategy-name-indeed", u64::MAX, OrderLeg::TakeProfit);
        assert_eq!(widest.len(), MAX_CLIENT_ORDER_ID_LEN);
        assert!(widest.ends_with(&format!("-{}-TP", u64::MAX)));
        for sequence in [0, 9_999_999_999, u64::MAX / 7, u64::MAX - 1] {
            for leg in [OrderLeg::Entry, OrderLeg::Exit, OrderLeg::TakeProfit, OrderLeg::StopLoss] {
                assert!(client_order_id("x.y", sequence, leg).len() <= MAX_CLIENT_ORDER_ID_LEN);
            }
        }

        // "a.b" and "ab" must not collide after sanitizing
        assert_ne!(
            client_order_id("a.b", 1, OrderLeg::Entry),
            client_order_id("ab", 1, OrderLeg::Entry)
        );
    }

    #[test]
    fn test_exchange_state_mapping() {
        assert_eq!(
            OrderStatus::from_exchange(&ExchangeOrderState::Executed),
            Some(OrderStatus::Filled)
        );
        assert_eq!(
            OrderStatus::from_exchange(&ExchangeOrderState::Expired),
            Some(OrderStatus::Cancelled)
        );
        assert_eq!(
            OrderStatus::from_exchange(&ExchangeOrderState::PartiallyFilled),
            None
        );
    }

    #[test]
    fn test_requested_quantity_from_margin() {
        let decision = TradeDecision {
            sequence: 1,
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            action: DecisionAction::Open,
            sizing: Sizing::Margin(dec!(100)),
            reference_price: dec!(50000),
            limit_price: None,
            leverage: Some(10),
            margin_mode: None,
            bracket: None,
        };
        let (qty, margin) = decision.requested_quantity(10);
        assert_eq!(qty, dec!(0.02));
        assert_eq!(margin, Some(dec!(100)));
    }

    #[test]
    fn test_decision_from_json() {
        let decision: TradeDecision = serde_json::from_str(
            r#"{
                "sequence": 7,
                "symbol": "ETHUSDT",
                "side": "SELL",
                "action": "open",
                "sizing": {"quantity": "0.5"},
                "reference_price": "3000",
                "bracket": {"tp_percent": "2", "sl_percent": "1"}
            }"#,
        )
        .unwrap();
        assert_eq!(decision.sizing, Sizing::Quantity(dec!(0.5)));
        assert_eq!(decision.bracket.unwrap().tp_percent, dec!(2));
        assert!(decision.leverage.is_none());
    }
}
