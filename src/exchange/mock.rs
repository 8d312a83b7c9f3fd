//! In-memory exchange for paper trading and engine tests.
//!
//! Behaves like the venue where it matters to the engine:
//! - Duplicate client order ids are refused
//! - Conditional orders live on a separate surface; cancelling or querying
//!   them through the regular order calls yields "unknown order"
//! - Margin type changes are refused while a position or open order exists
//! - Cancelling a filled/cancelled order yields "unknown order"
//!
//! Every call is recorded so tests can assert routing, and per-operation
//! faults can be scripted to simulate timeouts and lost responses.

use super::error::ExchangeError;
use super::traits::ExchangeAdapter;
use super::types::*;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Exchange operations, used for call recording and fault scripting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    CreateOrder,
    CancelOrder,
    CancelAlgoOrder,
    GetOrder,
    GetAlgoOrder,
    GetPositions,
    SetMarginType,
    GetSymbolFilters,
}

/// A recorded adapter call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub op: MockOp,
    pub symbol: String,
    /// Order id, algo id or client order id involved, when any.
    pub target: Option<String>,
}

/// Scripted misbehaviour for the next call of an operation.
#[derive(Debug, Clone)]
pub enum MockFault {
    /// Fail without touching state.
    Fail(ExchangeError),
    /// Apply the operation, then report a timeout (response lost in transit).
    ApplyThenTimeout,
    /// Sleep before handling the call normally.
    Hang(Duration),
}

#[derive(Debug, Clone)]
struct MockOrder {
    id: String,
    client_order_id: String,
    symbol: String,
    side: OrderSide,
    kind: OrderKind,
    quantity: Decimal,
    price: Option<Decimal>,
    trigger_price: Option<Decimal>,
    reduce_only: bool,
    state: ExchangeOrderState,
    raw_status: String,
    executed_qty: Decimal,
    avg_price: Decimal,
}

impl MockOrder {
    fn snapshot(&self) -> OrderSnapshot {
        OrderSnapshot {
            exchange_order_id: self.id.clone(),
            client_order_id: self.client_order_id.clone(),
            symbol: self.symbol.clone(),
            state: self.state.clone(),
            raw_status: self.raw_status.clone(),
            executed_qty: self.executed_qty,
            avg_price: self.avg_price,
        }
    }

    fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }
}

#[derive(Debug, Default)]
struct MockExchangeState {
    orders: HashMap<String, MockOrder>,
    by_client_id: HashMap<String, String>,
    positions: HashMap<String, PositionInfo>,
    filters: HashMap<String, SymbolFilters>,
    prices: HashMap<String, Decimal>,
    margin_types: HashMap<String, MarginType>,
    faults: HashMap<MockOp, VecDeque<MockFault>>,
    calls: Vec<MockCall>,
}

/// Simulated exchange implementing [`ExchangeAdapter`].
pub struct MockExchange {
    state: RwLock<MockExchangeState>,
    id_counter: AtomicU64,
    auto_fill_market: bool,
    default_filters: Option<SymbolFilters>,
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExchange {
    /// Create a mock that fills market orders immediately.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MockExchangeState::default()),
            id_counter: AtomicU64::new(1000),
            auto_fill_market: true,
            default_filters: None,
        }
    }

    /// Create a mock that leaves market orders resting until `fill_order`.
    pub fn without_auto_fill() -> Self {
        Self {
            auto_fill_market: false,
            ..Self::new()
        }
    }

    /// Accept any symbol, answering filter queries with `filters` for
    /// symbols without explicit filters (paper trading).
    pub fn with_default_filters(mut self, filters: SymbolFilters) -> Self {
        self.default_filters = Some(filters);
        self
    }

    fn next_id(&self) -> String {
        self.id_counter.fetch_add(1, Ordering::SeqCst).to_string()
    }

    pub async fn set_filters(&self, symbol: &str, filters: SymbolFilters) {
        self.state
            .write()
            .await
            .filters
            .insert(symbol.to_string(), filters);
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.state
            .write()
            .await
            .prices
            .insert(symbol.to_string(), price);
    }

    pub async fn set_position(&self, symbol: &str, quantity: Decimal, entry_price: Decimal) {
        let mut state = self.state.write().await;
        state.positions.insert(
            symbol.to_string(),
            PositionInfo {
                symbol: symbol.to_string(),
                quantity,
                entry_price,
                margin_type: None,
                leverage: None,
            },
        );
    }

    /// Queue a fault for the next call of `op`.
    pub async fn inject_fault(&self, op: MockOp, fault: MockFault) {
        self.state
            .write()
            .await
            .faults
            .entry(op)
            .or_default()
            .push_back(fault);
    }

    /// All calls made so far, in order.
    pub async fn calls(&self) -> Vec<MockCall> {
        self.state.read().await.calls.clone()
    }

    /// Number of calls of one operation.
    pub async fn call_count(&self, op: MockOp) -> usize {
        self.state
            .read()
            .await
            .calls
            .iter()
            .filter(|c| c.op == op)
            .count()
    }

    /// Number of orders that exist on the simulated venue.
    pub async fn order_count(&self) -> usize {
        self.state.read().await.orders.len()
    }

    pub async fn order_by_client_id(&self, client_order_id: &str) -> Option<OrderSnapshot> {
        let state = self.state.read().await;
        state
            .by_client_id
            .get(client_order_id)
            .and_then(|id| state.orders.get(id))
            .map(MockOrder::snapshot)
    }

    pub async fn margin_type(&self, symbol: &str) -> Option<MarginType> {
        self.state.read().await.margin_types.get(symbol).copied()
    }

    pub async fn position(&self, symbol: &str) -> Option<PositionInfo> {
        self.state.read().await.positions.get(symbol).cloned()
    }

    /// Fill a resting regular order at `price`.
    pub async fn fill_order(&self, client_order_id: &str, price: Decimal) -> bool {
        self.execute(client_order_id, price, false).await
    }

    /// Trigger a conditional order and fill it at `price` (status FINISHED).
    pub async fn trigger_algo(&self, client_order_id: &str, price: Decimal) -> bool {
        self.execute(client_order_id, price, true).await
    }

    /// Cancel an order venue-side (e.g. expiry or manual action).
    pub async fn expire_order(&self, client_order_id: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(id) = state.by_client_id.get(client_order_id).cloned() else {
            return false;
        };
        match state.orders.get_mut(&id) {
            Some(order) if order.is_live() => {
                order.state = ExchangeOrderState::Expired;
                order.raw_status = "EXPIRED".to_string();
                true
            }
            _ => false,
        }
    }

    async fn execute(&self, client_order_id: &str, price: Decimal, conditional: bool) -> bool {
        let mut state = self.state.write().await;
        let Some(id) = state.by_client_id.get(client_order_id).cloned() else {
            return false;
        };
        let Some(order) = state.orders.get_mut(&id) else {
            return false;
        };
        if !order.is_live() || order.kind.is_conditional() != conditional {
            return false;
        }
        Self::fill(order, price);
        let filled = order.clone();
        Self::apply_fill(&mut state, &filled);
        info!(
            client_order_id,
            symbol = %filled.symbol,
            %price,
            "Mock order executed"
        );
        true
    }

    fn fill(order: &mut MockOrder, price: Decimal) {
        order.state = ExchangeOrderState::Executed;
        order.raw_status = if order.kind.is_conditional() {
            "FINISHED".to_string()
        } else {
            "FILLED".to_string()
        };
        order.executed_qty = order.quantity;
        order.avg_price = price;
    }

    fn apply_fill(state: &mut MockExchangeState, order: &MockOrder) {
        let signed = match order.side {
            OrderSide::Buy => order.executed_qty,
            OrderSide::Sell => -order.executed_qty,
        };
        let position = state
            .positions
            .entry(order.symbol.clone())
            .or_insert_with(|| PositionInfo {
                symbol: order.symbol.clone(),
                quantity: Decimal::ZERO,
                entry_price: Decimal::ZERO,
                margin_type: None,
                leverage: None,
            });
        if position.quantity.is_zero() {
            position.entry_price = order.avg_price;
        }
        position.quantity += signed;
        if position.quantity.is_zero() {
            state.positions.remove(&order.symbol);
        }
    }

    /// Record the call and pop the next scripted fault for `op`.
    async fn begin(&self, op: MockOp, symbol: &str, target: Option<&str>) -> Option<MockFault> {
        let fault = {
            let mut state = self.state.write().await;
            state.calls.push(MockCall {
                op,
                symbol: symbol.to_string(),
                target: target.map(str::to_string),
            });
            state.faults.get_mut(&op).and_then(VecDeque::pop_front)
        };
        match fault {
            Some(MockFault::Hang(duration)) => {
                tokio::time::sleep(duration).await;
                None
            }
            other => other,
        }
    }

    fn find<'a>(
        state: &'a mut MockExchangeState,
        lookup: &OrderLookup,
    ) -> Option<&'a mut MockOrder> {
        let id = match lookup {
            OrderLookup::ExchangeId(id) => id.clone(),
            OrderLookup::ClientId(client_id) => state.by_client_id.get(client_id)?.clone(),
        };
        state.orders.get_mut(&id)
    }

    async fn cancel(
        &self,
        op: MockOp,
        symbol: &str,
        id: &str,
        conditional: bool,
    ) -> Result<OrderSnapshot, ExchangeError> {
        let fault = self.begin(op, symbol, Some(id)).await;
        if let Some(MockFault::Fail(err)) = &fault {
            return Err(err.clone());
        }

        let mut state = self.state.write().await;
        let lookup = OrderLookup::ExchangeId(id.to_string());
        let order = match Self::find(&mut state, &lookup) {
            Some(order) if order.kind.is_conditional() == conditional && order.is_live() => order,
            _ => return Err(ExchangeError::UnknownOrder("Unknown order sent.".to_string())),
        };

        order.state = ExchangeOrderState::Cancelled;
        order.raw_status = "CANCELED".to_string();
        let snapshot = order.snapshot();
        debug!(%symbol, id, "Mock order cancelled");

        if matches!(fault, Some(MockFault::ApplyThenTimeout)) {
            return Err(ExchangeError::Timeout);
        }
        Ok(snapshot)
    }

    async fn query(
        &self,
        op: MockOp,
        symbol: &str,
        lookup: &OrderLookup,
        conditional: bool,
    ) -> Result<OrderSnapshot, ExchangeError> {
        let target = match lookup {
            OrderLookup::ExchangeId(id) | OrderLookup::ClientId(id) => id.clone(),
        };
        if let Some(MockFault::Fail(err)) = self.begin(op, symbol, Some(&target)).await {
            return Err(err);
        }

        let mut state = self.state.write().await;
        match Self::find(&mut state, lookup) {
            Some(order) if order.kind.is_conditional() == conditional => Ok(order.snapshot()),
            _ => Err(ExchangeError::UnknownOrder("Order does not exist.".to_string())),
        }
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    async fn create_order(&self, request: &OrderRequest) -> Result<OrderSnapshot, ExchangeError> {
        let fault = self
            .begin(
                MockOp::CreateOrder,
                &request.symbol,
                Some(&request.client_order_id),
            )
            .await;
        if let Some(MockFault::Fail(err)) = &fault {
            return Err(err.clone());
        }

        let mut state = self.state.write().await;
        if state.by_client_id.contains_key(&request.client_order_id) {
            return Err(ExchangeError::DuplicateClientOrderId(
                request.client_order_id.clone(),
            ));
        }
        if self.default_filters.is_none()
            && !state.filters.is_empty()
            && !state.filters.contains_key(&request.symbol)
        {
            return Err(ExchangeError::Rejected {
                code: -1121,
                message: "Invalid symbol.".to_string(),
            });
        }

        let mut order = MockOrder {
            id: self.next_id(),
            client_order_id: request.client_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            kind: request.kind,
            quantity: request.quantity,
            price: request.price,
            trigger_price: request.trigger_price,
            reduce_only: request.reduce_only,
            state: ExchangeOrderState::Open,
            raw_status: "NEW".to_string(),
            executed_qty: Decimal::ZERO,
            avg_price: Decimal::ZERO,
        };

        if request.kind == OrderKind::Market && self.auto_fill_market {
            let price = state
                .prices
                .get(&request.symbol)
                .copied()
                .or(request.price)
                .unwrap_or(dec!(1));
            Self::fill(&mut order, price);
            Self::apply_fill(&mut state, &order);
        }

        info!(
            id = %order.id,
            client_order_id = %order.client_order_id,
            symbol = %order.symbol,
            kind = ?order.kind,
            side = ?order.side,
            quantity = %order.quantity,
            trigger = ?order.trigger_price,
            limit = ?order.price,
            reduce_only = order.reduce_only,
            status = %order.raw_status,
            "Mock order accepted"
        );

        let snapshot = order.snapshot();
        state
            .by_client_id
            .insert(order.client_order_id.clone(), order.id.clone());
        state.orders.insert(order.id.clone(), order);

        if matches!(fault, Some(MockFault::ApplyThenTimeout)) {
            return Err(ExchangeError::Timeout);
        }
        Ok(snapshot)
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderSnapshot, ExchangeError> {
        self.cancel(MockOp::CancelOrder, symbol, order_id, false)
            .await
    }

    async fn cancel_algo_order(
        &self,
        symbol: &str,
        algo_id: &str,
    ) -> Result<OrderSnapshot, ExchangeError> {
        self.cancel(MockOp::CancelAlgoOrder, symbol, algo_id, true)
            .await
    }

    async fn get_order(
        &self,
        symbol: &str,
        lookup: &OrderLookup,
    ) -> Result<OrderSnapshot, ExchangeError> {
        self.query(MockOp::GetOrder, symbol, lookup, false).await
    }

    async fn get_algo_order(
        &self,
        symbol: &str,
        lookup: &OrderLookup,
    ) -> Result<OrderSnapshot, ExchangeError> {
        self.query(MockOp::GetAlgoOrder, symbol, lookup, true).await
    }

    async fn get_positions(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<PositionInfo>, ExchangeError> {
        if let Some(MockFault::Fail(err)) = self
            .begin(MockOp::GetPositions, symbol.unwrap_or_default(), None)
            .await
        {
            return Err(err);
        }
        let state = self.state.read().await;
        Ok(state
            .positions
            .values()
            .filter(|p| symbol.map_or(true, |s| p.symbol == s))
            .cloned()
            .collect())
    }

    async fn set_margin_type(
        &self,
        symbol: &str,
        margin_type: MarginType,
    ) -> Result<(), ExchangeError> {
        if let Some(MockFault::Fail(err)) = self.begin(MockOp::SetMarginType, symbol, None).await {
            return Err(err);
        }

        let mut state = self.state.write().await;
        let current = state
            .margin_types
            .get(symbol)
            .copied()
            .unwrap_or(MarginType::Cross);
        if current == margin_type {
            return Err(ExchangeError::MarginTypeUnchanged);
        }
        if state.positions.contains_key(symbol) {
            return Err(ExchangeError::MarginChangeBlocked(
                "Margin type cannot be changed if there exists position.".to_string(),
            ));
        }
        if state
            .orders
            .values()
            .any(|o| o.symbol == symbol && o.is_live())
        {
            return Err(ExchangeError::MarginChangeBlocked(
                "Margin type cannot be changed if there exists open orders.".to_string(),
            ));
        }
        state.margin_types.insert(symbol.to_string(), margin_type);
        Ok(())
    }

    async fn get_symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        if let Some(MockFault::Fail(err)) = self.begin(MockOp::GetSymbolFilters, symbol, None).await
        {
            return Err(err);
        }
        let state = self.state.read().await;
        state
            .filters
            .get(symbol)
            .copied()
            .or(self.default_filters)
            .ok_or_else(|| ExchangeError::Rejected {
                code: -1121,
                message: "Invalid symbol.".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market(client_id: &str) -> OrderRequest {
        OrderRequest {
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            kind: OrderKind::Market,
            quantity: dec!(0.5),
            price: None,
            trigger_price: None,
            reduce_only: false,
            client_order_id: client_id.to_string(),
        }
    }

    fn stop(client_id: &str) -> OrderRequest {
        OrderRequest {
            side: OrderSide::Sell,
            kind: OrderKind::StopLoss,
            trigger_price: Some(dec!(48000)),
            reduce_only: true,
            ..market(client_id)
        }
    }

    #[tokio::test]
    async fn test_market_order_fills_and_opens_position() {
        let exchange = MockExchange::new();
        exchange.set_price("BTCUSDT", dec!(50000)).await;

        let snapshot = exchange.create_order(&market("c-1")).await.unwrap();
        assert_eq!(snapshot.state, ExchangeOrderState::Executed);
        assert_eq!(snapshot.avg_price, dec!(50000));

        let position = exchange.position("BTCUSDT").await.unwrap();
        assert_eq!(position.quantity, dec!(0.5));
    }

    #[tokio::test]
    async fn test_duplicate_client_id_refused() {
        let exchange = MockExchange::new();
        exchange.create_order(&market("c-1")).await.unwrap();
        let err = exchange.create_order(&market("c-1")).await.unwrap_err();
        assert!(matches!(err, ExchangeError::DuplicateClientOrderId(_)));
        assert_eq!(exchange.order_count().await, 1);
    }

    #[tokio::test]
    async fn test_regular_cancel_cannot_reach_algo_order() {
        let exchange = MockExchange::new();
        let algo = exchange.create_order(&stop("c-sl")).await.unwrap();

        let err = exchange
            .cancel_order("BTCUSDT", &algo.exchange_order_id)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::UnknownOrder(_)));

        let snapshot = exchange
            .order_by_client_id("c-sl")
            .await
            .unwrap();
        assert_eq!(snapshot.state, ExchangeOrderState::Open);

        let cancelled = exchange
            .cancel_algo_order("BTCUSDT", &algo.exchange_order_id)
            .await
            .unwrap();
        assert_eq!(cancelled.state, ExchangeOrderState::Cancelled);
    }

    #[tokio::test]
    async fn test_apply_then_timeout_creates_order() {
        let exchange = MockExchange::new();
        exchange
            .inject_fault(MockOp::CreateOrder, MockFault::ApplyThenTimeout)
            .await;

        let err = exchange.create_order(&market("c-1")).await.unwrap_err();
        assert_eq!(err, ExchangeError::Timeout);
        assert!(exchange.order_by_client_id("c-1").await.is_some());
    }

    #[tokio::test]
    async fn test_margin_change_blocked_by_position() {
        let exchange = MockExchange::new();
        exchange.set_position("BTCUSDT", dec!(1), dec!(50000)).await;

        let err = exchange
            .set_margin_type("BTCUSDT", MarginType::Isolated)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::MarginChangeBlocked(_)));

        let err = exchange
            .set_margin_type("BTCUSDT", MarginType::Cross)
            .await
            .unwrap_err();
        assert_eq!(err, ExchangeError::MarginTypeUnchanged);
    }

    #[tokio::test]
    async fn test_trigger_algo_reports_finished() {
        let exchange = MockExchange::new();
        exchange.set_position("BTCUSDT", dec!(0.5), dec!(50000)).await;
        exchange.create_order(&stop("c-sl")).await.unwrap();

        assert!(exchange.trigger_algo("c-sl", dec!(48000)).await);
        let snapshot = exchange.order_by_client_id("c-sl").await.unwrap();
        assert_eq!(snapshot.raw_status, "FINISHED");
        assert!(snapshot.state.is_executed());
        assert!(exchange.position("BTCUSDT").await.is_none());
    }
}
