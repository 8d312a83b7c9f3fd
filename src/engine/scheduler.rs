//! Order scheduler.
//!
//! Turns a strategy's decisions into scheduled orders. Each trigger runs
//! under a per-strategy lease so two triggers of the same strategy never
//! overlap, and every order row carries a client order id derived from
//! `(strategy, sequence, leg)`, so re-triggering a decision that was already
//! handled creates nothing new.

use super::bracket::BracketManager;
use super::decisions::DecisionSource;
use super::events::{EngineEvent, EventJournal};
use super::margin::{ExecutionScope, MarginTaskPool};
use super::model::{
    client_order_id, DecisionAction, ExecutionStatus, NewScheduledOrder, OrderLeg, OrderStatus,
    ScheduledOrder, StrategyExecution, TradeDecision,
};
use super::submitter::{OrderSubmitter, SubmitError};
use crate::config::StrategyConfig;
use crate::exchange::{bounded, ExchangeAdapter, ExchangeError, MarginType, OrderKind, OrderSide};
use crate::persistence::{OrderStore, OrderUpdate};
use anyhow::anyhow;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// Why a trigger did not produce a completed execution.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Another trigger of the same strategy holds the lease.
    #[error("strategy {0} already has a run in flight")]
    Busy(String),

    /// Authentication or configuration failure; the execution is failed.
    #[error("execution {execution_id} failed: {source}")]
    Fatal {
        execution_id: i64,
        source: ExchangeError,
    },

    #[error("order store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub struct OrderScheduler {
    store: Arc<OrderStore>,
    journal: EventJournal,
    exchange: Arc<dyn ExchangeAdapter>,
    submitter: Arc<OrderSubmitter>,
    brackets: Arc<BracketManager>,
    margin_pool: Arc<MarginTaskPool>,
    decisions: Arc<dyn DecisionSource>,
    lease_ttl: Duration,
    call_timeout: Duration,
    instance_id: String,
    trigger_counter: AtomicU64,
}

impl OrderScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<OrderStore>,
        journal: EventJournal,
        exchange: Arc<dyn ExchangeAdapter>,
        submitter: Arc<OrderSubmitter>,
        brackets: Arc<BracketManager>,
        margin_pool: Arc<MarginTaskPool>,
        decisions: Arc<dyn DecisionSource>,
        lease_ttl: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            journal,
            exchange,
            submitter,
            brackets,
            margin_pool,
            decisions,
            lease_ttl,
            call_timeout,
            instance_id: instance_id(),
            trigger_counter: AtomicU64::new(0),
        }
    }

    /// Run one scheduling pass for `strategy`.
    ///
    /// Returns [`ScheduleError::Busy`] without creating any rows if another
    /// run of the same strategy holds the lease. A failing decision source
    /// yields a `failed` execution rather than an error.
    #[instrument(skip(self, strategy), fields(strategy_id = %strategy.id))]
    pub async fn trigger(
        &self,
        strategy: &StrategyConfig,
    ) -> Result<StrategyExecution, ScheduleError> {
        let holder = format!(
            "{}-{}",
            self.instance_id,
            self.trigger_counter.fetch_add(1, Ordering::Relaxed)
        );
        if !self
            .store
            .try_acquire_lease(&strategy.id, &holder, self.lease_ttl)?
        {
            info!("Trigger skipped, previous run still holds the lease");
            return Err(ScheduleError::Busy(strategy.id.clone()));
        }

        let result = self.run_execution(strategy, &holder).await;

        match self.store.release_lease(&strategy.id, &holder) {
            Ok(true) => {}
            Ok(false) => warn!(%holder, "Lease was gone at release, run outlived its TTL"),
            Err(e) => warn!(%holder, error = %e, "Lease release failed, it will lapse"),
        }
        result
    }

    async fn run_execution(
        &self,
        strategy: &StrategyConfig,
        holder: &str,
    ) -> Result<StrategyExecution, ScheduleError> {
        let execution = self.store.create_execution(&strategy.id)?;
        self.store
            .attach_lease_execution(&strategy.id, holder, execution.id)?;
        self.store.transition_execution(
            execution.id,
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            None,
        )?;
        info!(execution_id = execution.id, "🚀 Execution started");

        // Background margin attempts die with this scope
        let scope = ExecutionScope::new();

        let decisions = match self.decisions.decisions(&strategy.id).await {
            Ok(decisions) => decisions,
            Err(e) => {
                let reason = format!("decision source failed: {e:#}");
                return self.fail_execution(&execution, &reason);
            }
        };
        debug!(execution_id = execution.id, count = decisions.len(), "Decisions loaded");

        for decision in &decisions {
            let result = match decision.action {
                DecisionAction::Open => self.open(strategy, execution.id, decision, &scope).await,
                DecisionAction::Close => self.close(strategy, execution.id, decision).await,
            };
            if let Err(e) = result {
                scope.cancel();
                self.fail_execution(&execution, &e.to_string())?;
                return Err(e);
            }
        }

        self.store.refresh_execution_counters(execution.id)?;
        self.store.transition_execution(
            execution.id,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            None,
        )?;
        let execution = self.load_execution(execution.id)?;
        info!(
            execution_id = execution.id,
            orders = execution.orders_total,
            filled = execution.orders_filled,
            failed = execution.orders_failed,
            "✅ Execution completed"
        );
        Ok(execution)
    }

    /// Place the entry for an `Open` decision (and register its bracket).
    async fn open(
        &self,
        strategy: &StrategyConfig,
        execution_id: i64,
        decision: &TradeDecision,
        scope: &ExecutionScope,
    ) -> Result<(), ScheduleError> {
        let leverage = decision.leverage.unwrap_or(strategy.leverage).max(1);
        let mode = decision.margin_mode.unwrap_or(strategy.margin_mode);
        let (requested_qty, intended_margin) = decision.requested_quantity(leverage);
        if requested_qty <= Decimal::ZERO {
            return self.decision_failed(execution_id, decision, "sizing yields no quantity");
        }

        let (kind, price) = match decision.limit_price {
            Some(limit) => (OrderKind::Limit, limit),
            None => (OrderKind::Market, decision.reference_price),
        };

        let (order, created) = self.store.insert_order(&NewScheduledOrder {
            client_order_id: client_order_id(&strategy.id, decision.sequence, OrderLeg::Entry),
            execution_id,
            strategy_id: strategy.id.clone(),
            sequence: decision.sequence,
            leg: OrderLeg::Entry,
            symbol: decision.symbol.clone(),
            side: decision.side,
            kind,
            requested_qty,
            price: Some(price),
            trigger_price: None,
            leverage,
            intended_margin,
            reduce_only: false,
            bracket: decision.bracket,
            parent_order_id: None,
        })?;

        if order.status != OrderStatus::Pending {
            debug!(client_order_id = %order.client_order_id, status = %order.status, "Decision already handled");
            return Ok(());
        }
        if !created {
            info!(client_order_id = %order.client_order_id, "Resuming pending entry from an earlier run");
        }

        self.margin_pool.submit(&order.symbol, mode, scope);

        if order.bracket.is_some() && self.brackets.register(&order)?.is_none() {
            warn!(
                client_order_id = %order.client_order_id,
                symbol = %order.symbol,
                "Symbol already has an open bracket, entry refused"
            );
            self.store.transition_order(
                order.id,
                OrderStatus::Pending,
                OrderStatus::Rejected,
                &OrderUpdate {
                    last_error: Some("symbol already has an open bracket".to_string()),
                    ..Default::default()
                },
            )?;
            return Ok(());
        }

        self.submit_and_follow(&order, Some(mode), execution_id)
            .await
    }

    /// Flatten the current position with a reduce-only market order.
    async fn close(
        &self,
        strategy: &StrategyConfig,
        execution_id: i64,
        decision: &TradeDecision,
    ) -> Result<(), ScheduleError> {
        let cid = client_order_id(&strategy.id, decision.sequence, OrderLeg::Exit);
        if let Some(existing) = self.store.get_order_by_client_id(&cid)? {
            if existing.status != OrderStatus::Pending {
                debug!(client_order_id = %cid, status = %existing.status, "Close already handled");
                return Ok(());
            }
            return self.submit_and_follow(&existing, None, execution_id).await;
        }

        let positions = match bounded(
            self.call_timeout,
            self.exchange.get_positions(Some(&decision.symbol)),
        )
        .await
        {
            Ok(positions) => positions,
            Err(e) if e.is_fatal() => {
                return Err(ScheduleError::Fatal {
                    execution_id,
                    source: e,
                })
            }
            Err(e) => {
                let reason = format!("position lookup failed: {e}");
                return self.decision_failed(execution_id, decision, &reason);
            }
        };

        let Some(position) = positions
            .into_iter()
            .find(|p| p.symbol == decision.symbol && !p.quantity.is_zero())
        else {
            info!(symbol = %decision.symbol, "No position to close");
            return Ok(());
        };

        let side = if position.quantity > Decimal::ZERO {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        };
        let (order, _) = self.store.insert_order(&NewScheduledOrder {
            client_order_id: cid,
            execution_id,
            strategy_id: strategy.id.clone(),
            sequence: decision.sequence,
            leg: OrderLeg::Exit,
            symbol: decision.symbol.clone(),
            side,
            kind: OrderKind::Market,
            requested_qty: position.quantity.abs(),
            price: Some(decision.reference_price),
            trigger_price: None,
            leverage: decision.leverage.unwrap_or(strategy.leverage).max(1),
            intended_margin: None,
            reduce_only: true,
            bracket: None,
            parent_order_id: None,
        })?;
        info!(
            client_order_id = %order.client_order_id,
            symbol = %order.symbol,
            %side,
            quantity = %order.requested_qty,
            "Closing position"
        );

        self.submit_and_follow(&order, None, execution_id).await
    }

    async fn submit_and_follow(
        &self,
        order: &ScheduledOrder,
        margin_mode: Option<MarginType>,
        execution_id: i64,
    ) -> Result<(), ScheduleError> {
        let outcome = match self.submitter.submit(order, margin_mode).await {
            Ok(outcome) => outcome,
            Err(SubmitError::Fatal(source)) => {
                return Err(ScheduleError::Fatal {
                    execution_id,
                    source,
                })
            }
            Err(SubmitError::Store(e)) => return Err(ScheduleError::Store(e)),
        };

        if !outcome.status.is_terminal() {
            return Ok(());
        }
        let resolved = self
            .store
            .get_order(order.id)?
            .ok_or_else(|| anyhow!("order {} vanished after submit", order.id))?;
        if let Err(e) = self.brackets.on_order_resolved(&resolved).await {
            // Sync picks the bracket up on its next pass
            warn!(client_order_id = %resolved.client_order_id, error = %e, "Bracket follow-up failed");
        }
        Ok(())
    }

    fn decision_failed(
        &self,
        execution_id: i64,
        decision: &TradeDecision,
        reason: &str,
    ) -> Result<(), ScheduleError> {
        warn!(
            execution_id,
            sequence = decision.sequence,
            symbol = %decision.symbol,
            %reason,
            "Decision not executed"
        );
        self.store.record_decision_failure(execution_id)?;
        Ok(())
    }

    fn fail_execution(
        &self,
        execution: &StrategyExecution,
        reason: &str,
    ) -> Result<StrategyExecution, ScheduleError> {
        error!(execution_id = execution.id, %reason, "❌ Execution failed");
        self.store.refresh_execution_counters(execution.id)?;
        self.store.transition_execution(
            execution.id,
            ExecutionStatus::Running,
            ExecutionStatus::Failed,
            Some(reason),
        )?;
        self.journal.emit(EngineEvent::ExecutionFailed {
            execution_id: execution.id,
            strategy_id: execution.strategy_id.clone(),
            error: reason.to_string(),
        });
        self.load_execution(execution.id)
    }

    fn load_execution(&self, id: i64) -> Result<StrategyExecution, ScheduleError> {
        Ok(self
            .store
            .get_execution(id)?
            .ok_or_else(|| anyhow!("execution {id} vanished"))?)
    }

    /// Trigger `strategy` every `interval` until `shutdown` flips to true.
    ///
    /// Ticks never wait for the previous run; an overlapping trigger is
    /// refused by the lease. On shutdown no new runs start and in-flight
    /// runs are awaited.
    pub async fn run_strategy(
        self: Arc<Self>,
        strategy: StrategyConfig,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(strategy_id = %strategy.id, interval_secs = interval.as_secs(), "Strategy loop started");
        let strategy = Arc::new(strategy);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let scheduler = self.clone();
                    let strategy = strategy.clone();
                    in_flight.spawn(async move {
                        match scheduler.trigger(&strategy).await {
                            Ok(execution) => debug!(execution_id = execution.id, status = %execution.status, "Trigger finished"),
                            Err(ScheduleError::Busy(id)) => debug!(strategy_id = %id, "Trigger refused, busy"),
                            Err(e) => error!(strategy_id = %strategy.id, error = %e, "Trigger failed"),
                        }
                    });
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(strategy_id = %strategy.id, error = %e, "Trigger task panicked");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(strategy_id = %strategy.id, running = in_flight.len(), "Strategy loop stopping, waiting for in-flight runs");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(strategy_id = %strategy.id, error = %e, "Trigger task panicked");
            }
        }
    }
}

/// `{hostname}-{pid}-{nanos}`, unique per process start.
fn instance_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{host}-{}-{nanos}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::decisions::MockDecisionSource;
    use crate::engine::margin::{MarginModeCoordinator, SymbolGate};
    use crate::engine::model::{BracketSpec, BracketStatus, Sizing};
    use crate::engine::retry::RetryPolicy;
    use crate::exchange::{MockExchange, MockFault, MockOp, SymbolFilters};
    use rust_decimal_macros::dec;

    struct Harness {
        exchange: Arc<MockExchange>,
        store: Arc<OrderStore>,
        scheduler: OrderScheduler,
    }

    async fn harness(exchange: MockExchange, decisions: MockDecisionSource) -> Harness {
        let exchange = Arc::new(exchange);
        exchange
            .set_filters(
                "DOGEUSDT",
                SymbolFilters {
                    step_size: dec!(1),
                    min_notional: dec!(5),
                    min_qty: dec!(1),
                    max_qty: dec!(10000000),
                    tick_size: dec!(0.00001),
                },
            )
            .await;
        exchange.set_price("DOGEUSDT", dec!(0.01)).await;

        let store = Arc::new(OrderStore::in_memory().unwrap());
        let journal = EventJournal::new(store.clone());
        let gate = Arc::new(SymbolGate::new());
        let margin = Arc::new(MarginModeCoordinator::new(
            exchange.clone(),
            journal.clone(),
            RetryPolicy::new(2, 1),
            Duration::from_secs(1),
        ));
        let submitter = Arc::new(OrderSubmitter::new(
            exchange.clone(),
            store.clone(),
            journal.clone(),
            margin.clone(),
            gate.clone(),
            RetryPolicy::new(2, 1),
            Duration::from_millis(200),
            Duration::from_secs(60),
        ));
        let brackets = Arc::new(BracketManager::new(
            store.clone(),
            journal.clone(),
            submitter.clone(),
            RetryPolicy::new(2, 1),
        ));
        let pool = Arc::new(MarginTaskPool::start(margin, gate, 1, 8));
        let scheduler = OrderScheduler::new(
            store.clone(),
            journal,
            exchange.clone(),
            submitter,
            brackets,
            pool,
            Arc::new(decisions),
            Duration::from_secs(60),
            Duration::from_secs(1),
        );
        Harness {
            exchange,
            store,
            scheduler,
        }
    }

    fn strategy() -> StrategyConfig {
        StrategyConfig {
            id: "alpha".to_string(),
            interval_secs: None,
            enabled: true,
            margin_mode: MarginType::Isolated,
            leverage: 5,
        }
    }

    fn open(sequence: u64) -> TradeDecision {
        TradeDecision {
            sequence,
            symbol: "DOGEUSDT".to_string(),
            side: OrderSide::Buy,
            action: DecisionAction::Open,
            sizing: Sizing::Margin(dec!(1)),
            reference_price: dec!(0.01),
            limit_price: None,
            leverage: None,
            margin_mode: None,
            bracket: None,
        }
    }

    fn returning(decisions: Vec<TradeDecision>) -> MockDecisionSource {
        let mut source = MockDecisionSource::new();
        source
            .expect_decisions()
            .returning(move |_| Ok(decisions.clone()));
        source
    }

    #[tokio::test]
    async fn test_trigger_refused_while_lease_held() {
        let mut source = MockDecisionSource::new();
        source.expect_decisions().times(0);
        let h = harness(MockExchange::new(), source).await;

        assert!(h
            .store
            .try_acquire_lease("alpha", "other-worker", Duration::from_secs(60))
            .unwrap());

        let err = tokio_test::assert_err!(h.scheduler.trigger(&strategy()).await);
        assert!(matches!(err, ScheduleError::Busy(ref id) if id == "alpha"));
        assert!(h.store.recent_executions(10).unwrap().is_empty());
        assert_eq!(h.store.lease_holder("alpha").unwrap().unwrap().0, "other-worker");
    }

    #[tokio::test]
    async fn test_retrigger_is_idempotent() {
        let h = harness(MockExchange::without_auto_fill(), returning(vec![open(7)])).await;

        let first = h.scheduler.trigger(&strategy()).await.unwrap();
        let second = h.scheduler.trigger(&strategy()).await.unwrap();

        assert_eq!(first.status, ExecutionStatus::Completed);
        assert_eq!(second.status, ExecutionStatus::Completed);
        assert_ne!(first.id, second.id);

        let orders = h.store.all_orders().unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, OrderStatus::Submitted);
        assert_eq!(orders[0].client_order_id, "os-alpha-7-E");
        assert_eq!(h.exchange.order_count().await, 1);
        assert_eq!(h.exchange.call_count(MockOp::CreateOrder).await, 1);
        assert!(h.store.lease_holder("alpha").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_margin_sizing_and_fill() {
        let h = harness(MockExchange::new(), returning(vec![open(1)])).await;

        let execution = h.scheduler.trigger(&strategy()).await.unwrap();
        assert_eq!(execution.orders_total, 1);
        assert_eq!(execution.orders_filled, 1);

        let order = h.store.get_order_by_client_id("os-alpha-1-E").unwrap().unwrap();
        // 1 margin x 5 leverage / 0.01 = 500 base units
        assert_eq!(order.requested_qty, dec!(500));
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(h.exchange.margin_type("DOGEUSDT").await, Some(MarginType::Isolated));
    }

    #[tokio::test]
    async fn test_auth_failure_fails_execution() {
        let h = harness(MockExchange::new(), returning(vec![open(3), open(4)])).await;
        h.exchange
            .inject_fault(
                MockOp::CreateOrder,
                MockFault::Fail(ExchangeError::Auth("invalid api key".to_string())),
            )
            .await;

        let err = h.scheduler.trigger(&strategy()).await.unwrap_err();
        let ScheduleError::Fatal { execution_id, .. } = err else {
            panic!("expected fatal error, got {err:?}");
        };

        let execution = h.store.get_execution(execution_id).unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.error.unwrap().contains("authentication"));
        // The second decision is never attempted
        assert!(h.store.get_order_by_client_id("os-alpha-4-E").unwrap().is_none());
        assert_eq!(h.store.count_events("ExecutionFailed").unwrap(), 1);
        assert!(h.store.lease_holder("alpha").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_decision_source_error_fails_execution() {
        let mut source = MockDecisionSource::new();
        source
            .expect_decisions()
            .returning(|_| Err(anyhow!("signal feed offline")));
        let h = harness(MockExchange::new(), source).await;

        let execution = h.scheduler.trigger(&strategy()).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.error.unwrap().contains("signal feed offline"));
        assert!(h.store.all_orders().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_sizing_counts_as_failure() {
        let mut decision = open(5);
        decision.sizing = Sizing::Quantity(Decimal::ZERO);
        let h = harness(MockExchange::new(), returning(vec![decision])).await;

        let execution = h.scheduler.trigger(&strategy()).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.orders_total, 0);
        assert_eq!(execution.orders_failed, 1);
    }

    #[tokio::test]
    async fn test_close_flattens_position() {
        let mut decision = open(9);
        decision.action = DecisionAction::Close;
        let h = harness(MockExchange::new(), returning(vec![decision])).await;
        h.exchange
            .set_position("DOGEUSDT", dec!(600), dec!(0.01))
            .await;

        h.scheduler.trigger(&strategy()).await.unwrap();

        let exit = h.store.get_order_by_client_id("os-alpha-9-X").unwrap().unwrap();
        assert!(exit.reduce_only);
        assert_eq!(exit.side, OrderSide::Sell);
        assert_eq!(exit.requested_qty, dec!(600));
        assert_eq!(exit.status, OrderStatus::Filled);
        assert!(h.exchange.position("DOGEUSDT").await.is_none());
        // Reduce-only orders leave the margin mode alone
        assert_eq!(h.exchange.call_count(MockOp::SetMarginType).await, 0);
    }

    #[tokio::test]
    async fn test_close_without_position_is_a_noop() {
        let mut decision = open(10);
        decision.action = DecisionAction::Close;
        let h = harness(MockExchange::new(), returning(vec![decision])).await;

        let execution = h.scheduler.trigger(&strategy()).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(h.store.all_orders().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_bracket_on_symbol_is_refused() {
        let mut first = open(11);
        first.bracket = Some(BracketSpec {
            tp_percent: dec!(2),
            sl_percent: dec!(1),
        });
        let mut second = first.clone();
        second.sequence = 12;
        let h = harness(MockExchange::new(), returning(vec![first, second])).await;

        h.scheduler.trigger(&strategy()).await.unwrap();

        let link = h.store.open_bracket_for_symbol("DOGEUSDT").unwrap().unwrap();
        assert_eq!(link.entry_client_id, "os-alpha-11-E");
        assert_eq!(link.status, BracketStatus::Active);

        let refused = h.store.get_order_by_client_id("os-alpha-12-E").unwrap().unwrap();
        assert_eq!(refused.status, OrderStatus::Rejected);
        assert!(h.exchange.order_by_client_id("os-alpha-12-E").await.is_none());
    }
}
