//! Reconciliation engine (order sync).
//!
//! Periodically corrects local rows toward the exchange. One pass runs:
//! 1. pending rows (lookup by client order id)
//! 2. submitted rows (direct status query)
//! 3. open and orphaned brackets
//! 4. execution counters
//!
//! Terminal statuses are applied only on unambiguous answers. Timeouts, rate
//! limits, server errors and "unknown order" on a *query* leave rows as they
//! are until the next pass.

use super::bracket::BracketManager;
use super::events::{EngineEvent, EventJournal};
use super::model::{BracketStatus, OrderStatus, ScheduledOrder};
use super::submitter::{OrderSubmitter, StatusChange};
use crate::exchange::ExchangeError;
use crate::persistence::{OrderStore, OrderUpdate};
use anyhow::{bail, Result};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub orders_checked: usize,
    pub orders_corrected: usize,
    /// Lookups that gave no usable answer this pass.
    pub ambiguous: usize,
    pub brackets_checked: usize,
    pub orphans_retried: usize,
    pub orphans_resolved: usize,
    pub errors: usize,
}

impl SyncReport {
    pub fn is_quiet(&self) -> bool {
        self.orders_corrected == 0 && self.orphans_resolved == 0 && self.errors == 0
    }
}

pub struct OrderSync {
    store: Arc<OrderStore>,
    journal: EventJournal,
    submitter: Arc<OrderSubmitter>,
    brackets: Arc<BracketManager>,
    pending_grace: Duration,
}

impl OrderSync {
    pub fn new(
        store: Arc<OrderStore>,
        journal: EventJournal,
        submitter: Arc<OrderSubmitter>,
        brackets: Arc<BracketManager>,
        pending_grace: Duration,
    ) -> Self {
        Self {
            store,
            journal,
            submitter,
            brackets,
            pending_grace,
        }
    }

    /// Run passes on `interval` until `shutdown` flips to true.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "Order sync started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(report) if report.is_quiet() => debug!(?report, "Sync pass complete"),
                        Ok(report) => info!(?report, "Sync pass corrected drift"),
                        Err(e) => error!(error = %e, "Sync pass aborted"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Order sync stopped");
    }

    /// One full reconciliation pass.
    pub async fn run_once(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let mut touched = BTreeSet::new();

        for order in self.store.orders_with_status(OrderStatus::Pending)? {
            touched.insert(order.execution_id);
            report.orders_checked += 1;
            self.sync_pending(&order, &mut report).await?;
        }

        for order in self.store.orders_with_status(OrderStatus::Submitted)? {
            touched.insert(order.execution_id);
            report.orders_checked += 1;
            self.sync_submitted(&order, &mut report).await?;
        }

        for status in [
            BracketStatus::Created,
            BracketStatus::Active,
            BracketStatus::Orphaned,
        ] {
            for link in self.store.brackets_with_status(status)? {
                touched.insert(link.execution_id);
                report.brackets_checked += 1;
                if status == BracketStatus::Orphaned {
                    report.orphans_retried += 1;
                }
                match self.brackets.advance(&link).await {
                    Ok(BracketStatus::Closed) if status == BracketStatus::Orphaned => {
                        info!(bracket_id = link.id, "Orphaned bracket resolved");
                        report.orphans_resolved += 1;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(bracket_id = link.id, error = %e, "Bracket advance failed");
                        report.errors += 1;
                    }
                }
            }
        }

        for execution_id in touched {
            self.store.refresh_execution_counters(execution_id)?;
        }

        Ok(report)
    }

    async fn sync_pending(&self, order: &ScheduledOrder, report: &mut SyncReport) -> Result<()> {
        match self.submitter.query(order).await {
            Ok(snapshot) => {
                let change = self.submitter.record_snapshot(order, &snapshot)?;
                self.after_change(order, change, &snapshot.raw_status, report)
                    .await;
            }
            Err(ExchangeError::UnknownOrder(_)) => {
                let age = Utc::now()
                    .signed_duration_since(order.created_at)
                    .to_std()
                    .unwrap_or_default();
                if age < self.pending_grace {
                    debug!(client_order_id = %order.client_order_id, "Pending order not on exchange yet");
                    return Ok(());
                }
                let changed = self.store.transition_order(
                    order.id,
                    OrderStatus::Pending,
                    OrderStatus::Rejected,
                    &OrderUpdate {
                        last_error: Some("never reached the exchange".to_string()),
                        ..Default::default()
                    },
                )?;
                let change = changed.then_some(StatusChange {
                    from: OrderStatus::Pending,
                    to: OrderStatus::Rejected,
                });
                self.after_change(order, change, "UNKNOWN_ORDER", report)
                    .await;
            }
            Err(e) => self.lookup_failed(order, e, report)?,
        }
        Ok(())
    }

    async fn sync_submitted(&self, order: &ScheduledOrder, report: &mut SyncReport) -> Result<()> {
        match self.submitter.query(order).await {
            Ok(snapshot) => {
                let change = self.submitter.record_snapshot(order, &snapshot)?;
                self.after_change(order, change, &snapshot.raw_status, report)
                    .await;
            }
            Err(ExchangeError::UnknownOrder(msg)) => {
                // Not proof of a terminal state on a query
                warn!(client_order_id = %order.client_order_id, %msg, "Submitted order unknown on query, unchanged");
                report.ambiguous += 1;
            }
            Err(e) => self.lookup_failed(order, e, report)?,
        }
        Ok(())
    }

    fn lookup_failed(
        &self,
        order: &ScheduledOrder,
        err: ExchangeError,
        report: &mut SyncReport,
    ) -> Result<()> {
        if err.is_fatal() {
            bail!("fatal exchange error during sync: {err}");
        }
        warn!(client_order_id = %order.client_order_id, error = %err, "Order lookup failed, unchanged");
        report.ambiguous += 1;
        Ok(())
    }

    async fn after_change(
        &self,
        order: &ScheduledOrder,
        change: Option<StatusChange>,
        exchange_status: &str,
        report: &mut SyncReport,
    ) {
        let Some(change) = change else {
            return;
        };
        report.orders_corrected += 1;
        warn!(
            client_order_id = %order.client_order_id,
            from = %change.from,
            to = %change.to,
            %exchange_status,
            "Drift corrected"
        );
        self.journal.emit(EngineEvent::DriftCorrected {
            client_order_id: order.client_order_id.clone(),
            symbol: order.symbol.clone(),
            from: change.from,
            to: change.to,
            exchange_status: exchange_status.to_string(),
        });

        if !change.to.is_terminal() {
            return;
        }
        let resolved = match self.store.get_order(order.id) {
            Ok(Some(row)) => row,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Reload after drift correction failed");
                report.errors += 1;
                return;
            }
        };
        if let Err(e) = self.brackets.on_order_resolved(&resolved).await {
            warn!(client_order_id = %resolved.client_order_id, error = %e, "Bracket follow-up failed");
            report.errors += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::margin::{MarginModeCoordinator, SymbolGate};
    use crate::engine::model::{client_order_id, NewScheduledOrder, OrderLeg};
    use crate::engine::retry::RetryPolicy;
    use crate::exchange::{MockExchange, MockFault, MockOp, OrderKind, OrderSide};
    use rust_decimal_macros::dec;

    fn sync_with(
        exchange: Arc<MockExchange>,
        store: Arc<OrderStore>,
        pending_grace: Duration,
    ) -> OrderSync {
        let journal = EventJournal::new(store.clone());
        let margin = Arc::new(MarginModeCoordinator::new(
            exchange.clone(),
            journal.clone(),
            RetryPolicy::new(1, 1),
            Duration::from_secs(1),
        ));
        let submitter = Arc::new(OrderSubmitter::new(
            exchange,
            store.clone(),
            journal.clone(),
            margin,
            Arc::new(SymbolGate::new()),
            RetryPolicy::new(1, 1),
            Duration::from_secs(1),
            Duration::from_secs(60),
        ));
        let brackets = Arc::new(BracketManager::new(
            store.clone(),
            journal.clone(),
            submitter.clone(),
            RetryPolicy::new(1, 1),
        ));
        OrderSync::new(store, journal, submitter, brackets, pending_grace)
    }

    fn pending_entry(store: &OrderStore, sequence: u64) -> ScheduledOrder {
        let execution_id = store.create_execution("alpha").unwrap().id;
        store
            .insert_order(&NewScheduledOrder {
                client_order_id: client_order_id("alpha", sequence, OrderLeg::Entry),
                execution_id,
                strategy_id: "alpha".to_string(),
                sequence,
                leg: OrderLeg::Entry,
                symbol: "BTCUSDT".to_string(),
                side: OrderSide::Buy,
                kind: OrderKind::Limit,
                requested_qty: dec!(0.01),
                price: Some(dec!(50000)),
                trigger_price: None,
                leverage: 5,
                intended_margin: None,
                reduce_only: false,
                bracket: None,
                parent_order_id: None,
            })
            .unwrap()
            .0
    }

    #[tokio::test]
    async fn test_pending_within_grace_is_left_alone() {
        let exchange = Arc::new(MockExchange::new());
        let store = Arc::new(OrderStore::in_memory().unwrap());
        let order = pending_entry(&store, 1);
        let sync = sync_with(exchange, store.clone(), Duration::from_secs(3600));

        let report = sync.run_once().await.unwrap();
        assert_eq!(report.orders_checked, 1);
        assert_eq!(report.orders_corrected, 0);
        assert_eq!(
            store.get_order(order.id).unwrap().unwrap().status,
            OrderStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_unknown_on_query_keeps_submitted_row() {
        let exchange = Arc::new(MockExchange::new());
        let store = Arc::new(OrderStore::in_memory().unwrap());
        let order = pending_entry(&store, 2);
        store
            .transition_order(
                order.id,
                OrderStatus::Pending,
                OrderStatus::Submitted,
                &OrderUpdate {
                    exchange_order_id: Some("424242".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        let sync = sync_with(exchange, store.clone(), Duration::ZERO);

        let report = sync.run_once().await.unwrap();
        assert_eq!(report.ambiguous, 1);
        assert_eq!(report.orders_corrected, 0);
        assert_eq!(
            store.get_order(order.id).unwrap().unwrap().status,
            OrderStatus::Submitted
        );
    }

    #[tokio::test]
    async fn test_timeout_on_lookup_is_ambiguous() {
        let exchange = Arc::new(MockExchange::new());
        exchange
            .inject_fault(MockOp::GetOrder, MockFault::Fail(ExchangeError::Timeout))
            .await;
        let store = Arc::new(OrderStore::in_memory().unwrap());
        let order = pending_entry(&store, 3);
        let sync = sync_with(exchange, store.clone(), Duration::ZERO);

        let report = sync.run_once().await.unwrap();
        assert_eq!(report.ambiguous, 1);
        assert_eq!(
            store.get_order(order.id).unwrap().unwrap().status,
            OrderStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_auth_failure_aborts_pass() {
        let exchange = Arc::new(MockExchange::new());
        exchange
            .inject_fault(
                MockOp::GetOrder,
                MockFault::Fail(ExchangeError::Auth("key revoked".to_string())),
            )
            .await;
        let store = Arc::new(OrderStore::in_memory().unwrap());
        pending_entry(&store, 4);
        let sync = sync_with(exchange, store, Duration::ZERO);

        assert!(sync.run_once().await.is_err());
    }
}
