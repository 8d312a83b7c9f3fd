//! Per-symbol margin mode coordination.
//!
//! Margin mode is set twice per order: fire-and-forget through the
//! [`MarginTaskPool`] when the order row is created, and synchronously by the
//! submitter right before sending the order. Both paths take the symbol's
//! [`SymbolGate`] lock, so a mode change never races an order submission for
//! the same symbol.
//!
//! Per-symbol state: `unset → pending → {confirmed | blocked}`. A change
//! refused because a position or open orders exist is an expected outcome,
//! not a failure; order flow continues under the mode that is active.

use super::events::{EngineEvent, EventJournal};
use super::retry::RetryPolicy;
use crate::exchange::{bounded, ExchangeAdapter, ExchangeError, MarginType};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Coordinator view of a symbol's margin mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarginModeState {
    Unset,
    Pending,
    Confirmed(MarginType),
    /// Change to the desired mode refused while exposure exists.
    Blocked(MarginType),
}

/// Result of a `set_mode` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarginModeOutcome {
    /// Desired mode is in effect.
    pub success: bool,
    /// Mode known to be active on the exchange, if any.
    pub mode: Option<MarginType>,
    pub state: MarginModeState,
    pub error: Option<ExchangeError>,
}

impl MarginModeOutcome {
    /// Order flow may continue (everything except fatal errors).
    pub fn may_proceed(&self) -> bool {
        !self.error.as_ref().is_some_and(ExchangeError::is_fatal)
    }
}

pub struct MarginModeCoordinator {
    exchange: Arc<dyn ExchangeAdapter>,
    journal: EventJournal,
    policy: RetryPolicy,
    call_timeout: Duration,
    states: RwLock<HashMap<String, MarginModeState>>,
}

impl MarginModeCoordinator {
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        journal: EventJournal,
        policy: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            exchange,
            journal,
            policy,
            call_timeout,
            states: RwLock::new(HashMap::new()),
        }
    }

    pub async fn state(&self, symbol: &str) -> MarginModeState {
        self.states
            .read()
            .await
            .get(symbol)
            .copied()
            .unwrap_or(MarginModeState::Unset)
    }

    async fn set_state(&self, symbol: &str, state: MarginModeState) {
        self.states.write().await.insert(symbol.to_string(), state);
    }

    /// Idempotently put `symbol` into `desired` margin mode.
    ///
    /// Callers must hold the symbol's [`SymbolGate`] lock.
    pub async fn set_mode(&self, symbol: &str, desired: MarginType) -> MarginModeOutcome {
        if self.state(symbol).await == MarginModeState::Confirmed(desired) {
            debug!(%symbol, mode = %desired, "Margin mode already confirmed");
            return MarginModeOutcome {
                success: true,
                mode: Some(desired),
                state: MarginModeState::Confirmed(desired),
                error: None,
            };
        }

        self.set_state(symbol, MarginModeState::Pending).await;

        let result = self
            .policy
            .run("set_margin_type", || {
                bounded(
                    self.call_timeout,
                    self.exchange.set_margin_type(symbol, desired),
                )
            })
            .await;

        match result {
            Ok(()) | Err(ExchangeError::MarginTypeUnchanged) => {
                info!(%symbol, mode = %desired, "Margin mode confirmed");
                self.set_state(symbol, MarginModeState::Confirmed(desired)).await;
                MarginModeOutcome {
                    success: true,
                    mode: Some(desired),
                    state: MarginModeState::Confirmed(desired),
                    error: None,
                }
            }
            Err(ExchangeError::MarginChangeBlocked(reason)) => {
                let active = self.active_mode(symbol).await;
                info!(
                    %symbol,
                    desired = %desired,
                    active = ?active,
                    %reason,
                    "Margin mode change blocked by open exposure, continuing under active mode"
                );
                self.set_state(symbol, MarginModeState::Blocked(desired)).await;
                self.journal.emit(EngineEvent::MarginModeBlocked {
                    symbol: symbol.to_string(),
                    desired,
                    reason: reason.clone(),
                });
                MarginModeOutcome {
                    success: active == Some(desired),
                    mode: active,
                    state: MarginModeState::Blocked(desired),
                    error: Some(ExchangeError::MarginChangeBlocked(reason)),
                }
            }
            Err(e) => {
                if e.is_fatal() {
                    error!(%symbol, error = %e, "Margin mode change failed fatally");
                } else {
                    warn!(%symbol, mode = %desired, error = %e, "Margin mode not set, proceeding best-effort");
                }
                self.set_state(symbol, MarginModeState::Unset).await;
                MarginModeOutcome {
                    success: false,
                    mode: None,
                    state: MarginModeState::Unset,
                    error: Some(e),
                }
            }
        }
    }

    /// Margin mode reported on the symbol's position, if it can be read.
    async fn active_mode(&self, symbol: &str) -> Option<MarginType> {
        match bounded(self.call_timeout, self.exchange.get_positions(Some(symbol))).await {
            Ok(positions) => positions
                .into_iter()
                .find(|p| p.symbol == symbol)
                .and_then(|p| p.margin_type),
            Err(e) => {
                debug!(%symbol, error = %e, "Could not read active margin mode");
                None
            }
        }
    }
}

/// Per-symbol async mutex serializing margin changes and order submission.
#[derive(Default)]
pub struct SymbolGate {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SymbolGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, symbol: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(symbol.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Cancellation signal owned by one strategy execution.
///
/// Background work tied to the execution stops once the scope is cancelled
/// or dropped.
pub struct ExecutionScope {
    cancel: watch::Sender<bool>,
}

impl Default for ExecutionScope {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionScope {
    pub fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self { cancel }
    }

    pub fn token(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

impl Drop for ExecutionScope {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
    }
}

struct MarginJob {
    symbol: String,
    mode: MarginType,
    cancel: watch::Receiver<bool>,
}

/// Bounded worker pool for fire-and-forget margin mode attempts.
///
/// Submissions never block: a full queue sheds the attempt, which is safe
/// because the submitter makes the authoritative call anyway.
pub struct MarginTaskPool {
    sender: std::sync::Mutex<Option<mpsc::Sender<MarginJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MarginTaskPool {
    pub fn start(
        coordinator: Arc<MarginModeCoordinator>,
        gate: Arc<SymbolGate>,
        worker_count: usize,
        queue_capacity: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel::<MarginJob>(queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..worker_count.max(1))
            .map(|worker| {
                let receiver = receiver.clone();
                let coordinator = coordinator.clone();
                let gate = gate.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { receiver.lock().await.recv().await };
                        let Some(mut job) = job else {
                            debug!(worker, "Margin worker exiting");
                            break;
                        };
                        Self::run_job(&coordinator, &gate, &mut job).await;
                    }
                })
            })
            .collect();

        Self {
            sender: std::sync::Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    async fn run_job(coordinator: &MarginModeCoordinator, gate: &SymbolGate, job: &mut MarginJob) {
        if *job.cancel.borrow() {
            debug!(symbol = %job.symbol, "Margin job skipped, execution finished");
            return;
        }
        let _guard = gate.lock(&job.symbol).await;
        if *job.cancel.borrow() {
            return;
        }

        tokio::select! {
            biased;
            _ = job.cancel.wait_for(|cancelled| *cancelled) => {
                debug!(symbol = %job.symbol, "Margin job cancelled mid-flight");
            }
            outcome = coordinator.set_mode(&job.symbol, job.mode) => {
                debug!(symbol = %job.symbol, state = ?outcome.state, "Background margin attempt done");
            }
        }
    }

    /// Queue a background attempt. Returns false if the pool is full or shut
    /// down.
    pub fn submit(&self, symbol: &str, mode: MarginType, scope: &ExecutionScope) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let Some(sender) = sender else {
            return false;
        };

        let job = MarginJob {
            symbol: symbol.to_string(),
            mode,
            cancel: scope.token(),
        };
        match sender.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(symbol = %job.symbol, "Margin queue full, background attempt shed");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Stop accepting jobs, let queued jobs drain and wait for the workers.
    pub async fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "Margin worker panicked");
            }
        }
        info!("Margin task pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{MockExchange, MockFault, MockOp};
    use crate::persistence::OrderStore;
    use rust_decimal_macros::dec;

    fn coordinator(exchange: Arc<MockExchange>) -> (Arc<MarginModeCoordinator>, Arc<OrderStore>) {
        let store = Arc::new(OrderStore::in_memory().unwrap());
        let coordinator = MarginModeCoordinator::new(
            exchange,
            EventJournal::new(store.clone()),
            RetryPolicy::new(3, 1),
            Duration::from_secs(1),
        );
        (Arc::new(coordinator), store)
    }

    #[tokio::test]
    async fn test_set_mode_confirms_and_caches() {
        let exchange = Arc::new(MockExchange::new());
        let (coordinator, _) = coordinator(exchange.clone());

        let outcome = coordinator.set_mode("BTCUSDT", MarginType::Isolated).await;
        assert!(outcome.success);
        assert_eq!(outcome.state, MarginModeState::Confirmed(MarginType::Isolated));
        assert_eq!(
            exchange.margin_type("BTCUSDT").await,
            Some(MarginType::Isolated)
        );

        coordinator.set_mode("BTCUSDT", MarginType::Isolated).await;
        assert_eq!(exchange.call_count(MockOp::SetMarginType).await, 1);
    }

    #[tokio::test]
    async fn test_unchanged_counts_as_confirmed() {
        let exchange = Arc::new(MockExchange::new());
        let (coordinator, _) = coordinator(exchange.clone());

        // Mock symbols start in cross mode
        let outcome = coordinator.set_mode("ETHUSDT", MarginType::Cross).await;
        assert!(outcome.success);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_blocked_is_expected_and_journaled() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_position("BTCUSDT", dec!(0.1), dec!(50000)).await;
        let (coordinator, store) = coordinator(exchange.clone());

        let outcome = coordinator.set_mode("BTCUSDT", MarginType::Isolated).await;
        assert!(!outcome.success);
        assert!(outcome.may_proceed());
        assert_eq!(outcome.state, MarginModeState::Blocked(MarginType::Isolated));
        assert_eq!(store.count_events("MarginModeBlocked").unwrap(), 1);
        // Blocked is not retried
        assert_eq!(exchange.call_count(MockOp::SetMarginType).await, 1);
    }

    #[tokio::test]
    async fn test_transient_errors_retried_then_unset() {
        let exchange = Arc::new(MockExchange::new());
        for _ in 0..3 {
            exchange
                .inject_fault(
                    MockOp::SetMarginType,
                    MockFault::Fail(ExchangeError::RateLimited("busy".into())),
                )
                .await;
        }
        let (coordinator, _) = coordinator(exchange.clone());

        let outcome = coordinator.set_mode("BTCUSDT", MarginType::Isolated).await;
        assert!(!outcome.success);
        assert!(outcome.may_proceed());
        assert_eq!(outcome.state, MarginModeState::Unset);
        assert_eq!(exchange.call_count(MockOp::SetMarginType).await, 3);
        assert_eq!(coordinator.state("BTCUSDT").await, MarginModeState::Unset);
    }

    #[tokio::test]
    async fn test_auth_error_is_fatal() {
        let exchange = Arc::new(MockExchange::new());
        exchange
            .inject_fault(
                MockOp::SetMarginType,
                MockFault::Fail(ExchangeError::Auth("bad key".into())),
            )
            .await;
        let (coordinator, _) = coordinator(exchange.clone());

        let outcome = coordinator.set_mode("BTCUSDT", MarginType::Isolated).await;
        assert!(!outcome.may_proceed());
    }

    #[tokio::test]
    async fn test_pool_runs_jobs_and_drains_on_shutdown() {
        let exchange = Arc::new(MockExchange::new());
        let (coordinator, _) = coordinator(exchange.clone());
        let pool = MarginTaskPool::start(coordinator.clone(), Arc::new(SymbolGate::new()), 2, 8);
        let scope = ExecutionScope::new();

        assert!(pool.submit("BTCUSDT", MarginType::Isolated, &scope));
        assert!(pool.submit("ETHUSDT", MarginType::Isolated, &scope));
        pool.shutdown().await;

        assert_eq!(
            coordinator.state("BTCUSDT").await,
            MarginModeState::Confirmed(MarginType::Isolated)
        );
        assert_eq!(
            coordinator.state("ETHUSDT").await,
            MarginModeState::Confirmed(MarginType::Isolated)
        );
        assert!(!pool.submit("SOLUSDT", MarginType::Isolated, &scope));
    }

    #[tokio::test]
    async fn test_cancelled_scope_skips_queued_jobs() {
        let exchange = Arc::new(MockExchange::new());
        let (coordinator, _) = coordinator(exchange.clone());
        let gate = Arc::new(SymbolGate::new());
        let pool = MarginTaskPool::start(coordinator, gate.clone(), 1, 8);

        // Hold the symbol so the job cannot start before the scope ends
        let guard = gate.lock("BTCUSDT").await;
        {
            let scope = ExecutionScope::new();
            assert!(pool.submit("BTCUSDT", MarginType::Isolated, &scope));
        }
        drop(guard);
        pool.shutdown().await;

        assert_eq!(exchange.call_count(MockOp::SetMarginType).await, 0);
    }

    #[tokio::test]
    async fn test_full_queue_sheds() {
        let exchange = Arc::new(MockExchange::new());
        let (coordinator, _) = coordinator(exchange.clone());
        let gate = Arc::new(SymbolGate::new());
        let pool = MarginTaskPool::start(coordinator, gate.clone(), 1, 1);
        let scope = ExecutionScope::new();

        let guard = gate.lock("BTCUSDT").await;
        assert!(pool.submit("BTCUSDT", MarginType::Isolated, &scope));
        // Let the worker pick the first job up and block on the gate
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pool.submit("BTCUSDT", MarginType::Isolated, &scope));
        assert!(!pool.submit("BTCUSDT", MarginType::Isolated, &scope));
        drop(guard);
        pool.shutdown().await;
    }
}
