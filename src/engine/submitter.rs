//! Order submission, cancellation and status queries.
//!
//! The submitter turns a pending [`ScheduledOrder`] into an exchange order:
//! margin mode is set authoritatively under the symbol gate, the quantity is
//! normalized against the symbol filters, and the order is sent with its
//! deterministic client order id. A "duplicate client id" answer means an
//! earlier attempt landed, so the existing order is fetched and adopted.
//!
//! Local rows only move to a terminal status on unambiguous answers. Timeouts
//! and other ambiguous failures leave the row where it was for the
//! reconciliation engine to resolve.

use super::events::{EngineEvent, EventJournal};
use super::margin::{MarginModeCoordinator, SymbolGate};
use super::model::{OrderStatus, ScheduledOrder};
use super::normalize::{
    effective_margin, normalize_quantity, normalize_reduce_only, round_to_tick,
};
use super::retry::RetryPolicy;
use crate::exchange::{
    bounded, ExchangeAdapter, ExchangeError, ExchangeOrderState, MarginType, OrderKind,
    OrderLookup, OrderRequest, OrderSnapshot, SymbolFilters,
};
use crate::persistence::{OrderStore, OrderUpdate};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

/// Errors that stop a submission from being handled as a per-order outcome.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// Persistent authentication or configuration failure.
    #[error("fatal exchange error: {0}")]
    Fatal(ExchangeError),

    #[error("order store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Observable result of a submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutcome {
    pub exchange_order_id: Option<String>,
    pub status: OrderStatus,
    pub executed_qty: Decimal,
    pub avg_price: Option<Decimal>,
    pub error: Option<String>,
}

impl SubmitOutcome {
    fn from_row(order: &ScheduledOrder) -> Self {
        Self {
            exchange_order_id: order.exchange_order_id.clone(),
            status: order.status,
            executed_qty: order.executed_qty,
            avg_price: order.avg_fill_price,
            error: order.last_error.clone(),
        }
    }
}

/// Local status change caused by an exchange snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub from: OrderStatus,
    pub to: OrderStatus,
}

pub struct OrderSubmitter {
    exchange: Arc<dyn ExchangeAdapter>,
    store: Arc<OrderStore>,
    journal: EventJournal,
    margin: Arc<MarginModeCoordinator>,
    gate: Arc<SymbolGate>,
    policy: RetryPolicy,
    call_timeout: Duration,
    filter_ttl: Duration,
    filter_cache: RwLock<HashMap<String, (Instant, SymbolFilters)>>,
}

impl OrderSubmitter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        store: Arc<OrderStore>,
        journal: EventJournal,
        margin: Arc<MarginModeCoordinator>,
        gate: Arc<SymbolGate>,
        policy: RetryPolicy,
        call_timeout: Duration,
        filter_ttl: Duration,
    ) -> Self {
        Self {
            exchange,
            store,
            journal,
            margin,
            gate,
            policy,
            call_timeout,
            filter_ttl,
            filter_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Symbol filters, cached for the configured TTL.
    pub async fn filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        if let Some((fetched_at, filters)) = self.filter_cache.read().await.get(symbol) {
            if fetched_at.elapsed() < self.filter_ttl {
                return Ok(*filters);
            }
        }

        let filters = self
            .policy
            .run("get_symbol_filters", || {
                bounded(self.call_timeout, self.exchange.get_symbol_filters(symbol))
            })
            .await?;
        self.filter_cache
            .write()
            .await
            .insert(symbol.to_string(), (Instant::now(), filters));
        Ok(filters)
    }

    /// Submit a pending order.
    ///
    /// `margin_mode` is applied to the symbol first for position-opening
    /// orders. Orders that are no longer pending are returned as stored.
    #[instrument(skip(self, order), fields(client_order_id = %order.client_order_id, symbol = %order.symbol))]
    pub async fn submit(
        &self,
        order: &ScheduledOrder,
        margin_mode: Option<MarginType>,
    ) -> Result<SubmitOutcome, SubmitError> {
        let _guard = self.gate.lock(&order.symbol).await;

        // Re-read under the gate: sync or an earlier attempt may have moved it
        let order = self.reload(order)?;
        if order.status != OrderStatus::Pending {
            debug!(status = %order.status, "Order already past pending, not resubmitting");
            return Ok(SubmitOutcome::from_row(&order));
        }

        if let Some(mode) = margin_mode.filter(|_| !order.reduce_only) {
            let outcome = self.margin.set_mode(&order.symbol, mode).await;
            if let Some(e) = outcome.error.filter(ExchangeError::is_fatal) {
                return self.fail_unsent(&order, e).await;
            }
        }

        let request = match self.build_request(&order).await {
            Ok(request) => request,
            Err(BuildError::Fatal(e)) => return self.fail_unsent(&order, e).await,
            Err(BuildError::Invalid(reason)) => {
                return self.reject_unsent(&order, reason);
            }
            Err(BuildError::Store(e)) => return Err(SubmitError::Store(e)),
        };

        let result = self
            .policy
            .run("create_order", || {
                bounded(self.call_timeout, self.exchange.create_order(&request))
            })
            .await;

        match result {
            Ok(snapshot) => {
                info!(
                    exchange_order_id = %snapshot.exchange_order_id,
                    status = %snapshot.raw_status,
                    quantity = %request.quantity,
                    "Order accepted"
                );
                self.record_snapshot(&order, &snapshot)?;
                Ok(SubmitOutcome::from_row(&self.reload(&order)?))
            }
            Err(ExchangeError::DuplicateClientOrderId(_)) => {
                info!("Client order id already on exchange, adopting existing order");
                match self.query(&order).await {
                    Ok(snapshot) => {
                        self.record_snapshot(&order, &snapshot)?;
                    }
                    Err(e) => {
                        warn!(error = %e, "Existing order lookup failed, leaving row pending");
                        self.store.note_order_error(order.id, &e.to_string())?;
                    }
                }
                Ok(SubmitOutcome::from_row(&self.reload(&order)?))
            }
            Err(e) if e.is_ambiguous() => {
                warn!(error = %e, "Submission outcome unknown, leaving row pending");
                self.store.note_order_error(order.id, &e.to_string())?;
                Ok(SubmitOutcome::from_row(&self.reload(&order)?))
            }
            Err(e) if e.is_fatal() => self.fail_unsent(&order, e).await,
            Err(e) => {
                error!(error = %e, "Order rejected by exchange");
                self.store.transition_order(
                    order.id,
                    OrderStatus::Pending,
                    OrderStatus::Rejected,
                    &OrderUpdate {
                        last_error: Some(e.to_string()),
                        ..Default::default()
                    },
                )?;
                Ok(SubmitOutcome::from_row(&self.reload(&order)?))
            }
        }
    }

    /// Normalize quantity and prices and persist the adjustment.
    async fn build_request(&self, order: &ScheduledOrder) -> Result<OrderRequest, BuildError> {
        let filters = self.filters(&order.symbol).await.map_err(|e| {
            if e.is_fatal() {
                BuildError::Fatal(e)
            } else {
                BuildError::Invalid(format!("symbol filters unavailable: {e}"))
            }
        })?;

        let quantity = if order.reduce_only {
            normalize_reduce_only(order.requested_qty, &filters)
                .map_err(|e| BuildError::Invalid(e.to_string()))?
        } else {
            let price = order
                .price
                .ok_or_else(|| BuildError::Invalid("entry order has no price".to_string()))?;
            let normalized = normalize_quantity(order.requested_qty, price, &filters)
                .map_err(|e| BuildError::Invalid(e.to_string()))?;
            normalized.quantity
        };

        let margin = (!order.reduce_only)
            .then_some(order.price)
            .flatten()
            .map(|price| effective_margin(quantity, price, order.leverage));

        self.store
            .record_normalization(order.id, quantity, margin)
            .map_err(BuildError::Store)?;

        if quantity != order.requested_qty {
            info!(
                client_order_id = %order.client_order_id,
                requested = %order.requested_qty,
                adjusted = %quantity,
                intended_margin = ?order.intended_margin,
                effective_margin = ?margin,
                "Quantity adjusted to exchange filters"
            );
            self.journal.emit(EngineEvent::QuantityAdjusted {
                client_order_id: order.client_order_id.clone(),
                symbol: order.symbol.clone(),
                requested_qty: order.requested_qty,
                adjusted_qty: quantity,
                intended_margin: order.intended_margin,
                effective_margin: margin,
            });
        }

        let price = match order.kind {
            OrderKind::Limit => order.price.map(|p| round_to_tick(p, filters.tick_size)),
            _ => None,
        };
        let trigger_price = order
            .trigger_price
            .filter(|_| order.kind.is_conditional())
            .map(|p| round_to_tick(p, filters.tick_size));

        Ok(OrderRequest {
            symbol: order.symbol.clone(),
            side: order.side,
            kind: order.kind,
            quantity,
            price,
            trigger_price,
            reduce_only: order.reduce_only,
            client_order_id: order.client_order_id.clone(),
        })
    }

    /// The order definitely never reached the exchange and cannot be sent.
    fn reject_unsent(
        &self,
        order: &ScheduledOrder,
        reason: String,
    ) -> Result<SubmitOutcome, SubmitError> {
        warn!(client_order_id = %order.client_order_id, %reason, "Order not submittable");
        self.store.transition_order(
            order.id,
            OrderStatus::Pending,
            OrderStatus::Rejected,
            &OrderUpdate {
                last_error: Some(reason),
                ..Default::default()
            },
        )?;
        Ok(SubmitOutcome::from_row(&self.reload(order)?))
    }

    async fn fail_unsent(
        &self,
        order: &ScheduledOrder,
        err: ExchangeError,
    ) -> Result<SubmitOutcome, SubmitError> {
        error!(client_order_id = %order.client_order_id, error = %err, "Fatal exchange error");
        self.store.transition_order(
            order.id,
            OrderStatus::Pending,
            OrderStatus::Rejected,
            &OrderUpdate {
                last_error: Some(err.to_string()),
                ..Default::default()
            },
        )?;
        Err(SubmitError::Fatal(err))
    }

    /// Query the order on the surface matching its kind. Single bounded
    /// attempt; callers decide about retries.
    pub async fn query(&self, order: &ScheduledOrder) -> Result<OrderSnapshot, ExchangeError> {
        let lookup = match &order.exchange_order_id {
            Some(id) => OrderLookup::ExchangeId(id.clone()),
            None => OrderLookup::ClientId(order.client_order_id.clone()),
        };
        if order.kind.is_conditional() {
            bounded(
                self.call_timeout,
                self.exchange.get_algo_order(&order.symbol, &lookup),
            )
            .await
        } else {
            bounded(
                self.call_timeout,
                self.exchange.get_order(&order.symbol, &lookup),
            )
            .await
        }
    }

    /// Cancel a live order through the surface matching its kind.
    ///
    /// Returns the resulting local status. "Unknown order" on a cancel means
    /// no live order exists; a follow-up lookup decides between filled and
    /// cancelled, and the row is only marked cancelled when the lookup cannot
    /// find the order either. Ambiguous errors are returned and leave the row
    /// untouched for the next reconciliation pass.
    #[instrument(skip(self, order), fields(client_order_id = %order.client_order_id, symbol = %order.symbol))]
    pub async fn cancel(&self, order: &ScheduledOrder) -> Result<OrderStatus, ExchangeError> {
        let order = self.reload(order).map_err(store_error)?;
        if order.status.is_terminal() {
            return Ok(order.status);
        }

        let exchange_id = match &order.exchange_order_id {
            Some(id) => id.clone(),
            None => {
                // Never confirmed: find it by client id first
                let snapshot = self.query(&order).await?;
                self.record_snapshot(&order, &snapshot).map_err(store_error)?;
                if let Some(status) = OrderStatus::from_exchange(&snapshot.state) {
                    return Ok(status);
                }
                snapshot.exchange_order_id
            }
        };
        let order = self.reload(&order).map_err(store_error)?;

        let result = if order.kind.is_conditional() {
            bounded(
                self.call_timeout,
                self.exchange.cancel_algo_order(&order.symbol, &exchange_id),
            )
            .await
        } else {
            bounded(
                self.call_timeout,
                self.exchange.cancel_order(&order.symbol, &exchange_id),
            )
            .await
        };

        match result {
            Ok(snapshot) => {
                let snapshot = match snapshot.state {
                    ExchangeOrderState::Executed => snapshot,
                    _ => OrderSnapshot {
                        state: ExchangeOrderState::Cancelled,
                        ..snapshot
                    },
                };
                self.record_snapshot(&order, &snapshot).map_err(store_error)?;
                info!(status = %snapshot.raw_status, "Order cancelled");
                Ok(self.reload(&order).map_err(store_error)?.status)
            }
            Err(ExchangeError::UnknownOrder(msg)) => {
                debug!(%msg, "Cancel found no live order, resolving terminal state");
                let resolved = match self.query(&order).await {
                    Ok(snapshot) if snapshot.state.is_terminal() => snapshot,
                    Ok(snapshot) => {
                        warn!(status = %snapshot.raw_status, "Cancel said unknown but order is live, row unchanged");
                        return Err(ExchangeError::UnknownOrder(msg));
                    }
                    Err(ExchangeError::UnknownOrder(_)) => OrderSnapshot {
                        exchange_order_id: exchange_id,
                        client_order_id: order.client_order_id.clone(),
                        symbol: order.symbol.clone(),
                        state: ExchangeOrderState::Cancelled,
                        raw_status: "UNKNOWN_ORDER".to_string(),
                        executed_qty: order.executed_qty,
                        avg_price: order.avg_fill_price.unwrap_or_default(),
                    },
                    Err(e) => {
                        warn!(error = %e, "Order state after cancel unresolved, row unchanged");
                        return Err(e);
                    }
                };
                self.record_snapshot(&order, &resolved).map_err(store_error)?;
                Ok(self.reload(&order).map_err(store_error)?.status)
            }
            Err(e) => {
                warn!(error = %e, "Cancel failed, row unchanged");
                Err(e)
            }
        }
    }

    /// Apply an exchange snapshot to a non-terminal local row with a
    /// conditional update. Returns the status change if this writer made one.
    pub fn record_snapshot(
        &self,
        order: &ScheduledOrder,
        snapshot: &OrderSnapshot,
    ) -> anyhow::Result<Option<StatusChange>> {
        let current = self.reload(order)?;
        if let ExchangeOrderState::Unrecognized(code) = &snapshot.state {
            warn!(
                client_order_id = %current.client_order_id,
                %code,
                "Unrecognized exchange status, not acting on it"
            );
            return Ok(None);
        }

        let exchange_status = OrderStatus::from_exchange(&snapshot.state);
        let update = OrderUpdate {
            exchange_order_id: Some(snapshot.exchange_order_id.clone()),
            executed_qty: Some(snapshot.executed_qty),
            avg_fill_price: (snapshot.avg_price > Decimal::ZERO).then_some(snapshot.avg_price),
            last_error: None,
        };

        if current.status.is_terminal() {
            // Terminal rows only move to a different terminal status the
            // exchange reports; the exchange wins
            let Some(next) = exchange_status.filter(|s| *s != current.status) else {
                return Ok(None);
            };
            if !self
                .store
                .transition_order(current.id, current.status, next, &update)?
            {
                return Ok(None);
            }
            warn!(
                client_order_id = %current.client_order_id,
                local = %current.status,
                exchange = %snapshot.raw_status,
                "Local terminal status contradicted by exchange, corrected"
            );
            self.journal.emit(EngineEvent::StatusConflict {
                client_order_id: current.client_order_id.clone(),
                symbol: current.symbol.clone(),
                local: current.status,
                exchange_status: snapshot.raw_status.clone(),
            });
            return Ok(Some(StatusChange {
                from: current.status,
                to: next,
            }));
        }

        let next = exchange_status.unwrap_or(OrderStatus::Submitted);
        let changed = self
            .store
            .transition_order(current.id, current.status, next, &update)?;
        Ok((changed && next != current.status).then_some(StatusChange {
            from: current.status,
            to: next,
        }))
    }

    fn reload(&self, order: &ScheduledOrder) -> anyhow::Result<ScheduledOrder> {
        self.store
            .get_order(order.id)?
            .ok_or_else(|| anyhow::anyhow!("order {} missing", order.id))
    }
}

enum BuildError {
    Fatal(ExchangeError),
    Invalid(String),
    Store(anyhow::Error),
}

fn store_error(e: anyhow::Error) -> ExchangeError {
    // Store failures during a cancel leave the outcome unknown to the caller
    ExchangeError::Network(format!("store: {e}"))
}
