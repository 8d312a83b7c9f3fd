//! Structured engine events.
//!
//! Events are the hand-off to reporting and operators: every event is logged
//! as one JSON line under the `engine_event` target and journaled in the
//! store's `engine_events` table.

use super::model::OrderStatus;
use crate::exchange::MarginType;
use crate::persistence::OrderStore;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Engine event payloads.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Margin mode could not be changed because of an open position or orders.
    MarginModeBlocked {
        symbol: String,
        desired: MarginType,
        reason: String,
    },
    /// A bracket leg executed but its sibling could not be cancelled.
    BracketOrphaned {
        bracket_id: i64,
        symbol: String,
        sibling_client_id: String,
        error: String,
    },
    /// Reconciliation moved a local row to match the exchange.
    DriftCorrected {
        client_order_id: String,
        symbol: String,
        from: OrderStatus,
        to: OrderStatus,
        exchange_status: String,
    },
    /// Exchange reports a terminal state that contradicts a local terminal state.
    StatusConflict {
        client_order_id: String,
        symbol: String,
        local: OrderStatus,
        exchange_status: String,
    },
    /// Take-profit and stop-loss both executed.
    BothLegsExecuted { bracket_id: i64, symbol: String },
    /// The exchange refused a protective leg.
    BracketLegRejected {
        bracket_id: i64,
        symbol: String,
        leg_client_id: String,
        reason: String,
    },
    /// Filter normalization changed the submitted quantity.
    QuantityAdjusted {
        client_order_id: String,
        symbol: String,
        requested_qty: Decimal,
        adjusted_qty: Decimal,
        intended_margin: Option<Decimal>,
        effective_margin: Option<Decimal>,
    },
    /// A strategy run ended on an unrecoverable error.
    ExecutionFailed {
        execution_id: i64,
        strategy_id: String,
        error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::MarginModeBlocked { .. } => "MarginModeBlocked",
            EngineEvent::BracketOrphaned { .. } => "BracketOrphaned",
            EngineEvent::DriftCorrected { .. } => "DriftCorrected",
            EngineEvent::StatusConflict { .. } => "StatusConflict",
            EngineEvent::BothLegsExecuted { .. } => "BothLegsExecuted",
            EngineEvent::BracketLegRejected { .. } => "BracketLegRejected",
            EngineEvent::QuantityAdjusted { .. } => "QuantityAdjusted",
            EngineEvent::ExecutionFailed { .. } => "ExecutionFailed",
        }
    }

    pub fn symbol(&self) -> Option<&str> {
        match self {
            EngineEvent::MarginModeBlocked { symbol, .. }
            | EngineEvent::BracketOrphaned { symbol, .. }
            | EngineEvent::DriftCorrected { symbol, .. }
            | EngineEvent::StatusConflict { symbol, .. }
            | EngineEvent::BothLegsExecuted { symbol, .. }
            | EngineEvent::BracketLegRejected { symbol, .. }
            | EngineEvent::QuantityAdjusted { symbol, .. } => Some(symbol),
            EngineEvent::ExecutionFailed { .. } => None,
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            EngineEvent::MarginModeBlocked { .. } | EngineEvent::QuantityAdjusted { .. } => {
                EventSeverity::Info
            }
            EngineEvent::DriftCorrected { .. } | EngineEvent::StatusConflict { .. } => {
                EventSeverity::Warning
            }
            EngineEvent::BracketOrphaned { .. }
            | EngineEvent::BothLegsExecuted { .. }
            | EngineEvent::BracketLegRejected { .. }
            | EngineEvent::ExecutionFailed { .. } => EventSeverity::Error,
        }
    }
}

/// Logs and journals engine events.
#[derive(Clone)]
pub struct EventJournal {
    store: Arc<OrderStore>,
}

impl EventJournal {
    pub fn new(store: Arc<OrderStore>) -> Self {
        Self { store }
    }

    /// Emit an event. Journal write failures are logged, never propagated.
    pub fn emit(&self, event: EngineEvent) {
        let json = serde_json::to_string(&event).unwrap_or_default();

        match event.severity() {
            EventSeverity::Info => info!(target: "engine_event", "ENGINE_EVENT: {}", json),
            EventSeverity::Warning => warn!(target: "engine_event", "ENGINE_EVENT: {}", json),
            EventSeverity::Error => error!(target: "engine_event", "ENGINE_EVENT: {}", json),
        }

        if let Err(e) = self.store.record_event(event.kind(), event.symbol(), &json) {
            warn!(kind = event.kind(), error = %e, "Failed to journal engine event");
        }
    }
}
