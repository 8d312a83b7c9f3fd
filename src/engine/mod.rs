//! Order scheduling engine.
//!
//! - `scheduler`: strategy triggers, leases and decision handling
//! - `submitter`: normalization, idempotent submission, cancel routing
//! - `margin`: per-symbol margin mode coordination and background pool
//! - `bracket`: entry / take-profit / stop-loss linkage
//! - `sync`: reconciliation of local rows against the exchange
//! - `events`: structured engine events and their journal

mod bracket;
mod decisions;
mod events;
mod margin;
mod model;
mod normalize;
mod retry;
mod scheduler;
mod submitter;
mod sync;

pub use bracket::{trigger_prices, BracketManager};
pub use decisions::{DecisionSource, JsonFileDecisionSource, StaticDecisionSource};
pub use events::{EngineEvent, EventJournal, EventSeverity};
pub use margin::{
    ExecutionScope, MarginModeCoordinator, MarginModeOutcome, MarginModeState, MarginTaskPool,
    SymbolGate,
};
pub use model::{
    client_order_id, BracketLink, BracketSpec, BracketStatus, DecisionAction, ExecutionStatus,
    NewScheduledOrder, OrderLeg, OrderStatus, ScheduledOrder, Sizing, StrategyExecution,
    TradeDecision, MAX_CLIENT_ORDER_ID_LEN,
};
pub use normalize::{
    effective_margin, normalize_quantity, normalize_reduce_only, round_to_tick, NormalizeError,
    NormalizedQuantity,
};
pub use retry::RetryPolicy;
pub use scheduler::{OrderScheduler, ScheduleError};
pub use submitter::{OrderSubmitter, StatusChange, SubmitError, SubmitOutcome};
pub use sync::{OrderSync, SyncReport};
