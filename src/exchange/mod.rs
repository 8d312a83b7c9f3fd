//! Exchange integrations.
//!
//! ## Binance Futures
//! Signed REST access to:
//! - Regular orders (market/limit): create, cancel, query
//! - Conditional "algo" orders (take-profit/stop-loss): create, cancel, query
//! - Positions, margin type, and symbol trading filters
//!
//! ## Mock
//! In-memory venue used for paper trading and engine tests.

mod client;
mod error;
pub mod mock;
mod traits;
mod types;

pub use client::BinanceClient;
pub use error::ExchangeError;
pub use mock::{MockCall, MockExchange, MockFault, MockOp};
pub use traits::{bounded, ExchangeAdapter};
pub use types::*;
