//! Venue-agnostic exchange capability set.
//!
//! The engine talks to an exchange only through [`ExchangeAdapter`]. Regular
//! and conditional ("algo") orders are separate capabilities because venues
//! expose them as separate API surfaces with separate identifiers.

use super::error::ExchangeError;
use super::types::{
    MarginType, OrderLookup, OrderRequest, OrderSnapshot, PositionInfo, SymbolFilters,
};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Trait implemented by every exchange integration (live REST client, mock).
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Submit a new order. Conditional kinds are routed to the algo surface
    /// by the implementation; the returned snapshot carries the algo id.
    async fn create_order(&self, request: &OrderRequest) -> Result<OrderSnapshot, ExchangeError>;

    /// Cancel a regular (market/limit) order by exchange order id.
    async fn cancel_order(&self, symbol: &str, order_id: &str)
        -> Result<OrderSnapshot, ExchangeError>;

    /// Cancel a conditional order by its algo id.
    async fn cancel_algo_order(
        &self,
        symbol: &str,
        algo_id: &str,
    ) -> Result<OrderSnapshot, ExchangeError>;

    /// Query a regular order.
    async fn get_order(
        &self,
        symbol: &str,
        lookup: &OrderLookup,
    ) -> Result<OrderSnapshot, ExchangeError>;

    /// Query a conditional order.
    async fn get_algo_order(
        &self,
        symbol: &str,
        lookup: &OrderLookup,
    ) -> Result<OrderSnapshot, ExchangeError>;

    /// Open positions, optionally restricted to one symbol.
    async fn get_positions(&self, symbol: Option<&str>)
        -> Result<Vec<PositionInfo>, ExchangeError>;

    /// Set the per-symbol margin mode.
    async fn set_margin_type(
        &self,
        symbol: &str,
        margin_type: MarginType,
    ) -> Result<(), ExchangeError>;

    /// Typed trading constraints for a symbol.
    async fn get_symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError>;
}

/// Run an exchange call with an upper bound on its duration.
///
/// An elapsed timer means the call's outcome is unknown, so it surfaces as
/// [`ExchangeError::Timeout`] and never as a definite failure.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, ExchangeError>
where
    F: Future<Output = Result<T, ExchangeError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ExchangeError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: Result<(), ExchangeError> = bounded(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(ExchangeError::Timeout));
    }

    #[tokio::test]
    async fn test_bounded_passes_through() {
        let result = bounded(Duration::from_secs(1), async { Ok::<_, ExchangeError>(7) }).await;
        assert_eq!(result, Ok(7));
    }
}
