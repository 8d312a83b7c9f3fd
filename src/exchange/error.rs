//! Exchange error taxonomy.
//!
//! Every venue failure is mapped once, here, into a variant the engine can
//! reason about:
//! - Transient (timeout, network, rate limit, 5xx): outcome unknown, retry
//! - Expected terminal (duplicate client id, margin unchanged/blocked)
//! - Unknown order: unambiguous "no live order" when seen on a cancel
//! - Rejected: the request was refused and will not succeed on retry
//! - Fatal (authentication / configuration)

use thiserror::Error;

/// Errors returned by an [`ExchangeAdapter`](super::ExchangeAdapter).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("request timed out, outcome unknown")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("exchange server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error("client order id already exists: {0}")]
    DuplicateClientOrderId(String),

    #[error("margin type already set")]
    MarginTypeUnchanged,

    #[error("margin type change blocked by open position or orders: {0}")]
    MarginChangeBlocked(String),

    #[error("unknown order: {0}")]
    UnknownOrder(String),

    #[error("order rejected ({code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("failed to decode exchange response: {0}")]
    Decode(String),
}

impl ExchangeError {
    /// Map a venue `{code, msg}` error body to a typed error.
    pub fn from_api(code: i64, msg: &str) -> Self {
        let message = msg.to_string();
        match code {
            -1003 => ExchangeError::RateLimited(message),
            -1001 | -1006 | -1007 => ExchangeError::Timeout,
            -1021 => ExchangeError::Network(message),
            -1002 | -1022 | -2014 | -2015 => ExchangeError::Auth(message),
            -2011 | -2013 => ExchangeError::UnknownOrder(message),
            -4046 => ExchangeError::MarginTypeUnchanged,
            -4047 | -4048 => ExchangeError::MarginChangeBlocked(message),
            -4116 => ExchangeError::DuplicateClientOrderId(message),
            _ if msg.to_ascii_lowercase().contains("duplicate") => {
                ExchangeError::DuplicateClientOrderId(message)
            }
            _ if msg.to_ascii_lowercase().contains("unknown order") => {
                ExchangeError::UnknownOrder(message)
            }
            _ => ExchangeError::Rejected { code, message },
        }
    }

    /// Map an HTTP status without a parseable body.
    pub fn from_http_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => ExchangeError::Auth(body.to_string()),
            408 => ExchangeError::Timeout,
            418 | 429 => ExchangeError::RateLimited(body.to_string()),
            500..=599 => ExchangeError::Server {
                status,
                message: body.to_string(),
            },
            _ => ExchangeError::Rejected {
                code: i64::from(status),
                message: body.to_string(),
            },
        }
    }

    /// Worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Timeout
                | ExchangeError::Network(_)
                | ExchangeError::RateLimited(_)
                | ExchangeError::Server { .. }
        )
    }

    /// The request may or may not have taken effect on the exchange.
    /// Local state must not be moved to a terminal status on these.
    pub fn is_ambiguous(&self) -> bool {
        self.is_transient() || matches!(self, ExchangeError::Decode(_))
    }

    /// Persistent misconfiguration; stop the run and surface to an operator.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExchangeError::Auth(_))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Timeout
        } else if err.is_decode() {
            ExchangeError::Decode(err.to_string())
        } else {
            ExchangeError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_code_mapping() {
        assert_eq!(
            ExchangeError::from_api(-2011, "Unknown order sent."),
            ExchangeError::UnknownOrder("Unknown order sent.".to_string())
        );
        assert_eq!(
            ExchangeError::from_api(-4046, "No need to change margin type."),
            ExchangeError::MarginTypeUnchanged
        );
        assert!(matches!(
            ExchangeError::from_api(-4048, "Margin type cannot be changed if there exists position."),
            ExchangeError::MarginChangeBlocked(_)
        ));
        assert!(matches!(
            ExchangeError::from_api(-4116, "ClientOrderId is duplicated."),
            ExchangeError::DuplicateClientOrderId(_)
        ));
        assert!(matches!(
            ExchangeError::from_api(-2019, "Margin is insufficient."),
            ExchangeError::Rejected { code: -2019, .. }
        ));
    }

    #[test]
    fn test_classification() {
        assert!(ExchangeError::Timeout.is_transient());
        assert!(ExchangeError::from_api(-1003, "Too many requests").is_transient());
        assert!(ExchangeError::from_http_status(503, "unavailable").is_ambiguous());
        assert!(ExchangeError::from_api(-2015, "Invalid API-key").is_fatal());

        let unknown = ExchangeError::UnknownOrder("gone".to_string());
        assert!(!unknown.is_ambiguous());
        assert!(!unknown.is_transient());

        let rejected = ExchangeError::from_api(-1121, "Invalid symbol.");
        assert!(!rejected.is_ambiguous());
        assert!(!rejected.is_fatal());
    }
}
