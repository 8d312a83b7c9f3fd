//! # Order Scheduler
//!
//! Idempotent order scheduling, bracket (TP/SL) linkage, margin mode
//! coordination and exchange reconciliation for Binance Futures.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Exchange adapter trait, Binance REST client and mock venue
//! - `engine`: Scheduler, submitter, bracket manager and order sync
//! - `persistence`: SQLite store for orders, brackets, executions and leases

pub mod config;
pub mod engine;
pub mod exchange;
pub mod persistence;

pub use config::Config;
