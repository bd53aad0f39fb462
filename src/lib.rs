//! # Funding Arbitrage Backtester
//!
//! Replays historical perpetual-futures funding rates through a
//! delta-neutral funding-collection strategy and reports its economics.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `backtest`: Data loading, simulation engine, metrics and parameter sweeps
//! - `utils`: Shared utilities and decimal arithmetic

pub mod backtest;
pub mod config;
pub mod utils;

pub use config::Config;
