//! Backtesting module for the funding-rate arbitrage strategy.
//!
//! This module provides:
//! - Historical funding data loading (CSV exports)
//! - Single-pass simulation engine
//! - Parameter sweep for threshold optimization
//! - Performance and risk metrics
//!
//! # Example
//!
//! ```rust,ignore
//! use funding_arb_backtest::backtest::{CsvDataLoader, DataLoader, FundingArbitrageSimulator};
//! use funding_arb_backtest::Config;
//!
//! let loader = CsvDataLoader::new("data/BTCUSDT_funding.csv")?;
//! let simulator = FundingArbitrageSimulator::new(Config::default())?;
//!
//! let result = simulator.run(loader.observations())?;
//! println!("{}", result.summary());
//! ```

mod data;
mod engine;
mod metrics;
mod portfolio;
mod runner;

pub use data::{CsvDataLoader, DataLoader, FundingObservation};
pub use engine::{decide, BacktestResult, Decision, FundingArbitrageSimulator, StepResult};
pub use metrics::{FundingStats, RiskMetrics, RunSummary};
pub use portfolio::{
    ExitReason, PortfolioSnapshot, PortfolioState, Position, TradeAction, TradeRecord,
};
pub use runner::{ParameterSpace, SweepResults, SweepRunner};

use crate::config::ConfigError;
use thiserror::Error;

/// Errors that abort a backtest run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BacktestError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("malformed observation at index {index}: {reason}")]
    MalformedObservation { index: usize, reason: String },

    #[error("arithmetic overflow computing {operation} at index {index}")]
    Overflow {
        index: usize,
        operation: &'static str,
    },
}
