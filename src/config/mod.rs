//! Configuration management for the funding arbitrage backtester.
//!
//! Loads settings from environment variables and config files, and validates
//! them eagerly so a bad parameter set is refused before any data is replayed.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid strategy parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("initial_capital must be > 0, got {0}")]
    NonPositiveCapital(Decimal),

    #[error("position_size_pct must be in (0, 1], got {0}")]
    PositionSizeOutOfRange(Decimal),

    #[error("leverage must be >= 1, got {0}")]
    LeverageBelowOne(Decimal),

    #[error("{name} must be >= 0, got {value}")]
    NegativeThreshold { name: &'static str, value: Decimal },

    #[error("exit_threshold ({exit}) must not exceed entry_threshold ({entry})")]
    ThresholdOrder { entry: Decimal, exit: Decimal },

    #[error("cost rate {name} must be >= 0, got {value}")]
    NegativeCost { name: &'static str, value: Decimal },

    #[error("days_per_year must be > 0, got {0}")]
    NonPositiveYear(Decimal),
}

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Capital and position sizing
    #[serde(default)]
    pub capital: CapitalConfig,
    /// Entry/exit thresholds
    #[serde(default)]
    pub signal: SignalConfig,
    /// Transaction cost model
    #[serde(default)]
    pub costs: CostRates,
    /// Margin behavior
    #[serde(default)]
    pub risk: RiskConfig,
    /// Reporting conventions
    #[serde(default)]
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapitalConfig {
    /// Starting capital in quote currency
    #[serde(default = "default_initial_capital")]
    pub initial_capital: Decimal,
    /// Fraction of capital committed per trade (0.0-1.0]
    #[serde(default = "default_position_size_pct")]
    pub position_size_pct: Decimal,
    /// Multiplier applied to committed capital
    #[serde(default = "default_leverage")]
    pub leverage: Decimal,
    /// Which capital figure position size is derived from
    #[serde(default)]
    pub sizing_basis: SizingBasis,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalConfig {
    /// Minimum absolute funding rate to open a position
    #[serde(default = "default_entry_threshold")]
    pub entry_threshold: Decimal,
    /// Absolute funding rate below which an open position is closed
    #[serde(default = "default_exit_threshold")]
    pub exit_threshold: Decimal,
}

/// Per-side transaction cost rates, as fractions of position notional.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CostRates {
    #[serde(default = "default_futures_commission")]
    pub futures_commission: Decimal,
    #[serde(default = "default_spot_commission")]
    pub spot_commission: Decimal,
    #[serde(default = "default_spread_cost")]
    pub spread_cost: Decimal,
}

impl CostRates {
    /// Cost of one side of the round trip (entry or exit).
    pub fn per_side(&self) -> Decimal {
        self.futures_commission + self.spot_commission + self.spread_cost
    }

    /// Cost of opening and later closing a position.
    pub fn round_trip(&self) -> Decimal {
        self.per_side() * Decimal::TWO
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RiskConfig {
    /// What happens when capital is exhausted
    #[serde(default)]
    pub capital_floor: CapitalFloor,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportConfig {
    /// Day count used to annualize returns
    #[serde(default = "default_days_per_year")]
    pub days_per_year: Decimal,
}

/// Base capital used to size a position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SizingBasis {
    /// Size is fixed from capital at the moment the position opens.
    #[default]
    EntryCapital,
    /// Size is recomputed from current capital every time it is used.
    CurrentCapital,
}

/// Treatment of capital that falls to zero or below.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CapitalFloor {
    /// Capital may go negative; the run continues arithmetically.
    #[default]
    Unbounded,
    /// Force-close at zero capital and stop opening positions.
    Liquidate,
}

// Default value functions
fn default_initial_capital() -> Decimal {
    Decimal::new(10_000, 0) // $10,000
}

fn default_position_size_pct() -> Decimal {
    Decimal::new(90, 2) // 0.90
}

fn default_leverage() -> Decimal {
    Decimal::new(3, 0) // 3x
}

fn default_entry_threshold() -> Decimal {
    Decimal::new(5, 4) // 0.0005 (0.05%)
}

fn default_exit_threshold() -> Decimal {
    Decimal::new(25, 5) // 0.00025, half the entry threshold
}

fn default_futures_commission() -> Decimal {
    Decimal::new(2, 4) // 0.02% futures maker fee
}

fn default_spot_commission() -> Decimal {
    Decimal::new(1, 4) // 0.01% spot maker fee
}

fn default_spread_cost() -> Decimal {
    Decimal::new(2, 4) // 0.02% bid-ask spread
}

fn default_days_per_year() -> Decimal {
    Decimal::new(36525, 2) // 365.25
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("FARB"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let capital = &self.capital;
        if capital.initial_capital <= Decimal::ZERO {
            return Err(ConfigError::NonPositiveCapital(capital.initial_capital));
        }
        if capital.position_size_pct <= Decimal::ZERO || capital.position_size_pct > Decimal::ONE {
            return Err(ConfigError::PositionSizeOutOfRange(capital.position_size_pct));
        }
        if capital.leverage < Decimal::ONE {
            return Err(ConfigError::LeverageBelowOne(capital.leverage));
        }

        let signal = &self.signal;
        for (name, value) in [
            ("entry_threshold", signal.entry_threshold),
            ("exit_threshold", signal.exit_threshold),
        ] {
            if value < Decimal::ZERO {
                return Err(ConfigError::NegativeThreshold { name, value });
            }
        }
        if signal.exit_threshold > signal.entry_threshold {
            return Err(ConfigError::ThresholdOrder {
                entry: signal.entry_threshold,
                exit: signal.exit_threshold,
            });
        }

        for (name, value) in [
            ("futures_commission", self.costs.futures_commission),
            ("spot_commission", self.costs.spot_commission),
            ("spread_cost", self.costs.spread_cost),
        ] {
            if value < Decimal::ZERO {
                return Err(ConfigError::NegativeCost { name, value });
            }
        }

        if self.report.days_per_year <= Decimal::ZERO {
            return Err(ConfigError::NonPositiveYear(self.report.days_per_year));
        }

        Ok(())
    }

    /// Set the entry threshold and derive the exit threshold as `ratio * entry`.
    pub fn with_thresholds(mut self, entry: Decimal, exit_ratio: Decimal) -> Self {
        self.signal.entry_threshold = entry;
        self.signal.exit_threshold = entry * exit_ratio;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capital: CapitalConfig::default(),
            signal: SignalConfig::default(),
            costs: CostRates::default(),
            risk: RiskConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

impl Default for CapitalConfig {
    fn default() -> Self {
        Self {
            initial_capital: default_initial_capital(),
            position_size_pct: default_position_size_pct(),
            leverage: default_leverage(),
            sizing_basis: SizingBasis::default(),
        }
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            entry_threshold: default_entry_threshold(),
            exit_threshold: default_exit_threshold(),
        }
    }
}

impl Default for CostRates {
    fn default() -> Self {
        Self {
            futures_commission: default_futures_commission(),
            spot_commission: default_spot_commission(),
            spread_cost: default_spread_cost(),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            days_per_year: default_days_per_year(),
        }
    }
}
