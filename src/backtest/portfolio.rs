//! Portfolio state, trade log entries and per-period snapshots.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The single hedged position held by the strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Position {
    /// No open hedge
    #[default]
    Flat,
    /// Long spot + short futures, collects positive funding
    LongCollect,
    /// Short spot + long futures, collects negative funding
    ShortCollect,
}

impl Position {
    /// +1 for long-collect, -1 for short-collect, 0 when flat.
    pub fn direction_sign(&self) -> Decimal {
        match self {
            Position::Flat => Decimal::ZERO,
            Position::LongCollect => Decimal::ONE,
            Position::ShortCollect => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn is_open(&self) -> bool {
        !matches!(self, Position::Flat)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Position::Flat => "FLAT",
            Position::LongCollect => "LONG_COLLECT",
            Position::ShortCollect => "SHORT_COLLECT",
        };
        f.write_str(label)
    }
}

/// Mutable portfolio state carried across one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioState {
    pub capital: Decimal,
    pub position: Position,
    /// Funding rate observed when the current position opened
    pub entry_rate: Option<Decimal>,
    /// Notional fixed at open; used when sizing from entry capital
    pub entry_size: Decimal,
}

impl PortfolioState {
    /// Flat portfolio holding `capital`.
    pub fn new(capital: Decimal) -> Self {
        Self {
            capital,
            position: Position::Flat,
            entry_rate: None,
            entry_size: Decimal::ZERO,
        }
    }

    pub(crate) fn open(&mut self, position: Position, rate: Decimal, size: Decimal) {
        self.position = position;
        self.entry_rate = Some(rate);
        self.entry_size = size;
    }

    pub(crate) fn close(&mut self) {
        self.position = Position::Flat;
        self.entry_rate = None;
        self.entry_size = Decimal::ZERO;
    }
}

/// Why a trade was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// |funding rate| dropped below the exit threshold
    FundingDecay,
    /// Capital exhausted under the liquidating capital floor
    Liquidation,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::FundingDecay => f.write_str("funding_decay"),
            ExitReason::Liquidation => f.write_str("liquidation"),
        }
    }
}

/// One round trip, from open to close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub open_timestamp: DateTime<Utc>,
    pub close_timestamp: Option<DateTime<Utc>>,
    pub direction: Position,
    pub entry_rate: Decimal,
    pub exit_rate: Option<Decimal>,
    /// Notional at open
    pub position_size: Decimal,
    pub funding_collected: Decimal,
    pub costs_paid: Decimal,
    /// Funding settlements accrued while open
    pub periods_held: u32,
    pub exit_reason: Option<ExitReason>,
}

impl TradeRecord {
    pub(crate) fn open(
        timestamp: DateTime<Utc>,
        direction: Position,
        entry_rate: Decimal,
        position_size: Decimal,
        entry_cost: Decimal,
    ) -> Self {
        Self {
            open_timestamp: timestamp,
            close_timestamp: None,
            direction,
            entry_rate,
            exit_rate: None,
            position_size,
            funding_collected: Decimal::ZERO,
            costs_paid: entry_cost,
            periods_held: 0,
            exit_reason: None,
        }
    }

    pub(crate) fn accrue(&mut self, payment: Decimal) {
        self.funding_collected += payment;
        self.periods_held += 1;
    }

    pub(crate) fn close(
        &mut self,
        timestamp: DateTime<Utc>,
        exit_rate: Decimal,
        exit_cost: Decimal,
        reason: ExitReason,
    ) {
        self.close_timestamp = Some(timestamp);
        self.exit_rate = Some(exit_rate);
        self.costs_paid += exit_cost;
        self.exit_reason = Some(reason);
    }

    pub fn is_closed(&self) -> bool {
        self.close_timestamp.is_some()
    }

    /// Funding collected minus all costs charged to this trade.
    pub fn net_pnl(&self) -> Decimal {
        self.funding_collected - self.costs_paid
    }

    pub fn is_profitable(&self) -> bool {
        self.net_pnl() > Decimal::ZERO
    }

    /// Holding time in hours, if closed.
    pub fn duration_hours(&self) -> Option<i64> {
        self.close_timestamp
            .map(|close| (close - self.open_timestamp).num_hours())
    }
}

/// Position change applied in a period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TradeAction {
    #[default]
    None,
    Open,
    Close,
    Liquidate,
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TradeAction::None => "none",
            TradeAction::Open => "open",
            TradeAction::Close => "close",
            TradeAction::Liquidate => "liquidate",
        };
        f.write_str(label)
    }
}

/// Portfolio state recorded after each observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub timestamp: DateTime<Utc>,
    pub funding_rate: Decimal,
    pub position: Position,
    pub action: TradeAction,
    pub funding_payment: Decimal,
    pub transaction_cost: Decimal,
    pub capital: Decimal,
    pub cumulative_funding: Decimal,
    pub cumulative_costs: Decimal,
}

impl PortfolioSnapshot {
    /// Return on `initial_capital` at this point.
    pub fn portfolio_return(&self, initial_capital: Decimal) -> Decimal {
        if initial_capital == Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.capital - initial_capital) / initial_capital
    }
}
