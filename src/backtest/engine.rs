//! Backtesting simulation engine.
//!
//! Replays funding observations through the arbitrage strategy in a single
//! pass: accrue funding on the open hedge, decide, charge costs, snapshot.

use crate::backtest::data::FundingObservation;
use crate::backtest::metrics::{RunSummary, RunTotals};
use crate::backtest::portfolio::{
    ExitReason, PortfolioSnapshot, PortfolioState, Position, TradeAction, TradeRecord,
};
use crate::backtest::BacktestError;
use crate::config::{CapitalFloor, Config, ConfigError, SignalConfig, SizingBasis};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Decimal places kept on every payment and cost so that running totals
/// and capital stay exactly reconcilable.
const AMOUNT_DP: u32 = 10;

/// Outcome of the decision rule for one period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Open(Position),
    Close,
    Hold,
}

/// Decide the position change for a period.
///
/// Entry is only evaluated while flat and exit only while open, so at most
/// one transition can fire.
pub fn decide(position: Position, funding_rate: Decimal, signal: &SignalConfig) -> Decision {
    match position {
        Position::Flat if funding_rate > signal.entry_threshold => {
            Decision::Open(Position::LongCollect)
        }
        Position::Flat if funding_rate < -signal.entry_threshold => {
            Decision::Open(Position::ShortCollect)
        }
        Position::LongCollect | Position::ShortCollect
            if funding_rate.abs() < signal.exit_threshold =>
        {
            Decision::Close
        }
        _ => Decision::Hold,
    }
}

/// Result of a single simulation step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub timestamp: DateTime<Utc>,
    pub action: TradeAction,
    pub funding_payment: Decimal,
    pub transaction_cost: Decimal,
    pub capital: Decimal,
}

/// Complete result of a backtest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub config: Config,
    pub summary: RunSummary,
    pub snapshots: Vec<PortfolioSnapshot>,
    /// Completed trades, in close order
    pub trades: Vec<TradeRecord>,
    /// Position still held when the data ran out
    pub open_trade: Option<TradeRecord>,
}

impl BacktestResult {
    /// Snapshot series as CSV.
    pub fn snapshots_csv(&self) -> Result<String> {
        let mut wtr = csv::Writer::from_writer(vec![]);
        wtr.write_record([
            "timestamp",
            "funding_rate",
            "position",
            "action",
            "funding_payment",
            "transaction_cost",
            "capital",
            "cumulative_funding",
            "cumulative_costs",
            "portfolio_return",
        ])?;

        let initial = self.summary.initial_capital;
        for s in &self.snapshots {
            wtr.write_record([
                s.timestamp.to_rfc3339(),
                s.funding_rate.to_string(),
                s.position.to_string(),
                s.action.to_string(),
                s.funding_payment.to_string(),
                s.transaction_cost.to_string(),
                s.capital.to_string(),
                s.cumulative_funding.to_string(),
                s.cumulative_costs.to_string(),
                s.portfolio_return(initial).round_dp(8).to_string(),
            ])?;
        }

        Ok(String::from_utf8(wtr.into_inner()?)?)
    }

    /// Completed trades (and the open one, if any) as CSV.
    pub fn trades_csv(&self) -> Result<String> {
        let mut wtr = csv::Writer::from_writer(vec![]);
        wtr.write_record([
            "open_timestamp",
            "close_timestamp",
            "direction",
            "entry_rate",
            "exit_rate",
            "position_size",
            "funding_collected",
            "costs_paid",
            "net_pnl",
            "periods_held",
            "duration_hours",
            "exit_reason",
        ])?;

        for t in self.trades.iter().chain(self.open_trade.iter()) {
            wtr.write_record([
                t.open_timestamp.to_rfc3339(),
                t.close_timestamp.map(|c| c.to_rfc3339()).unwrap_or_default(),
                t.direction.to_string(),
                t.entry_rate.to_string(),
                t.exit_rate.map(|r| r.to_string()).unwrap_or_default(),
                t.position_size.to_string(),
                t.funding_collected.to_string(),
                t.costs_paid.to_string(),
                t.net_pnl().to_string(),
                t.periods_held.to_string(),
                t.duration_hours().map(|h| h.to_string()).unwrap_or_default(),
                t.exit_reason.map(|r| r.to_string()).unwrap_or_default(),
            ])?;
        }

        Ok(String::from_utf8(wtr.into_inner()?)?)
    }

    /// Write `snapshots.csv`, `trades.csv` and `summary.json` into `dir`.
    pub fn write_to_dir<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        std::fs::write(dir.join("snapshots.csv"), self.snapshots_csv()?)?;
        std::fs::write(dir.join("trades.csv"), self.trades_csv()?)?;
        std::fs::write(
            dir.join("summary.json"),
            serde_json::to_string_pretty(&self.summary)?,
        )?;

        Ok(())
    }

    /// Get a summary string.
    pub fn summary(&self) -> String {
        let period = match (self.snapshots.first(), self.snapshots.last()) {
            (Some(first), Some(last)) => format!(
                "{} to {}",
                first.timestamp.format("%Y-%m-%d %H:%M"),
                last.timestamp.format("%Y-%m-%d %H:%M")
            ),
            _ => "no data".to_string(),
        };

        let mut s = format!(
            "{}\n\nBacktest Period: {}\nOpen At End: {}",
            self.summary.render(),
            period,
            self.open_trade
                .as_ref()
                .map(|t| t.direction.to_string())
                .unwrap_or_else(|| "none".to_string()),
        );

        if self.summary.liquidated {
            s.push_str(&format!(
                "\nLiquidated: shortfall ${:.2}",
                self.summary.liquidation_shortfall
            ));
        }
        s
    }
}

/// The funding-rate arbitrage simulator.
///
/// Holds only the validated configuration; every call to [`run`](Self::run)
/// starts from a fresh flat portfolio.
#[derive(Debug, Clone)]
pub struct FundingArbitrageSimulator {
    config: Config,
}

impl FundingArbitrageSimulator {
    /// Create a simulator, refusing invalid parameters up front.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Replay `observations` in order.
    ///
    /// Stopping early (e.g. `iter().take(n)`) is safe: state is consistent
    /// after every observation.
    pub fn run<'a, I>(&self, observations: I) -> Result<BacktestResult, BacktestError>
    where
        I: IntoIterator<Item = &'a FundingObservation>,
    {
        info!(
            "Starting backtest: capital=${} size={}% leverage={}x entry={} exit={}",
            self.config.capital.initial_capital,
            self.config.capital.position_size_pct * Decimal::ONE_HUNDRED,
            self.config.capital.leverage,
            self.config.signal.entry_threshold,
            self.config.signal.exit_threshold,
        );

        let mut state = RunState::new(&self.config);
        for (i, observation) in observations.into_iter().enumerate() {
            let step = state.step(i, observation)?;

            if i % 1000 == 0 {
                debug!(
                    "Progress: {} observations, capital ${:.2}",
                    i + 1,
                    step.capital
                );
            }
        }

        let result = state.finish();
        info!(
            "Backtest complete. Final capital: ${:.2} ({} closed trades)",
            result.summary.final_capital, result.summary.closed_trades
        );

        Ok(result)
    }
}

/// Per-run mutable state. Dropped at the end of the run.
struct RunState<'c> {
    config: &'c Config,
    portfolio: PortfolioState,
    open_trade: Option<TradeRecord>,
    trades: Vec<TradeRecord>,
    snapshots: Vec<PortfolioSnapshot>,
    rates: Vec<Decimal>,
    totals: RunTotals,
    last_timestamp: Option<DateTime<Utc>>,
}

impl<'c> RunState<'c> {
    fn new(config: &'c Config) -> Self {
        let initial = config.capital.initial_capital;
        Self {
            config,
            portfolio: PortfolioState::new(initial),
            open_trade: None,
            trades: Vec::new(),
            snapshots: Vec::new(),
            rates: Vec::new(),
            totals: RunTotals {
                initial_capital: initial,
                final_capital: initial,
                ..Default::default()
            },
            last_timestamp: None,
        }
    }

    /// Process a single observation.
    fn step(
        &mut self,
        index: usize,
        observation: &FundingObservation,
    ) -> Result<StepResult, BacktestError> {
        let timestamp = observation.timestamp;
        let rate = observation.funding_rate;

        if let Some(prev) = self.last_timestamp {
            if timestamp <= prev {
                return Err(BacktestError::MalformedObservation {
                    index,
                    reason: format!(
                        "timestamp {} does not follow {}",
                        timestamp.to_rfc3339(),
                        prev.to_rfc3339()
                    ),
                });
            }
        }
        self.last_timestamp = Some(timestamp);
        self.rates.push(rate);

        // 1. Funding on the hedge carried in from the previous period
        let funding_payment = self.accrue(index, rate)?;

        // 2-3. Decide and charge transition costs
        let mut transaction_cost = Decimal::ZERO;
        let mut action = if self.breaches_floor() {
            self.liquidate(timestamp, rate);
            TradeAction::Liquidate
        } else {
            match decide(self.portfolio.position, rate, &self.config.signal) {
                Decision::Open(_)
                    if self.totals.liquidated || self.portfolio.capital <= Decimal::ZERO =>
                {
                    TradeAction::None
                }
                Decision::Open(direction) => {
                    transaction_cost = self.open(index, timestamp, direction, rate)?;
                    TradeAction::Open
                }
                Decision::Close => {
                    transaction_cost = self.close(index, timestamp, rate)?;
                    TradeAction::Close
                }
                Decision::Hold => TradeAction::None,
            }
        };

        // A transition cost can push capital through the floor too
        if self.breaches_floor() {
            self.liquidate(timestamp, rate);
            action = TradeAction::Liquidate;
        }

        // 4. Snapshot
        self.snapshots.push(PortfolioSnapshot {
            timestamp,
            funding_rate: rate,
            position: self.portfolio.position,
            action,
            funding_payment,
            transaction_cost,
            capital: self.portfolio.capital,
            cumulative_funding: self.totals.total_funding,
            cumulative_costs: self.totals.total_costs,
        });

        Ok(StepResult {
            timestamp,
            action,
            funding_payment,
            transaction_cost,
            capital: self.portfolio.capital,
        })
    }

    /// Notional the open position is evaluated at right now.
    fn position_size(&self, index: usize) -> Result<Decimal, BacktestError> {
        match self.config.capital.sizing_basis {
            SizingBasis::EntryCapital => Ok(self.portfolio.entry_size),
            SizingBasis::CurrentCapital => self.size_from_capital(index),
        }
    }

    /// Committed, leveraged capital. Never negative: exhausted capital backs no notional.
    fn size_from_capital(&self, index: usize) -> Result<Decimal, BacktestError> {
        let capital = &self.config.capital;
        let size = checked_product(
            &[capital.position_size_pct, self.portfolio.capital, capital.leverage],
            index,
            "position size",
        )?;
        Ok(size.max(Decimal::ZERO))
    }

    fn side_cost(&self, size: Decimal, index: usize) -> Result<Decimal, BacktestError> {
        checked_product(
            &[size.max(Decimal::ZERO), self.config.costs.per_side()],
            index,
            "transaction cost",
        )
    }

    fn accrue(&mut self, index: usize, rate: Decimal) -> Result<Decimal, BacktestError> {
        if !self.portfolio.position.is_open() {
            return Ok(Decimal::ZERO);
        }

        let size = self.position_size(index)?;
        let payment = checked_product(
            &[size, rate, self.portfolio.position.direction_sign()],
            index,
            "funding payment",
        )?;
        self.portfolio.capital = checked_sum(self.portfolio.capital, payment, index, "capital")?;
        self.totals.total_funding =
            checked_sum(self.totals.total_funding, payment, index, "total funding")?;
        if let Some(trade) = self.open_trade.as_mut() {
            trade.accrue(payment);
        }

        Ok(payment)
    }

    fn breaches_floor(&self) -> bool {
        self.config.risk.capital_floor == CapitalFloor::Liquidate
            && !self.totals.liquidated
            && self.portfolio.capital <= Decimal::ZERO
    }

    fn charge(&mut self, cost: Decimal, index: usize) -> Result<(), BacktestError> {
        self.portfolio.capital = checked_sum(self.portfolio.capital, -cost, index, "capital")?;
        self.totals.total_costs = checked_sum(self.totals.total_costs, cost, index, "total costs")?;
        Ok(())
    }

    fn open(
        &mut self,
        index: usize,
        timestamp: DateTime<Utc>,
        direction: Position,
        rate: Decimal,
    ) -> Result<Decimal, BacktestError> {
        let size = self.size_from_capital(index)?;
        let cost = self.side_cost(size, index)?;

        self.charge(cost, index)?;
        self.totals.positions_opened += 1;
        self.portfolio.open(direction, rate, size);
        self.open_trade = Some(TradeRecord::open(timestamp, direction, rate, size, cost));

        debug!(
            "Opened {} at {} (rate {}), size ${:.2}, cost ${:.4}",
            direction,
            timestamp.format("%Y-%m-%d %H:%M"),
            rate,
            size,
            cost
        );

        Ok(cost)
    }

    fn close(
        &mut self,
        index: usize,
        timestamp: DateTime<Utc>,
        rate: Decimal,
    ) -> Result<Decimal, BacktestError> {
        let size = self.position_size(index)?;
        let cost = self.side_cost(size, index)?;

        self.charge(cost, index)?;
        self.finish_trade(timestamp, rate, cost, ExitReason::FundingDecay);

        Ok(cost)
    }

    /// Zero out capital, force-close any hedge and stop trading.
    fn liquidate(&mut self, timestamp: DateTime<Utc>, rate: Decimal) {
        let shortfall = -self.portfolio.capital;
        warn!(
            "Capital exhausted at {} (${:.2}); liquidating",
            timestamp.format("%Y-%m-%d %H:%M"),
            self.portfolio.capital
        );

        if self.portfolio.position.is_open() {
            self.finish_trade(timestamp, rate, Decimal::ZERO, ExitReason::Liquidation);
        }
        self.portfolio.capital = Decimal::ZERO;
        self.totals.liquidation_shortfall += shortfall;
        self.totals.liquidated = true;
    }

    fn finish_trade(
        &mut self,
        timestamp: DateTime<Utc>,
        rate: Decimal,
        cost: Decimal,
        reason: ExitReason,
    ) {
        if let Some(mut trade) = self.open_trade.take() {
            trade.close(timestamp, rate, cost, reason);
            debug!(
                "Closed {} at {} ({}), held {} periods, net ${:.4}",
                trade.direction,
                timestamp.format("%Y-%m-%d %H:%M"),
                reason,
                trade.periods_held,
                trade.net_pnl()
            );
            self.trades.push(trade);
        }
        self.portfolio.close();
    }

    fn finish(mut self) -> BacktestResult {
        self.totals.final_capital = self.portfolio.capital;

        let summary = RunSummary::calculate(
            &self.totals,
            &self.snapshots,
            &self.trades,
            &self.rates,
            &self.config.signal,
            self.config.report.days_per_year,
        );

        BacktestResult {
            config: self.config.clone(),
            summary,
            snapshots: self.snapshots,
            trades: self.trades,
            open_trade: self.open_trade,
        }
    }
}

/// Product of `terms` rounded to [`AMOUNT_DP`]; overflow is a [`BacktestError::Overflow`].
fn checked_product(
    terms: &[Decimal],
    index: usize,
    operation: &'static str,
) -> Result<Decimal, BacktestError> {
    terms
        .iter()
        .try_fold(Decimal::ONE, |acc, term| acc.checked_mul(*term))
        .map(|v| v.round_dp(AMOUNT_DP))
        .ok_or(BacktestError::Overflow { index, operation })
}

fn checked_sum(
    a: Decimal,
    b: Decimal,
    index: usize,
    operation: &'static str,
) -> Result<Decimal, BacktestError> {
    a.checked_add(b)
        .ok_or(BacktestError::Overflow { index, operation })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    // =========================================================================
    // Test Helpers
    // =========================================================================

    /// Round numbers: 10k capital, full size, no leverage, 0.05% per side.
    fn test_config() -> Config {
        let mut config = Config::default();
        config.capital.initial_capital = dec!(10000);
        config.capital.position_size_pct = dec!(1);
        config.capital.leverage = dec!(1);
        config
    }

    fn simulator(config: Config) -> FundingArbitrageSimulator {
        FundingArbitrageSimulator::new(config).unwrap()
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn series(rates: &[Decimal]) -> Vec<FundingObservation> {
        rates
            .iter()
            .enumerate()
            .map(|(i, r)| FundingObservation::new(base_time() + Duration::hours(8 * i as i64), *r))
            .collect()
    }

    // =========================================================================
    // Decision Tests
    // =========================================================================

    #[test]
    fn test_decide_entry() {
        let signal = test_config().signal;
        assert_eq!(
            decide(Position::Flat, dec!(0.0006), &signal),
            Decision::Open(Position::LongCollect)
        );
        assert_eq!(
            decide(Position::Flat, dec!(-0.0006), &signal),
            Decision::Open(Position::ShortCollect)
        );
        // Strictly greater than the threshold
        assert_eq!(decide(Position::Flat, dec!(0.0005), &signal), Decision::Hold);
        assert_eq!(decide(Position::Flat, dec!(-0.0005), &signal), Decision::Hold);
        // Flat with a tiny rate never "exits"
        assert_eq!(decide(Position::Flat, dec!(0), &signal), Decision::Hold);
    }

    #[test]
    fn test_decide_exit() {
        let signal = test_config().signal;
        assert_eq!(decide(Position::LongCollect, dec!(0.0001), &signal), Decision::Close);
        assert_eq!(decide(Position::ShortCollect, dec!(-0.0001), &signal), Decision::Close);
        // Exit band is strict
        assert_eq!(decide(Position::LongCollect, dec!(0.00025), &signal), Decision::Hold);
        // Open positions never re-enter or flip
        assert_eq!(decide(Position::LongCollect, dec!(0.001), &signal), Decision::Hold);
        assert_eq!(decide(Position::LongCollect, dec!(-0.001), &signal), Decision::Hold);
    }

    // =========================================================================
    // Construction Tests
    // =========================================================================

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = test_config();
        config.capital.initial_capital = dec!(-1);
        assert!(FundingArbitrageSimulator::new(config).is_err());

        let mut config = test_config();
        config.signal.exit_threshold = dec!(0.01);
        assert!(matches!(
            FundingArbitrageSimulator::new(config),
            Err(ConfigError::ThresholdOrder { .. })
        ));
    }

    // =========================================================================
    // Scenario Tests
    // =========================================================================

    #[test]
    fn test_single_observation_opens_long_without_accrual() {
        let sim = simulator(test_config());
        let result = sim.run(&series(&[dec!(0.0006)])).unwrap();

        let snap = &result.snapshots[0];
        assert_eq!(snap.position, Position::LongCollect);
        assert_eq!(snap.action, TradeAction::Open);
        assert_eq!(snap.funding_payment, Decimal::ZERO);
        // 10000 * 0.0005
        assert_eq!(snap.transaction_cost, dec!(5));
        assert_eq!(snap.capital, dec!(9995));

        assert!(result.trades.is_empty());
        let open = result.open_trade.as_ref().unwrap();
        assert_eq!(open.entry_rate, dec!(0.0006));
        assert_eq!(open.position_size, dec!(10000));
        assert_eq!(result.summary.positions_opened, 1);
        assert_eq!(result.summary.closed_trades, 0);
    }

    #[test]
    fn test_open_hold_close() {
        let sim = simulator(test_config());
        let result = sim
            .run(&series(&[dec!(0.0006), dec!(0.0003), dec!(0.0001)]))
            .unwrap();

        let positions: Vec<_> = result.snapshots.iter().map(|s| s.position).collect();
        assert_eq!(
            positions,
            vec![Position::LongCollect, Position::LongCollect, Position::Flat]
        );

        assert_eq!(result.trades.len(), 1);
        assert!(result.open_trade.is_none());

        let trade = &result.trades[0];
        assert_eq!(trade.open_timestamp, base_time());
        assert_eq!(trade.close_timestamp, Some(base_time() + Duration::hours(16)));
        assert_eq!(trade.exit_reason, Some(ExitReason::FundingDecay));
        assert_eq!(trade.periods_held, 2);
        // 10000 * (0.0003 + 0.0001)
        assert_eq!(trade.funding_collected, dec!(4));
        assert_eq!(trade.costs_paid, dec!(10));
        assert!(!trade.is_profitable());

        assert_eq!(result.summary.final_capital, dec!(9994));
        assert_eq!(result.summary.win_rate, Some(Decimal::ZERO));
    }

    #[test]
    fn test_short_collects_negative_funding() {
        let sim = simulator(test_config());
        let result = sim.run(&series(&[dec!(-0.0008), dec!(-0.0007)])).unwrap();

        assert_eq!(result.snapshots[0].position, Position::ShortCollect);
        // 10000 * -0.0007 * -1
        assert_eq!(result.snapshots[1].funding_payment, dec!(7));
        assert_eq!(result.snapshots[1].action, TradeAction::None);
    }

    #[test]
    fn test_adverse_funding_is_a_cost() {
        let sim = simulator(test_config());
        let result = sim.run(&series(&[dec!(0.0006), dec!(-0.0004)])).unwrap();

        // Long held through a negative rate that is outside the exit band
        assert_eq!(result.snapshots[1].funding_payment, dec!(-4));
        assert_eq!(result.snapshots[1].position, Position::LongCollect);
    }

    #[test]
    fn test_empty_input() {
        let sim = simulator(test_config());
        let result = sim.run(&Vec::new()).unwrap();

        assert!(result.snapshots.is_empty());
        assert_eq!(result.summary.closed_trades, 0);
        assert_eq!(result.summary.total_return, Decimal::ZERO);
        assert_eq!(result.summary.final_capital, dec!(10000));
        assert_eq!(result.summary.annualized_return, None);
        assert!(result.summary.funding_stats.is_none());
    }

    #[test]
    fn test_all_zero_rates() {
        let sim = simulator(test_config());
        let result = sim.run(&series(&[Decimal::ZERO; 20])).unwrap();

        assert_eq!(result.summary.positions_opened, 0);
        assert_eq!(result.summary.final_capital, dec!(10000));
        assert_eq!(result.summary.total_return, Decimal::ZERO);
        assert_eq!(result.summary.annualized_return, Some(Decimal::ZERO));
        assert_eq!(result.summary.funding_stats.as_ref().unwrap().count, 20);
    }

    #[test]
    fn test_profitable_trade_counts_as_win() {
        let sim = simulator(test_config());
        let result = sim
            .run(&series(&[
                dec!(0.001),
                dec!(0.001),
                dec!(0.001),
                dec!(0.0001),
            ]))
            .unwrap();

        // Funding: 10 + 10 + 1 = 21, costs 10
        let trade = &result.trades[0];
        assert_eq!(trade.funding_collected, dec!(21));
        assert_eq!(trade.net_pnl(), dec!(11));
        assert_eq!(result.summary.win_rate, Some(Decimal::ONE));
        assert_eq!(result.summary.final_capital, dec!(10011));
        assert_eq!(result.summary.cost_ratio, Some(dec!(10) / dec!(21)));
        // 21 over 4 periods, 3 of which paid
        assert_eq!(result.summary.avg_funding_per_period, Some(dec!(5.25)));
        assert_eq!(result.summary.funding_consistency, Some(dec!(0.75)));
    }

    #[test]
    fn test_reopens_after_close() {
        let sim = simulator(test_config());
        let result = sim
            .run(&series(&[
                dec!(0.0006),
                dec!(0),
                dec!(-0.0009),
                dec!(-0.0006),
            ]))
            .unwrap();

        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.summary.positions_opened, 2);
        assert_eq!(
            result.open_trade.as_ref().map(|t| t.direction),
            Some(Position::ShortCollect)
        );
    }

    // =========================================================================
    // Sizing Tests
    // =========================================================================

    #[test]
    fn test_leverage_and_size_scale_notional() {
        let mut config = test_config();
        config.capital.position_size_pct = dec!(0.9);
        config.capital.leverage = dec!(3);
        let sim = simulator(config);

        let result = sim.run(&series(&[dec!(0.0006), dec!(0.0006)])).unwrap();
        let open = result.open_trade.unwrap();

        assert_eq!(open.position_size, dec!(27000));
        assert_eq!(open.costs_paid, dec!(13.5));
        assert_eq!(result.snapshots[1].funding_payment, dec!(16.2));
    }

    #[test]
    fn test_current_capital_sizing_compounds() {
        let mut config = test_config();
        config.capital.sizing_basis = SizingBasis::CurrentCapital;
        let sim = simulator(config);

        let result = sim
            .run(&series(&[dec!(0.001), dec!(0.001), dec!(0.001)]))
            .unwrap();

        // After entry cost capital is 9995, so the first accrual is 9.995
        assert_eq!(result.snapshots[1].funding_payment, dec!(9.995));
        // Then 10004.995 * 0.001
        assert_eq!(result.snapshots[2].funding_payment, dec!(10.004995));
        // Trade record keeps the notional at entry
        assert_eq!(result.open_trade.unwrap().position_size, dec!(10000));
    }

    #[test]
    fn test_entry_capital_sizing_is_frozen() {
        let sim = simulator(test_config());
        let result = sim
            .run(&series(&[dec!(0.001), dec!(0.001), dec!(0.001)]))
            .unwrap();

        assert_eq!(result.snapshots[1].funding_payment, dec!(10));
        assert_eq!(result.snapshots[2].funding_payment, dec!(10));
    }

    // =========================================================================
    // Capital Floor Tests
    // =========================================================================

    fn ruinous_rates() -> Vec<Decimal> {
        // Long opened, then funding swings hard against it
        vec![dec!(0.0006), dec!(-0.6), dec!(-0.6), dec!(0.0009)]
    }

    #[test]
    fn test_unbounded_floor_allows_negative_capital() {
        let mut config = test_config();
        config.capital.leverage = dec!(2);
        let sim = simulator(config);

        let result = sim.run(&series(&ruinous_rates())).unwrap();

        assert!(result.summary.final_capital < Decimal::ZERO);
        assert!(!result.summary.liquidated);
        assert_eq!(result.summary.liquidation_shortfall, Decimal::ZERO);
    }

    #[test]
    fn test_liquidating_floor_clamps_and_stops() {
        let mut config = test_config();
        config.capital.leverage = dec!(2);
        config.risk.capital_floor = CapitalFloor::Liquidate;
        let sim = simulator(config);

        let result = sim.run(&series(&ruinous_rates())).unwrap();
        let summary = &result.summary;

        assert!(summary.liquidated);
        assert_eq!(summary.final_capital, Decimal::ZERO);
        assert_eq!(result.snapshots[1].action, TradeAction::Liquidate);
        assert_eq!(result.trades[0].exit_reason, Some(ExitReason::Liquidation));
        // No re-entry at 0.0009 after liquidation
        assert_eq!(summary.positions_opened, 1);
        assert!(result.open_trade.is_none());

        assert_eq!(
            summary.final_capital,
            summary.initial_capital + summary.total_funding_collected
                - summary.total_costs_paid
                + summary.liquidation_shortfall
        );
    }

    #[test]
    fn test_exit_cost_through_floor_liquidates() {
        let mut config = test_config();
        config.capital.leverage = dec!(2);
        config.risk.capital_floor = CapitalFloor::Liquidate;
        let sim = simulator(config);

        // Entry leaves 9990; -9985 of funding leaves 5; +2 then a 10 exit cost
        let result = sim
            .run(&series(&[dec!(0.0006), dec!(-0.49925), dec!(0.0001)]))
            .unwrap();
        let summary = &result.summary;

        assert_eq!(result.snapshots[1].capital, dec!(5));
        assert_eq!(result.snapshots[2].action, TradeAction::Liquidate);
        assert_eq!(result.snapshots[2].transaction_cost, dec!(10));
        assert_eq!(result.snapshots[2].capital, Decimal::ZERO);
        assert_eq!(result.trades[0].exit_reason, Some(ExitReason::FundingDecay));

        assert!(summary.liquidated);
        assert_eq!(summary.final_capital, Decimal::ZERO);
        assert_eq!(summary.liquidation_shortfall, dec!(3));
        assert_eq!(
            summary.final_capital,
            summary.initial_capital + summary.total_funding_collected
                - summary.total_costs_paid
                + summary.liquidation_shortfall
        );
    }

    #[test]
    fn test_negative_capital_backs_no_notional() {
        let mut config = test_config();
        config.capital.leverage = dec!(2);
        config.capital.sizing_basis = SizingBasis::CurrentCapital;
        let sim = simulator(config);

        let result = sim
            .run(&series(&[dec!(0.0006), dec!(-0.6), dec!(0.0001), dec!(0.001)]))
            .unwrap();
        let summary = &result.summary;

        // 19980 * -0.6 leaves 9990 - 11988
        assert_eq!(result.snapshots[1].capital, dec!(-1998));

        // Underwater: no funding, a free close and no re-entry
        assert_eq!(result.snapshots[2].funding_payment, Decimal::ZERO);
        assert_eq!(result.snapshots[2].action, TradeAction::Close);
        assert_eq!(result.snapshots[2].transaction_cost, Decimal::ZERO);
        assert_eq!(result.snapshots[3].action, TradeAction::None);
        assert_eq!(result.snapshots[3].position, Position::Flat);

        assert!(result
            .snapshots
            .iter()
            .all(|s| s.transaction_cost >= Decimal::ZERO));
        assert_eq!(summary.total_costs_paid, dec!(10));
        assert_eq!(summary.positions_opened, 1);
        assert_eq!(summary.final_capital, dec!(-1998));
        assert!(!summary.liquidated);
    }

    #[test]
    fn test_compounding_overflow_is_an_error() {
        let mut config = test_config();
        config.capital.leverage = dec!(100);
        config.capital.sizing_basis = SizingBasis::CurrentCapital;
        let sim = simulator(config);

        // Capital doubles every period until Decimal runs out of range
        let result = sim.run(&series(&[dec!(0.01); 120]));

        assert!(matches!(result, Err(BacktestError::Overflow { .. })));
    }

    // =========================================================================
    // Ordering / Accounting Tests
    // =========================================================================

    #[test]
    fn test_rejects_non_monotonic_timestamps() {
        let sim = simulator(test_config());
        let mut obs = series(&[dec!(0.0001), dec!(0.0002), dec!(0.0003)]);
        obs[2].timestamp = obs[0].timestamp;

        let err = sim.run(&obs).unwrap_err();
        assert!(matches!(
            err,
            BacktestError::MalformedObservation { index: 2, .. }
        ));
    }

    #[test]
    fn test_accounting_closure() {
        let mut config = test_config();
        config.capital.position_size_pct = dec!(0.9);
        config.capital.leverage = dec!(3);
        config.capital.sizing_basis = SizingBasis::CurrentCapital;
        let sim = simulator(config);

        let rates = [
            dec!(0.0007),
            dec!(0.00031),
            dec!(-0.00042),
            dec!(0.0002),
            dec!(-0.0011),
            dec!(-0.00033),
            dec!(0.00001),
        ];
        let result = sim.run(&series(&rates)).unwrap();
        let summary = &result.summary;

        assert_eq!(
            summary.final_capital,
            summary.initial_capital + summary.total_funding_collected - summary.total_costs_paid
        );
        assert_eq!(
            result.snapshots.last().unwrap().capital,
            summary.final_capital
        );
    }

    #[test]
    fn test_runs_are_independent() {
        let sim = simulator(test_config());
        let obs = series(&[dec!(0.0006), dec!(0.0004), dec!(0.0001)]);

        let first = sim.run(&obs).unwrap();
        let second = sim.run(&obs).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_early_stop() {
        let sim = simulator(test_config());
        let obs = series(&[dec!(0.0006), dec!(0.0004), dec!(0.0001)]);

        let result = sim.run(obs.iter().take(2)).unwrap();
        assert_eq!(result.snapshots.len(), 2);
        assert!(result.open_trade.is_some());
    }

    // =========================================================================
    // Export Tests
    // =========================================================================

    #[test]
    fn test_csv_exports() {
        let sim = simulator(test_config());
        let result = sim
            .run(&series(&[dec!(0.0006), dec!(0.0003), dec!(0.0001), dec!(0.0007)]))
            .unwrap();

        let snapshots = result.snapshots_csv().unwrap();
        assert_eq!(snapshots.lines().count(), 5);
        assert!(snapshots.starts_with("timestamp,funding_rate,position"));
        assert!(snapshots.contains("LONG_COLLECT"));

        let trades = result.trades_csv().unwrap();
        // Header + closed trade + open trade
        assert_eq!(trades.lines().count(), 3);
        assert!(trades.contains("funding_decay"));
    }

    #[test]
    fn test_summary_text() {
        let sim = simulator(test_config());
        let result = sim.run(&series(&[dec!(0.0006)])).unwrap();

        let text = result.summary();
        assert!(text.contains("BACKTEST RESULTS"));
        assert!(text.contains("Open At End: LONG_COLLECT"));
    }
}
