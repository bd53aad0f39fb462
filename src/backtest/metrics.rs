//! Performance metrics calculation for backtesting.
//!
//! Provides run-level returns, trade statistics, drawdown and Sharpe analysis,
//! and descriptive statistics over the raw funding-rate series.

use crate::backtest::portfolio::{PortfolioSnapshot, TradeRecord};
use crate::config::SignalConfig;
use crate::utils::decimal::{checked_ratio, from_f64, to_basis_points, to_f64, to_pct};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Descriptive statistics over a funding-rate series.
///
/// Computed over every observation, independent of trading activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingStats {
    pub count: usize,
    pub mean: Decimal,
    /// Sample standard deviation (n - 1); zero for a single value
    pub std_dev: Decimal,
    pub min: Decimal,
    pub max: Decimal,
    pub positive_count: usize,
    /// Rates strictly above +entry_threshold
    pub above_entry_count: usize,
    /// Rates strictly below -entry_threshold
    pub below_neg_entry_count: usize,
    /// Rates with |rate| strictly below exit_threshold
    pub within_exit_count: usize,
    /// Mean of the rates above +entry_threshold
    pub high_positive_mean: Option<Decimal>,
    /// Mean of the rates below -entry_threshold
    pub high_negative_mean: Option<Decimal>,
}

impl FundingStats {
    /// Returns `None` for an empty series.
    pub fn calculate(rates: &[Decimal], signal: &SignalConfig) -> Option<Self> {
        let first = *rates.first()?;
        let count = rates.len();
        let n = Decimal::from(count);

        let (sum, min, max) = rates.iter().fold(
            (Decimal::ZERO, first, first),
            |(sum, min, max), &r| (sum + r, min.min(r), max.max(r)),
        );
        let mean = sum / n;

        let std_dev = if count > 1 {
            let mean_f64 = to_f64(mean);
            let variance = rates
                .iter()
                .map(|r| (to_f64(*r) - mean_f64).powi(2))
                .sum::<f64>()
                / (count - 1) as f64;
            from_f64(variance.sqrt()).unwrap_or(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };

        let entry = signal.entry_threshold;
        let high_positive: Vec<Decimal> = rates.iter().copied().filter(|r| *r > entry).collect();
        let high_negative: Vec<Decimal> = rates.iter().copied().filter(|r| *r < -entry).collect();

        Some(Self {
            count,
            mean,
            std_dev,
            min,
            max,
            positive_count: rates.iter().filter(|r| **r > Decimal::ZERO).count(),
            above_entry_count: high_positive.len(),
            below_neg_entry_count: high_negative.len(),
            within_exit_count: rates
                .iter()
                .filter(|r| r.abs() < signal.exit_threshold)
                .count(),
            high_positive_mean: mean_of(&high_positive),
            high_negative_mean: mean_of(&high_negative),
        })
    }

    /// Periods where |rate| exceeds the entry threshold.
    pub fn tradeable_count(&self) -> usize {
        self.above_entry_count + self.below_neg_entry_count
    }

    /// Share of periods (in percent) that would qualify for entry.
    pub fn tradeable_pct(&self) -> Decimal {
        share_pct(self.tradeable_count(), self.count)
    }

    /// Format the funding opportunity analysis.
    pub fn render(&self, signal: &SignalConfig) -> String {
        let mut s = format!(
            r#"═══════════════════════════════════════════════
FUNDING RATE OPPORTUNITIES ({} periods)
═══════════════════════════════════════════════
  Mean:              {:.4}% ({:.2} bp)
  Std Dev:           {:.4}%
  Min:               {:.4}%
  Max:               {:.4}%
  Positive Rates:    {} ({:.1}%)
  Above +{:.4}%:   {} ({:.1}%)
  Below -{:.4}%:   {} ({:.1}%)
  Tradeable:         {} ({:.1}%)
  Below Exit Band:   {} ({:.1}%)"#,
            self.count,
            to_pct(self.mean),
            to_basis_points(self.mean),
            to_pct(self.std_dev),
            to_pct(self.min),
            to_pct(self.max),
            self.positive_count,
            share_pct(self.positive_count, self.count),
            to_pct(signal.entry_threshold),
            self.above_entry_count,
            share_pct(self.above_entry_count, self.count),
            to_pct(signal.entry_threshold),
            self.below_neg_entry_count,
            share_pct(self.below_neg_entry_count, self.count),
            self.tradeable_count(),
            self.tradeable_pct(),
            self.within_exit_count,
            share_pct(self.within_exit_count, self.count),
        );

        if let Some(mean) = self.high_positive_mean {
            s.push_str(&format!("\n  High Positive Mean: {:.4}%", to_pct(mean)));
        }
        if let Some(mean) = self.high_negative_mean {
            s.push_str(&format!("\n  High Negative Mean: {:.4}%", to_pct(mean)));
        }
        s.push_str("\n═══════════════════════════════════════════════");
        s
    }
}

/// Drawdown and volatility of the capital curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RiskMetrics {
    /// Maximum drawdown as a fraction of the running peak
    pub max_drawdown: Decimal,
    /// Duration of maximum drawdown in hours
    pub max_drawdown_duration_hours: i64,
    /// Annualized volatility of per-period returns
    pub volatility: Decimal,
    /// Sharpe ratio (assuming 0 risk-free rate)
    pub sharpe_ratio: Decimal,
}

impl RiskMetrics {
    /// Calculate from the snapshot series; the curve starts at `initial_capital`.
    pub fn calculate(
        snapshots: &[PortfolioSnapshot],
        initial_capital: Decimal,
        days_per_year: Decimal,
    ) -> Self {
        if snapshots.is_empty() {
            return Self::default();
        }

        let (max_drawdown, max_drawdown_duration_hours) =
            calculate_max_drawdown(snapshots, initial_capital);

        let duration_years = elapsed_days(snapshots) / to_f64(days_per_year);
        let returns = calculate_period_returns(snapshots, initial_capital);
        let (volatility, sharpe_ratio) = calculate_volatility_and_sharpe(&returns, duration_years);

        Self {
            max_drawdown,
            max_drawdown_duration_hours,
            volatility,
            sharpe_ratio,
        }
    }
}

/// Aggregate result of a backtest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    // Returns
    pub initial_capital: Decimal,
    pub final_capital: Decimal,
    /// (final - initial) / initial
    pub total_return: Decimal,
    /// Compounded over the observed span; `None` for a zero span
    pub annualized_return: Option<Decimal>,

    // Funding and costs
    pub total_funding_collected: Decimal,
    pub total_costs_paid: Decimal,
    pub net_profit: Decimal,
    /// Funding collected relative to initial capital
    pub funding_yield: Decimal,
    /// Costs relative to funding; `None` unless funding was collected
    pub cost_ratio: Option<Decimal>,
    /// Negative capital absorbed by a liquidating capital floor
    pub liquidation_shortfall: Decimal,
    pub liquidated: bool,

    // Activity
    pub observations: usize,
    pub positions_opened: u64,
    pub closed_trades: usize,
    pub profitable_trades: usize,
    /// Profitable / closed; `None` when no trade closed
    pub win_rate: Option<Decimal>,
    pub avg_periods_per_trade: Option<Decimal>,
    pub avg_profit_per_trade: Option<Decimal>,
    pub periods_in_position: usize,
    pub profitable_funding_periods: usize,
    /// Funding collected divided by every observed period
    pub avg_funding_per_period: Option<Decimal>,
    /// Share of observed periods with a positive funding payment
    pub funding_consistency: Option<Decimal>,

    // Time
    pub time_span_days: f64,

    pub risk: RiskMetrics,
    /// `None` for an empty observation sequence
    pub funding_stats: Option<FundingStats>,
}

/// Run totals accumulated by the engine.
#[derive(Debug, Clone, Default)]
pub(crate) struct RunTotals {
    pub initial_capital: Decimal,
    pub final_capital: Decimal,
    pub total_funding: Decimal,
    pub total_costs: Decimal,
    pub liquidation_shortfall: Decimal,
    pub liquidated: bool,
    pub positions_opened: u64,
}

impl RunSummary {
    pub(crate) fn calculate(
        totals: &RunTotals,
        snapshots: &[PortfolioSnapshot],
        trades: &[TradeRecord],
        rates: &[Decimal],
        signal: &SignalConfig,
        days_per_year: Decimal,
    ) -> Self {
        let initial = totals.initial_capital;
        let total_return =
            checked_ratio(totals.final_capital - initial, initial).unwrap_or(Decimal::ZERO);

        let time_span_days = elapsed_days(snapshots);
        let annualized_return = annualize(total_return, time_span_days, days_per_year);

        let closed_trades = trades.len();
        let profitable_trades = trades.iter().filter(|t| t.is_profitable()).count();
        let closed = Decimal::from(closed_trades);
        let win_rate = checked_ratio(Decimal::from(profitable_trades), closed);
        let avg_periods_per_trade = checked_ratio(
            trades.iter().map(|t| Decimal::from(t.periods_held)).sum(),
            closed,
        );
        let avg_profit_per_trade =
            checked_ratio(trades.iter().map(TradeRecord::net_pnl).sum(), closed);

        let period_count = Decimal::from(snapshots.len());
        let profitable_funding_periods = snapshots
            .iter()
            .filter(|s| s.funding_payment > Decimal::ZERO)
            .count();

        let cost_ratio = if totals.total_funding > Decimal::ZERO {
            checked_ratio(totals.total_costs, totals.total_funding)
        } else {
            None
        };

        Self {
            initial_capital: initial,
            final_capital: totals.final_capital,
            total_return,
            annualized_return,
            total_funding_collected: totals.total_funding,
            total_costs_paid: totals.total_costs,
            net_profit: totals.total_funding - totals.total_costs,
            funding_yield: checked_ratio(totals.total_funding, initial).unwrap_or(Decimal::ZERO),
            cost_ratio,
            liquidation_shortfall: totals.liquidation_shortfall,
            liquidated: totals.liquidated,
            observations: snapshots.len(),
            positions_opened: totals.positions_opened,
            closed_trades,
            profitable_trades,
            win_rate,
            avg_periods_per_trade,
            avg_profit_per_trade,
            periods_in_position: snapshots.iter().filter(|s| s.position.is_open()).count(),
            profitable_funding_periods,
            avg_funding_per_period: checked_ratio(totals.total_funding, period_count),
            funding_consistency: checked_ratio(
                Decimal::from(profitable_funding_periods),
                period_count,
            ),
            time_span_days,
            risk: RiskMetrics::calculate(snapshots, initial, days_per_year),
            funding_stats: FundingStats::calculate(rates, signal),
        }
    }

    /// Format the summary as a report block.
    pub fn render(&self) -> String {
        format!(
            r#"═══════════════════════════════════════════════
BACKTEST RESULTS ({:.1} days, {} periods)
═══════════════════════════════════════════════
RETURNS
  Initial Capital:   ${:.2}
  Final Capital:     ${:.2}
  Total Return:      {:.4}%
  Annualized:        {}

FUNDING
  Funding Collected: ${:.2}
  Costs Paid:        ${:.2}
  Net Profit:        ${:.2}
  Funding Yield:     {:.4}%
  Cost Ratio:        {}
  Avg Funding/Per.: {}
  Consistency:       {}

RISK
  Max Drawdown:      {:.2}%
  Volatility:        {:.2}%
  Sharpe Ratio:      {:.3}

ACTIVITY
  Positions Opened:  {}
  Closed Trades:     {}
  Profitable Trades: {}
  Win Rate:          {}
  Avg Periods/Trade: {}
  Avg Profit/Trade:  {}
  Periods in Pos.:   {}
═══════════════════════════════════════════════"#,
            self.time_span_days,
            self.observations,
            self.initial_capital,
            self.final_capital,
            to_pct(self.total_return),
            fmt_pct(self.annualized_return, 4),
            self.total_funding_collected,
            self.total_costs_paid,
            self.net_profit,
            to_pct(self.funding_yield),
            fmt_pct(self.cost_ratio, 2),
            fmt_opt(self.avg_funding_per_period.map(|v| format!("${:.4}", v))),
            fmt_pct(self.funding_consistency, 2),
            to_pct(self.risk.max_drawdown),
            to_pct(self.risk.volatility),
            self.risk.sharpe_ratio,
            self.positions_opened,
            self.closed_trades,
            self.profitable_trades,
            fmt_pct(self.win_rate, 2),
            fmt_opt(self.avg_periods_per_trade.map(|v| format!("{:.1}", v))),
            fmt_opt(self.avg_profit_per_trade.map(|v| format!("${:.2}", v))),
            self.periods_in_position,
        )
    }
}

fn fmt_pct(value: Option<Decimal>, dp: usize) -> String {
    fmt_opt(value.map(|v| format!("{:.*}%", dp, to_pct(v))))
}

fn fmt_opt(value: Option<String>) -> String {
    value.unwrap_or_else(|| "N/A".to_string())
}

fn mean_of(values: &[Decimal]) -> Option<Decimal> {
    checked_ratio(values.iter().copied().sum(), Decimal::from(values.len()))
}

fn share_pct(part: usize, total: usize) -> Decimal {
    checked_ratio(Decimal::from(part), Decimal::from(total))
        .map(to_pct)
        .unwrap_or(Decimal::ZERO)
}

/// Wall-clock span between the first and last snapshot, in days.
fn elapsed_days(snapshots: &[PortfolioSnapshot]) -> f64 {
    match (snapshots.first(), snapshots.last()) {
        (Some(first), Some(last)) => {
            (last.timestamp - first.timestamp).num_seconds() as f64 / 86400.0
        }
        _ => 0.0,
    }
}

/// `(1 + r)^(days_per_year / days) - 1`, undefined for a zero span or a
/// wiped-out portfolio.
fn annualize(total_return: Decimal, days: f64, days_per_year: Decimal) -> Option<Decimal> {
    if days <= 0.0 {
        return None;
    }
    let base = 1.0 + to_f64(total_return);
    if base <= 0.0 {
        return None;
    }
    from_f64(base.powf(to_f64(days_per_year) / days) - 1.0)
}

/// Per-period returns; the first period is measured against initial capital.
fn calculate_period_returns(
    snapshots: &[PortfolioSnapshot],
    initial_capital: Decimal,
) -> Vec<f64> {
    let mut prev = initial_capital;
    snapshots
        .iter()
        .map(|s| {
            let r = if prev > Decimal::ZERO {
                to_f64((s.capital - prev) / prev)
            } else {
                0.0
            };
            prev = s.capital;
            r
        })
        .collect()
}

/// Calculate maximum drawdown and its duration.
fn calculate_max_drawdown(
    snapshots: &[PortfolioSnapshot],
    initial_capital: Decimal,
) -> (Decimal, i64) {
    let mut peak = initial_capital;
    let mut peak_time: Option<DateTime<Utc>> = None;
    let mut max_dd = Decimal::ZERO;
    let mut max_dd_duration: i64 = 0;

    for point in snapshots {
        if point.capital >= peak {
            peak = point.capital;
            peak_time = Some(point.timestamp);
            continue;
        }
        if peak <= Decimal::ZERO {
            continue;
        }

        let dd = (peak - point.capital) / peak;
        if dd > max_dd {
            max_dd = dd;
        }

        let start = peak_time.unwrap_or(snapshots[0].timestamp);
        let duration = (point.timestamp - start).num_hours();
        if duration > max_dd_duration {
            max_dd_duration = duration;
        }
    }

    (max_dd, max_dd_duration)
}

/// Annualized volatility and Sharpe ratio from per-period returns.
fn calculate_volatility_and_sharpe(returns: &[f64], duration_years: f64) -> (Decimal, Decimal) {
    if returns.len() < 2 || duration_years <= 0.0 {
        return (Decimal::ZERO, Decimal::ZERO);
    }

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();

    let periods_per_year = n / duration_years;
    let annualized_std = std_dev * periods_per_year.sqrt();
    let volatility = from_f64(annualized_std).unwrap_or(Decimal::ZERO);

    if std_dev < 1e-12 {
        return (volatility, Decimal::ZERO);
    }

    let sharpe = (mean * periods_per_year) / annualized_std;
    (volatility, from_f64(sharpe).unwrap_or(Decimal::ZERO))
}
