//! Parameter sweep runner for backtesting optimization.
//!
//! Allows testing multiple threshold/sizing combinations in parallel.

use crate::backtest::{BacktestResult, DataLoader, FundingArbitrageSimulator, FundingObservation};
use crate::config::Config;
use anyhow::Result;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Defines the parameter space to explore during optimization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpace {
    // Signal parameters
    pub entry_threshold: Vec<Decimal>,
    /// Exit threshold as a fraction of the entry threshold
    pub exit_ratio: Vec<Decimal>,

    // Sizing parameters
    pub leverage: Vec<Decimal>,
    pub position_size_pct: Vec<Decimal>,
}

impl Default for ParameterSpace {
    fn default() -> Self {
        Self {
            entry_threshold: vec![
                dec!(0.0001),
                dec!(0.0002),
                dec!(0.0003),
                dec!(0.0005),
                dec!(0.0008),
            ],
            exit_ratio: vec![dec!(0.25), dec!(0.5), dec!(0.75)],
            leverage: vec![dec!(1), dec!(2), dec!(3)],
            position_size_pct: vec![dec!(0.5), dec!(0.9)],
        }
    }
}

impl ParameterSpace {
    /// Create a minimal parameter space for quick testing.
    pub fn minimal() -> Self {
        Self {
            entry_threshold: vec![dec!(0.0003), dec!(0.0005)],
            exit_ratio: vec![dec!(0.5)],
            leverage: vec![dec!(3)],
            position_size_pct: vec![dec!(0.9)],
        }
    }

    /// Count total number of combinations.
    pub fn combination_count(&self) -> usize {
        self.entry_threshold.len()
            * self.exit_ratio.len()
            * self.leverage.len()
            * self.position_size_pct.len()
    }

    /// Generate all config combinations, valid or not.
    pub fn generate_configs(&self, base_config: &Config) -> Vec<Config> {
        let mut configs = Vec::with_capacity(self.combination_count());

        for &entry in &self.entry_threshold {
            for &exit_ratio in &self.exit_ratio {
                for &leverage in &self.leverage {
                    for &position_size_pct in &self.position_size_pct {
                        let mut config = base_config.clone().with_thresholds(entry, exit_ratio);
                        config.capital.leverage = leverage;
                        config.capital.position_size_pct = position_size_pct;
                        configs.push(config);
                    }
                }
            }
        }

        configs
    }

    /// Describe a config's parameter values.
    pub fn describe_config(config: &Config) -> String {
        format!(
            "entry>{:.4}% exit<{:.4}% lev={}x size={:.0}%",
            config.signal.entry_threshold * dec!(100),
            config.signal.exit_threshold * dec!(100),
            config.capital.leverage.normalize(),
            config.capital.position_size_pct * dec!(100),
        )
    }
}

/// Results from a parameter sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepResults {
    /// All completed runs, in combination order
    pub runs: Vec<BacktestResult>,

    /// Best run by Sharpe ratio
    pub best_by_sharpe: Option<usize>,

    /// Best run by total return
    pub best_by_return: Option<usize>,

    /// Total combinations generated
    pub total_combinations: usize,

    /// Combinations refused by config validation
    pub skipped_combinations: usize,

    /// Successful runs
    pub successful_runs: usize,

    /// Failed runs
    pub failed_runs: usize,
}

impl SweepResults {
    /// Get the best result by Sharpe ratio.
    pub fn best_sharpe(&self) -> Option<&BacktestResult> {
        self.best_by_sharpe.map(|i| &self.runs[i])
    }

    /// Get the best result by total return.
    pub fn best_return(&self) -> Option<&BacktestResult> {
        self.best_by_return.map(|i| &self.runs[i])
    }

    /// Results as CSV, one row per run.
    pub fn to_csv(&self) -> Result<String> {
        let mut wtr = csv::Writer::from_writer(vec![]);
        wtr.write_record([
            "entry_threshold",
            "exit_threshold",
            "leverage",
            "position_size_pct",
            "total_return",
            "annualized_return",
            "sharpe_ratio",
            "max_drawdown",
            "total_funding",
            "total_costs",
            "closed_trades",
            "win_rate",
        ])?;

        for run in &self.runs {
            let summary = &run.summary;
            wtr.write_record([
                run.config.signal.entry_threshold.to_string(),
                run.config.signal.exit_threshold.to_string(),
                run.config.capital.leverage.to_string(),
                run.config.capital.position_size_pct.to_string(),
                summary.total_return.round_dp(8).to_string(),
                summary
                    .annualized_return
                    .map(|r| r.round_dp(8).to_string())
                    .unwrap_or_default(),
                summary.risk.sharpe_ratio.round_dp(4).to_string(),
                summary.risk.max_drawdown.round_dp(8).to_string(),
                summary.total_funding_collected.round_dp(4).to_string(),
                summary.total_costs_paid.round_dp(4).to_string(),
                summary.closed_trades.to_string(),
                summary
                    .win_rate
                    .map(|r| r.round_dp(4).to_string())
                    .unwrap_or_default(),
            ])?;
        }

        Ok(String::from_utf8(wtr.into_inner()?)?)
    }

    /// Generate a summary comparison table.
    pub fn summary(&self) -> String {
        let mut s = String::new();

        s.push_str("═══════════════════════════════════════════════════════════════\n");
        s.push_str("PARAMETER SWEEP RESULTS\n");
        s.push_str("═══════════════════════════════════════════════════════════════\n");
        s.push_str(&format!(
            "Total: {} | Successful: {} | Skipped: {} | Failed: {}\n\n",
            self.total_combinations,
            self.successful_runs,
            self.skipped_combinations,
            self.failed_runs
        ));

        if let Some(run) = self.best_sharpe() {
            s.push_str("BEST BY SHARPE RATIO:\n");
            s.push_str(&format!("  Config: {}\n", ParameterSpace::describe_config(&run.config)));
            s.push_str(&format!(
                "  Sharpe: {:.3} | Return: {:.2}% | MaxDD: {:.2}%\n\n",
                run.summary.risk.sharpe_ratio,
                run.summary.total_return * dec!(100),
                run.summary.risk.max_drawdown * dec!(100)
            ));
        }

        if let Some(run) = self.best_return() {
            s.push_str("BEST BY RETURN:\n");
            s.push_str(&format!("  Config: {}\n", ParameterSpace::describe_config(&run.config)));
            s.push_str(&format!(
                "  Return: {:.2}% | Sharpe: {:.3} | Trades: {}\n",
                run.summary.total_return * dec!(100),
                run.summary.risk.sharpe_ratio,
                run.summary.closed_trades
            ));
        }

        s.push_str("═══════════════════════════════════════════════════════════════\n");

        s
    }
}

/// Parameter sweep runner for parallel backtesting.
pub struct SweepRunner {
    parameter_space: ParameterSpace,
    base_config: Config,
    parallelism: usize,
}

impl SweepRunner {
    /// Create a new sweep runner.
    pub fn new(parameter_space: ParameterSpace, base_config: Config, parallelism: usize) -> Self {
        Self {
            parameter_space,
            base_config,
            parallelism: parallelism.max(1),
        }
    }

    /// Run the parameter sweep over every observation the loader holds.
    pub async fn run<D: DataLoader>(&self, data_loader: &D) -> Result<SweepResults> {
        let configs = self.parameter_space.generate_configs(&self.base_config);
        let total_combinations = configs.len();

        info!(
            "Starting parameter sweep with {} combinations, parallelism={}",
            total_combinations, self.parallelism
        );

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let observations: Arc<Vec<FundingObservation>> =
            Arc::new(data_loader.observations().to_vec());

        let mut handles = Vec::with_capacity(configs.len());
        let mut skipped_combinations = 0;

        for (i, config) in configs.into_iter().enumerate() {
            let description = ParameterSpace::describe_config(&config);
            let simulator = match FundingArbitrageSimulator::new(config) {
                Ok(simulator) => simulator,
                Err(e) => {
                    warn!(
                        "[{}/{}] Skipping {}: {}",
                        i + 1,
                        total_combinations,
                        description,
                        e
                    );
                    skipped_combinations += 1;
                    continue;
                }
            };

            let sem = semaphore.clone();
            let data = observations.clone();

            let handle = tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok()?;

                debug!("[{}/{}] Testing: {}", i + 1, total_combinations, description);

                let run = tokio::task::spawn_blocking(move || simulator.run(data.iter())).await;

                match run {
                    Ok(Ok(result)) => {
                        info!(
                            "[{}/{}] Complete: Sharpe={:.3} Return={:.2}%",
                            i + 1,
                            total_combinations,
                            result.summary.risk.sharpe_ratio,
                            result.summary.total_return * dec!(100)
                        );
                        Some(result)
                    }
                    Ok(Err(e)) => {
                        warn!("[{}/{}] Failed: {}", i + 1, total_combinations, e);
                        None
                    }
                    Err(e) => {
                        warn!("[{}/{}] Task panicked: {}", i + 1, total_combinations, e);
                        None
                    }
                }
            });

            handles.push(handle);
        }

        // Collect results
        let mut runs = Vec::new();
        let mut failed_runs = 0;

        for handle in handles {
            match handle.await {
                Ok(Some(result)) => runs.push(result),
                Ok(None) => failed_runs += 1,
                Err(e) => {
                    warn!("Task panicked: {}", e);
                    failed_runs += 1;
                }
            }
        }

        let best_by_sharpe = runs
            .iter()
            .enumerate()
            .max_by_key(|(_, r)| r.summary.risk.sharpe_ratio)
            .map(|(i, _)| i);

        let best_by_return = runs
            .iter()
            .enumerate()
            .max_by_key(|(_, r)| r.summary.total_return)
            .map(|(i, _)| i);

        Ok(SweepResults {
            successful_runs: runs.len(),
            runs,
            best_by_sharpe,
            best_by_return,
            total_combinations,
            skipped_combinations,
            failed_runs,
        })
    }
}
