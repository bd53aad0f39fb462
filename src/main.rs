//! Funding Arbitrage Backtester - Main Entry Point

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use funding_arb_backtest::backtest::{
    CsvDataLoader, DataLoader, FundingArbitrageSimulator, FundingObservation, FundingStats,
    ParameterSpace, SweepRunner,
};
use funding_arb_backtest::config::Config;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Funding Arbitrage Backtester CLI
#[derive(Parser)]
#[command(name = "funding-arb-backtest")]
#[command(version, about = "Backtest delta-neutral funding rate arbitrage on historical data")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a backtest simulation on historical funding rates
    Backtest {
        /// Path to CSV funding history
        #[arg(short, long)]
        data: String,

        /// Start date (YYYY-MM-DD)
        #[arg(short, long)]
        start: Option<String>,

        /// End date (YYYY-MM-DD)
        #[arg(short, long)]
        end: Option<String>,

        /// Initial capital, overrides config
        #[arg(short = 'c', long)]
        initial_capital: Option<Decimal>,

        /// Entry threshold as a fraction (0.0005 = 0.05%), overrides config
        #[arg(long)]
        entry_threshold: Option<Decimal>,

        /// Exit threshold as a fraction, overrides config
        #[arg(long)]
        exit_threshold: Option<Decimal>,

        /// Leverage, overrides config
        #[arg(short, long)]
        leverage: Option<Decimal>,

        /// Stop after this many observations
        #[arg(long)]
        limit: Option<usize>,

        /// Output directory for snapshots, trades and summary
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Report funding rate statistics without trading
    Analyze {
        /// Path to CSV funding history
        #[arg(short, long)]
        data: String,
    },

    /// Run a parameter sweep optimization
    Sweep {
        /// Path to CSV funding history
        #[arg(short, long)]
        data: String,

        /// Start date (YYYY-MM-DD)
        #[arg(short, long)]
        start: Option<String>,

        /// End date (YYYY-MM-DD)
        #[arg(short, long)]
        end: Option<String>,

        /// Number of parallel backtests
        #[arg(short, long, default_value = "4")]
        parallelism: usize,

        /// Output directory for results
        #[arg(short, long)]
        output: Option<String>,

        /// Use minimal parameter space (faster, for testing)
        #[arg(long)]
        minimal: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    match cli.command {
        Commands::Backtest {
            data,
            start,
            end,
            initial_capital,
            entry_threshold,
            exit_threshold,
            leverage,
            limit,
            output,
        } => {
            let mut config = Config::load()?;
            if let Some(capital) = initial_capital {
                config.capital.initial_capital = capital;
            }
            if let Some(entry) = entry_threshold {
                config.signal.entry_threshold = entry;
            }
            if let Some(exit) = exit_threshold {
                config.signal.exit_threshold = exit;
            }
            if let Some(leverage) = leverage {
                config.capital.leverage = leverage;
            }

            run_backtest(
                &data,
                start.as_deref(),
                end.as_deref(),
                config,
                limit,
                output.as_deref(),
            )
        }
        Commands::Analyze { data } => run_analyze(&data),
        Commands::Sweep {
            data,
            start,
            end,
            parallelism,
            output,
            minimal,
        } => {
            run_sweep(
                &data,
                start.as_deref(),
                end.as_deref(),
                parallelism,
                output.as_deref(),
                minimal,
            )
            .await
        }
    }
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "funding-arb-backtest.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("funding_arb_backtest=info".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!("   Initial Capital: ${}", config.capital.initial_capital);
    info!(
        "   Position Size: {:.0}% of capital ({:?})",
        config.capital.position_size_pct * dec!(100),
        config.capital.sizing_basis
    );
    info!("   Leverage: {}x", config.capital.leverage);
    info!(
        "   Entry / Exit: {:.4}% / {:.4}%",
        config.signal.entry_threshold * dec!(100),
        config.signal.exit_threshold * dec!(100)
    );
    info!(
        "   Cost per side / round trip: {:.4}% / {:.4}%",
        config.costs.per_side() * dec!(100),
        config.costs.round_trip() * dec!(100)
    );
    info!("   Capital Floor: {:?}", config.risk.capital_floor);
}

fn parse_date(raw: &str, end_of_day: bool) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD", raw))?;
    let time = if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    time.map(|t| t.and_utc())
        .with_context(|| format!("Invalid date '{}'", raw))
}

/// Load the CSV and apply the optional date window.
fn load_data(
    data_path: &str,
    start: Option<&str>,
    end: Option<&str>,
) -> Result<Vec<FundingObservation>> {
    info!("📊 Loading data from: {}", data_path);
    let data_loader = CsvDataLoader::new(data_path)?;

    if let Some((data_start, data_end)) = data_loader.available_range() {
        info!(
            "   Data range: {} to {}",
            data_start.format("%Y-%m-%d %H:%M"),
            data_end.format("%Y-%m-%d %H:%M")
        );
    }
    if !data_loader.contracts().is_empty() {
        info!("   Contracts: {}", data_loader.contracts().join(", "));
    }
    if let Some(hours) = data_loader.interval_hours() {
        info!("   Funding interval: {}h", hours);
    }
    info!("   Observations: {}", data_loader.len());

    let observations = match (start, end) {
        (None, None) => data_loader.observations().to_vec(),
        (start, end) => {
            let start = start
                .map(|s| parse_date(s, false))
                .transpose()?
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            let end = end
                .map(|e| parse_date(e, true))
                .transpose()?
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            let filtered = data_loader.load_observations(start, end);
            info!("   In window: {}", filtered.len());
            filtered
        }
    };

    Ok(observations)
}

/// Run a single backtest with the given parameters.
fn run_backtest(
    data_path: &str,
    start: Option<&str>,
    end: Option<&str>,
    config: Config,
    limit: Option<usize>,
    output_dir: Option<&str>,
) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!("║              BACKTEST MODE                                 ║");
    info!("╚════════════════════════════════════════════════════════════╝");

    let observations = load_data(data_path, start, end)?;
    log_config(&config);

    let simulator = FundingArbitrageSimulator::new(config)?;
    let limit = limit.unwrap_or(usize::MAX);
    let result = simulator.run(observations.iter().take(limit))?;

    println!("\n{}", result.summary());

    if let Some(dir) = output_dir {
        result.write_to_dir(dir)?;
        info!("📁 Snapshots, trades and summary saved to: {}", dir);
    }

    Ok(())
}

/// Print funding statistics for a data file.
fn run_analyze(data_path: &str) -> Result<()> {
    let observations = load_data(data_path, None, None)?;
    let config = Config::load()?;

    let rates: Vec<Decimal> = observations.iter().map(|o| o.funding_rate).collect();
    match FundingStats::calculate(&rates, &config.signal) {
        Some(stats) => println!("\n{}", stats.render(&config.signal)),
        None => println!("\nNo funding observations to analyze"),
    }

    Ok(())
}

/// Run a parameter sweep optimization.
async fn run_sweep(
    data_path: &str,
    start: Option<&str>,
    end: Option<&str>,
    parallelism: usize,
    output_dir: Option<&str>,
    minimal: bool,
) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!("║           PARAMETER SWEEP MODE                             ║");
    info!("╚════════════════════════════════════════════════════════════╝");

    let observations = load_data(data_path, start, end)?;
    let data_loader = CsvDataLoader::from_observations(observations);

    let base_config = Config::load()?;

    let param_space = if minimal {
        info!("🔧 Using minimal parameter space (quick test)");
        ParameterSpace::minimal()
    } else {
        info!("🔧 Using full parameter space");
        ParameterSpace::default()
    };

    info!("   Combinations to test: {}", param_space.combination_count());
    info!("⚡ Parallelism: {}", parallelism);

    let runner = SweepRunner::new(param_space, base_config, parallelism);
    let results = runner.run(&data_loader).await?;

    println!("\n{}", results.summary());

    if let Some(dir) = output_dir {
        std::fs::create_dir_all(dir)?;

        let results_path = format!("{}/sweep_results.csv", dir);
        std::fs::write(&results_path, results.to_csv()?)?;
        info!("📁 Sweep results saved to: {}", results_path);
    }

    Ok(())
}
