//! Historical funding data loading for backtesting.
//!
//! Parses exchange funding-history exports into [`FundingObservation`]s.

use crate::utils::decimal::parse_rate;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;

/// A single funding settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingObservation {
    pub timestamp: DateTime<Utc>,
    /// Signed fraction, e.g. 0.0005 = 0.05%
    pub funding_rate: Decimal,
}

impl FundingObservation {
    pub fn new(timestamp: DateTime<Utc>, funding_rate: Decimal) -> Self {
        Self {
            timestamp,
            funding_rate,
        }
    }
}

/// Trait for loading historical funding data.
pub trait DataLoader: Send + Sync {
    /// All observations, oldest first.
    fn observations(&self) -> &[FundingObservation];

    /// Observations within `[start, end]`, oldest first.
    fn load_observations(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<FundingObservation> {
        self.observations()
            .iter()
            .filter(|o| o.timestamp >= start && o.timestamp <= end)
            .copied()
            .collect()
    }

    /// Get the available date range in the data.
    fn available_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let first = self.observations().first()?;
        let last = self.observations().last()?;
        Some((first.timestamp, last.timestamp))
    }
}

/// CSV loader for exchange funding-rate history exports.
///
/// Expected CSV format (column order is free, header names are matched
/// case-insensitively, extra columns are ignored):
/// ```csv
/// "Time","Contracts","Funding Interval","Funding Rate"
/// "2025-06-18 08:00:00","BTCUSDT Perpetual","8h","0.0100%"
/// ```
///
/// Exports are usually newest-first; rows are re-sorted oldest-first.
#[derive(Debug, Clone, Default)]
pub struct CsvDataLoader {
    observations: Vec<FundingObservation>,
    contracts: Vec<String>,
    interval_hours: Option<u32>,
}

impl CsvDataLoader {
    /// Load data from a CSV file.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to read CSV file: {}", path.display()))?;

        Self::from_reader(file)
            .with_context(|| format!("Failed to load funding history from {}", path.display()))
    }

    /// Load data from CSV content string.
    pub fn from_csv_content(content: &str) -> Result<Self> {
        Self::from_reader(content.as_bytes())
    }

    fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);

        let columns = Columns::locate(reader.headers().context("Failed to read CSV header")?)?;

        let mut observations = Vec::new();
        let mut contracts = BTreeSet::new();
        let mut interval_hours = None;

        for (idx, record) in reader.records().enumerate() {
            // Header is line 1
            let line = idx + 2;
            let record = record.with_context(|| format!("Failed to read line {}", line))?;
            if record.iter().all(|field| field.is_empty()) {
                continue;
            }

            let raw_time = record.get(columns.time).unwrap_or_default();
            let timestamp = parse_timestamp(raw_time)
                .with_context(|| format!("Invalid timestamp on line {}: {:?}", line, raw_time))?;

            let raw_rate = record.get(columns.rate).unwrap_or_default();
            let funding_rate = parse_rate(raw_rate).with_context(|| {
                format!("Invalid funding rate on line {}: {:?}", line, raw_rate)
            })?;

            if let Some(contract) = columns.contract.and_then(|c| record.get(c)) {
                if !contract.is_empty() {
                    contracts.insert(contract.to_string());
                }
            }
            if interval_hours.is_none() {
                interval_hours = columns
                    .interval
                    .and_then(|c| record.get(c))
                    .and_then(parse_interval_hours);
            }

            observations.push(FundingObservation::new(timestamp, funding_rate));
        }

        if observations.is_empty() {
            anyhow::bail!("CSV file contains no data rows");
        }

        observations.sort_by_key(|o| o.timestamp);
        if let Some(pair) = observations
            .windows(2)
            .find(|w| w[0].timestamp == w[1].timestamp)
        {
            anyhow::bail!(
                "Duplicate funding timestamp {}",
                pair[0].timestamp.to_rfc3339()
            );
        }

        Ok(Self {
            observations,
            contracts: contracts.into_iter().collect(),
            interval_hours,
        })
    }

    /// Create a loader from in-memory observations.
    pub fn from_observations(mut observations: Vec<FundingObservation>) -> Self {
        observations.sort_by_key(|o| o.timestamp);
        Self {
            observations,
            contracts: Vec::new(),
            interval_hours: None,
        }
    }

    /// Contract identifiers seen in the file.
    pub fn contracts(&self) -> &[String] {
        &self.contracts
    }

    /// Funding interval from the first row that declares one.
    pub fn interval_hours(&self) -> Option<u32> {
        self.interval_hours
    }

    /// Get total number of observations.
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    /// Check if the loader has no data.
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

impl DataLoader for CsvDataLoader {
    fn observations(&self) -> &[FundingObservation] {
        &self.observations
    }
}

/// Column positions resolved from the header row.
#[derive(Debug)]
struct Columns {
    time: usize,
    rate: usize,
    contract: Option<usize>,
    interval: Option<usize>,
}

impl Columns {
    fn locate(headers: &csv::StringRecord) -> Result<Self> {
        let find = |aliases: &[&str]| {
            headers.iter().position(|h| {
                let normalized = h.trim().to_ascii_lowercase().replace(' ', "_");
                aliases.contains(&normalized.as_str())
            })
        };

        Ok(Self {
            time: find(&["time", "timestamp", "funding_time"])
                .context("CSV header has no Time column")?,
            rate: find(&["funding_rate", "rate"]).context("CSV header has no Funding Rate column")?,
            contract: find(&["contracts", "contract", "symbol"]),
            interval: find(&["funding_interval", "interval"]),
        })
    }
}

/// Accepts RFC 3339 or naive `YYYY-MM-DD HH:MM[:SS]` (interpreted as UTC).
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn parse_interval_hours(raw: &str) -> Option<u32> {
    raw.trim()
        .trim_end_matches(|c| c == 'h' || c == 'H')
        .trim()
        .parse()
        .ok()
}
