//! Column statistics and data quality scores recorded in version metadata.

use crate::table::{Cell, ColumnKind, Table};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Summary of a numeric column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericSummary {
    pub mean: f64,
    /// Sample standard deviation; absent with fewer than two values
    pub std: Option<f64>,
    pub min: f64,
    pub max: f64,
}

/// Summary of a text column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoricalSummary {
    /// Number of distinct values
    pub unique: usize,
    /// Most frequent value (smallest on ties)
    pub top: Option<String>,
    /// Occurrences of `top`
    pub freq: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetStatistics {
    pub numerical: BTreeMap<String, NumericSummary>,
    pub categorical: BTreeMap<String, CategoricalSummary>,
}

/// Name, type and missing count of one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub missing: usize,
}

/// Data quality scores, each in `[0, 100]` rounded to two decimals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub completeness: f64,
    pub consistency: f64,
    pub balance: f64,
}

/// Time span covered by the date column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeCoverage {
    #[serde(rename = "timeRange")]
    pub time_range: String,
    #[serde(rename = "sampleRate")]
    pub sample_rate: String,
}

impl TimeCoverage {
    fn unknown() -> Self {
        Self {
            time_range: "Unknown".to_string(),
            sample_rate: "Unknown".to_string(),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn present_count(table: &Table, idx: usize) -> usize {
    table.column(idx).filter(|c| !c.is_missing()).count()
}

/// Occurrence count of each distinct present value.
fn value_counts(table: &Table, idx: usize) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for key in table.column(idx).filter_map(Cell::as_key) {
        *counts.entry(key).or_insert(0) += 1;
    }
    counts
}

fn sample_std(values: &[f64], mean: f64) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

pub fn numerical_statistics(table: &Table) -> BTreeMap<String, NumericSummary> {
    let mut stats = BTreeMap::new();
    for (idx, name) in table.columns.iter().enumerate() {
        if table.column_kind(idx) != ColumnKind::Numeric {
            continue;
        }
        let values: Vec<f64> = table
            .column(idx)
            .filter_map(|c| match c {
                Cell::Number(n) if n.is_finite() => Some(*n),
                _ => None,
            })
            .collect();
        if values.is_empty() {
            continue;
        }

        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        stats.insert(
            name.clone(),
            NumericSummary {
                mean,
                std: sample_std(&values, mean),
                min,
                max,
            },
        );
    }
    stats
}

pub fn categorical_statistics(table: &Table) -> BTreeMap<String, CategoricalSummary> {
    let mut stats = BTreeMap::new();
    for (idx, name) in table.columns.iter().enumerate() {
        if !matches!(
            table.column_kind(idx),
            ColumnKind::Categorical | ColumnKind::Empty
        ) {
            continue;
        }
        let counts = value_counts(table, idx);
        let top = counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(value, count)| (value.clone(), *count));

        stats.insert(
            name.clone(),
            CategoricalSummary {
                unique: counts.len(),
                top: top.as_ref().map(|(value, _)| value.clone()),
                freq: top.map(|(_, count)| count),
            },
        );
    }
    stats
}

pub fn statistics(table: &Table) -> DatasetStatistics {
    DatasetStatistics {
        numerical: numerical_statistics(table),
        categorical: categorical_statistics(table),
    }
}

/// Name, inferred type and missing count for every column.
pub fn features(table: &Table) -> Vec<FeatureInfo> {
    table
        .columns
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            let missing = table.column(idx).filter(|c| c.is_missing()).count();
            let kind = table.column_kind(idx);
            let integral = kind == ColumnKind::Numeric
                && missing == 0
                && table
                    .column(idx)
                    .all(|c| matches!(c, Cell::Number(n) if n.fract() == 0.0));

            FeatureInfo {
                name: name.clone(),
                kind: if integral { "int64" } else { kind.label() }.to_string(),
                missing,
            }
        })
        .collect()
}

/// Completeness, consistency and balance over every column.
///
/// - completeness: `(1 - mean missing ratio) * 100`
/// - consistency: `(1 - mean(unique / present)) * 100`, skipping empty columns
/// - balance: mean of `(1 - std(value frequencies)) * 100`, with columns of at
///   most one distinct value scoring 0
pub fn quality(table: &Table) -> QualityMetrics {
    if table.is_empty() || table.column_count() == 0 {
        return QualityMetrics::default();
    }

    let rows = table.len() as f64;
    let columns = table.column_count();

    let mut missing_ratio = 0.0;
    let mut unique_ratios = Vec::with_capacity(columns);
    let mut balance_scores = Vec::with_capacity(columns);

    for idx in 0..columns {
        let present = present_count(table, idx);
        missing_ratio += (table.len() - present) as f64 / rows;

        let counts = value_counts(table, idx);
        if present > 0 {
            unique_ratios.push(counts.len() as f64 / present as f64);
        }

        if counts.len() <= 1 {
            balance_scores.push(0.0);
            continue;
        }
        let freqs: Vec<f64> = counts.values().map(|c| *c as f64 / present as f64).collect();
        let mean = freqs.iter().sum::<f64>() / freqs.len() as f64;
        let std = sample_std(&freqs, mean).unwrap_or(0.0);
        balance_scores.push((1.0 - std) * 100.0);
    }

    let completeness = (1.0 - missing_ratio / columns as f64) * 100.0;
    let consistency = if unique_ratios.is_empty() {
        0.0
    } else {
        (1.0 - unique_ratios.iter().sum::<f64>() / unique_ratios.len() as f64) * 100.0
    };
    let balance = balance_scores.iter().sum::<f64>() / balance_scores.len() as f64;

    QualityMetrics {
        completeness: round2(completeness),
        consistency: round2(consistency),
        balance: round2(balance),
    }
}

/// Render a duration as `"<days> days HH:MM:SS"`.
fn format_interval(interval: Duration) -> String {
    let total = interval.num_seconds();
    let days = total.div_euclid(86_400);
    let rem = total.rem_euclid(86_400);
    format!(
        "{days} days {:02}:{:02}:{:02}",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

/// First/last timestamp and median sampling interval of `date_column`.
pub fn time_coverage(table: &Table, date_column: &str) -> TimeCoverage {
    let Some(idx) = table.column_index(date_column) else {
        return TimeCoverage::unknown();
    };

    let mut stamps = table.timestamps(idx);
    if stamps.is_empty() {
        return TimeCoverage::unknown();
    }
    stamps.sort();

    let first = stamps[0];
    let last = stamps[stamps.len() - 1];
    let time_range = format!(
        "{} ~ {}",
        first.format("%Y-%m-%d %H:%M:%S"),
        last.format("%Y-%m-%d %H:%M:%S")
    );

    let mut deltas: Vec<i64> = stamps
        .windows(2)
        .map(|w| (w[1] - w[0]).num_seconds())
        .collect();
    let sample_rate = if deltas.is_empty() {
        "Unknown".to_string()
    } else {
        deltas.sort_unstable();
        let mid = deltas.len() / 2;
        let median = if deltas.len() % 2 == 0 {
            (deltas[mid - 1] + deltas[mid]) / 2
        } else {
            deltas[mid]
        };
        format_interval(Duration::seconds(median))
    };

    TimeCoverage {
        time_range,
        sample_rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::parse_timestamp;

    fn sample_table() -> Table {
        let ts = |s: &str| Cell::Timestamp(parse_timestamp(s).unwrap());
        Table {
            columns: vec!["date".into(), "value".into(), "site".into()],
            rows: vec![
                vec![ts("2024-01-01 00:00:00"), Cell::Number(1.0), Cell::Text("a".into())],
                vec![ts("2024-01-01 01:00:00"), Cell::Number(2.0), Cell::Text("a".into())],
                vec![ts("2024-01-01 02:00:00"), Cell::Number(3.0), Cell::Text("b".into())],
                vec![ts("2024-01-01 04:00:00"), Cell::Missing, Cell::Text("a".into())],
            ],
        }
    }

    #[test]
    fn test_numerical_statistics() {
        let stats = numerical_statistics(&sample_table());
        let value = &stats["value"];
        assert_eq!(value.mean, 2.0);
        assert_eq!(value.std, Some(1.0));
        assert_eq!(value.min, 1.0);
        assert_eq!(value.max, 3.0);
        assert!(!stats.contains_key("date"));
    }

    #[test]
    fn test_categorical_statistics() {
        let stats = categorical_statistics(&sample_table());
        let site = &stats["site"];
        assert_eq!(site.unique, 2);
        assert_eq!(site.top.as_deref(), Some("a"));
        assert_eq!(site.freq, Some(3));
    }

    #[test]
    fn test_features() {
        let features = features(&sample_table());
        assert_eq!(features[0].kind, "datetime64[ns]");
        assert_eq!(features[1].kind, "float64");
        assert_eq!(features[1].missing, 1);
        assert_eq!(features[2].kind, "object");
    }

    #[test]
    fn test_quality_scores() {
        let q = quality(&sample_table());
        // one missing cell out of twelve
        assert_eq!(q.completeness, 91.67);
        assert!(q.consistency >= 0.0 && q.consistency <= 100.0);
        assert!(q.balance >= 0.0 && q.balance <= 100.0);

        assert_eq!(quality(&Table::default()), QualityMetrics::default());
    }

    #[test]
    fn test_time_coverage() {
        let coverage = time_coverage(&sample_table(), "date");
        assert_eq!(
            coverage.time_range,
            "2024-01-01 00:00:00 ~ 2024-01-01 04:00:00"
        );
        assert_eq!(coverage.sample_rate, "0 days 01:00:00");

        let missing = time_coverage(&sample_table(), "nope");
        assert_eq!(missing.time_range, "Unknown");
    }
}
