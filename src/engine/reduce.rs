//! Down-sampling and aggregation of query results.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::datasource::{DataResp, Labels};

/// Reduction from a sequence of values to one scalar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReduceFn {
    Avg,
    Sum,
    Min,
    Max,
    Last,
    Count,
    P50,
    P95,
    P99,
}

impl ReduceFn {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReduceFn::Avg => "avg",
            ReduceFn::Sum => "sum",
            ReduceFn::Min => "min",
            ReduceFn::Max => "max",
            ReduceFn::Last => "last",
            ReduceFn::Count => "count",
            ReduceFn::P50 => "p50",
            ReduceFn::P95 => "p95",
            ReduceFn::P99 => "p99",
        }
    }

    /// Reduce `values` (in timestamp order). NaN samples are ignored;
    /// `None` when nothing remains.
    pub fn apply(&self, values: &[f64]) -> Option<f64> {
        let clean: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
        if clean.is_empty() {
            return None;
        }
        let n = clean.len() as f64;
        Some(match self {
            ReduceFn::Avg => clean.iter().sum::<f64>() / n,
            ReduceFn::Sum => clean.iter().sum(),
            ReduceFn::Min => clean.iter().copied().fold(f64::INFINITY, f64::min),
            ReduceFn::Max => clean.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            ReduceFn::Last => clean[clean.len() - 1],
            ReduceFn::Count => n,
            ReduceFn::P50 => percentile(clean, 0.50),
            ReduceFn::P95 => percentile(clean, 0.95),
            ReduceFn::P99 => percentile(clean, 0.99),
        })
    }
}

impl std::fmt::Display for ReduceFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Linear interpolation between the closest ranks of the sorted values
fn percentile(mut values: Vec<f64>, q: f64) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let rank = q * (values.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    values[lo] + (values[hi] - values[lo]) * (rank - lo as f64)
}

/// One series reduced to a single value
#[derive(Debug, Clone, PartialEq)]
pub struct Reduced {
    pub labels: Labels,
    pub value: f64,
    /// Timestamp of the newest contributing sample
    pub timestamp: i64,
}

/// Reduce each series to one scalar. Without a function the last sample is used.
/// Series with no usable samples are dropped.
pub fn downsample(series: &[DataResp], func: Option<ReduceFn>) -> Vec<Reduced> {
    let func = func.unwrap_or(ReduceFn::Last);
    series
        .iter()
        .filter_map(|s| {
            let mut samples = s.values.clone();
            samples.sort_by_key(|p| p.timestamp);
            let timestamp = samples.last()?.timestamp;
            let values: Vec<f64> = samples.iter().map(|p| p.value).collect();
            let value = match func.apply(&values) {
                Some(v) => v,
                // a series of NaN samples still reports, as NaN
                None => f64::NAN,
            };
            Some(Reduced {
                labels: s.metric.clone(),
                value,
                timestamp,
            })
        })
        .collect()
}

/// Partition by the `group_key` label sub-tuple and reduce each group.
/// An empty `group_key` yields a single group with no labels.
pub fn aggregate(items: &[Reduced], group_key: &[String], func: ReduceFn) -> Vec<Reduced> {
    let mut groups: BTreeMap<Vec<(String, String)>, (Vec<f64>, i64)> = BTreeMap::new();
    for item in items {
        let key: Vec<(String, String)> = group_key
            .iter()
            .filter_map(|k| item.labels.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        let entry = groups.entry(key).or_insert_with(|| (Vec::new(), i64::MIN));
        entry.0.push(item.value);
        entry.1 = entry.1.max(item.timestamp);
    }

    groups
        .into_iter()
        .map(|(key, (values, timestamp))| Reduced {
            labels: key.into_iter().collect(),
            value: func.apply(&values).unwrap_or(f64::NAN),
            timestamp,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::testing::series;

    #[test]
    fn test_reducers() {
        let v = [3.0, 1.0, 4.0, 1.0, 5.0];
        assert_eq!(ReduceFn::Avg.apply(&v), Some(2.8));
        assert_eq!(ReduceFn::Sum.apply(&v), Some(14.0));
        assert_eq!(ReduceFn::Min.apply(&v), Some(1.0));
        assert_eq!(ReduceFn::Max.apply(&v), Some(5.0));
        assert_eq!(ReduceFn::Last.apply(&v), Some(5.0));
        assert_eq!(ReduceFn::Count.apply(&v), Some(5.0));
        assert_eq!(ReduceFn::Sum.apply(&[]), None);
        assert_eq!(ReduceFn::Avg.apply(&[f64::NAN, 2.0]), Some(2.0));
    }

    #[test]
    fn test_percentile_interpolation() {
        let v = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(ReduceFn::P50.apply(&v), Some(25.0));
        // rank 0.95 * 3 = 2.85
        let p95 = ReduceFn::P95.apply(&v).unwrap();
        assert!((p95 - 38.5).abs() < 1e-9);
        assert_eq!(ReduceFn::P99.apply(&[7.0]), Some(7.0));
    }

    #[test]
    fn test_downsample_orders_by_timestamp() {
        let s = series(&[("ident", "h1")], &[(30, 3.0), (10, 1.0), (20, 2.0)]);
        let reduced = downsample(&[s.clone()], None);
        assert_eq!(reduced[0].value, 3.0);
        assert_eq!(reduced[0].timestamp, 30);

        let reduced = downsample(&[s], Some(ReduceFn::Avg));
        assert_eq!(reduced[0].value, 2.0);

        let empty = series(&[("ident", "h2")], &[]);
        assert!(downsample(&[empty], None).is_empty());
    }

    #[test]
    fn test_aggregate_groups() {
        let items = vec![
            Reduced {
                labels: [("cluster", "a"), ("ident", "h1")]
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                value: 1.0,
                timestamp: 10,
            },
            Reduced {
                labels: [("cluster", "a"), ("ident", "h2")]
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                value: 3.0,
                timestamp: 20,
            },
            Reduced {
                labels: [("cluster", "b"), ("ident", "h3")]
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                value: 5.0,
                timestamp: 15,
            },
        ];

        let grouped = aggregate(&items, &["cluster".to_string()], ReduceFn::Sum);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].labels.get("cluster").map(String::as_str), Some("a"));
        assert_eq!(grouped[0].value, 4.0);
        assert_eq!(grouped[0].timestamp, 20);
        assert!(!grouped[0].labels.contains_key("ident"));

        let all = aggregate(&items, &[], ReduceFn::Max);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].value, 5.0);
        assert!(all[0].labels.is_empty());
    }
}
