//! Snapshot aggregation
//!
//! Pure transform from a raw snapshot to the aggregate view shown on the
//! summary and statistics screens: total units, distinct category count,
//! and the chart series. Malformed snapshots aggregate as an empty map.

use serde::{Deserialize, Serialize};
use tracing::warn;
use types::ids::SnapshotId;
use types::snapshot::{Snapshot, Timestamp};

use crate::config::ChartConfig;

/// Bar chart series, index-aligned labels and values.
///
/// With zero categories `values` holds a single `0` so that consumers never
/// observe an empty series; `labels` stays empty in that case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartSeries {
    pub labels: Vec<String>,
    pub values: Vec<i64>,
}

impl ChartSeries {
    /// Whether any bar would be drawn above zero.
    pub fn has_positive_value(&self) -> bool {
        self.values.iter().any(|v| *v > 0)
    }
}

/// Derived view of the governing snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateView {
    /// Document the view was computed from (administrative).
    pub source_id: SnapshotId,
    pub total_units: i64,
    pub distinct_categories: usize,
    pub last_updated: Timestamp,
    pub chart_series: ChartSeries,
    /// Per-category detail in received order, with untruncated names.
    pub categories: Vec<(String, i64)>,
    /// The snapshot's products were unusable and were treated as empty.
    pub malformed: bool,
}

/// Aggregate a snapshot.
///
/// A total that does not fit in `i64` makes the snapshot malformed.
pub fn aggregate(snapshot: &Snapshot, chart: &ChartConfig) -> AggregateView {
    let mut malformed = !snapshot.is_well_formed();
    let mut categories: Vec<(String, i64)> = if malformed {
        Vec::new()
    } else {
        snapshot
            .products()
            .entries()
            .iter()
            .map(|c| (c.name.clone(), c.quantity))
            .collect()
    };

    let total_units = match categories
        .iter()
        .try_fold(0i64, |acc, (_, qty)| acc.checked_add(*qty))
    {
        Some(total) => total,
        None => {
            warn!(snapshot = %snapshot.id(), "Category total overflows, aggregating as empty");
            malformed = true;
            categories.clear();
            0
        }
    };

    AggregateView {
        source_id: snapshot.id().clone(),
        total_units,
        distinct_categories: categories.len(),
        last_updated: snapshot.timestamp().clone(),
        chart_series: chart_series(&categories, chart),
        categories,
        malformed,
    }
}

fn chart_series(categories: &[(String, i64)], chart: &ChartConfig) -> ChartSeries {
    if categories.is_empty() {
        return ChartSeries {
            labels: Vec::new(),
            values: vec![0],
        };
    }

    ChartSeries {
        labels: categories
            .iter()
            .map(|(name, _)| truncate_label(name, chart))
            .collect(),
        values: categories.iter().map(|(_, qty)| *qty).collect(),
    }
}

/// Cut a label to `label_max_chars` characters plus the ellipsis marker.
///
/// Counts characters, not bytes, so multi-byte category names never split
/// inside a code point.
pub fn truncate_label(name: &str, chart: &ChartConfig) -> String {
    if name.chars().count() > chart.label_max_chars {
        let head: String = name.chars().take(chart.label_max_chars).collect();
        format!("{}{}", head, chart.ellipsis)
    } else {
        name.to_string()
    }
}
