use std::collections::HashMap;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;

use crate::fetch::TabularResult;

pub const DAY_DIMENSION: &str = "day";
pub const TRAFFIC_SOURCE_DIMENSION: &str = "insightTrafficSourceType";

pub const VIEWS_METRIC: &str = "views";
pub const ESTIMATED_MINUTES_WATCHED_METRIC: &str = "estimatedMinutesWatched";
pub const AVERAGE_VIEW_DURATION_METRIC: &str = "averageViewDuration";
pub const AVERAGE_VIEW_PERCENTAGE_METRIC: &str = "averageViewPercentage";
pub const ENGAGED_VIEWS_METRIC: &str = "engagedViews";

/// Metrics requested per window. `averageViewDuration` is intentionally not
/// queried; it is derived from watch time and views during normalization.
pub const DEFAULT_METRICS: &str = "views,estimatedMinutesWatched,engagedViews,averageViewPercentage";

/// Canonical unit of the persisted series: one traffic source on one day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrafficSourceDaily {
  pub dt: NaiveDate,
  pub source: String,
  pub views: i64,
  pub estimated_minutes_watched: i64,
  /// Seconds.
  pub average_view_duration: i64,
  pub average_view_percentage: f64,
  pub engaged_views: i64,
}

impl TrafficSourceDaily {
  pub fn zero(dt: NaiveDate, source: impl Into<String>) -> Self {
    TrafficSourceDaily {
      dt,
      source: source.into(),
      views: 0,
      estimated_minutes_watched: 0,
      average_view_duration: 0,
      average_view_percentage: 0.0,
      engaged_views: 0,
    }
  }
}

/// Average seconds watched per view, rounded. Zero views means zero duration.
pub fn derive_average_view_duration(views: i64, estimated_minutes_watched: i64) -> i64 {
  if views > 0 {
    ((estimated_minutes_watched as f64 * 60.0) / views as f64).round() as i64
  } else {
    0
  }
}

fn cell_as_i64(cell: Option<&Value>) -> Option<i64> {
  let v = cell?;
  v.as_i64()
    .or_else(|| v.as_f64().map(|n| n.round() as i64))
    .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

fn cell_as_f64(cell: Option<&Value>) -> Option<f64> {
  let v = cell?;
  v.as_f64()
    .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

fn coerce_i64(row: &[Value], idx: Option<usize>, column: &str) -> i64 {
  let cell = idx.and_then(|i| row.get(i));
  match cell_as_i64(cell) {
    Some(n) => n.max(0),
    None => {
      if let Some(cell) = cell {
        if !cell.is_null() {
          tracing::warn!(column, cell = %cell, "unparsable metric cell, defaulting to 0");
        }
      }
      0
    }
  }
}

fn coerce_f64(row: &[Value], idx: Option<usize>, column: &str) -> f64 {
  let cell = idx.and_then(|i| row.get(i));
  match cell_as_f64(cell) {
    Some(n) => n.max(0.0),
    None => {
      if let Some(cell) = cell {
        if !cell.is_null() {
          tracing::warn!(column, cell = %cell, "unparsable metric cell, defaulting to 0.0");
        }
      }
      0.0
    }
  }
}

/// Maps one window's raw report into canonical records. Rows without a
/// parsable day or a non-empty source are dropped; malformed metric cells
/// degrade to zero instead of failing the row.
pub fn normalize_rows(result: &TabularResult) -> Vec<TrafficSourceDaily> {
  let col_index: HashMap<&str, usize> = result
    .columns
    .iter()
    .enumerate()
    .map(|(i, name)| (name.as_str(), i))
    .collect();

  let idx_day = col_index.get(DAY_DIMENSION).copied();
  let idx_source = col_index.get(TRAFFIC_SOURCE_DIMENSION).copied();
  let idx_views = col_index.get(VIEWS_METRIC).copied();
  let idx_emw = col_index.get(ESTIMATED_MINUTES_WATCHED_METRIC).copied();
  let idx_avd = col_index.get(AVERAGE_VIEW_DURATION_METRIC).copied();
  let idx_avp = col_index.get(AVERAGE_VIEW_PERCENTAGE_METRIC).copied();
  let idx_engaged = col_index.get(ENGAGED_VIEWS_METRIC).copied();

  let (idx_day, idx_source) = match (idx_day, idx_source) {
    (Some(a), Some(b)) => (a, b),
    _ => return vec![],
  };

  let mut out = Vec::with_capacity(result.rows.len());
  for row in &result.rows {
    let day_str = row.get(idx_day).and_then(|v| v.as_str()).unwrap_or("");
    let dt = match NaiveDate::parse_from_str(day_str, "%Y-%m-%d") {
      Ok(d) => d,
      Err(_) => {
        tracing::warn!(cell = day_str, "dropping row with unparsable day");
        continue;
      }
    };

    let source = row
      .get(idx_source)
      .and_then(|v| v.as_str())
      .unwrap_or("")
      .trim()
      .to_string();
    if source.is_empty() {
      continue;
    }

    let views = coerce_i64(row, idx_views, VIEWS_METRIC);
    let estimated_minutes_watched = coerce_i64(row, idx_emw, ESTIMATED_MINUTES_WATCHED_METRIC);

    // Pass the API value through when the duration column was queried;
    // otherwise derive it from watch time.
    let average_view_duration = match idx_avd {
      Some(_) => coerce_i64(row, idx_avd, AVERAGE_VIEW_DURATION_METRIC),
      None => derive_average_view_duration(views, estimated_minutes_watched),
    };

    out.push(TrafficSourceDaily {
      dt,
      source,
      views,
      estimated_minutes_watched,
      average_view_duration,
      average_view_percentage: coerce_f64(row, idx_avp, AVERAGE_VIEW_PERCENTAGE_METRIC),
      engaged_views: coerce_i64(row, idx_engaged, ENGAGED_VIEWS_METRIC),
    });
  }

  out
}
