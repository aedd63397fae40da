use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;

use crate::accumulate::SourceDailySeries;
use crate::fetch::{fetch_window_with_retry, QueryExecutor, RetryPolicy};
use crate::normalize::{normalize_rows, TrafficSourceDaily, DEFAULT_METRICS};
use crate::range::{platform_inception, resolve_range, ActivityStartLookup, Clock};
use crate::tenant::TenantKey;
use crate::windows::{plan_windows, InvalidRangeError};

/// Dimensions requested per window, matching the report's sort order.
pub const QUERY_DIMENSIONS: &str = "insightTrafficSourceType,day";

#[derive(Debug, Clone)]
pub struct StoreError {
  pub message: String,
}

impl std::fmt::Display for StoreError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "store error: {}", self.message)
  }
}

impl std::error::Error for StoreError {}

/// Idempotent keyed upsert into the destination store. Returns the number of
/// rows committed; writing the same rows again must converge to the same
/// stored values, never accumulate.
#[async_trait]
pub trait MetricStore: Send + Sync {
  async fn upsert_batch(
    &self,
    tenant: &TenantKey,
    rows: &[TrafficSourceDaily],
  ) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct BackfillConfig {
  pub nominal_lower_bound: NaiveDate,
  pub max_window_span_days: i64,
  pub batch_size: usize,
  pub retry: RetryPolicy,
}

impl Default for BackfillConfig {
  fn default() -> Self {
    BackfillConfig {
      nominal_lower_bound: platform_inception(),
      max_window_span_days: 90,
      batch_size: 5000,
      retry: RetryPolicy::default(),
    }
  }
}

/// Cooperative cancellation. Checked between window fetches and between
/// write batches; an in-flight call always runs to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
  pub start_dt: NaiveDate,
  pub end_dt: NaiveDate,
  pub windows_attempted: usize,
  pub windows_skipped: usize,
  pub rows_written: u64,
  pub write_errors: usize,
  pub sources_seen: Vec<String>,
  pub cancelled: bool,
}

impl RunReport {
  /// True when every window fetched and every batch committed.
  pub fn is_complete(&self) -> bool {
    !self.cancelled && self.windows_skipped == 0 && self.write_errors == 0
  }
}

/// Runs one tenant's backfill: resolve the effective range, fetch it window
/// by window, merge and zero-fill the series, then upsert in batches.
///
/// Only an inverted range aborts the run. A window that keeps failing is
/// skipped and the run continues; a failed batch does not stop later
/// batches. Callers must inspect the report to learn whether the series is
/// fully backfilled.
pub async fn run_backfill(
  tenant: &TenantKey,
  config: &BackfillConfig,
  executor: &dyn QueryExecutor,
  activity_start: &dyn ActivityStartLookup,
  store: &dyn MetricStore,
  clock: &dyn Clock,
  cancel: &CancelToken,
) -> Result<RunReport, InvalidRangeError> {
  let (start_dt, end_dt) =
    resolve_range(activity_start, clock, tenant, config.nominal_lower_bound).await;
  let windows = plan_windows(start_dt, end_dt, config.max_window_span_days)?;

  let mut report = RunReport {
    start_dt,
    end_dt,
    windows_attempted: 0,
    windows_skipped: 0,
    rows_written: 0,
    write_errors: 0,
    sources_seen: Vec::new(),
    cancelled: false,
  };

  tracing::info!(
    account_tag = %tenant.account_tag,
    %start_dt,
    %end_dt,
    windows = windows.len(),
    "starting traffic source backfill"
  );

  // One window at a time: the API is quota-limited and per-call latency
  // dominates, so concurrent windows buy nothing.
  let mut series = SourceDailySeries::new();
  for window in windows {
    if cancel.is_cancelled() {
      report.cancelled = true;
      break;
    }

    report.windows_attempted += 1;
    match fetch_window_with_retry(
      executor,
      tenant,
      window,
      QUERY_DIMENSIONS,
      DEFAULT_METRICS,
      &config.retry,
    )
    .await
    {
      Ok(result) => series.accumulate(normalize_rows(&result)),
      Err(err) => {
        tracing::warn!(%window, error = %err, "window skipped");
        report.windows_skipped += 1;
      }
    }
  }

  // Zero-fill covers the whole requested range, but only for sources this
  // run actually observed.
  series.fill_missing(start_dt, end_dt);
  report.sources_seen = series.sources();

  let rows = series.into_rows();
  for batch in rows.chunks(config.batch_size.max(1)) {
    if cancel.is_cancelled() {
      report.cancelled = true;
      break;
    }

    match store.upsert_batch(tenant, batch).await {
      Ok(committed) => report.rows_written += committed,
      Err(err) => {
        tracing::warn!(error = %err, batch_len = batch.len(), "write batch failed");
        report.write_errors += 1;
      }
    }
  }

  tracing::info!(
    account_tag = %tenant.account_tag,
    rows_written = report.rows_written,
    windows_skipped = report.windows_skipped,
    write_errors = report.write_errors,
    cancelled = report.cancelled,
    "backfill finished"
  );

  Ok(report)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::fetch::{FetchError, TabularResult};
  use crate::windows::DateWindow;
  use serde_json::json;
  use std::collections::BTreeMap;
  use std::sync::Mutex;
  use std::time::Duration;

  fn d(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
  }

  struct FixedClock(NaiveDate);

  impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
      self.0
    }
  }

  struct FixedLookup(Option<NaiveDate>);

  #[async_trait]
  impl ActivityStartLookup for FixedLookup {
    async fn activity_start(&self, _tenant: &TenantKey) -> Option<NaiveDate> {
      self.0
    }
  }

  /// Serves canned (day, source, views) triples, returning each window's
  /// slice of the data. Windows whose start date is listed in
  /// `failing_starts` always return a transient error.
  struct CannedExecutor {
    data: Vec<(NaiveDate, &'static str, i64)>,
    failing_starts: Vec<NaiveDate>,
    calls: Mutex<Vec<DateWindow>>,
  }

  impl CannedExecutor {
    fn new(data: Vec<(NaiveDate, &'static str, i64)>) -> Self {
      CannedExecutor {
        data,
        failing_starts: Vec::new(),
        calls: Mutex::new(Vec::new()),
      }
    }

    fn failing(mut self, starts: Vec<NaiveDate>) -> Self {
      self.failing_starts = starts;
      self
    }
  }

  #[async_trait]
  impl QueryExecutor for CannedExecutor {
    async fn execute(
      &self,
      _tenant: &TenantKey,
      window: DateWindow,
      _dimensions: &str,
      _metrics: &str,
    ) -> Result<TabularResult, FetchError> {
      self.calls.lock().unwrap().push(window);
      if self.failing_starts.contains(&window.start_dt) {
        return Err(FetchError::from_status(503, "unavailable".into()));
      }

      let rows = self
        .data
        .iter()
        .filter(|(dt, _, _)| *dt >= window.start_dt && *dt <= window.end_dt)
        .map(|(dt, source, views)| {
          vec![
            json!(dt.format("%Y-%m-%d").to_string()),
            json!(source),
            json!(views),
            json!(views / 3),
            json!(views / 2),
            json!(12.5),
          ]
        })
        .collect();

      Ok(TabularResult {
        columns: vec![
          "day".into(),
          "insightTrafficSourceType".into(),
          "views".into(),
          "estimatedMinutesWatched".into(),
          "engagedViews".into(),
          "averageViewPercentage".into(),
        ],
        rows,
      })
    }
  }

  type StoredKey = (String, String, NaiveDate, String);

  #[derive(Default)]
  struct MemoryStore {
    rows: Mutex<BTreeMap<StoredKey, TrafficSourceDaily>>,
    fail_batches: Mutex<Vec<usize>>,
    batches_seen: Mutex<usize>,
    cancel_on_first_batch: Mutex<Option<CancelToken>>,
  }

  impl MemoryStore {
    fn snapshot(&self) -> BTreeMap<StoredKey, TrafficSourceDaily> {
      self.rows.lock().unwrap().clone()
    }
  }

  #[async_trait]
  impl MetricStore for MemoryStore {
    async fn upsert_batch(
      &self,
      tenant: &TenantKey,
      rows: &[TrafficSourceDaily],
    ) -> Result<u64, StoreError> {
      let batch_no = {
        let mut seen = self.batches_seen.lock().unwrap();
        *seen += 1;
        *seen
      };
      if self.fail_batches.lock().unwrap().contains(&batch_no) {
        return Err(StoreError {
          message: "injected batch failure".into(),
        });
      }

      let mut stored = self.rows.lock().unwrap();
      for row in rows {
        stored.insert(
          (
            tenant.account_tag.clone(),
            tenant.channel_id.clone(),
            row.dt,
            row.source.clone(),
          ),
          row.clone(),
        );
      }
      if batch_no == 1 {
        if let Some(token) = self.cancel_on_first_batch.lock().unwrap().take() {
          token.cancel();
        }
      }
      Ok(rows.len() as u64)
    }
  }

  fn zero_delay_config(max_window_span_days: i64, batch_size: usize) -> BackfillConfig {
    BackfillConfig {
      nominal_lower_bound: d(2021, 1, 1),
      max_window_span_days,
      batch_size,
      retry: RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::ZERO,
      },
    }
  }

  fn tenant() -> TenantKey {
    TenantKey::new("acct", "UC123")
  }

  #[tokio::test]
  async fn scenario_two_sources_three_days_yields_six_rows() {
    let executor = CannedExecutor::new(vec![
      (d(2021, 1, 1), "SEARCH", 10),
      (d(2021, 1, 2), "DIRECT", 5),
    ]);
    let store = MemoryStore::default();
    let config = zero_delay_config(90, 5000);

    let report = run_backfill(
      &tenant(),
      &config,
      &executor,
      &FixedLookup(None),
      &store,
      &FixedClock(d(2021, 1, 3)),
      &CancelToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.start_dt, d(2021, 1, 1));
    assert_eq!(report.end_dt, d(2021, 1, 3));
    assert_eq!(report.windows_attempted, 1);
    assert_eq!(report.windows_skipped, 0);
    assert_eq!(report.rows_written, 6);
    assert_eq!(report.sources_seen, vec!["DIRECT".to_string(), "SEARCH".to_string()]);
    assert!(report.is_complete());

    let stored = store.snapshot();
    assert_eq!(stored.len(), 6);
    assert_eq!(stored.values().filter(|r| r.views == 0).count(), 4);

    let key = ("acct".to_string(), "UC123".to_string(), d(2021, 1, 1), "SEARCH".to_string());
    assert_eq!(stored.get(&key).unwrap().views, 10);
  }

  #[tokio::test]
  async fn coverage_invariant_holds_across_multiple_windows() {
    let executor = CannedExecutor::new(vec![
      (d(2021, 1, 1), "SEARCH", 10),
      (d(2021, 1, 5), "DIRECT", 4),
      (d(2021, 1, 9), "PLAYLIST", 7),
    ]);
    let store = MemoryStore::default();
    let config = zero_delay_config(3, 4);

    let report = run_backfill(
      &tenant(),
      &config,
      &executor,
      &FixedLookup(None),
      &store,
      &FixedClock(d(2021, 1, 10)),
      &CancelToken::new(),
    )
    .await
    .unwrap();

    // 10 days x 3 sources, exactly once each.
    assert_eq!(report.windows_attempted, 4);
    assert_eq!(report.rows_written, 30);
    let stored = store.snapshot();
    assert_eq!(stored.len(), 30);
    for dt_offset in 0..10 {
      let dt = d(2021, 1, 1) + chrono::Duration::days(dt_offset);
      for source in ["SEARCH", "DIRECT", "PLAYLIST"] {
        let key = ("acct".to_string(), "UC123".to_string(), dt, source.to_string());
        assert!(stored.contains_key(&key), "missing {dt} {source}");
      }
    }
  }

  #[tokio::test]
  async fn rerunning_converges_to_the_same_stored_rows() {
    let executor = CannedExecutor::new(vec![
      (d(2021, 1, 1), "SEARCH", 10),
      (d(2021, 1, 2), "DIRECT", 5),
    ]);
    let store = MemoryStore::default();
    let config = zero_delay_config(2, 3);
    let clock = FixedClock(d(2021, 1, 4));

    let first = run_backfill(
      &tenant(),
      &config,
      &executor,
      &FixedLookup(None),
      &store,
      &clock,
      &CancelToken::new(),
    )
    .await
    .unwrap();
    let after_first = store.snapshot();

    let second = run_backfill(
      &tenant(),
      &config,
      &executor,
      &FixedLookup(None),
      &store,
      &clock,
      &CancelToken::new(),
    )
    .await
    .unwrap();
    let after_second = store.snapshot();

    assert_eq!(first.rows_written, second.rows_written);
    assert_eq!(after_first, after_second);
  }

  #[tokio::test]
  async fn skipped_window_degrades_without_failing_the_run() {
    // Five 2-day windows over 2021-01-01..2021-01-10; the second keeps
    // returning 503 until retries run out.
    let executor = CannedExecutor::new(vec![
      (d(2021, 1, 1), "SEARCH", 10),
      (d(2021, 1, 3), "SEARCH", 3),
      (d(2021, 1, 5), "SEARCH", 4),
      (d(2021, 1, 7), "DIRECT", 6),
      (d(2021, 1, 9), "SEARCH", 8),
    ])
    .failing(vec![d(2021, 1, 3)]);
    let store = MemoryStore::default();
    let config = zero_delay_config(2, 100);

    let report = run_backfill(
      &tenant(),
      &config,
      &executor,
      &FixedLookup(None),
      &store,
      &FixedClock(d(2021, 1, 10)),
      &CancelToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.windows_attempted, 5);
    assert_eq!(report.windows_skipped, 1);
    assert!(!report.is_complete());

    // The failing window was retried once, the other four fetched once.
    assert_eq!(executor.calls.lock().unwrap().len(), 6);

    // Observed sources are zero-filled across the whole range, including
    // the skipped window's days.
    let stored = store.snapshot();
    assert_eq!(stored.len(), 20);
    let key = ("acct".to_string(), "UC123".to_string(), d(2021, 1, 5), "SEARCH".to_string());
    assert_eq!(stored.get(&key).unwrap().views, 4);
    let skipped_day = ("acct".to_string(), "UC123".to_string(), d(2021, 1, 3), "SEARCH".to_string());
    assert_eq!(stored.get(&skipped_day).unwrap().views, 0);
  }

  #[tokio::test]
  async fn failed_batch_does_not_stop_later_batches() {
    let executor = CannedExecutor::new(vec![
      (d(2021, 1, 1), "SEARCH", 10),
      (d(2021, 1, 2), "DIRECT", 5),
    ]);
    let store = MemoryStore::default();
    store.fail_batches.lock().unwrap().push(1);
    // 6 rows in batches of 2: the first batch fails, two commit.
    let config = zero_delay_config(90, 2);

    let report = run_backfill(
      &tenant(),
      &config,
      &executor,
      &FixedLookup(None),
      &store,
      &FixedClock(d(2021, 1, 3)),
      &CancelToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.write_errors, 1);
    assert_eq!(report.rows_written, 4);
    assert_eq!(store.snapshot().len(), 4);
    assert!(!report.is_complete());
  }

  #[tokio::test]
  async fn inverted_range_aborts_before_any_work() {
    let executor = CannedExecutor::new(vec![]);
    let store = MemoryStore::default();
    let mut config = zero_delay_config(90, 100);
    config.nominal_lower_bound = d(2022, 1, 1);

    let err = run_backfill(
      &tenant(),
      &config,
      &executor,
      &FixedLookup(None),
      &store,
      &FixedClock(d(2021, 1, 1)),
      &CancelToken::new(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.start_dt, d(2022, 1, 1));
    assert!(executor.calls.lock().unwrap().is_empty());
    assert!(store.snapshot().is_empty());
  }

  #[tokio::test]
  async fn cancellation_stops_before_the_first_window() {
    let executor = CannedExecutor::new(vec![(d(2021, 1, 1), "SEARCH", 10)]);
    let store = MemoryStore::default();
    let config = zero_delay_config(90, 100);
    let cancel = CancelToken::new();
    cancel.cancel();

    let report = run_backfill(
      &tenant(),
      &config,
      &executor,
      &FixedLookup(None),
      &store,
      &FixedClock(d(2021, 1, 3)),
      &cancel,
    )
    .await
    .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.windows_attempted, 0);
    assert_eq!(report.rows_written, 0);
    assert!(executor.calls.lock().unwrap().is_empty());
    assert!(store.snapshot().is_empty());
  }

  #[tokio::test]
  async fn cancellation_between_batches_retains_committed_rows() {
    let executor = CannedExecutor::new(vec![
      (d(2021, 1, 1), "SEARCH", 10),
      (d(2021, 1, 2), "DIRECT", 5),
    ]);
    let store = MemoryStore::default();
    let cancel = CancelToken::new();
    // The store flips the token while committing the first batch; the run
    // must stop before batch two starts.
    *store.cancel_on_first_batch.lock().unwrap() = Some(cancel.clone());
    // 6 rows in batches of 2.
    let config = zero_delay_config(90, 2);

    let report = run_backfill(
      &tenant(),
      &config,
      &executor,
      &FixedLookup(None),
      &store,
      &FixedClock(d(2021, 1, 3)),
      &cancel,
    )
    .await
    .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.rows_written, 2);
    assert_eq!(report.write_errors, 0);
    assert_eq!(*store.batches_seen.lock().unwrap(), 1);
    assert_eq!(store.snapshot().len(), 2);
  }

  #[tokio::test]
  async fn activity_start_clamps_the_planned_windows() {
    let executor = CannedExecutor::new(vec![(d(2021, 6, 1), "SEARCH", 1)]);
    let store = MemoryStore::default();
    let mut config = zero_delay_config(90, 1000);
    config.nominal_lower_bound = platform_inception();

    let report = run_backfill(
      &tenant(),
      &config,
      &executor,
      &FixedLookup(Some(d(2021, 6, 1))),
      &store,
      &FixedClock(d(2021, 6, 10)),
      &CancelToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.start_dt, d(2021, 6, 1));
    assert_eq!(report.windows_attempted, 1);
    assert_eq!(report.rows_written, 10);
  }
}
