use std::collections::{BTreeMap, BTreeSet};

use chrono::{Duration, NaiveDate};

use crate::normalize::TrafficSourceDaily;

/// In-memory merge of all windows in one run, keyed by `(day, source)`, plus
/// the set of sources observed so far. `BTreeMap` keeps rows ordered by
/// `(dt, source)` for deterministic writes.
#[derive(Debug, Default)]
pub struct SourceDailySeries {
  map: BTreeMap<(NaiveDate, String), TrafficSourceDaily>,
  sources: BTreeSet<String>,
}

impl SourceDailySeries {
  pub fn new() -> Self {
    Self::default()
  }

  /// Inserts records, overwriting on key collision (last window wins).
  pub fn accumulate(&mut self, records: Vec<TrafficSourceDaily>) {
    for record in records {
      self.sources.insert(record.source.clone());
      self.map.insert((record.dt, record.source.clone()), record);
    }
  }

  pub fn sources(&self) -> Vec<String> {
    self.sources.iter().cloned().collect()
  }

  pub(crate) fn len(&self) -> usize {
    self.map.len()
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.map.is_empty()
  }

  pub(crate) fn get(&self, dt: NaiveDate, source: &str) -> Option<&TrafficSourceDaily> {
    self.map.get(&(dt, source.to_string()))
  }

  /// Completes the series so every day in `[start_dt, end_dt]` has one row
  /// per observed source, synthesizing zero rows where a (day, source) pair
  /// never appeared. Sources never observed in this run are not invented.
  pub fn fill_missing(&mut self, start_dt: NaiveDate, end_dt: NaiveDate) {
    let mut dt = start_dt;
    while dt <= end_dt {
      for source in &self.sources {
        let key = (dt, source.clone());
        if !self.map.contains_key(&key) {
          self.map.insert(key, TrafficSourceDaily::zero(dt, source.clone()));
        }
      }
      dt += Duration::days(1);
    }
  }

  /// Consumes the series into rows ordered by `(dt, source)`.
  pub fn into_rows(self) -> Vec<TrafficSourceDaily> {
    self.map.into_values().collect()
  }
}
