use chrono::{Duration, NaiveDate};

/// Inclusive date sub-range submitted as one Analytics API query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
  pub start_dt: NaiveDate,
  pub end_dt: NaiveDate,
}

impl DateWindow {
  pub fn span_days(&self) -> i64 {
    (self.end_dt - self.start_dt).num_days() + 1
  }
}

impl std::fmt::Display for DateWindow {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}..{}", self.start_dt, self.end_dt)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidRangeError {
  pub start_dt: NaiveDate,
  pub end_dt: NaiveDate,
}

impl std::fmt::Display for InvalidRangeError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "invalid date range: start_dt ({}) > end_dt ({})",
      self.start_dt, self.end_dt
    )
  }
}

impl std::error::Error for InvalidRangeError {}

/// Splits `[start_dt, end_dt]` into consecutive, non-overlapping windows of
/// at most `max_span_days` days each, earliest first. The windows cover the
/// requested range exactly; only the last one may be shorter.
pub fn plan_windows(
  start_dt: NaiveDate,
  end_dt: NaiveDate,
  max_span_days: i64,
) -> Result<Vec<DateWindow>, InvalidRangeError> {
  if start_dt > end_dt {
    return Err(InvalidRangeError { start_dt, end_dt });
  }

  let max_span_days = max_span_days.clamp(1, 365);

  let mut out = Vec::new();
  let mut cur = start_dt;
  while cur <= end_dt {
    let window_end = (cur + Duration::days(max_span_days - 1)).min(end_dt);
    out.push(DateWindow {
      start_dt: cur,
      end_dt: window_end,
    });
    cur = window_end + Duration::days(1);
  }

  Ok(out)
}
