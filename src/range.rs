use async_trait::async_trait;
use chrono::{NaiveDate, Utc};

use crate::tenant::TenantKey;

/// Earliest date the platform can have analytics for; "lifetime" syncs start
/// here unless the tenant's channel is younger.
pub fn platform_inception() -> NaiveDate {
  NaiveDate::from_ymd_opt(2005, 2, 14).unwrap()
}

pub trait Clock: Send + Sync {
  fn today(&self) -> NaiveDate;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn today(&self) -> NaiveDate {
    Utc::now().date_naive()
  }
}

/// Looks up when a tenant's channel started producing data. `None` covers
/// both "unknown" and "lookup failed"; absence only means "no clamp".
#[async_trait]
pub trait ActivityStartLookup: Send + Sync {
  async fn activity_start(&self, tenant: &TenantKey) -> Option<NaiveDate>;
}

/// Resolves the effective sync range: the nominal lower bound clamped
/// forward by the tenant's activity start, through today.
pub async fn resolve_range(
  lookup: &dyn ActivityStartLookup,
  clock: &dyn Clock,
  tenant: &TenantKey,
  nominal_lower_bound: NaiveDate,
) -> (NaiveDate, NaiveDate) {
  let start_dt = match lookup.activity_start(tenant).await {
    Some(activity_start) if activity_start > nominal_lower_bound => activity_start,
    _ => nominal_lower_bound,
  };
  (start_dt, clock.today())
}
