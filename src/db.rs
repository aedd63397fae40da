use async_trait::async_trait;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySql, MySqlPool, QueryBuilder};
use tokio::sync::OnceCell;

use crate::backfill::{MetricStore, StoreError};
use crate::normalize::TrafficSourceDaily;
use crate::tenant::TenantKey;

static POOL: OnceCell<MySqlPool> = OnceCell::const_new();

fn store_err(e: impl std::fmt::Display) -> StoreError {
  StoreError {
    message: e.to_string(),
  }
}

async fn ensure_schema(pool: &MySqlPool) -> Result<(), sqlx::Error> {
  // Keep schema creation idempotent; the engine owns its own table.
  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS traffic_source_daily (
        account_tag VARCHAR(128) NOT NULL,
        channel_id VARCHAR(128) NOT NULL DEFAULT '',
        dt DATE NOT NULL,
        source VARCHAR(64) NOT NULL,
        views BIGINT NOT NULL DEFAULT 0,
        estimated_minutes_watched BIGINT NOT NULL DEFAULT 0,
        average_view_duration BIGINT NOT NULL DEFAULT 0,
        average_view_percentage DOUBLE NOT NULL DEFAULT 0,
        engaged_views BIGINT NOT NULL DEFAULT 0,
        updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
        PRIMARY KEY (account_tag, channel_id, dt, source),
        KEY idx_tsd_day (dt),
        KEY idx_tsd_source (source),
        KEY idx_tsd_acct (account_tag)
      );
    "#,
  )
  .execute(pool)
  .await?;

  Ok(())
}

pub async fn get_pool() -> Result<&'static MySqlPool, StoreError> {
  POOL
    .get_or_try_init(|| async {
      let url = std::env::var("TIDB_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .map_err(|_| store_err("Missing TIDB_DATABASE_URL (or DATABASE_URL)"))?;

      let pool = MySqlPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .map_err(store_err)?;

      ensure_schema(&pool).await.map_err(store_err)?;
      Ok::<_, StoreError>(pool)
    })
    .await
}

/// Writes one batch as a single multi-row insert, updating all non-key
/// columns on conflict, inside its own transaction. Re-writing the same
/// rows leaves the table unchanged.
pub async fn upsert_traffic_source_daily(
  pool: &MySqlPool,
  tenant: &TenantKey,
  rows: &[TrafficSourceDaily],
) -> Result<u64, sqlx::Error> {
  if rows.is_empty() {
    return Ok(0);
  }

  let mut builder: QueryBuilder<MySql> = QueryBuilder::new(
    "INSERT INTO traffic_source_daily \
      (account_tag, channel_id, dt, source, views, estimated_minutes_watched, \
       average_view_duration, average_view_percentage, engaged_views) ",
  );
  builder.push_values(rows, |mut b, row| {
    b.push_bind(&tenant.account_tag)
      .push_bind(&tenant.channel_id)
      .push_bind(row.dt)
      .push_bind(&row.source)
      .push_bind(row.views)
      .push_bind(row.estimated_minutes_watched)
      .push_bind(row.average_view_duration)
      .push_bind(row.average_view_percentage)
      .push_bind(row.engaged_views);
  });
  builder.push(
    " ON DUPLICATE KEY UPDATE \
      views = VALUES(views), \
      estimated_minutes_watched = VALUES(estimated_minutes_watched), \
      average_view_duration = VALUES(average_view_duration), \
      average_view_percentage = VALUES(average_view_percentage), \
      engaged_views = VALUES(engaged_views), \
      updated_at = CURRENT_TIMESTAMP(3)",
  );

  let mut tx = pool.begin().await?;
  builder.build().execute(&mut *tx).await?;
  tx.commit().await?;

  // MySQL's rows_affected counts updates twice; report the batch size.
  Ok(rows.len() as u64)
}

/// `MetricStore` backed by the MySQL/TiDB `traffic_source_daily` table.
#[derive(Debug, Clone)]
pub struct MySqlMetricStore {
  pool: MySqlPool,
}

impl MySqlMetricStore {
  pub fn new(pool: MySqlPool) -> Self {
    MySqlMetricStore { pool }
  }
}

#[async_trait]
impl MetricStore for MySqlMetricStore {
  async fn upsert_batch(
    &self,
    tenant: &TenantKey,
    rows: &[TrafficSourceDaily],
  ) -> Result<u64, StoreError> {
    upsert_traffic_source_daily(&self.pool, tenant, rows)
      .await
      .map_err(store_err)
  }
}
