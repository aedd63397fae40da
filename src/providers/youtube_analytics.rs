use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::{ACCEPT, AUTHORIZATION};
use hyper::{Method, Request, StatusCode};
use serde_json::Value;

use async_trait::async_trait;

use crate::fetch::{FetchError, QueryExecutor, TabularResult};
use crate::tenant::TenantKey;
use crate::windows::DateWindow;

pub const DEFAULT_BASE_URL: &str = "https://youtubeanalytics.googleapis.com/";

/// `QueryExecutor` backed by the YouTube Analytics `v2/reports` endpoint.
///
/// In channel mode the query runs as `channel==MINE` (or `channel==<id>` for
/// a channel-scoped tenant). With a content-owner id set, it runs as
/// `contentOwner==<id>` on behalf of the owner, restricted to claimed
/// self-uploaded content, optionally filtered to one channel.
#[derive(Debug, Clone)]
pub struct YoutubeAnalyticsExecutor {
  access_token: String,
  base_url: String,
  content_owner_id: Option<String>,
}

impl YoutubeAnalyticsExecutor {
  pub fn new(access_token: impl Into<String>) -> Self {
    Self::with_base_url(access_token, DEFAULT_BASE_URL)
  }

  pub fn with_base_url(access_token: impl Into<String>, base_url: impl Into<String>) -> Self {
    YoutubeAnalyticsExecutor {
      access_token: access_token.into(),
      base_url: base_url.into(),
      content_owner_id: None,
    }
  }

  pub fn for_content_owner(mut self, content_owner_id: impl Into<String>) -> Self {
    let owner = content_owner_id.into();
    self.content_owner_id = if owner.trim().is_empty() { None } else { Some(owner) };
    self
  }
}

fn ids_and_filters(
  content_owner_id: Option<&str>,
  tenant: &TenantKey,
) -> (String, Option<String>, Option<String>) {
  if let Some(owner) = content_owner_id {
    let ids = format!("contentOwner=={owner}");
    let filters = if tenant.is_aggregate() {
      "claimedStatus==claimed;uploaderType==self".to_string()
    } else {
      format!(
        "channel=={};claimedStatus==claimed;uploaderType==self",
        tenant.channel_id.trim()
      )
    };
    return (ids, Some(filters), Some(owner.to_string()));
  }

  let ids = if tenant.is_aggregate() {
    "channel==MINE".to_string()
  } else {
    format!("channel=={}", tenant.channel_id.trim())
  };
  (ids, None, None)
}

fn build_reports_url(
  base_url: &str,
  ids_value: &str,
  window: DateWindow,
  dimensions: &str,
  metrics: &str,
  filters: Option<&str>,
  on_behalf_of: Option<&str>,
) -> String {
  let base = base_url.trim_end_matches('/');
  let mut url = format!(
    "{base}/v2/reports?ids={ids_value}&startDate={}&endDate={}&dimensions={dimensions}&metrics={metrics}&sort=day,insightTrafficSourceType",
    window.start_dt, window.end_dt
  );
  if let Some(filters) = filters {
    url.push_str("&filters=");
    url.push_str(filters);
  }
  if let Some(owner) = on_behalf_of {
    url.push_str("&onBehalfOfContentOwner=");
    url.push_str(owner);
  }
  url
}

/// Lifts a report response into column names plus positional row cells.
/// Rows that are not arrays are dropped; a response with no `rows` key is an
/// empty (but valid) result.
fn parse_tabular(json: &Value) -> TabularResult {
  let columns = json
    .get("columnHeaders")
    .and_then(|v| v.as_array())
    .map(|headers| {
      headers
        .iter()
        .map(|h| h.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string())
        .collect()
    })
    .unwrap_or_default();

  let rows = json
    .get("rows")
    .and_then(|v| v.as_array())
    .map(|rows| {
      rows
        .iter()
        .filter_map(|row| row.as_array().cloned())
        .collect()
    })
    .unwrap_or_default();

  TabularResult { columns, rows }
}

async fn fetch_report_json_by_url(access_token: &str, url: &str) -> Result<Value, FetchError> {
  let connector = hyper_rustls::HttpsConnectorBuilder::new()
    .with_native_roots()
    .map_err(|e| FetchError::transport(e.to_string()))?
    .https_or_http()
    .enable_http1()
    .build();

  let client =
    hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new()).build(connector);

  let req = Request::builder()
    .method(Method::GET)
    .uri(url)
    .header(AUTHORIZATION, format!("Bearer {}", access_token))
    .header(ACCEPT, "application/json")
    .body(Empty::<Bytes>::new())
    .map_err(|e| FetchError::transport(e.to_string()))?;

  let resp = client
    .request(req)
    .await
    .map_err(|e| FetchError::transport(e.to_string()))?;

  let status = resp.status();
  let body_bytes = resp
    .into_body()
    .collect()
    .await
    .map_err(|e| FetchError::transport(e.to_string()))?
    .to_bytes();

  if status != StatusCode::OK {
    let snippet = String::from_utf8_lossy(&body_bytes);
    let snippet = snippet.chars().take(800).collect::<String>();
    return Err(FetchError::from_status(
      status.as_u16(),
      format!("{snippet} (url: {url})"),
    ));
  }

  serde_json::from_slice::<Value>(&body_bytes)
    .map_err(|e| FetchError::transport(format!("invalid json response: {e}")))
}

#[async_trait]
impl QueryExecutor for YoutubeAnalyticsExecutor {
  async fn execute(
    &self,
    tenant: &TenantKey,
    window: DateWindow,
    dimensions: &str,
    metrics: &str,
  ) -> Result<TabularResult, FetchError> {
    let (ids_value, filters, on_behalf_of) =
      ids_and_filters(self.content_owner_id.as_deref(), tenant);
    let url = build_reports_url(
      &self.base_url,
      &ids_value,
      window,
      dimensions,
      metrics,
      filters.as_deref(),
      on_behalf_of.as_deref(),
    );

    let json = fetch_report_json_by_url(&self.access_token, &url).await?;
    Ok(parse_tabular(&json))
  }
}
