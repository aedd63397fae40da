use async_trait::async_trait;
use chrono::NaiveDate;
use google_youtube3::YouTube;

use crate::range::ActivityStartLookup;
use crate::tenant::TenantKey;

pub const DEFAULT_BASE_URL: &str = "https://youtube.googleapis.com/";

#[derive(Debug)]
pub struct ChannelLookupError {
  pub message: String,
}

impl std::fmt::Display for ChannelLookupError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "channel lookup error: {}", self.message)
  }
}

impl std::error::Error for ChannelLookupError {}

fn lookup_err(e: impl std::fmt::Display) -> ChannelLookupError {
  ChannelLookupError {
    message: e.to_string(),
  }
}

fn build_hub(
  access_token: &str,
  base_url: &str,
) -> Result<
  YouTube<hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>>,
  ChannelLookupError,
> {
  let connector = hyper_rustls::HttpsConnectorBuilder::new()
    .with_native_roots()
    .map_err(lookup_err)?
    .https_or_http()
    .enable_http1()
    .build();

  let client =
    hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new()).build(connector);

  let mut hub = YouTube::new(client, access_token.to_string());
  hub.base_url(base_url.to_string());
  hub.root_url(base_url.to_string());
  Ok(hub)
}

/// Channel creation date for the token's own channel, or for one specific
/// channel id. `Ok(None)` means the API answered but listed no channel.
pub async fn fetch_channel_created_date_with_base_url(
  access_token: &str,
  base_url: &str,
  channel_id: Option<&str>,
) -> Result<Option<NaiveDate>, ChannelLookupError> {
  let hub = build_hub(access_token, base_url)?;

  let mut call = hub.channels().list(&vec!["snippet".into()]).max_results(1);
  call = match channel_id {
    Some(id) if !id.trim().is_empty() => call.add_id(id.trim()),
    _ => call.mine(true),
  };

  let (_, response) = call.doit().await.map_err(lookup_err)?;

  Ok(
    response
      .items
      .unwrap_or_default()
      .into_iter()
      .find_map(|c| c.snippet.and_then(|s| s.published_at))
      .map(|published| published.date_naive()),
  )
}

pub async fn fetch_channel_created_date(
  access_token: &str,
  channel_id: Option<&str>,
) -> Result<Option<NaiveDate>, ChannelLookupError> {
  fetch_channel_created_date_with_base_url(access_token, DEFAULT_BASE_URL, channel_id).await
}

/// Earliest creation date across every channel the content owner manages.
/// Used in aggregate owner mode, where the stored series spans all of them.
pub async fn fetch_earliest_managed_channel_date_with_base_url(
  access_token: &str,
  base_url: &str,
  content_owner_id: &str,
) -> Result<Option<NaiveDate>, ChannelLookupError> {
  let hub = build_hub(access_token, base_url)?;

  let mut earliest: Option<NaiveDate> = None;
  let mut page_token: Option<String> = None;
  loop {
    let mut call = hub
      .channels()
      .list(&vec!["snippet".into()])
      .managed_by_me(true)
      .on_behalf_of_content_owner(content_owner_id)
      .max_results(50);
    if let Some(token) = &page_token {
      call = call.page_token(token);
    }

    let (_, response) = call.doit().await.map_err(lookup_err)?;

    for channel in response.items.unwrap_or_default() {
      if let Some(published) = channel.snippet.and_then(|s| s.published_at) {
        let dt = published.date_naive();
        earliest = Some(earliest.map_or(dt, |e| e.min(dt)));
      }
    }

    page_token = response.next_page_token;
    if page_token.is_none() {
      break;
    }
  }

  Ok(earliest)
}

/// `ActivityStartLookup` backed by the YouTube Data API channel snippet.
/// Lookup failures are folded to "no clamp" rather than failing the run.
#[derive(Debug, Clone)]
pub struct ChannelCreatedLookup {
  access_token: String,
  base_url: String,
  content_owner_id: Option<String>,
}

impl ChannelCreatedLookup {
  pub fn new(access_token: impl Into<String>) -> Self {
    Self::with_base_url(access_token, DEFAULT_BASE_URL)
  }

  pub fn with_base_url(access_token: impl Into<String>, base_url: impl Into<String>) -> Self {
    ChannelCreatedLookup {
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

#[async_trait]
impl ActivityStartLookup for ChannelCreatedLookup {
  async fn activity_start(&self, tenant: &TenantKey) -> Option<NaiveDate> {
    let result = match (&self.content_owner_id, tenant.is_aggregate()) {
      (Some(owner), true) => {
        fetch_earliest_managed_channel_date_with_base_url(&self.access_token, &self.base_url, owner)
          .await
      }
      _ => {
        let channel_id = (!tenant.is_aggregate()).then_some(tenant.channel_id.as_str());
        fetch_channel_created_date_with_base_url(&self.access_token, &self.base_url, channel_id)
          .await
      }
    };

    match result {
      Ok(dt) => dt,
      Err(err) => {
        tracing::warn!(
          account_tag = %tenant.account_tag,
          error = %err,
          "channel created-date lookup failed, syncing from the nominal bound"
        );
        None
      }
    }
  }
}
