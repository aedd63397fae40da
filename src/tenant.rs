/// Identifies the credential scope a sync run writes under.
///
/// `channel_id` is empty when a content-owner credential aggregates across
/// all of its managed channels; rows are then stored with `channel_id = ''`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantKey {
  pub account_tag: String,
  pub channel_id: String,
}

impl TenantKey {
  pub fn new(account_tag: impl Into<String>, channel_id: impl Into<String>) -> Self {
    TenantKey {
      account_tag: account_tag.into(),
      channel_id: channel_id.into(),
    }
  }

  pub fn aggregate(account_tag: impl Into<String>) -> Self {
    TenantKey::new(account_tag, "")
  }

  pub fn is_aggregate(&self) -> bool {
    self.channel_id.trim().is_empty()
  }
}
