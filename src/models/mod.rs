use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A configured remote channel-list source.
///
/// The `url` field may hold several locators separated by commas; they are
/// fetched in order and their channels merged. `last_updated` is `None` until
/// the first successful refresh, which the scheduler treats as infinitely
/// stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub user_agent: String,
    /// Extra request headers as a JSON object string.
    pub headers: String,
    pub auto_update_minutes: i64,
    pub is_enabled: bool,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_update_status: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One playable entry belonging to a subscription.
///
/// Channels are replaced wholesale on every refresh; the visual-check fields
/// survive only until the next refresh rewrites the rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub name: String,
    pub url: String,
    pub group_title: Option<String>,
    pub logo: Option<String>,
    pub tvg_id: Option<String>,
    pub is_enabled: bool,
    pub check_status: Option<bool>,
    pub check_date: Option<DateTime<Utc>>,
    /// Captured frame as a `data:image/jpeg;base64,...` URI.
    pub check_image: Option<String>,
    pub check_error: Option<String>,
}

/// Parsed playlist entry before it is attached to a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDraft {
    pub name: String,
    pub url: String,
    pub group_title: Option<String>,
    pub logo: Option<String>,
    pub tvg_id: Option<String>,
}

/// A named, filtered aggregate view over the channels of its referenced
/// subscriptions, published at a stable slug. Owns no channels itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSource {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    /// Referenced subscription ids, order preserved. Ids of deleted
    /// subscriptions are tolerated and skipped.
    pub subscription_ids: Vec<Uuid>,
    pub filter_regex: String,
    pub keywords: Vec<KeywordRule>,
    pub epg_url: Option<String>,
    pub include_source_suffix: bool,
    pub auto_update_minutes: i64,
    pub auto_visual_check: bool,
    pub is_enabled: bool,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_update_status: Option<String>,
    pub last_request_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One keyword-to-group rewrite rule. An empty `group` keeps the channel's
/// original group label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordRule {
    pub value: String,
    #[serde(default)]
    pub group: String,
}

/// Accepts both the fixed-shape rule object and the legacy bare-string form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum KeywordInput {
    Plain(String),
    Rule(KeywordRule),
}

impl KeywordInput {
    pub fn normalize(self) -> KeywordRule {
        match self {
            KeywordInput::Plain(value) => KeywordRule {
                value,
                group: String::new(),
            },
            KeywordInput::Rule(rule) => rule,
        }
    }
}

/// Normalize a mixed list of keyword payloads, dropping empty values.
pub fn normalize_keywords(inputs: Vec<KeywordInput>) -> Vec<KeywordRule> {
    inputs
        .into_iter()
        .map(KeywordInput::normalize)
        .filter(|rule| !rule.value.trim().is_empty())
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionCreateRequest {
    pub name: String,
    pub url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_headers")]
    pub headers: String,
    #[serde(default)]
    pub auto_update_minutes: i64,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionUpdateRequest {
    pub name: String,
    pub url: String,
    pub user_agent: String,
    pub headers: String,
    pub auto_update_minutes: i64,
    pub is_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputSourceCreateRequest {
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub subscription_ids: Vec<Uuid>,
    #[serde(default = "default_filter_regex")]
    pub filter_regex: String,
    #[serde(default)]
    pub keywords: Vec<KeywordInput>,
    #[serde(default)]
    pub epg_url: Option<String>,
    #[serde(default = "default_true")]
    pub include_source_suffix: bool,
    #[serde(default)]
    pub auto_update_minutes: i64,
    #[serde(default)]
    pub auto_visual_check: bool,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputSourceUpdateRequest {
    pub name: String,
    pub slug: String,
    pub subscription_ids: Vec<Uuid>,
    pub filter_regex: String,
    pub keywords: Vec<KeywordInput>,
    pub epg_url: Option<String>,
    pub include_source_suffix: bool,
    pub auto_update_minutes: i64,
    pub auto_visual_check: bool,
    pub is_enabled: bool,
}

fn default_user_agent() -> String {
    "Mozilla/5.0".to_string()
}

fn default_headers() -> String {
    "{}".to_string()
}

fn default_filter_regex() -> String {
    ".*".to_string()
}

fn default_true() -> bool {
    true
}

/// The default regex means "match everything" and disables the regex pass.
pub const MATCH_ALL_REGEX: &str = ".*";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_string_keyword_promotes_to_rule_with_empty_group() {
        let inputs: Vec<KeywordInput> =
            serde_json::from_str(r#"["news", {"value": "sport", "group": "Sports"}]"#).unwrap();
        let rules = normalize_keywords(inputs);
        assert_eq!(
            rules,
            vec![
                KeywordRule {
                    value: "news".to_string(),
                    group: String::new()
                },
                KeywordRule {
                    value: "sport".to_string(),
                    group: "Sports".to_string()
                },
            ]
        );
    }

    #[test]
    fn empty_keyword_values_are_dropped() {
        let inputs: Vec<KeywordInput> = serde_json::from_str(r#"["", "  ", "kids"]"#).unwrap();
        let rules = normalize_keywords(inputs);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].value, "kids");
    }
}
