//! Filter & Rebrand Engine
//!
//! Pure pipeline that turns stored channel rows into a published playlist:
//! keyword claiming with group override, regex filtering, logo propagation,
//! and M3U serialization. Operates on copies; stored rows are never mutated.

use regex::RegexBuilder;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::models::{Channel, KeywordRule, OutputSource, MATCH_ALL_REGEX};

/// Keyword pass: each rule, in declaration order, claims matching channels
/// exactly once (first rule wins; later rules cannot reclaim). A claimed
/// channel is copied with its group overridden by the rule's target group,
/// when non-empty. With rules present, unclaimed channels are dropped; with
/// no rules, every channel passes through.
pub fn apply_keyword_rules(channels: &[Channel], rules: &[KeywordRule]) -> Vec<Channel> {
    if rules.is_empty() {
        return channels.to_vec();
    }

    let mut claimed: HashSet<Uuid> = HashSet::new();
    let mut result = Vec::new();

    for rule in rules {
        let needle = rule.value.to_lowercase();
        if needle.is_empty() {
            continue;
        }
        for channel in channels {
            if claimed.contains(&channel.id) {
                continue;
            }
            if channel.name.to_lowercase().contains(&needle) {
                let mut copy = channel.clone();
                if !rule.group.trim().is_empty() {
                    copy.group_title = Some(rule.group.trim().to_string());
                }
                result.push(copy);
                claimed.insert(channel.id);
            }
        }
    }

    result
}

/// Regex pass over channel names, case-insensitive. The match-all default
/// and empty patterns are no-ops, and so is an invalid pattern.
pub fn apply_regex_filter(channels: Vec<Channel>, pattern: &str) -> Vec<Channel> {
    if pattern.is_empty() || pattern == MATCH_ALL_REGEX {
        return channels;
    }

    match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(regex) => channels
            .into_iter()
            .filter(|c| regex.is_match(&c.name))
            .collect(),
        Err(_) => channels,
    }
}

/// Fill missing logos from channels sharing the same identity key (tvg-id
/// when present, otherwise name). First seen logo per key wins; an existing
/// logo is never overwritten, so the pass is idempotent.
pub fn propagate_logos(mut channels: Vec<Channel>) -> Vec<Channel> {
    let mut logo_by_key: HashMap<String, String> = HashMap::new();

    for channel in &channels {
        if let Some(logo) = channel.logo.as_deref().filter(|l| !l.is_empty()) {
            let key = identity_key(channel);
            logo_by_key.entry(key).or_insert_with(|| logo.to_string());
        }
    }

    for channel in &mut channels {
        if channel.logo.as_deref().map_or(true, str::is_empty) {
            if let Some(logo) = logo_by_key.get(&identity_key(channel)) {
                channel.logo = Some(logo.clone());
            }
        }
    }

    channels
}

fn identity_key(channel: &Channel) -> String {
    channel
        .tvg_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .unwrap_or(&channel.name)
        .to_string()
}

/// Serialize channels into M3U text. `tvg-name` keeps the original channel
/// name so guide matching survives rebranding; the display name gets an
/// optional `" (source)"` suffix when the owning subscription resolves.
pub fn serialize_playlist(
    channels: &[Channel],
    epg_url: Option<&str>,
    include_source_suffix: bool,
    source_names: &HashMap<Uuid, String>,
) -> String {
    let mut lines = Vec::with_capacity(channels.len() * 2 + 1);

    let header = match epg_url.filter(|u| !u.is_empty()) {
        Some(url) => format!("#EXTM3U x-tvg-url=\"{url}\""),
        None => "#EXTM3U".to_string(),
    };
    lines.push(header);

    for channel in channels {
        let suffix = if include_source_suffix {
            source_names
                .get(&channel.subscription_id)
                .map(|name| format!(" ({name})"))
                .unwrap_or_default()
        } else {
            String::new()
        };

        lines.push(format!(
            "#EXTINF:-1 tvg-id=\"{}\" tvg-name=\"{}\" tvg-logo=\"{}\" group-title=\"{}\",{}{}",
            channel.tvg_id.as_deref().unwrap_or(""),
            channel.name,
            channel.logo.as_deref().unwrap_or(""),
            channel.group_title.as_deref().unwrap_or("Default"),
            channel.name,
            suffix,
        ));
        lines.push(channel.url.clone());
    }

    lines.join("\n")
}

/// Full pipeline for one output source: keyword pass, regex pass, logo
/// propagation, serialization.
pub fn render_output(
    channels: &[Channel],
    output: &OutputSource,
    source_names: &HashMap<Uuid, String>,
) -> String {
    let selected = apply_keyword_rules(channels, &output.keywords);
    let filtered = apply_regex_filter(selected, &output.filter_regex);
    let complete = propagate_logos(filtered);
    serialize_playlist(
        &complete,
        output.epg_url.as_deref(),
        output.include_source_suffix,
        source_names,
    )
}

/// Minimal valid playlist served for a disabled output: a header plus a
/// human-readable notice, never an error status.
pub fn disabled_playlist(output_name: &str) -> String {
    format!("#EXTM3U\n# Output source '{output_name}' is currently disabled")
}
