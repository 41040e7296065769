use tracing::debug;

use crate::models::ChannelDraft;

/// Prefixes accepted as playable entry URLs on continuation lines.
const URL_PREFIXES: &[&str] = &["http", "rtmp", "rtp", "udp", "mms", "p3p"];

/// Parse raw M3U playlist text into channel drafts.
///
/// Handles `#EXTINF` metadata lines followed by a URL line, and bare URL
/// lines without metadata (named by their last path segment).
pub fn parse_playlist(content: &str) -> Vec<ChannelDraft> {
    let mut channels = Vec::new();
    let mut pending: Option<ChannelDraft> = None;

    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with("#EXTINF:") {
            pending = Some(parse_extinf_line(line));
        } else if URL_PREFIXES.iter().any(|p| line.starts_with(p)) {
            match pending.take() {
                Some(mut draft) => {
                    draft.url = line.to_string();
                    channels.push(draft);
                }
                None => {
                    // Bare URL without metadata
                    let name = line.rsplit('/').next().unwrap_or(line).to_string();
                    channels.push(ChannelDraft {
                        name,
                        url: line.to_string(),
                        group_title: None,
                        logo: None,
                        tvg_id: None,
                    });
                }
            }
        }
    }

    debug!("Parsed {} channels from playlist", channels.len());
    channels
}

/// Parse one `#EXTINF` line: quoted attributes, then the display name after
/// the last comma. The URL is filled in by the caller.
fn parse_extinf_line(line: &str) -> ChannelDraft {
    let (attributes_part, name) = match line.rfind(',') {
        Some(comma_pos) => (
            &line[..comma_pos],
            line[comma_pos + 1..].trim().to_string(),
        ),
        None => (line, String::new()),
    };

    let mut group_title = None;
    let mut logo = None;
    let mut tvg_id = None;

    for (key, value) in parse_attributes(attributes_part) {
        match key.as_str() {
            "group-title" => group_title = non_empty(value),
            "tvg-logo" => logo = non_empty(value),
            "tvg-id" => tvg_id = non_empty(value),
            _ => {}
        }
    }

    ChannelDraft {
        name: if name.is_empty() {
            "Unknown".to_string()
        } else {
            name
        },
        url: String::new(),
        group_title,
        logo,
        tvg_id,
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Extract `key="value"` pairs from an EXTINF attribute section.
fn parse_attributes(attributes: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let mut current_key = String::new();
    let mut current_value = String::new();
    let mut in_quotes = false;
    let mut in_value = false;

    for ch in attributes.chars() {
        match ch {
            '"' if in_value => {
                if in_quotes {
                    attrs.push((current_key.trim().to_string(), current_value.clone()));
                    current_key.clear();
                    current_value.clear();
                    in_value = false;
                }
                in_quotes = !in_quotes;
            }
            '=' if !in_quotes && !in_value => in_value = true,
            ' ' | '\t' if !in_quotes => {
                if !in_value {
                    current_key.clear();
                }
            }
            _ => {
                if in_value {
                    current_value.push(ch);
                } else {
                    current_key.push(ch);
                }
            }
        }
    }

    attrs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_extinf_entries_with_attributes() {
        let content = r#"#EXTM3U
#EXTINF:-1 tvg-id="bbc1" tvg-logo="http://logo/bbc.png" group-title="UK",BBC One
http://example.com/bbc1.m3u8
#EXTINF:-1,Plain Channel
http://example.com/plain.ts
"#;
        let channels = parse_playlist(content);
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].name, "BBC One");
        assert_eq!(channels[0].tvg_id.as_deref(), Some("bbc1"));
        assert_eq!(channels[0].logo.as_deref(), Some("http://logo/bbc.png"));
        assert_eq!(channels[0].group_title.as_deref(), Some("UK"));
        assert_eq!(channels[0].url, "http://example.com/bbc1.m3u8");
        assert_eq!(channels[1].name, "Plain Channel");
        assert!(channels[1].tvg_id.is_none());
    }

    #[test]
    fn bare_urls_become_channels_named_by_last_segment() {
        let content = "http://example.com/streams/sports.m3u8\nudp://239.0.0.1:1234\n";
        let channels = parse_playlist(content);
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].name, "sports.m3u8");
        assert_eq!(channels[1].url, "udp://239.0.0.1:1234");
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let content = "#EXTM3U\n\n# just a comment\n";
        assert!(parse_playlist(content).is_empty());
    }

    #[test]
    fn attribute_values_may_contain_commas_and_spaces() {
        let line = r#"#EXTINF:-1 tvg-id="a.b" group-title="News, World",World News"#;
        let channels = parse_playlist(&format!("{line}\nhttp://x/1\n"));
        assert_eq!(channels[0].group_title.as_deref(), Some("News, World"));
        assert_eq!(channels[0].name, "World News");
    }
}
