//! Two-tier EPG cache
//!
//! Maps an EPG source URL to a parsed program index. The memory index and
//! the on-disk snapshot each have an independent one-hour TTL, so a disk hit
//! can satisfy a cold memory cache without a network round trip. A single
//! mutex serializes the whole check-TTL-then-rebuild sequence, so concurrent
//! lookups for an expired URL trigger exactly one rebuild.

use chrono::Utc;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Both the memory index and the disk snapshot go stale after an hour.
const MEMORY_TTL_SECS: i64 = 3600;
const DISK_TTL_SECS: u64 = 3600;
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of a "what is airing now" lookup. The three failure sentinels are
/// deliberately distinct so callers can tell an empty guide from a broken
/// source.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgramLookup {
    Found(String),
    NoProgram,
    FetchFailed,
    ParseError,
}

impl ProgramLookup {
    pub fn describe(&self) -> String {
        match self {
            ProgramLookup::Found(title) => title.clone(),
            ProgramLookup::NoProgram => "No Program Info".to_string(),
            ProgramLookup::FetchFailed => "Fetch Failed".to_string(),
            ProgramLookup::ParseError => "Parse Error".to_string(),
        }
    }
}

/// One scheduled program; start/stop are 14-digit UTC-comparable strings
/// (`YYYYMMDDHHMMSS`), truncated from the guide's timestamp attributes.
#[derive(Debug, Clone)]
struct EpgProgram {
    start: String,
    stop: String,
    title: String,
}

#[derive(Debug)]
struct EpgEntry {
    fetched_at: i64,
    programs: HashMap<String, Vec<EpgProgram>>,
    /// display-name -> channel id; last seen id wins on duplicate names.
    name_map: HashMap<String, String>,
}

enum BuildError {
    Fetch,
    Parse,
}

pub struct EpgCache {
    client: reqwest::Client,
    cache_dir: PathBuf,
    inner: Mutex<HashMap<String, EpgEntry>>,
}

impl EpgCache {
    pub fn new(cache_dir: PathBuf) -> Self {
        if let Err(e) = std::fs::create_dir_all(&cache_dir) {
            warn!(
                "Failed to create EPG cache directory {}: {}",
                cache_dir.display(),
                e
            );
        }
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            cache_dir,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Look up the currently airing program for a channel identity.
    ///
    /// `force_refresh` treats the entry as absent and re-downloads the guide
    /// bypassing the disk snapshot. A build failure never evicts an existing
    /// entry; it only surfaces as a sentinel for this lookup.
    pub async fn current_program(
        &self,
        epg_url: &str,
        channel_id: Option<&str>,
        channel_name: Option<&str>,
        force_refresh: bool,
    ) -> ProgramLookup {
        let key = url_key(epg_url);
        let now_ts = Utc::now().timestamp();
        let now_str = now_string();

        let mut cache = self.inner.lock().await;

        if !force_refresh {
            if let Some(entry) = cache.get(&key) {
                if now_ts - entry.fetched_at < MEMORY_TTL_SECS {
                    return lookup_in(entry, channel_id, channel_name, &now_str);
                }
            }
        }

        match self.build_entry(epg_url, force_refresh).await {
            Ok(entry) => {
                let result = lookup_in(&entry, channel_id, channel_name, &now_str);
                cache.insert(key, entry);
                result
            }
            Err(BuildError::Fetch) => ProgramLookup::FetchFailed,
            Err(BuildError::Parse) => ProgramLookup::ParseError,
        }
    }

    /// Force-rebuild the cache entry for a URL, re-downloading the guide.
    /// Used by the scheduler's EPG refresh step.
    pub async fn refresh(&self, epg_url: &str) -> anyhow::Result<()> {
        let key = url_key(epg_url);
        let mut cache = self.inner.lock().await;
        match self.build_entry(epg_url, true).await {
            Ok(entry) => {
                info!(
                    "Refreshed EPG index for {} ({} channels)",
                    epg_url,
                    entry.programs.len()
                );
                cache.insert(key, entry);
                Ok(())
            }
            Err(BuildError::Fetch) => Err(anyhow::anyhow!("EPG fetch failed for {epg_url}")),
            Err(BuildError::Parse) => Err(anyhow::anyhow!("EPG parse failed for {epg_url}")),
        }
    }

    fn snapshot_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{key}.xml"))
    }

    /// Build an index for a URL: parse a fresh disk snapshot if one exists,
    /// otherwise download (decompressing gzip framing), snapshot to disk,
    /// and parse.
    async fn build_entry(&self, epg_url: &str, force_refresh: bool) -> Result<EpgEntry, BuildError> {
        let key = url_key(epg_url);
        let path = self.snapshot_path(&key);

        let content = if !force_refresh && snapshot_is_fresh(&path) {
            debug!("EPG disk snapshot hit for {}", epg_url);
            std::fs::read_to_string(&path).map_err(|_| BuildError::Fetch)?
        } else {
            info!("Downloading EPG guide: {}", epg_url);
            let response = self
                .client
                .get(epg_url)
                .send()
                .await
                .map_err(|_| BuildError::Fetch)?;
            if !response.status().is_success() {
                return Err(BuildError::Fetch);
            }
            let body = response.bytes().await.map_err(|_| BuildError::Fetch)?;
            let xml = decompress_if_gzip(epg_url, &body);
            let content = String::from_utf8_lossy(&xml).into_owned();
            if let Err(e) = std::fs::write(&path, &content) {
                warn!("Failed to write EPG snapshot {}: {}", path.display(), e);
            }
            content
        };

        let entry = parse_guide(&content).ok_or(BuildError::Parse)?;
        Ok(entry)
    }

    #[cfg(test)]
    async fn backdate_entry(&self, epg_url: &str, seconds: i64) {
        let key = url_key(epg_url);
        if let Some(entry) = self.inner.lock().await.get_mut(&key) {
            entry.fetched_at -= seconds;
        }
    }
}

fn url_key(url: &str) -> String {
    format!("{:x}", md5::compute(url.as_bytes()))
}

fn now_string() -> String {
    Utc::now().format("%Y%m%d%H%M%S").to_string()
}

fn snapshot_is_fresh(path: &std::path::Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = metadata.modified() else {
        return false;
    };
    match modified.elapsed() {
        Ok(age) => age.as_secs() < DISK_TTL_SECS,
        Err(_) => true, // mtime in the future counts as fresh
    }
}

/// Gzip framing is detected by the `.gz` extension or the magic bytes.
fn decompress_if_gzip(url: &str, body: &[u8]) -> Vec<u8> {
    let looks_gzipped = url.ends_with(".gz") || body.starts_with(&[0x1f, 0x8b]);
    if !looks_gzipped {
        return body.to_vec();
    }

    use std::io::Read;
    let mut decoder = flate2::read::GzDecoder::new(body);
    let mut decompressed = Vec::new();
    match decoder.read_to_end(&mut decompressed) {
        Ok(_) => decompressed,
        Err(e) => {
            warn!("Gzip decompression failed for {}: {}", url, e);
            body.to_vec()
        }
    }
}

/// Streaming XMLTV parse into a program index plus a display-name map.
fn parse_guide(content: &str) -> Option<EpgEntry> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut programs: HashMap<String, Vec<EpgProgram>> = HashMap::new();
    let mut name_map: HashMap<String, String> = HashMap::new();

    let mut current_channel_id: Option<String> = None;
    let mut current_program: Option<(String, EpgProgram)> = None;
    let mut element_stack: Vec<String> = Vec::new();
    let mut current_text = String::new();
    let mut saw_tv_root = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                match name.as_str() {
                    "tv" => saw_tv_root = true,
                    "channel" => {
                        current_channel_id = attribute(e, "id");
                    }
                    "programme" => {
                        let channel = attribute(e, "channel").unwrap_or_default();
                        let start = truncate14(attribute(e, "start").unwrap_or_default());
                        let stop = truncate14(attribute(e, "stop").unwrap_or_default());
                        current_program = Some((
                            channel,
                            EpgProgram {
                                start,
                                stop,
                                title: String::new(),
                            },
                        ));
                    }
                    _ => {}
                }
                element_stack.push(name);
                current_text.clear();
            }
            Ok(Event::End(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                match name.as_str() {
                    "display-name" => {
                        // Inside <channel>: map the display name to the id.
                        if element_stack.iter().rev().nth(1).map(String::as_str)
                            == Some("channel")
                        {
                            if let Some(id) = &current_channel_id {
                                let display = current_text.trim();
                                if !display.is_empty() {
                                    name_map.insert(display.to_string(), id.clone());
                                }
                            }
                        }
                    }
                    "title" => {
                        if let Some((_, program)) = current_program.as_mut() {
                            if program.title.is_empty() {
                                program.title = current_text.trim().to_string();
                            }
                        }
                    }
                    "channel" => current_channel_id = None,
                    "programme" => {
                        if let Some((channel, program)) = current_program.take() {
                            if !channel.is_empty()
                                && !program.start.is_empty()
                                && !program.stop.is_empty()
                            {
                                programs.entry(channel).or_default().push(program);
                            }
                        }
                    }
                    _ => {}
                }
                element_stack.pop();
                current_text.clear();
            }
            Ok(Event::Text(e)) => {
                current_text.push_str(&String::from_utf8_lossy(&e));
            }
            Ok(Event::CData(e)) => {
                current_text.push_str(&String::from_utf8_lossy(&e));
            }
            Ok(Event::Eof) => break,
            Err(_) => return None,
            _ => {}
        }
    }

    if !saw_tv_root {
        return None;
    }

    Some(EpgEntry {
        fetched_at: Utc::now().timestamp(),
        programs,
        name_map,
    })
}

fn attribute(element: &BytesStart, name: &str) -> Option<String> {
    element.attributes().flatten().find_map(|attr| {
        if attr.key.as_ref() == name.as_bytes() {
            Some(String::from_utf8_lossy(&attr.value).into_owned())
        } else {
            None
        }
    })
}

/// Guide timestamps carry a timezone suffix (`20240101120000 +0000`);
/// comparisons use the fixed-width 14-digit prefix only.
fn truncate14(value: String) -> String {
    value.chars().take(14).collect()
}

/// Resolve the candidate identity set and return the first program whose
/// `[start, stop]` window contains `now` (inclusive both ends).
fn lookup_in(
    entry: &EpgEntry,
    channel_id: Option<&str>,
    channel_name: Option<&str>,
    now_str: &str,
) -> ProgramLookup {
    let add = |candidate: Option<&str>, list: &mut Vec<String>| {
        if let Some(c) = candidate {
            let trimmed = c.trim();
            if !trimmed.is_empty() && !list.iter().any(|existing| existing == trimmed) {
                list.push(trimmed.to_string());
            }
        }
    };

    let mut ids: Vec<String> = Vec::new();
    add(channel_id, &mut ids);
    add(channel_name, &mut ids);
    add(
        channel_name.and_then(|n| entry.name_map.get(n.trim()).map(String::as_str)),
        &mut ids,
    );
    add(
        channel_id.and_then(|i| entry.name_map.get(i.trim()).map(String::as_str)),
        &mut ids,
    );

    for id in &ids {
        if let Some(programs) = entry.programs.get(id) {
            for program in programs {
                if program.start.as_str() <= now_str && now_str <= program.stop.as_str() {
                    return ProgramLookup::Found(program.title.clone());
                }
            }
        }
    }

    ProgramLookup::NoProgram
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUIDE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<tv>
  <channel id="bbc1">
    <display-name>BBC One</display-name>
  </channel>
  <channel id="bbc1.alt">
    <display-name>BBC One</display-name>
  </channel>
  <programme start="20240101100000 +0000" stop="20240101110000 +0000" channel="bbc1">
    <title>Morning Show</title>
  </programme>
  <programme start="20240101110000 +0000" stop="20240101120000 +0000" channel="bbc1">
    <title>Midday News</title>
  </programme>
  <programme start="20240101100000 +0000" stop="20240101110000 +0000" channel="bbc1.alt">
    <title>Alt Morning</title>
  </programme>
</tv>"#;

    fn entry() -> EpgEntry {
        parse_guide(GUIDE).expect("guide parses")
    }

    #[test]
    fn parse_builds_program_index_and_name_map() {
        let entry = entry();
        assert_eq!(entry.programs["bbc1"].len(), 2);
        assert_eq!(entry.programs["bbc1"][0].title, "Morning Show");
        assert_eq!(entry.programs["bbc1"][0].start, "20240101100000");
        // Duplicate display names resolve to the last seen id.
        assert_eq!(entry.name_map["BBC One"], "bbc1.alt");
    }

    #[test]
    fn program_window_is_inclusive_at_both_boundaries() {
        let entry = entry();
        for now in ["20240101100000", "20240101105959", "20240101110000"] {
            let result = lookup_in(&entry, Some("bbc1"), None, now);
            assert!(
                matches!(result, ProgramLookup::Found(_)),
                "expected a program at {now}"
            );
        }
        // start == now for the first program
        assert_eq!(
            lookup_in(&entry, Some("bbc1"), None, "20240101100000"),
            ProgramLookup::Found("Morning Show".to_string())
        );
        // stop == now still matches the first program (inclusive stop)
        assert_eq!(
            lookup_in(&entry, Some("bbc1"), None, "20240101110000"),
            ProgramLookup::Found("Morning Show".to_string())
        );
    }

    #[test]
    fn lookup_falls_back_to_display_name_resolution() {
        let entry = entry();
        let result = lookup_in(&entry, None, Some("BBC One"), "20240101103000");
        // Direct name has no programs; the name map resolves to bbc1.alt.
        assert_eq!(result, ProgramLookup::Found("Alt Morning".to_string()));
    }

    #[test]
    fn no_matching_window_returns_the_no_program_sentinel() {
        let entry = entry();
        assert_eq!(
            lookup_in(&entry, Some("bbc1"), None, "20240101230000"),
            ProgramLookup::NoProgram
        );
        assert_eq!(
            lookup_in(&entry, Some("unknown"), None, "20240101103000"),
            ProgramLookup::NoProgram
        );
    }

    #[test]
    fn malformed_guide_is_a_parse_error() {
        assert!(parse_guide("this is not xml at all").is_none());
        assert!(parse_guide("<html><body>oops</body></html>").is_none());
    }

    #[test]
    fn gzip_payloads_are_detected_by_magic_bytes() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(GUIDE.as_bytes()).unwrap();
        let gzipped = encoder.finish().unwrap();

        let plain = decompress_if_gzip("http://example.com/guide.xml", &gzipped);
        assert_eq!(plain, GUIDE.as_bytes());
    }

    #[tokio::test]
    async fn disk_snapshot_satisfies_a_cold_memory_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EpgCache::new(dir.path().to_path_buf());
        let url = "http://epg.invalid/guide.xml";

        // Seed a fresh snapshot; no network is available for this URL.
        std::fs::write(cache.snapshot_path(&url_key(url)), GUIDE).unwrap();

        let result = cache.current_program(url, Some("bbc1"), None, false).await;
        // Whatever "now" is, the entry built from disk answers the lookup.
        assert_ne!(result, ProgramLookup::FetchFailed);
        assert_ne!(result, ProgramLookup::ParseError);
    }

    #[tokio::test]
    async fn fresh_memory_entry_answers_without_touching_disk_or_network() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EpgCache::new(dir.path().to_path_buf());
        let url = "http://epg.invalid/guide.xml";
        let path = cache.snapshot_path(&url_key(url));

        std::fs::write(&path, GUIDE).unwrap();
        let first = cache.current_program(url, Some("bbc1"), None, false).await;
        assert_ne!(first, ProgramLookup::FetchFailed);

        // Remove the snapshot; a rebuild would now need the network and fail.
        std::fs::remove_file(&path).unwrap();
        let second = cache.current_program(url, Some("bbc1"), None, false).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn expired_entry_rebuilds_once_under_concurrent_lookups() {
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(EpgCache::new(dir.path().to_path_buf()));
        let url = "http://epg.invalid/guide.xml";
        let path = cache.snapshot_path(&url_key(url));

        std::fs::write(&path, GUIDE).unwrap();
        let _ = cache.current_program(url, Some("bbc1"), None, false).await;
        cache.backdate_entry(url, MEMORY_TTL_SECS + 10).await;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.current_program(url, Some("bbc1"), None, false).await
            }));
        }
        for handle in handles {
            let result = handle.await.unwrap();
            assert_ne!(result, ProgramLookup::FetchFailed);
        }

        // The first caller rebuilt from disk; everyone after hit memory.
        // With the snapshot gone, a further lookup still answers from the
        // rebuilt entry, proving no additional rebuilds are needed.
        std::fs::remove_file(&path).unwrap();
        let after = cache.current_program(url, Some("bbc1"), None, false).await;
        assert_ne!(after, ProgramLookup::FetchFailed);
    }

    #[tokio::test]
    async fn failed_rebuild_does_not_evict_an_existing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EpgCache::new(dir.path().to_path_buf());
        let url = "http://epg.invalid/guide.xml";
        let path = cache.snapshot_path(&url_key(url));

        std::fs::write(&path, GUIDE).unwrap();
        let _ = cache.current_program(url, Some("bbc1"), None, false).await;

        // Force refresh with no reachable source: the lookup fails but the
        // stale entry must survive for non-forced callers.
        std::fs::remove_file(&path).unwrap();
        let forced = cache.current_program(url, Some("bbc1"), None, true).await;
        assert_eq!(forced, ProgramLookup::FetchFailed);

        let normal = cache.current_program(url, Some("bbc1"), None, false).await;
        assert_ne!(normal, ProgramLookup::FetchFailed);
    }
}
