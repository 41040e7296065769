use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub checker: CheckerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for decompressed EPG snapshots, one file per source URL.
    pub epg_cache_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between staleness evaluation ticks.
    pub tick_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckerConfig {
    pub ffmpeg_command: String,
    pub probe_timeout_seconds: u64,
    /// Concurrency ceiling for API-triggered visual checks.
    pub api_concurrency: usize,
    /// Concurrency ceiling for scheduler-triggered visual checks.
    pub scheduler_concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://./m3u-hub.db".to_string(),
                max_connections: Some(10),
            },
            web: WebConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                base_url: "http://localhost:8080".to_string(),
            },
            storage: StorageConfig {
                epg_cache_path: PathBuf::from("./data/epg_cache"),
            },
            scheduler: SchedulerConfig {
                tick_interval_seconds: 60,
            },
            checker: CheckerConfig {
                ffmpeg_command: "ffmpeg".to_string(),
                probe_timeout_seconds: 15,
                api_concurrency: 4,
                scheduler_concurrency: 5,
            },
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());

        if std::path::Path::new(&config_file).exists() {
            let contents = std::fs::read_to_string(&config_file)?;
            Ok(toml::from_str(&contents)?)
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::create_dir_all(&default_config.storage.epg_cache_path)?;
            std::fs::write(&config_file, contents)?;
            Ok(default_config)
        }
    }
}
