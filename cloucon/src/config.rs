//! Configuration model. One JSON file describes the shared settings plus a
//! settings block per reader id; the engine process is started for exactly
//! one of the ids in `readers-list`.

use std::fmt;
use std::fs;
use std::path::Path;

use hashbrown::HashMap;
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    UnknownReader(String),
    MissingSettings(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io(text) => write!(f, "can not open config: {}", text),
            ConfigError::Parse(text) => write!(f, "can not decode config JSON: {}", text),
            ConfigError::UnknownReader(rid) => {
                write!(f, "reader id '{}' not present in readers-list", rid)
            }
            ConfigError::MissingSettings(rid) => {
                write!(f, "reader id '{}' has no settings block", rid)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReaderMode {
    /// The reader dials in; the engine listens and accepts.
    Client,
    /// The reader listens; the engine dials out.
    Server,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    pub host: String,
    pub port: u16,
    #[serde(rename = "reader-mode")]
    pub reader_mode: ReaderMode,
    #[serde(rename = "sock-timeout")]
    pub sock_timeout: f64,
    #[serde(rename = "parse-limit")]
    pub parse_limit: usize,
    #[serde(rename = "ntp-check-interval")]
    pub ntp_check_interval: f64,
    #[serde(rename = "log-tag-frames")]
    pub log_tag_frames: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "log-dir")]
    pub log_dir: String,
    #[serde(rename = "cmds-dir")]
    pub cmds_dir: String,
    #[serde(rename = "clou-run")]
    pub clou_run: String,
    #[serde(rename = "readers-list")]
    pub readers_list: Vec<String>,
    #[serde(rename = "reply-from-reader-timeout")]
    pub reply_from_reader_timeout: f64,
    #[serde(rename = "delay-between-reads")]
    pub delay_between_reads: f64,
    #[serde(rename = "ntp-service-url")]
    pub ntp_service_url: String,
    #[serde(rename = "max-server-time-offset")]
    pub max_server_time_offset: f64,
    #[serde(rename = "reader-no-life-timeout")]
    pub reader_no_life_timeout: f64,
    #[serde(rename = "tag-param-duplicate-exclude")]
    pub tag_param_duplicate_exclude: Vec<String>,
    #[serde(flatten)]
    pub readers: HashMap<String, ReaderConfig>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let file = fs::File::open(path)
            .map_err(|err| ConfigError::Io(format!("{}: {}", path.display(), err)))?;
        serde_json::from_reader(file)
            .map_err(|err| ConfigError::Parse(format!("{}: {}", path.display(), err)))
    }

    /// Settings block for one reader id; the id must be listed and have a
    /// block of its own.
    pub fn reader_settings(&self, rid: &str) -> Result<&ReaderConfig, ConfigError> {
        if !self.readers_list.iter().any(|entry| entry == rid) {
            return Err(ConfigError::UnknownReader(rid.to_string()));
        }
        self.readers
            .get(rid)
            .ok_or_else(|| ConfigError::MissingSettings(rid.to_string()))
    }
}
