use anyhow::{bail, Context, Result};
use clap::Parser;
use lib_channels::{channel_url, BackoffKind, ChannelConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_FILE: &str = "ws_tail.conf";
const DEFAULT_PAGE_URL: &str = "http://localhost:8080";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Follow logical push channels and log everything they deliver", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "WS_TAIL_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "WS_TAIL_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "WS_TAIL_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "WS_TAIL_PAGE_URL", help = "Page URL channel URLs are derived from (http/https maps to ws/wss).")]
    pub page_url: Option<String>,

    #[clap(
        long = "channel",
        env = "WS_TAIL_CHANNELS",
        value_delimiter = ',',
        help = "Channel to follow: ID, ID=SEGMENT or ID=ws(s)://URL. Repeatable."
    )]
    pub channels: Option<Vec<String>>,

    #[clap(long, env = "WS_TAIL_ACTION", help = "Action sent as {action, payload} every time a channel opens.")]
    pub action: Option<String>,

    #[clap(long, env = "WS_TAIL_PAYLOAD", help = "JSON payload sent with --action.")]
    pub payload: Option<String>,

    #[clap(long, env = "WS_TAIL_RECONNECT_INTERVAL_MS", help = "Delay in milliseconds between reconnect attempts.")]
    pub reconnect_interval_ms: Option<u64>,

    #[clap(long, env = "WS_TAIL_MAX_RECONNECT_ATTEMPTS", help = "Reconnect attempts before a channel gives up.")]
    pub max_reconnect_attempts: Option<u32>,

    #[clap(long, env = "WS_TAIL_BACKOFF", help = "Reconnect delay policy: fixed or exponential.")]
    pub backoff: Option<String>,

    #[clap(long, env = "WS_TAIL_MAX_RECONNECT_DELAY_MS", help = "Upper bound in milliseconds for exponential backoff.")]
    pub max_reconnect_delay_ms: Option<u64>,

    #[clap(long, env = "WS_TAIL_JITTER", help = "Randomize exponential backoff delays (true/false).")]
    pub jitter: Option<bool>,

    #[clap(long, env = "WS_TAIL_HEARTBEAT_INTERVAL_MS", help = "Send an application ping this often while open.")]
    pub heartbeat_interval_ms: Option<u64>,

    #[clap(long, env = "WS_TAIL_INACTIVITY_TIMEOUT_MS", help = "Reconnect when nothing arrives for this long.")]
    pub inactivity_timeout_ms: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            page_url: other.page_url.or(self.page_url),
            channels: other.channels.or(self.channels),
            action: other.action.or(self.action),
            payload: other.payload.or(self.payload),
            reconnect_interval_ms: other.reconnect_interval_ms.or(self.reconnect_interval_ms),
            max_reconnect_attempts: other.max_reconnect_attempts.or(self.max_reconnect_attempts),
            backoff: other.backoff.or(self.backoff),
            max_reconnect_delay_ms: other.max_reconnect_delay_ms.or(self.max_reconnect_delay_ms),
            jitter: other.jitter.or(self.jitter),
            heartbeat_interval_ms: other.heartbeat_interval_ms.or(self.heartbeat_interval_ms),
            inactivity_timeout_ms: other.inactivity_timeout_ms.or(self.inactivity_timeout_ms),
        }
    }

    fn defaults() -> Config {
        let channel = ChannelConfig::default();
        Config {
            log_dir: Some(default_log_dir()),
            log_level: Some("info".to_string()),
            page_url: Some(DEFAULT_PAGE_URL.to_string()),
            reconnect_interval_ms: Some(channel.reconnect_interval_ms),
            max_reconnect_attempts: Some(channel.max_reconnect_attempts),
            backoff: Some("fixed".to_string()),
            max_reconnect_delay_ms: Some(channel.max_reconnect_delay_ms),
            jitter: Some(channel.jitter),
            ..Default::default()
        }
    }
}

fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("ws-tail").join("logs"))
        .unwrap_or_else(|| PathBuf::from("./logs"))
}

/// One channel to follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTarget {
    pub id: String,
    pub url: String,
}

/// Fully resolved settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub log_dir: PathBuf,
    pub log_level: String,
    pub channels: Vec<ChannelTarget>,
    pub action: Option<String>,
    pub payload: serde_json::Value,
    pub channel: ChannelConfig,
}

pub fn load_config() -> Result<Settings> {
    resolve(Config::parse())
}

/// Layers defaults, the JSON config file and the command line (which already
/// includes environment variables), in that order.
pub fn resolve(cli: Config) -> Result<Settings> {
    let mut current = Config::defaults();

    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    if config_file_path.exists() {
        let raw = fs::read_to_string(&config_file_path)
            .with_context(|| format!("Failed to read config file {}", config_file_path.display()))?;
        let file_config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", config_file_path.display()))?;
        current = current.merge(file_config);
    } else if cli.config_path.is_some() {
        bail!("Config file not found: {}", config_file_path.display());
    }

    current = current.merge(cli);
    current.into_settings()
}

impl Config {
    fn into_settings(self) -> Result<Settings> {
        let page_url = self.page_url.unwrap_or_else(|| DEFAULT_PAGE_URL.to_string());

        let channels = self
            .channels
            .unwrap_or_default()
            .iter()
            .map(|raw| parse_target(raw, &page_url))
            .collect::<Result<Vec<_>>>()?;
        if channels.is_empty() {
            bail!("No channels given; use --channel ID[=SEGMENT|URL]");
        }

        let payload = match self.payload {
            Some(raw) => serde_json::from_str(&raw).context("--payload is not valid JSON")?,
            None => serde_json::Value::Null,
        };

        let backoff = match self.backoff.as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("fixed") => BackoffKind::Fixed,
            Some("exponential") => BackoffKind::Exponential,
            Some(other) => bail!("Unknown backoff '{}', expected fixed or exponential", other),
        };

        let defaults = ChannelConfig::default();
        let channel = ChannelConfig {
            reconnect_interval_ms: self.reconnect_interval_ms.unwrap_or(defaults.reconnect_interval_ms),
            max_reconnect_attempts: self.max_reconnect_attempts.unwrap_or(defaults.max_reconnect_attempts),
            backoff,
            max_reconnect_delay_ms: self.max_reconnect_delay_ms.unwrap_or(defaults.max_reconnect_delay_ms),
            jitter: self.jitter.unwrap_or(defaults.jitter),
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            inactivity_timeout_ms: self.inactivity_timeout_ms,
        };
        channel.validate()?;

        Ok(Settings {
            log_dir: self.log_dir.unwrap_or_else(default_log_dir),
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
            channels,
            action: self.action,
            payload,
            channel,
        })
    }
}

/// `ID`, `ID=SEGMENT` or `ID=ws(s)://...`.
fn parse_target(raw: &str, page_url: &str) -> Result<ChannelTarget> {
    let (id, rest) = match raw.split_once('=') {
        Some((id, rest)) => (id.trim(), Some(rest.trim())),
        None => (raw.trim(), None),
    };
    if id.is_empty() {
        bail!("Channel '{}' has an empty id", raw);
    }

    let url = match rest {
        Some(url) if url.starts_with("ws://") || url.starts_with("wss://") => url.to_string(),
        Some(segment) => channel_url(page_url, Some(segment))?.to_string(),
        None => channel_url(page_url, Some(id))?.to_string(),
    };

    Ok(ChannelTarget { id: id.to_string(), url })
}
