use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use log::LevelFilter;
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Optional config file merged underneath the environment.
/// Read from VIDMERGE_CONFIG environment variable
/// Default: vidmerge.toml (silently skipped when absent)
pub const CONFIG_FILE_ENV: &str = "VIDMERGE_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "vidmerge.toml";

/// Bot API upload ceiling for the public server (50 MB)
pub const CLOUD_UPLOAD_LIMIT: u64 = 50 * 1024 * 1024;
/// Bot API upload ceiling for a self-hosted server (2000 MB)
pub const LOCAL_UPLOAD_LIMIT: u64 = 2000 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {key}")]
    Missing { key: &'static str },

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("failed to read configuration: {0}")]
    Source(#[from] Box<figment::Error>),
}

/// A channel or group reference as accepted in FORCE_SUB_CHANNEL:
/// either `@username` or a numeric chat id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRef {
    Id(i64),
    Username(String),
}

impl ChannelRef {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Ok(id) = raw.parse::<i64>() {
            return Some(Self::Id(id));
        }
        let name = raw
            .trim_start_matches("https://t.me/")
            .trim_start_matches("t.me/")
            .trim_start_matches('@');
        if name.is_empty() {
            None
        } else {
            Some(Self::Username(name.to_string()))
        }
    }

    /// Public `t.me` link, only available for username references.
    pub fn public_link(&self) -> Option<String> {
        match self {
            Self::Username(name) => Some(format!("https://t.me/{}", name)),
            Self::Id(_) => None,
        }
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{}", id),
            Self::Username(name) => write!(f, "@{}", name),
        }
    }
}

/// Environment values arrive pre-parsed by figment (`42` becomes a number,
/// `@chan` stays a string), so every raw field accepts any scalar.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl Scalar {
    fn into_text(self) -> String {
        match self {
            Scalar::Int(v) => v.to_string(),
            Scalar::Float(v) => v.to_string(),
            Scalar::Bool(v) => v.to_string(),
            Scalar::Text(v) => v,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    bot_token: Option<Scalar>,
    teloxide_token: Option<Scalar>,
    owner_id: Option<Scalar>,
    admins: Option<Scalar>,
    database_url: Option<Scalar>,
    database_name: Option<Scalar>,
    force_sub_channel: Option<Scalar>,
    update_channel: Option<Scalar>,
    support_group: Option<Scalar>,
    log_channel: Option<Scalar>,
    merge_log_channel: Option<Scalar>,
    authorized_chats: Option<Scalar>,
    staging_dir: Option<Scalar>,
    download_dir: Option<Scalar>,
    gofile_token: Option<Scalar>,
    gofile_api_url: Option<Scalar>,
    bot_name: Option<Scalar>,
    bot_username: Option<Scalar>,
    developer: Option<Scalar>,
    bot_api_url: Option<Scalar>,
    log_file_path: Option<Scalar>,
    log_level: Option<Scalar>,
    ffmpeg_bin: Option<Scalar>,
    ffprobe_bin: Option<Scalar>,
    merge_timeout_secs: Option<Scalar>,
    merge_preset: Option<Scalar>,
    merge_crf: Option<Scalar>,
    max_upload_bytes: Option<Scalar>,
    max_download_bytes: Option<Scalar>,
    download_max_retries: Option<Scalar>,
    delivery_max_retries: Option<Scalar>,
    session_idle_timeout_secs: Option<Scalar>,
    session_sweep_interval_secs: Option<Scalar>,
    broadcast_delay_ms: Option<Scalar>,
    request_timeout_secs: Option<Scalar>,
}

/// Typed runtime configuration, built once at startup.
#[derive(Debug)]
pub struct Settings {
    pub bot_token: SecretString,
    pub owner_id: i64,
    /// Configured admins. The owner is always treated as an admin too.
    pub admin_ids: BTreeSet<i64>,
    pub database_url: String,
    /// Kept for compatibility with older deployments; only logged.
    pub database_name: Option<String>,
    pub force_sub_channel: Option<ChannelRef>,
    pub update_channel: Option<String>,
    pub support_group: Option<String>,
    pub log_channel: Option<i64>,
    pub merge_log_channel: Option<i64>,
    pub authorized_chats: BTreeSet<i64>,
    pub staging_dir: PathBuf,
    pub gofile_token: Option<SecretString>,
    pub gofile_api_url: String,
    pub bot_name: String,
    pub bot_username: Option<String>,
    pub developer: Option<String>,
    pub bot_api_url: Option<Url>,
    pub log_file_path: String,
    pub log_level: LevelFilter,
    pub ffmpeg_bin: String,
    /// Used to read input durations for merge progress
    pub ffprobe_bin: String,
    pub merge_timeout: Duration,
    pub merge_preset: String,
    pub merge_crf: u8,
    pub max_upload_bytes: u64,
    pub max_download_bytes: u64,
    pub download_max_retries: u32,
    pub delivery_max_retries: u32,
    pub session_idle_timeout: Duration,
    pub session_sweep_interval: Duration,
    pub broadcast_delay: Duration,
    pub request_timeout: Duration,
}

impl Settings {
    /// Loads settings from `vidmerge.toml` (if present) overlaid with the
    /// process environment. Call after `dotenvy::dotenv()`.
    pub fn load() -> Result<Self, ConfigError> {
        let file = std::env::var(CONFIG_FILE_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        let figment = Figment::new().merge(Toml::file(file)).merge(Env::raw());
        Self::from_figment(figment)
    }

    /// Builds settings from an arbitrary figment. Keys are the lowercase
    /// environment names (`bot_token`, `owner_id`, ...).
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let raw: RawSettings = figment.extract().map_err(Box::new)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> Result<Self, ConfigError> {
        let token = text(raw.bot_token)
            .or_else(|| text(raw.teloxide_token))
            .ok_or(ConfigError::Missing { key: "BOT_TOKEN" })?;
        if !token.contains(':') {
            return Err(ConfigError::Invalid {
                key: "BOT_TOKEN",
                reason: "expected the `<id>:<secret>` form issued by @BotFather".to_string(),
            });
        }

        let owner_id = match raw.owner_id {
            Some(value) => parse_i64("OWNER_ID", value)?,
            None => return Err(ConfigError::Missing { key: "OWNER_ID" }),
        };

        let admin_ids = text(raw.admins).map(|s| parse_id_list(&s)).unwrap_or_default();
        let authorized_chats = text(raw.authorized_chats)
            .map(|s| parse_id_list(&s))
            .unwrap_or_default();

        let bot_api_url = match text(raw.bot_api_url) {
            Some(s) => Some(Url::parse(&s).map_err(|e| ConfigError::Invalid {
                key: "BOT_API_URL",
                reason: e.to_string(),
            })?),
            None => None,
        };

        let max_upload_bytes = match raw.max_upload_bytes {
            Some(v) => parse_u64("MAX_UPLOAD_BYTES", v)?,
            None => default_upload_limit(bot_api_url.as_ref()),
        };

        let log_level = match text(raw.log_level) {
            Some(s) => s.parse::<LevelFilter>().map_err(|_| ConfigError::Invalid {
                key: "LOG_LEVEL",
                reason: format!("unknown level `{}`", s),
            })?,
            None => LevelFilter::Info,
        };

        let merge_crf = match raw.merge_crf {
            Some(v) => {
                let crf = parse_u64("MERGE_CRF", v)?;
                u8::try_from(crf)
                    .ok()
                    .filter(|c| *c <= 51)
                    .ok_or_else(|| ConfigError::Invalid {
                        key: "MERGE_CRF",
                        reason: "must be between 0 and 51".to_string(),
                    })?
            }
            None => 23,
        };

        let session_idle_timeout = secs("SESSION_IDLE_TIMEOUT_SECS", raw.session_idle_timeout_secs, 30 * 60)?;
        if session_idle_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "SESSION_IDLE_TIMEOUT_SECS",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            bot_token: SecretString::from(token),
            owner_id,
            admin_ids,
            database_url: text(raw.database_url).unwrap_or_else(|| "vidmerge.sqlite".to_string()),
            database_name: text(raw.database_name),
            force_sub_channel: text(raw.force_sub_channel).and_then(|s| ChannelRef::parse(&s)),
            update_channel: text(raw.update_channel),
            support_group: text(raw.support_group),
            log_channel: optional_i64("LOG_CHANNEL", raw.log_channel)?,
            merge_log_channel: optional_i64("MERGE_LOG_CHANNEL", raw.merge_log_channel)?,
            authorized_chats,
            staging_dir: PathBuf::from(
                text(raw.staging_dir)
                    .or_else(|| text(raw.download_dir))
                    .unwrap_or_else(|| "downloads".to_string()),
            ),
            gofile_token: text(raw.gofile_token).map(SecretString::from),
            gofile_api_url: text(raw.gofile_api_url).unwrap_or_else(|| "https://api.gofile.io".to_string()),
            bot_name: text(raw.bot_name).unwrap_or_else(|| "Video Merger Bot".to_string()),
            bot_username: text(raw.bot_username).map(|s| s.trim_start_matches('@').to_string()),
            developer: text(raw.developer),
            bot_api_url,
            log_file_path: text(raw.log_file_path).unwrap_or_else(|| "vidmerge.log".to_string()),
            log_level,
            ffmpeg_bin: text(raw.ffmpeg_bin).unwrap_or_else(|| "ffmpeg".to_string()),
            ffprobe_bin: text(raw.ffprobe_bin).unwrap_or_else(|| "ffprobe".to_string()),
            merge_timeout: secs("MERGE_TIMEOUT_SECS", raw.merge_timeout_secs, 30 * 60)?,
            merge_preset: text(raw.merge_preset).unwrap_or_else(|| "fast".to_string()),
            merge_crf,
            max_upload_bytes,
            max_download_bytes: match raw.max_download_bytes {
                Some(v) => parse_u64("MAX_DOWNLOAD_BYTES", v)?,
                None => 4 * 1024 * 1024 * 1024,
            },
            download_max_retries: count("DOWNLOAD_MAX_RETRIES", raw.download_max_retries, 2)?,
            delivery_max_retries: count("DELIVERY_MAX_RETRIES", raw.delivery_max_retries, 2)?,
            session_idle_timeout,
            session_sweep_interval: secs("SESSION_SWEEP_INTERVAL_SECS", raw.session_sweep_interval_secs, 60)?,
            broadcast_delay: match raw.broadcast_delay_ms {
                Some(v) => Duration::from_millis(parse_u64("BROADCAST_DELAY_MS", v)?),
                None => Duration::from_millis(50),
            },
            request_timeout: secs("REQUEST_TIMEOUT_SECS", raw.request_timeout_secs, 600)?,
        })
    }

    pub fn is_owner(&self, user_id: i64) -> bool {
        user_id == self.owner_id
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.is_owner(user_id) || self.admin_ids.contains(&user_id)
    }

    /// True when BOT_API_URL points at a self-hosted Bot API server.
    pub fn bot_api_is_local(&self) -> bool {
        self.bot_api_url
            .as_ref()
            .and_then(|u| u.host_str())
            .is_some_and(|host| host != "api.telegram.org")
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_dir
    }
}

fn default_upload_limit(bot_api_url: Option<&Url>) -> u64 {
    let local = bot_api_url
        .and_then(|u| u.host_str())
        .is_some_and(|host| host != "api.telegram.org");
    if local {
        LOCAL_UPLOAD_LIMIT
    } else {
        CLOUD_UPLOAD_LIMIT
    }
}

fn text(value: Option<Scalar>) -> Option<String> {
    value
        .map(Scalar::into_text)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_i64(key: &'static str, value: Scalar) -> Result<i64, ConfigError> {
    match value {
        Scalar::Int(v) => Ok(v),
        other => {
            let s = other.into_text();
            s.trim().parse().map_err(|_| ConfigError::Invalid {
                key,
                reason: format!("`{}` is not an integer", s),
            })
        }
    }
}

fn optional_i64(key: &'static str, value: Option<Scalar>) -> Result<Option<i64>, ConfigError> {
    match value {
        None => Ok(None),
        Some(Scalar::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(v) => parse_i64(key, v).map(Some),
    }
}

fn parse_u64(key: &'static str, value: Scalar) -> Result<u64, ConfigError> {
    let v = parse_i64(key, value)?;
    u64::try_from(v).map_err(|_| ConfigError::Invalid {
        key,
        reason: "must not be negative".to_string(),
    })
}

fn secs(key: &'static str, value: Option<Scalar>, default: u64) -> Result<Duration, ConfigError> {
    match value {
        Some(v) => parse_u64(key, v).map(Duration::from_secs),
        None => Ok(Duration::from_secs(default)),
    }
}

fn count(key: &'static str, value: Option<Scalar>, default: u32) -> Result<u32, ConfigError> {
    match value {
        Some(v) => u32::try_from(parse_u64(key, v)?).map_err(|_| ConfigError::Invalid {
            key,
            reason: "value too large".to_string(),
        }),
        None => Ok(default),
    }
}

/// Parses an id list separated by commas or whitespace. Unparseable
/// entries are skipped.
pub fn parse_id_list(raw: &str) -> BTreeSet<i64> {
    raw.split([',', ' ', '\n', '\t'])
        .filter_map(|part| part.trim().parse::<i64>().ok())
        .collect()
}
