// Runtime configuration: endpoint bases, session file location and the
// tunables the CLI exposes. Everything comes from `CLOUDBOX_*` environment
// variables with a default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

pub const DEFAULT_API_URL: &str = "https://pan.sjtu.edu.cn";
pub const DEFAULT_AUTH_URL: &str = "https://jaccount.sjtu.edu.cn/jaccount";
pub const DEFAULT_WS_URL: &str = "wss://jaccount.sjtu.edu.cn/jaccount/sub";
pub const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 300;
pub const MAX_UPLOAD_CONCURRENCY: usize = 4;

/// Endpoint and tuning settings shared by the coordinators and the UI.
#[derive(Debug, Clone)]
pub struct Config {
    /// REST base of the storage service.
    pub api_url: String,
    /// Base of the QR issuing / confirm pages.
    pub auth_url: String,
    /// Base of the QR event stream; the stream URL is `{ws_url}/{uuid}`.
    pub ws_url: String,
    /// Scheme used to reach the object-store domain returned by initiate.
    pub part_scheme: String,
    pub session_file: PathBuf,
    pub auth_timeout: Duration,
    pub upload_concurrency: usize,
}

impl Config {
    /// Build a config from `CLOUDBOX_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let session_file = match std::env::var("CLOUDBOX_SESSION_FILE") {
            Ok(path) => PathBuf::from(path),
            Err(_) => default_session_file().context("Failed to locate home directory")?,
        };
        let timeout_secs: u64 = env_parse("CLOUDBOX_AUTH_TIMEOUT_SECS", DEFAULT_AUTH_TIMEOUT_SECS);
        let concurrency: usize = env_parse("CLOUDBOX_UPLOAD_CONCURRENCY", MAX_UPLOAD_CONCURRENCY);

        Ok(Config {
            api_url: env_or("CLOUDBOX_API_URL", DEFAULT_API_URL),
            auth_url: env_or("CLOUDBOX_AUTH_URL", DEFAULT_AUTH_URL),
            ws_url: env_or("CLOUDBOX_WS_URL", DEFAULT_WS_URL),
            part_scheme: env_or("CLOUDBOX_PART_SCHEME", "https"),
            session_file,
            auth_timeout: Duration::from_secs(timeout_secs),
            upload_concurrency: concurrency.clamp(1, MAX_UPLOAD_CONCURRENCY),
        })
    }

    /// Config pointing every endpoint at one base URL. Used by tests that run
    /// a single mock server.
    pub fn for_base_url(base_url: &str, session_file: PathBuf) -> Self {
        let base = base_url.trim_end_matches('/');
        let ws_base = base
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        Config {
            api_url: base.to_string(),
            auth_url: format!("{}/jaccount", base),
            ws_url: format!("{}/jaccount/sub", ws_base),
            part_scheme: "http".into(),
            session_file,
            auth_timeout: Duration::from_secs(DEFAULT_AUTH_TIMEOUT_SECS),
            upload_concurrency: MAX_UPLOAD_CONCURRENCY,
        }
    }
}

/// `~/.cloudbox/session.json`
pub fn default_session_file() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".cloudbox").join("session.json"))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|v| v.trim_end_matches('/').to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, fallback = %default, "ignoring invalid numeric setting");
            default
        }),
        Err(_) => default,
    }
}
