use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::log_warn;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_VALIDITY_MINUTES: u64 = 15;
const DEFAULT_REFRESH_MINUTES: u64 = 15;
const DEFAULT_LIVE_BACKLOG_MB: usize = 64;
const MB: usize = 1024 * 1024;
const COOKIE_FILE_NAME: &str = "www.youtube.com_cookies.txt";

/// Runtime configuration, read once at startup
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub host: IpAddr,
    pub port: u16,
    pub root: PathBuf,
    pub youtube_api_key: Option<String>,
    pub youtube_channel_id: Option<String>,
    /// Explicit yt-dlp executable; resolved from `resources/bin` or PATH otherwise
    pub ytdlp_path: Option<PathBuf>,
    pub cookie_file: PathBuf,
    /// How long a cache snapshot counts as fresh
    pub cache_validity: Duration,
    /// Period of the unconditional background refresh
    pub cache_refresh: Duration,
    /// Bytes a live client may lag behind the download before it is cut off
    pub live_backlog: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let root = PathBuf::from(".");
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: DEFAULT_PORT,
            cookie_file: root.join(COOKIE_FILE_NAME),
            root,
            youtube_api_key: None,
            youtube_channel_id: None,
            ytdlp_path: None,
            cache_validity: Duration::from_secs(DEFAULT_VALIDITY_MINUTES * 60),
            cache_refresh: Duration::from_secs(DEFAULT_REFRESH_MINUTES * 60),
            live_backlog: DEFAULT_LIVE_BACKLOG_MB * MB,
        }
    }
}

impl GatewayConfig {
    /// Reads the process environment (after an optional `.env`).
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let value = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let root = value("GATEWAY_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.root);
        let cookie_file = value("YTDLP_COOKIES")
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join(COOKIE_FILE_NAME));

        Self {
            host: parse_or("GATEWAY_HOST", value("GATEWAY_HOST"), defaults.host),
            port: parse_or("GATEWAY_PORT", value("GATEWAY_PORT"), defaults.port),
            youtube_api_key: value("YOUTUBE_API_KEY"),
            youtube_channel_id: value("YOUTUBE_CHANNEL_ID"),
            ytdlp_path: value("YTDLP_PATH").map(PathBuf::from),
            cache_validity: minutes("CACHE_VALIDITY_MINUTES", value("CACHE_VALIDITY_MINUTES"))
                .unwrap_or(defaults.cache_validity),
            cache_refresh: minutes("CACHE_REFRESH_MINUTES", value("CACHE_REFRESH_MINUTES"))
                .unwrap_or(defaults.cache_refresh),
            live_backlog: parse_or(
                "LIVE_BACKLOG_MB",
                value("LIVE_BACKLOG_MB"),
                DEFAULT_LIVE_BACKLOG_MB,
            )
            .saturating_mul(MB),
            root,
            cookie_file,
        }
    }
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, fallback: T) -> T {
    match raw {
        None => fallback,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            log_warn!("Ignoring unparseable {}={:?}", key, raw);
            fallback
        }),
    }
}

fn minutes(key: &str, raw: Option<String>) -> Option<Duration> {
    let mins: u64 = parse_or(key, raw, 0);
    // zero would make every snapshot stale immediately
    (mins > 0).then(|| Duration::from_secs(mins * 60))
}
