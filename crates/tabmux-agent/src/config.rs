use crate::backoff::BackoffPolicy;
use crate::bridge::BridgeConfig;
use crate::broadcast::BroadcastConfig;
use crate::transport::TransportConfig;
use clap::Parser;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tabmux_core::sort::SortStrategy;
use thiserror::Error;
use url::Url;

pub const DEFAULT_COMPANION_URL: &str = "ws://127.0.0.1:47821/ws";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid companion url '{value}': {reason}")]
    InvalidUrl { value: String, reason: String },
    #[error("invalid sort strategy: {0}")]
    InvalidStrategy(String),
    #[error("invalid value for {name}: {value}")]
    InvalidNumber { name: &'static str, value: String },
}

#[derive(Parser, Debug, Default)]
#[command(name = "tabmux-agent", version)]
pub struct Args {
    #[arg(long, default_value = "")]
    pub url: String,
    #[arg(long, default_value = "")]
    pub browser_type: String,
    #[arg(long, default_value = "")]
    pub extension_version: String,
    #[arg(long, default_value = "")]
    pub state_dir: String,
    #[arg(long, default_value = "")]
    pub session_marker: String,
    #[arg(long, default_value = "")]
    pub log_dir: String,
    #[arg(long, default_value = "")]
    pub sort_strategy: String,
    #[arg(long, default_value_t = 0)]
    pub keepalive_secs: u64,
    #[arg(long, default_value_t = 0)]
    pub handshake_timeout_secs: u64,
    #[arg(long, default_value_t = 0)]
    pub backoff_initial_ms: u64,
    #[arg(long, default_value_t = 0)]
    pub backoff_max_ms: u64,
    #[arg(long, default_value_t = 0)]
    pub debounce_ms: u64,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub url: Url,
    pub state_dir: PathBuf,
    pub session_marker: String,
    pub log_dir: String,
    pub log_stderr: bool,
    pub transport: TransportConfig,
    pub broadcast: BroadcastConfig,
    pub bridge: BridgeConfig,
}

impl AgentConfig {
    /// Defaults for everything but the companion endpoint.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            state_dir: PathBuf::from(".tabmux"),
            session_marker: default_session_marker(),
            log_dir: String::new(),
            log_stderr: false,
            transport: TransportConfig::default(),
            broadcast: BroadcastConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }

    /// Resolves each setting as flag, then `TABMUX_*` variable, then default.
    pub fn load(args: Args) -> Result<Self, ConfigError> {
        let url = resolve_url(&args.url)?;
        let state_dir = PathBuf::from(resolve_string(
            &args.state_dir,
            "TABMUX_STATE_DIR",
            ".tabmux",
        ));
        let log_dir = resolve_string(
            &args.log_dir,
            "TABMUX_LOG_DIR",
            &state_dir.join("logs").to_string_lossy(),
        );
        let session_marker = resolve_string(
            &args.session_marker,
            "TABMUX_SESSION_MARKER",
            &default_session_marker(),
        );

        let defaults = TransportConfig::default();
        let backoff = BackoffPolicy {
            initial: resolve_millis(
                args.backoff_initial_ms,
                "TABMUX_BACKOFF_INITIAL_MS",
                defaults.backoff.initial,
            )?,
            max: resolve_millis(
                args.backoff_max_ms,
                "TABMUX_BACKOFF_MAX_MS",
                defaults.backoff.max,
            )?,
        };
        let transport = TransportConfig {
            browser_type: resolve_string(
                &args.browser_type,
                "TABMUX_BROWSER_TYPE",
                &defaults.browser_type,
            ),
            extension_version: resolve_string(
                &args.extension_version,
                "TABMUX_EXTENSION_VERSION",
                &defaults.extension_version,
            ),
            keepalive_interval: Duration::from_secs(resolve_number(
                args.keepalive_secs,
                "TABMUX_KEEPALIVE_SECS",
                defaults.keepalive_interval.as_secs(),
            )?),
            handshake_timeout: Duration::from_secs(resolve_number(
                args.handshake_timeout_secs,
                "TABMUX_HANDSHAKE_TIMEOUT_SECS",
                defaults.handshake_timeout.as_secs(),
            )?),
            backoff,
            ..defaults
        };

        let broadcast_defaults = BroadcastConfig::default();
        let strategy = resolve_string(&args.sort_strategy, "TABMUX_SORT_STRATEGY", "");
        let broadcast = BroadcastConfig {
            debounce: resolve_millis(
                args.debounce_ms,
                "TABMUX_DEBOUNCE_MS",
                broadcast_defaults.debounce,
            )?,
            initial_strategy: if strategy.is_empty() {
                broadcast_defaults.initial_strategy
            } else {
                strategy
                    .parse::<SortStrategy>()
                    .map_err(ConfigError::InvalidStrategy)?
            },
        };

        Ok(Self {
            url,
            state_dir,
            session_marker,
            log_dir,
            log_stderr: resolve_log_stderr(),
            transport,
            broadcast,
            bridge: BridgeConfig::default(),
        })
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn resolve_string(flag: &str, env_name: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    if let Some(value) = non_empty_env(env_name) {
        return value.trim().to_string();
    }
    default.to_string()
}

fn resolve_url(flag: &str) -> Result<Url, ConfigError> {
    let raw = resolve_string(flag, "TABMUX_URL", DEFAULT_COMPANION_URL);
    let url = Url::parse(&raw).map_err(|err| ConfigError::InvalidUrl {
        value: raw.clone(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConfigError::InvalidUrl {
            value: raw,
            reason: format!("unsupported scheme {other}"),
        }),
    }
}

fn resolve_number(flag: u64, env_name: &'static str, default: u64) -> Result<u64, ConfigError> {
    if flag > 0 {
        return Ok(flag);
    }
    match non_empty_env(env_name) {
        Some(value) => match value.trim().parse::<u64>() {
            Ok(parsed) if parsed > 0 => Ok(parsed),
            _ => Err(ConfigError::InvalidNumber {
                name: env_name,
                value,
            }),
        },
        None => Ok(default),
    }
}

fn resolve_millis(flag: u64, env_name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    resolve_number(flag, env_name, default_ms).map(Duration::from_millis)
}

pub fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}

fn resolve_log_stderr() -> bool {
    env::var("TABMUX_LOG_STDERR")
        .ok()
        .and_then(|value| parse_bool_env(&value))
        .unwrap_or(false)
}

/// The browser spawns the host process, so its pid identifies the browser
/// session the host belongs to.
#[cfg(unix)]
fn default_session_marker() -> String {
    format!("ppid-{}", std::os::unix::process::parent_id())
}

#[cfg(not(unix))]
fn default_session_marker() -> String {
    format!("pid-{}", std::process::id())
}
