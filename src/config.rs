//! Application-level configuration loading, including the room synchronization timings.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};
use url::Url;

/// Default location on disk where the bridge looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "WATCH_ROOM_CONFIG_PATH";
/// Page the room links are built from when nothing else is configured.
const DEFAULT_PAGE_URL: &str = "http://localhost:8080/";

const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(25);
const DEFAULT_ONLINE_WINDOW: Duration = Duration::from_secs(70);
const DEFAULT_PERSONAL_SAVE_DELAY: Duration = Duration::from_millis(400);
const DEFAULT_MESSAGE_LIMIT: usize = 200;
const DEFAULT_REPLY_SNIPPET_CHARS: usize = 30;

/// Timings and bounds used by the room synchronization components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Period between two presence heartbeats.
    pub heartbeat_interval: Duration,
    /// A member whose last heartbeat is older than this is reported offline.
    pub online_window: Duration,
    /// Debounce applied to replication writes while inside a room.
    pub room_save_delay: Duration,
    /// Debounce applied to replication writes against the personal document.
    pub personal_save_delay: Duration,
    /// Number of most recent chat messages kept by the message subscription.
    pub message_limit: usize,
    /// Maximum characters of text kept in a reply preview.
    pub reply_snippet_chars: usize,
}

impl SyncConfig {
    /// Enforce a non-zero heartbeat and an online window that tolerates at
    /// least one missed heartbeat.
    pub fn normalized(mut self) -> Self {
        if self.heartbeat_interval.is_zero() {
            warn!(
                default_ms = DEFAULT_HEARTBEAT.as_millis() as u64,
                "heartbeat interval must be positive; using the default"
            );
            self.heartbeat_interval = DEFAULT_HEARTBEAT;
        }
        let minimum = self.heartbeat_interval * 2;
        if self.online_window < minimum {
            warn!(
                heartbeat_ms = self.heartbeat_interval.as_millis() as u64,
                window_ms = self.online_window.as_millis() as u64,
                "online window shorter than two heartbeats; raising it"
            );
            self.online_window = minimum;
        }
        if self.message_limit == 0 {
            self.message_limit = DEFAULT_MESSAGE_LIMIT;
        }
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT,
            online_window: DEFAULT_ONLINE_WINDOW,
            room_save_delay: Duration::ZERO,
            personal_save_delay: DEFAULT_PERSONAL_SAVE_DELAY,
            message_limit: DEFAULT_MESSAGE_LIMIT,
            reply_snippet_chars: DEFAULT_REPLY_SNIPPET_CHARS,
        }
    }
}

#[derive(Debug, Clone)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    /// Synchronization timings handed to every room component.
    pub sync: SyncConfig,
    /// Page URL room links are derived from; may already carry a `room` parameter.
    pub page_url: Url,
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to baked-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let app_config: Self = raw.into();
                    info!(
                        path = %path.display(),
                        heartbeat_ms = app_config.sync.heartbeat_interval.as_millis() as u64,
                        window_ms = app_config.sync.online_window.as_millis() as u64,
                        "loaded room sync configuration"
                    );
                    app_config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            page_url: default_page_url(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    heartbeat_ms: Option<u64>,
    online_window_ms: Option<u64>,
    room_save_delay_ms: Option<u64>,
    personal_save_delay_ms: Option<u64>,
    message_limit: Option<usize>,
    reply_snippet_chars: Option<usize>,
    page_url: Option<String>,
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        let defaults = SyncConfig::default();
        let sync = SyncConfig {
            heartbeat_interval: value
                .heartbeat_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.heartbeat_interval),
            online_window: value
                .online_window_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.online_window),
            room_save_delay: value
                .room_save_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.room_save_delay),
            personal_save_delay: value
                .personal_save_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.personal_save_delay),
            message_limit: value.message_limit.unwrap_or(defaults.message_limit),
            reply_snippet_chars: value
                .reply_snippet_chars
                .unwrap_or(defaults.reply_snippet_chars),
        }
        .normalized();

        let page_url = match value.page_url.as_deref().map(Url::parse) {
            Some(Ok(url)) => url,
            Some(Err(err)) => {
                warn!(error = %err, "invalid page url in config; using default");
                default_page_url()
            }
            None => default_page_url(),
        };

        Self { sync, page_url }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

fn default_page_url() -> Url {
    Url::parse(DEFAULT_PAGE_URL).expect("default page url is valid")
}
