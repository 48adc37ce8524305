use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CONTENT_PORT: u16 = 8080;
pub const DEFAULT_BOOTSTRAP_URL: &str =
    "https://appassets.androidplatform.net/assets/ebook-reader/reader.html";
pub const DEFAULT_UI_QUEUE_CAP: usize = 256;
pub const DEFAULT_RENDERER_QUEUE_CAP: usize = 256;
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(15);

/// Runtime settings for a reader session and its content server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Loopback port the content server binds. `0` picks an ephemeral port.
    pub content_port: u16,
    /// Bootstrap document of the reading engine.
    pub bootstrap_url: String,
    /// Directory served under `/assets/`, if any.
    pub asset_root: Option<PathBuf>,
    pub ui_queue_cap: usize,
    pub renderer_queue_cap: usize,
    pub connection_timeout: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            content_port: DEFAULT_CONTENT_PORT,
            bootstrap_url: DEFAULT_BOOTSTRAP_URL.to_string(),
            asset_root: None,
            ui_queue_cap: DEFAULT_UI_QUEUE_CAP,
            renderer_queue_cap: DEFAULT_RENDERER_QUEUE_CAP,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
        }
    }
}

impl ReaderConfig {
    /// Defaults overridden by `READER_*` environment variables. Values that do
    /// not parse, or parse to zero where zero is meaningless, are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let content_port = lookup("READER_CONTENT_PORT")
            .and_then(|raw| raw.trim().parse::<u16>().ok())
            .unwrap_or(defaults.content_port);

        let bootstrap_url = lookup("READER_BOOTSTRAP_URL")
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
            .unwrap_or(defaults.bootstrap_url);

        let asset_root = lookup("READER_ASSET_ROOT")
            .filter(|raw| !raw.trim().is_empty())
            .map(PathBuf::from);

        let ui_queue_cap = parse_capacity(lookup("READER_UI_QUEUE_CAP"))
            .unwrap_or(defaults.ui_queue_cap);
        let renderer_queue_cap = parse_capacity(lookup("READER_RENDERER_QUEUE_CAP"))
            .unwrap_or(defaults.renderer_queue_cap);

        let connection_timeout = lookup("READER_CONNECTION_TIMEOUT_SECS")
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.connection_timeout);

        Self {
            content_port,
            bootstrap_url,
            asset_root,
            ui_queue_cap,
            renderer_queue_cap,
            connection_timeout,
        }
    }
}

fn parse_capacity(raw: Option<String>) -> Option<usize> {
    raw.and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
}
