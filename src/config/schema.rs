use anyhow::{Context, Result};
use directories::ProjectDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

const CONFIG_FILE_NAME: &str = "config.toml";
const STATE_DIR_NAME: &str = "state";

// ── Top-level config ─────────────────────────────────────────────

/// Top-level outpost configuration, loaded from `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Path of the loaded config file. Computed, never serialized.
    #[serde(skip)]
    pub config_path: PathBuf,
    /// Directory holding persisted queue state. Computed, never serialized.
    #[serde(skip)]
    pub state_dir: PathBuf,

    #[serde(default = "ClientConfig::unassigned")]
    pub client: ClientConfig,
    #[serde(default)]
    pub endpoints: EndpointsConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(CONFIG_FILE_NAME),
            state_dir: PathBuf::from(STATE_DIR_NAME),
            client: ClientConfig::default(),
            endpoints: EndpointsConfig::default(),
            delivery: DeliveryConfig::default(),
            socket: SocketConfig::default(),
            poller: PollerConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

// ── Client ───────────────────────────────────────────────────────

/// Client identity (`[client]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ClientConfig {
    /// Stable identifier of this client instance, appended to the socket URL.
    /// Generated on first start when empty.
    #[serde(default)]
    pub instance_id: String,
}

impl ClientConfig {
    /// A file without a `[client]` section loads with an empty id, so the
    /// loader assigns one and writes it back.
    fn unassigned() -> Self {
        Self {
            instance_id: String::new(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

// ── Endpoints ────────────────────────────────────────────────────

/// Server endpoints (`[endpoints]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EndpointsConfig {
    /// Websocket base URL; the instance id is appended. Default: `ws://127.0.0.1:8787/ws/`.
    #[serde(default = "default_socket_url")]
    pub socket_url: String,
    /// Fallback polling endpoint. Default: `http://127.0.0.1:8787/events`.
    #[serde(default = "default_poll_url")]
    pub poll_url: String,
}

fn default_socket_url() -> String {
    "ws://127.0.0.1:8787/ws/".into()
}

fn default_poll_url() -> String {
    "http://127.0.0.1:8787/events".into()
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            socket_url: default_socket_url(),
            poll_url: default_poll_url(),
        }
    }
}

// ── Delivery ─────────────────────────────────────────────────────

/// Order in which due items are placed into an outbound batch.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResendOrder {
    /// Longest-waiting items first.
    #[default]
    OldestFirst,
    NewestFirst,
}

/// Delivery engine tuning (`[delivery]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeliveryConfig {
    /// Seconds before an unacknowledged item is sent again. Default: `30`.
    #[serde(default = "default_resend_timeout_secs")]
    pub resend_timeout_secs: u64,
    /// Batch ordering of due items. Default: `oldest_first`.
    #[serde(default)]
    pub resend_order: ResendOrder,
}

fn default_resend_timeout_secs() -> u64 {
    30
}

impl DeliveryConfig {
    pub fn resend_timeout(&self) -> Duration {
        Duration::from_secs(self.resend_timeout_secs)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            resend_timeout_secs: default_resend_timeout_secs(),
            resend_order: ResendOrder::default(),
        }
    }
}

// ── Socket ───────────────────────────────────────────────────────

/// Persistent websocket transport (`[socket]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SocketConfig {
    /// Enable the websocket transport. Default: `true`.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Fixed delay in milliseconds before reconnecting after a close or failed open. Default: `10000`.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Connect handshake timeout in seconds. Default: `15`.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Seconds without inbound socket traffic before the poller takes over. Default: `120`.
    #[serde(default = "default_silence_threshold_secs")]
    pub silence_threshold_secs: u64,
}

fn default_reconnect_delay_ms() -> u64 {
    10_000
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_silence_threshold_secs() -> u64 {
    120
}

impl SocketConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn silence_threshold(&self) -> Duration {
        Duration::from_secs(self.silence_threshold_secs)
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reconnect_delay_ms: default_reconnect_delay_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            silence_threshold_secs: default_silence_threshold_secs(),
        }
    }
}

// ── Poller ───────────────────────────────────────────────────────

/// HTTP fallback poller (`[poller]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PollerConfig {
    /// Enable the fallback poller. Default: `true`.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Poll timer tick in milliseconds. Default: `2000`.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Minimum milliseconds between polls while channels are subscribed. Default: `10000`.
    #[serde(default = "default_subscribed_spacing_ms")]
    pub subscribed_spacing_ms: u64,
    /// Minimum milliseconds between polls with no subscriptions. Default: `30000`.
    #[serde(default = "default_idle_spacing_ms")]
    pub idle_spacing_ms: u64,
    /// Debounce in milliseconds coalescing forced polls after subscribe. Default: `200`.
    #[serde(default = "default_force_debounce_ms")]
    pub force_debounce_ms: u64,
    /// HTTP request timeout in seconds. Default: `30`.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_tick_ms() -> u64 {
    2_000
}

fn default_subscribed_spacing_ms() -> u64 {
    10_000
}

fn default_idle_spacing_ms() -> u64 {
    30_000
}

fn default_force_debounce_ms() -> u64 {
    200
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl PollerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn subscribed_spacing(&self) -> Duration {
        Duration::from_millis(self.subscribed_spacing_ms)
    }

    pub fn idle_spacing(&self) -> Duration {
        Duration::from_millis(self.idle_spacing_ms)
    }

    pub fn force_debounce(&self) -> Duration {
        Duration::from_millis(self.force_debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_ms: default_tick_ms(),
            subscribed_spacing_ms: default_subscribed_spacing_ms(),
            idle_spacing_ms: default_idle_spacing_ms(),
            force_debounce_ms: default_force_debounce_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

// ── Storage ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    /// Nothing survives a restart.
    Memory,
}

/// Queue persistence (`[storage]` section).
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct StorageConfig {
    /// Backend used for queue snapshots. Default: `sqlite`.
    #[serde(default)]
    pub backend: StorageBackend,
    /// Database file override. Default: `<state_dir>/outpost.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

// ── Loading ──────────────────────────────────────────────────────

fn default_config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("OUTPOST_CONFIG_DIR") {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(shellexpand_home(&dir)));
        }
    }
    let dirs = ProjectDirs::from("", "", "outpost")
        .context("Could not determine a home directory for outpost config")?;
    Ok(dirs.config_dir().to_path_buf())
}

fn shellexpand_home(raw: &str) -> String {
    match (raw.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{home}/{rest}"),
        _ => raw.to_string(),
    }
}

impl Config {
    /// Load `config.toml` from the default config directory, creating it with
    /// defaults on first run, then apply environment overrides.
    pub async fn load_or_init() -> Result<Self> {
        let dir = default_config_dir()?;
        Self::load_or_init_in(&dir).await
    }

    pub async fn load_or_init_in(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let mut config = if config_path.exists() {
            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path.clone();
            config.state_dir = dir.join(STATE_DIR_NAME);
            if config.client.instance_id.trim().is_empty() {
                config.client.instance_id = uuid::Uuid::new_v4().to_string();
                config.save().await?;
            }
            config
        } else {
            let config = Config {
                config_path: config_path.clone(),
                state_dir: dir.join(STATE_DIR_NAME),
                ..Config::default()
            };
            config.save().await?;
            tracing::info!("Created default config at {}", config_path.display());
            config
        };

        config.apply_env_overrides();
        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.config_path, toml_str)
            .await
            .with_context(|| format!("Failed to write config: {}", self.config_path.display()))?;
        Ok(())
    }

    /// Apply `OUTPOST_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("OUTPOST_SOCKET_URL") {
            if !url.is_empty() {
                self.endpoints.socket_url = url;
            }
        }
        if let Ok(url) = std::env::var("OUTPOST_POLL_URL") {
            if !url.is_empty() {
                self.endpoints.poll_url = url;
            }
        }
        if let Ok(id) = std::env::var("OUTPOST_INSTANCE_ID") {
            if !id.is_empty() {
                self.client.instance_id = id;
            }
        }
        if let Ok(backend) = std::env::var("OUTPOST_STORAGE_BACKEND") {
            match backend.trim().to_ascii_lowercase().as_str() {
                "sqlite" => self.storage.backend = StorageBackend::Sqlite,
                "memory" => self.storage.backend = StorageBackend::Memory,
                "" => {}
                other => tracing::warn!("Ignoring unknown OUTPOST_STORAGE_BACKEND '{other}'"),
            }
        }
    }

    /// Reject combinations the delivery loop cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if !self.socket.enabled && !self.poller.enabled {
            return Err("at least one of [socket] or [poller] must be enabled".into());
        }
        if self.socket.enabled && self.endpoints.socket_url.trim().is_empty() {
            return Err("endpoints.socket_url must be set when the socket is enabled".into());
        }
        if self.poller.enabled && self.endpoints.poll_url.trim().is_empty() {
            return Err("endpoints.poll_url must be set when the poller is enabled".into());
        }
        if self.poller.tick_ms == 0 {
            return Err("poller.tick_ms must be greater than zero".into());
        }
        if self.client.instance_id.trim().is_empty() {
            return Err("client.instance_id must not be empty".into());
        }
        Ok(())
    }
}
