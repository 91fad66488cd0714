//! Settings loading
//!
//! Settings come from an optional JSON file and are then overridden by
//! environment variables. Every field has a default except the webhook
//! secret, whose absence is reported when the settings are turned into
//! [`AppOptions`](crate::app::options::AppOptions).

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

use crate::deploy::devices::BackendKind;
use crate::deploy::flash::{FlashPolicy, PORT_PLACEHOLDER};
use crate::errors::AgentError;
use crate::filesys::file::File;
use crate::logs::LogLevel;

/// Daemon settings
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines on stdout
    #[serde(default)]
    pub log_json: bool,

    /// Directory for daily rolling log files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// HTTP listener
    #[serde(default)]
    pub server: ServerSettings,

    /// Shared webhook secret
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub token: Option<SecretString>,

    /// Clone URL used instead of the one in the payload
    #[serde(default)]
    pub repository_url: Option<String>,

    /// Base directory; workspaces go in its `tagflash/` subdirectory. The OS
    /// temp dir when unset
    #[serde(default)]
    pub workspace_dir: Option<PathBuf>,

    /// Board family to flash
    #[serde(default)]
    pub board: BoardSettings,

    /// Device enumeration backend
    #[serde(default)]
    pub device_backend: BackendKind,

    /// Flash tool invocation
    #[serde(default)]
    pub flash: FlashSettings,

    /// Clone attempts per run
    #[serde(default = "default_attempts")]
    pub clone_attempts: u32,

    /// How long shutdown may wait for a run in progress
    #[serde(default = "default_max_shutdown_delay")]
    pub max_shutdown_delay_secs: u64,
}

fn default_attempts() -> u32 {
    1
}

fn default_max_shutdown_delay() -> u64 {
    900
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?
        .filter(|s| !s.is_empty())
        .map(SecretString::from))
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_dir: None,
            server: ServerSettings::default(),
            token: None,
            repository_url: None,
            workspace_dir: None,
            board: BoardSettings::default(),
            device_backend: BackendKind::default(),
            flash: FlashSettings::default(),
            clone_attempts: default_attempts(),
            max_shutdown_delay_secs: default_max_shutdown_delay(),
        }
    }
}

/// HTTP listener settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Board family as hex ids, e.g. `"2341"` / `"0043"`
#[derive(Debug, Clone, Deserialize)]
pub struct BoardSettings {
    #[serde(default = "default_vendor_id")]
    pub vendor_id: String,

    #[serde(default = "default_product_id")]
    pub product_id: String,
}

fn default_vendor_id() -> String {
    "2341".to_string()
}

fn default_product_id() -> String {
    "0043".to_string()
}

impl Default for BoardSettings {
    fn default() -> Self {
        Self {
            vendor_id: default_vendor_id(),
            product_id: default_product_id(),
        }
    }
}

/// Flash tool settings
#[derive(Debug, Clone, Deserialize)]
pub struct FlashSettings {
    #[serde(default = "default_flash_tool")]
    pub tool: String,

    /// Tool arguments; `{port}` is replaced with the device
    #[serde(default = "default_flash_args")]
    pub args: Vec<String>,

    #[serde(default)]
    pub policy: FlashPolicy,

    #[serde(default = "default_flash_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

fn default_flash_tool() -> String {
    "pio".to_string()
}

fn default_flash_args() -> Vec<String> {
    ["run", "-t", "upload", "--upload-port", PORT_PLACEHOLDER]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_flash_timeout() -> u64 {
    600
}

impl Default for FlashSettings {
    fn default() -> Self {
        Self {
            tool: default_flash_tool(),
            args: default_flash_args(),
            policy: FlashPolicy::default(),
            timeout_secs: default_flash_timeout(),
            attempts: default_attempts(),
        }
    }
}

impl Settings {
    /// Read the settings file when given, then apply the process environment
    pub async fn load(path: Option<&Path>) -> Result<Self, AgentError> {
        let mut settings = match path {
            Some(path) => File::new(path).read_json::<Settings>().await.map_err(|e| {
                AgentError::ConfigError(format!("reading {}: {}", path.display(), e))
            })?,
            None => Settings::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Override fields from variables returned by `lookup`. Empty values count
    /// as unset.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), AgentError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = var("TOKEN").or_else(|| var("WEBHOOK_SECRET")) {
            self.token = Some(SecretString::from(token));
        }
        if let Some(port) = var("PORT") {
            self.server.port = parse_var("PORT", &port)?;
        }
        if let Some(host) = var("HOST") {
            self.server.host = host;
        }
        if let Some(dir) = var("WORKSPACE_DIR") {
            self.workspace_dir = Some(PathBuf::from(dir));
        }
        if let Some(url) = var("REPOSITORY_URL") {
            self.repository_url = Some(url);
        }
        if let Some(id) = var("BOARD_VENDOR_ID") {
            self.board.vendor_id = id;
        }
        if let Some(id) = var("BOARD_PRODUCT_ID") {
            self.board.product_id = id;
        }
        if let Some(backend) = var("DEVICE_BACKEND") {
            self.device_backend = parse_var("DEVICE_BACKEND", &backend)?;
        }
        if let Some(tool) = var("FLASH_TOOL") {
            self.flash.tool = tool;
        }
        if let Some(policy) = var("FLASH_POLICY") {
            self.flash.policy = parse_var("FLASH_POLICY", &policy)?;
        }
        if let Some(secs) = var("FLASH_TIMEOUT_SECS") {
            self.flash.timeout_secs = parse_var("FLASH_TIMEOUT_SECS", &secs)?;
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.log_level = parse_var("LOG_LEVEL", &level)?;
        }
        if let Some(json) = var("LOG_JSON") {
            self.log_json = parse_bool("LOG_JSON", &json)?;
        }
        if let Some(dir) = var("LOG_DIR") {
            self.log_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T, AgentError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| AgentError::ConfigError(format!("{}={:?}: {}", key, value, e)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, AgentError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AgentError::ConfigError(format!(
            "{}={:?}: expected a boolean",
            key, value
        ))),
    }
}
