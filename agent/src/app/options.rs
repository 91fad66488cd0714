//! Application configuration options

use std::time::Duration;

use secrecy::SecretString;

use crate::app::settings::Settings;
use crate::deploy::devices::{BackendKind, BoardFamily};
use crate::deploy::flash::FlashOptions;
use crate::deploy::git::GitOptions;
use crate::deploy::pipeline::PipelineOptions;
use crate::errors::AgentError;
use crate::logs::LogOptions;
use crate::utils::CooldownOptions;

/// Main application options
#[derive(Debug)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Server configuration
    pub server: ServerOptions,

    /// Shared webhook secret
    pub secret: SecretString,

    /// Clone URL replacing the payload's, if any
    pub repository_url: Option<String>,

    /// Boards to flash
    pub board_family: BoardFamily,

    /// Device enumeration backend
    pub device_backend: BackendKind,

    /// Git invocation
    pub git: GitOptions,

    /// Flash tool invocation
    pub flash: FlashOptions,

    /// Workspace placement and clone retries
    pub pipeline: PipelineOptions,
}

impl AppOptions {
    /// Default options around `secret`
    pub fn new(secret: SecretString) -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            server: ServerOptions::default(),
            secret,
            repository_url: None,
            board_family: BoardFamily::default(),
            device_backend: BackendKind::default(),
            git: GitOptions::default(),
            flash: FlashOptions::default(),
            pipeline: PipelineOptions::default(),
        }
    }

    /// Validate `settings` and map them onto typed options
    pub fn from_settings(settings: Settings) -> Result<Self, AgentError> {
        let secret = settings.token.ok_or_else(|| {
            AgentError::ConfigError("TOKEN is not set; a webhook secret is required".to_string())
        })?;

        let board_family = BoardFamily::new(
            parse_hex_id("vendor id", &settings.board.vendor_id)?,
            parse_hex_id("product id", &settings.board.product_id)?,
        );

        if settings.flash.tool.trim().is_empty() {
            return Err(AgentError::ConfigError("flash tool must not be empty".to_string()));
        }

        let defaults = Self::new(secret);
        Ok(Self {
            lifecycle: LifecycleOptions {
                max_shutdown_delay: Duration::from_secs(settings.max_shutdown_delay_secs),
            },
            server: ServerOptions {
                host: settings.server.host,
                port: settings.server.port,
            },
            repository_url: settings.repository_url,
            board_family,
            device_backend: settings.device_backend,
            flash: FlashOptions {
                program: settings.flash.tool,
                args: settings.flash.args,
                timeout: Duration::from_secs(settings.flash.timeout_secs),
                attempts: settings.flash.attempts.max(1),
                backoff: CooldownOptions::default(),
                policy: settings.flash.policy,
            },
            pipeline: PipelineOptions {
                workspace_base: settings
                    .workspace_dir
                    .unwrap_or_else(std::env::temp_dir),
                clone_attempts: settings.clone_attempts.max(1),
                clone_backoff: CooldownOptions::default(),
            },
            ..defaults
        })
    }
}

/// Logging options from settings
pub fn log_options(settings: &Settings) -> LogOptions {
    LogOptions {
        log_level: settings.log_level.clone(),
        log_dir: settings.log_dir.clone(),
        json_format: settings.log_json,
        ..Default::default()
    }
}

fn parse_hex_id(what: &str, value: &str) -> Result<u16, AgentError> {
    let digits = value
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u16::from_str_radix(digits, 16)
        .map_err(|e| AgentError::ConfigError(format!("invalid board {} {:?}: {}", what, value, e)))
}

/// Lifecycle options for the daemon
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown, including a run in progress
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(900),
        }
    }
}

/// HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}
