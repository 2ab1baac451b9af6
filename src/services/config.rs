//! Layered configuration: defaults, then a TOML file, then `TORLINE__*`
//! environment overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TorlineError};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MessengerConfig {
    pub identity: IdentitySettings,
    pub tor: TorSettings,
    pub server: ServerSettings,
    pub dispatch: DispatchSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdentitySettings {
    /// Logical user id; also names the key file.
    pub user_id: String,
    /// Where key files live. Defaults to `<data_dir>/torline`.
    pub data_dir: Option<PathBuf>,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            user_id: "default".to_string(),
            data_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TorSettings {
    /// When false, no daemon is launched and sends go direct (LAN/testing).
    pub enabled: bool,
    /// Explicit tor binary; otherwise PATH and well-known locations are searched.
    pub binary: Option<PathBuf>,
    pub socks_port: u16,
    pub control_port: u16,
    /// Virtual port published on the onion address.
    pub hidden_service_port: u16,
    pub hidden_service_dir: Option<PathBuf>,
    pub startup_attempts: u32,
    pub poll_interval_ms: u64,
}

impl Default for TorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: None,
            socks_port: 9050,
            control_port: 9051,
            hidden_service_port: 5000,
            hidden_service_dir: None,
            startup_attempts: 30,
            poll_interval_ms: 1000,
        }
    }
}

impl TorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_addr: String,
    /// Local listener port; 0 picks a free port.
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub request_timeout_secs: u64,
    /// Appended to peer addresses that carry no port.
    pub default_port: u16,
    pub max_message_size: usize,
    /// How long delivered, read or failed messages stay queryable; 0 keeps them.
    pub settled_retention_secs: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            workers: 5,
            queue_capacity: 64,
            request_timeout_secs: 60,
            default_port: 5000,
            max_message_size: 64 * 1024,
            settled_retention_secs: 3600,
        }
    }
}

impl MessengerConfig {
    /// Load configuration from `path` (if it exists) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path.to_path_buf())
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("TORLINE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let cfg: MessengerConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self)
            .map_err(|e| TorlineError::ConfigError(format!("serialize config: {}", e)))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.identity.user_id.trim().is_empty() {
            return Err(TorlineError::ConfigError("identity.user_id is empty".into()));
        }
        if self.dispatch.workers == 0 {
            return Err(TorlineError::ConfigError("dispatch.workers must be > 0".into()));
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(TorlineError::ConfigError(
                "dispatch.queue_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Directory holding key files.
    pub fn data_dir(&self) -> PathBuf {
        self.identity.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|p| p.join("torline"))
                .unwrap_or_else(|| PathBuf::from(".torline"))
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch.request_timeout_secs)
    }

    pub fn settled_retention(&self) -> Option<chrono::Duration> {
        match self.dispatch.settled_retention_secs {
            0 => None,
            secs => i64::try_from(secs).ok().map(chrono::Duration::seconds),
        }
    }

    /// `TORLINE_CONFIG`, else `<config_dir>/torline/config.toml`.
    pub fn default_path() -> PathBuf {
        if let Some(p) = std::env::var_os("TORLINE_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::config_dir()
            .map(|p| p.join("torline").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("torline.toml"))
    }
}
