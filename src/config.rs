use crate::error::{AppError, Result};
use crate::types::Host;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use std::{fs, path::Path, path::PathBuf};

const APP_NAME: &str = "opsh";
const DEFAULT_MODEL: &str = "google/gemini-3-flash-preview";
const DEFAULT_OPENROUTER_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_API_KEY_ENV: &str = "OPENROUTER_API_KEY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenRouter,
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: Provider,
    pub endpoint: String,
    pub model: String,
    /// Name of the environment variable holding the api key.
    pub api_key_env: String,
    pub timeout_secs: u64,
    /// Replace addresses and domain names in the request with the host alias
    /// before it is sent out.
    pub redact_hosts: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: Provider::OpenRouter,
            endpoint: DEFAULT_OPENROUTER_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            timeout_secs: 60,
            redact_hosts: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub connect_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub strict_host_key_checking: String,
    /// Unset means a hung remote command is waited on indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_dir: Option<PathBuf>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            poll_interval_ms: 50,
            strict_host_key_checking: "accept-new".to_string(),
            command_timeout_secs: None,
            control_dir: None,
        }
    }
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }

    pub fn control_dir(&self) -> PathBuf {
        self.control_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("opsh-ssh"))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Write a record for attempts the operator declined. Off by default.
    pub record_declined: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_host: Option<String>,
    pub llm: LlmConfig,
    pub ssh: SshConfig,
    pub audit: AuditConfig,
    pub hosts: Vec<Host>,
}

impl Config {
    pub fn host(&self, alias: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.alias == alias)
    }

    pub fn audit_path(&self) -> PathBuf {
        self.audit.path.clone().unwrap_or_else(get_audit_db_path)
    }

    fn check(&self) -> Result<()> {
        for (i, host) in self.hosts.iter().enumerate() {
            if host.alias.trim().is_empty() {
                return Err(AppError::Config(format!("hosts[{}] has an empty alias", i)));
            }
            if self.hosts[..i].iter().any(|h| h.alias == host.alias) {
                return Err(AppError::Config(format!(
                    "duplicate host alias: {}",
                    host.alias
                )));
            }
        }
        if let Some(default) = &self.default_host {
            if self.host(default).is_none() {
                return Err(AppError::Config(format!(
                    "default_host {} is not in [[hosts]]",
                    default
                )));
            }
        }
        Ok(())
    }
}

pub fn get_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
        .join("config.toml")
}

pub fn get_audit_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
        .join("audit.db")
}

/// A missing file yields defaults; a file that does not parse is an error.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        return Ok(Config::default());
    }
    let content = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    config.check()?;
    Ok(config)
}

pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)?;
    fs::write(path, content)?;
    Ok(())
}
