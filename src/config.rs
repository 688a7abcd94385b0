use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

pub const API_TOKEN_ENV: &str = "PVEWATCH_API_TOKEN";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    pub proxmox: ProxmoxConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxmoxConfig {
    #[serde(default = "default_name")]
    pub name: String,
    pub host: String,
    #[serde(default, alias = "apiToken")]
    pub api_token: String,
    #[serde(default = "default_attribute_separator", alias = "attributeSeparator")]
    pub attribute_separator: String,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default)]
    pub verify_tls: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let mut cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        if let Some(token) = resolve_token_from_env(API_TOKEN_ENV) {
            cfg.proxmox.api_token = token;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле listen обязательно".to_string(),
            ));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }
        if self.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "interval_secs должно быть >= 1".to_string(),
            ));
        }

        validate_proxmox(&self.proxmox)
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

impl ProxmoxConfig {
    pub fn new(host: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            name: default_name(),
            host: host.into(),
            api_token: api_token.into(),
            attribute_separator: default_attribute_separator(),
            timezone: None,
            scheme: default_scheme(),
            verify_tls: false,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    /// Parsed timezone; `None` means host-local time.
    pub fn tz(&self) -> Option<Tz> {
        self.timezone
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .and_then(|v| v.parse::<Tz>().ok())
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.host.trim().trim_end_matches('/'))
    }
}

fn validate_proxmox(cfg: &ProxmoxConfig) -> Result<(), ConfigError> {
    if cfg.host.trim().is_empty() {
        return Err(ConfigError::Validation(
            "proxmox.host обязателен".to_string(),
        ));
    }
    if cfg.host.contains("://") {
        return Err(ConfigError::Validation(
            "proxmox.host указывается без схемы, используйте proxmox.scheme".to_string(),
        ));
    }
    if cfg.api_token.trim().is_empty() {
        return Err(ConfigError::Validation(format!(
            "proxmox.api_token обязателен (или переменная окружения {API_TOKEN_ENV})"
        )));
    }
    if cfg.attribute_separator.is_empty() {
        return Err(ConfigError::Validation(
            "proxmox.attribute_separator не должен быть пустым".to_string(),
        ));
    }
    if cfg.name.trim().is_empty() {
        return Err(ConfigError::Validation(
            "proxmox.name не должен быть пустым".to_string(),
        ));
    }
    if let Some(tz) = cfg.timezone.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        if tz.parse::<Tz>().is_err() {
            return Err(ConfigError::Validation(format!(
                "proxmox.timezone '{tz}' не является зоной IANA"
            )));
        }
    }
    if cfg.scheme != "https" && cfg.scheme != "http" {
        return Err(ConfigError::Validation(format!(
            "proxmox.scheme должен быть https или http, получено '{}'",
            cfg.scheme
        )));
    }
    if cfg.request_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "proxmox.request_timeout_secs должно быть >= 1".to_string(),
        ));
    }
    Ok(())
}

fn resolve_token_from_env(env_name: &str) -> Option<String> {
    if let Ok(v) = std::env::var(env_name) {
        if !v.trim().is_empty() {
            return Some(v);
        }
    }
    None
}

fn default_listen() -> String {
    "127.0.0.1:9221".to_string()
}

const fn default_interval_secs() -> u64 {
    60
}

fn default_name() -> String {
    "proxmox_server_status".to_string()
}

fn default_attribute_separator() -> String {
    ",".to_string()
}

fn default_scheme() -> String {
    "https".to_string()
}

const fn default_request_timeout_secs() -> u64 {
    20
}
