use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::security::signature::SignatureMode;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Agent version advertised in heartbeat responses
    pub latest_agent_version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
            latest_agent_version: "1.0.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub requests_per_minute: u32,
    pub burst_size: u32,
    pub bucket_idle_secs: u64,
    pub bucket_sweep_interval_secs: u64,
    pub credential_sweep_interval_secs: u64,
    pub signature_mode: SignatureMode,
    pub max_body_bytes: usize,
    pub cors: CorsConfig,
    /// Peers allowed to report the client address via forwarding headers
    pub trusted_proxies: Vec<String>,
    pub admin_token: Option<String>,
    pub init_api_key: Option<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 100,
            burst_size: 20,
            bucket_idle_secs: 300,
            bucket_sweep_interval_secs: 300,
            credential_sweep_interval_secs: 3600,
            signature_mode: SignatureMode::Compat,
            max_body_bytes: 1024 * 1024,
            cors: CorsConfig::default(),
            trusted_proxies: Vec::new(),
            admin_token: None,
            init_api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub allow_credentials: bool,
}

impl Default for CorsConfig {
    /// Permissive development defaults; production deployments list origins explicitly.
    fn default() -> Self {
        Self::with_origins(vec!["*".to_string()])
    }
}

impl CorsConfig {
    pub fn with_origins(origins: Vec<String>) -> Self {
        Self {
            allowed_origins: origins,
            allowed_methods: ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            allowed_headers: vec![
                "Authorization".to_string(),
                "Content-Type".to_string(),
                crate::security::signature::TIMESTAMP_HEADER.to_string(),
                crate::security::signature::SIGNATURE_HEADER.to_string(),
            ],
            allow_credentials: true,
        }
    }
}

impl Config {
    /// Load configuration from an optional JSON file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Config::default(),
        };

        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from the environment. Empty variables are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("INIT_API_KEY").filter(|v| !v.is_empty()) {
            self.security.init_api_key = Some(key);
        }
        if let Some(token) = lookup("FLEET_ADMIN_TOKEN").filter(|v| !v.is_empty()) {
            self.security.admin_token = Some(token);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.security.requests_per_minute == 0 {
            return Err(ConfigError::Invalid("requests_per_minute must be positive".into()));
        }
        if self.security.burst_size == 0 {
            return Err(ConfigError::Invalid("burst_size must be positive".into()));
        }
        if self.security.bucket_sweep_interval_secs == 0
            || self.security.credential_sweep_interval_secs == 0
        {
            return Err(ConfigError::Invalid("sweep intervals must be positive".into()));
        }
        if let Some(bad) = self
            .security
            .trusted_proxies
            .iter()
            .find(|addr| addr.trim().parse::<std::net::IpAddr>().is_err())
        {
            return Err(ConfigError::Invalid(format!("invalid trusted proxy address {:?}", bad)));
        }
        if matches!(&self.security.admin_token, Some(token) if token.len() < 16) {
            return Err(ConfigError::Invalid("admin_token must be at least 16 characters".into()));
        }
        Ok(())
    }
}
