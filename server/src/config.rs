//! Configuration management for Hearth Server

use hearth_core::models::IceServer;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub ice: IceConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for relay tokens. Without one, any user id is accepted.
    pub shared_secret: Option<String>,
    pub token_ttl_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    pub servers: Vec<IceServer>,
    pub turn: Option<TurnConfig>,
}

/// TURN server using time-limited REST credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    pub urls: Vec<String>,
    pub username: String,
    pub secret: String,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_frame_size_kb: u64,
    pub max_connections_per_user: usize,
}

impl Config {
    pub async fn load(path: &str) -> anyhow::Result<Self> {
        if Path::new(path).exists() {
            let content = fs::read_to_string(path).await?;
            let config: Config = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            let content = toml::to_string_pretty(&config)?;
            fs::write(path, content).await?;
            tracing::info!("Created default config at {}", path);
            Ok(config)
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.limits.max_frame_size_kb == 0 {
            anyhow::bail!("limits.max_frame_size_kb must be positive");
        }
        if self.limits.max_connections_per_user == 0 {
            anyhow::bail!("limits.max_connections_per_user must be positive");
        }
        if matches!(&self.auth.shared_secret, Some(secret) if secret.len() < 16) {
            anyhow::bail!("auth.shared_secret must be at least 16 characters");
        }
        Ok(())
    }

    pub fn max_frame_bytes(&self) -> usize {
        (self.limits.max_frame_size_kb * 1024) as usize
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 9443,
            },
            auth: AuthConfig {
                shared_secret: None,
                token_ttl_hours: 24 * 30,
            },
            ice: IceConfig {
                servers: IceServer::public_defaults(),
                turn: None,
            },
            limits: LimitsConfig {
                max_frame_size_kb: 64,
                max_connections_per_user: 5,
            },
        }
    }
}
