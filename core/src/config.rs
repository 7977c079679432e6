//! Client configuration

use crate::error::{Error, Result};
use crate::models::IceServer;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server: ServerConfig,
    pub calls: CallConfig,
    pub threads: ThreadConfig,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    pub ice_servers: Vec<IceServer>,
    /// How long a call may stay Ringing or Connecting.
    pub connect_timeout_secs: u64,
    pub allow_microphone: bool,
    pub allow_camera: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadConfig {
    /// Idle time after the last keystroke before `typing=false` is sent.
    pub typing_idle_ms: u64,
    /// Receiver-side expiry of a `typing=true` with no follow-up.
    pub typing_expiry_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay added as random jitter, 0.0 to 1.0.
    pub jitter: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "localhost".to_string(),
                port: 9443,
                use_tls: false,
            },
            calls: CallConfig {
                ice_servers: IceServer::public_defaults(),
                connect_timeout_secs: 45,
                allow_microphone: true,
                allow_camera: true,
            },
            threads: ThreadConfig {
                typing_idle_ms: 2_000,
                typing_expiry_ms: 3_000,
            },
            reconnect: ReconnectConfig {
                initial_delay_ms: 500,
                max_delay_ms: 30_000,
                jitter: 0.2,
            },
        }
    }
}

impl ClientConfig {
    pub fn new(host: &str, port: u16, use_tls: bool) -> Self {
        let mut config = Self::default();
        config.server = ServerConfig {
            host: host.to_string(),
            port,
            use_tls,
        };
        config
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            return Err(Error::Config("server.host is empty".to_string()));
        }
        url::Url::parse(&self.ws_url())
            .map_err(|e| Error::Config(format!("invalid server address: {}", e)))?;
        if self.calls.connect_timeout_secs == 0 {
            return Err(Error::Config("calls.connect_timeout_secs must be positive".to_string()));
        }
        if self.reconnect.initial_delay_ms == 0
            || self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms
        {
            return Err(Error::Config("reconnect delays are inconsistent".to_string()));
        }
        Ok(())
    }

    pub fn http_url(&self) -> String {
        let scheme = if self.server.use_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.server.host, self.server.port)
    }

    pub fn ws_url(&self) -> String {
        let scheme = if self.server.use_tls { "wss" } else { "ws" };
        format!("{}://{}:{}/ws", scheme, self.server.host, self.server.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.calls.connect_timeout_secs)
    }
}

impl ThreadConfig {
    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    pub fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_expiry_ms)
    }
}

impl ReconnectConfig {
    /// Delay before reconnect attempt `attempt` (1-based): doubles from the
    /// initial delay up to the cap, plus jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let extra = if jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=jitter) * base as f64
        } else {
            0.0
        };
        Duration::from_millis(base + extra as u64)
    }
}
