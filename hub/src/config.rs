use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub session_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub entry_grace_secs: u64,
    pub heartbeat_interval_secs: u64,
}

impl HubConfig {
    pub fn load() -> Self {
        HubConfig {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            session_ttl_secs: env_u64("SESSION_TTL_SECS", 3600),
            sweep_interval_secs: env_u64("SWEEP_INTERVAL_SECS", 60),
            entry_grace_secs: env_u64("ENTRY_GRACE_SECS", 30),
            heartbeat_interval_secs: env_u64("HEARTBEAT_INTERVAL_SECS", 30),
        }
    }

    /// `/debug` is mounted only for the exact `development` label.
    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_ttl_secs as i64)
    }

    pub fn entry_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.entry_grace_secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            environment: "development".to_string(),
            session_ttl_secs: 3600,
            sweep_interval_secs: 60,
            entry_grace_secs: 30,
            heartbeat_interval_secs: 30,
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
