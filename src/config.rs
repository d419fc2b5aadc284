use std::{net::SocketAddr, str::FromStr};

use anyhow::{Context, anyhow};

use crate::relay::{DEFAULT_OUTBOUND_CAPACITY, SessionPolicy};

pub const MEMORY_DATABASE: &str = "memory";

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite url, or `memory` for the in-process store.
    pub database_url: String,
    pub db_max_connections: u32,
    pub bind_addr: SocketAddr,
    pub cors_origin: String,
    pub session_policy: SessionPolicy,
    /// Events that may queue for one connection before new ones are dropped.
    pub outbound_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://chat.db?mode=rwc".to_owned(),
            db_max_connections: 16,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
            cors_origin: "http://localhost:3000".to_owned(),
            session_policy: SessionPolicy::LastWriterWins,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

impl Config {
    /// Reads the environment, after loading `.env` if there is one.
    pub fn from_env() -> anyhow::Result<Config> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Config> {
        let mut config = Config::default();

        if let Some(url) = lookup("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(max) = lookup("DB_MAX_CONNECTIONS") {
            config.db_max_connections = max.parse().with_context(|| format!("DB_MAX_CONNECTIONS={max}"))?;
        }
        if let Some(addr) = lookup("BIND_ADDR") {
            config.bind_addr = addr.parse().with_context(|| format!("BIND_ADDR={addr}"))?;
        }
        if let Some(origin) = lookup("CORS_ORIGIN") {
            config.cors_origin = origin;
        }
        if let Some(policy) = lookup("SESSION_POLICY") {
            config.session_policy = policy.parse()?;
        }
        if let Some(capacity) = lookup("OUTBOUND_CAPACITY") {
            config.outbound_capacity = capacity.parse().with_context(|| format!("OUTBOUND_CAPACITY={capacity}"))?;
            if config.outbound_capacity == 0 {
                return Err(anyhow!("OUTBOUND_CAPACITY must be at least 1"));
            }
        }

        Ok(config)
    }

    pub fn uses_memory_store(&self) -> bool {
        self.database_url == MEMORY_DATABASE
    }
}

impl FromStr for SessionPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.trim().to_owned()))
            .map_err(|_| anyhow!("SESSION_POLICY must be last-writer-wins or multi-session, got {s:?}"))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<_, _> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = from(&[]).unwrap();
        assert_eq!(config.bind_addr.port(), 3001);
        assert_eq!(config.cors_origin, "http://localhost:3000");
        assert_eq!(config.session_policy, SessionPolicy::LastWriterWins);
        assert!(!config.uses_memory_store());
        assert_eq!(config.outbound_capacity, DEFAULT_OUTBOUND_CAPACITY);
    }

    #[test]
    fn overrides() {
        let config = from(&[
            ("DATABASE_URL", "memory"),
            ("BIND_ADDR", "127.0.0.1:9000"),
            ("SESSION_POLICY", "multi-session"),
            ("DB_MAX_CONNECTIONS", "4"),
            ("OUTBOUND_CAPACITY", "8"),
        ])
        .unwrap();
        assert!(config.uses_memory_store());
        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.session_policy, SessionPolicy::MultiSession);
        assert_eq!(config.db_max_connections, 4);
        assert_eq!(config.outbound_capacity, 8);
    }

    #[test]
    fn bad_values_are_errors() {
        assert!(from(&[("SESSION_POLICY", "both")]).is_err());
        assert!(from(&[("BIND_ADDR", "nowhere")]).is_err());
        assert!(from(&[("OUTBOUND_CAPACITY", "0")]).is_err());
    }
}
