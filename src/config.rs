//! Configuration loading
//!
//! The daemon reads a TOML file (by default `$HOME/.bgpmond.toml`) merged
//! with `BGPMOND_`-prefixed environment variables. The file carries the RPC
//! bind address, named session definitions, and the configured nodes that
//! seed the node registry on session open.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level daemon configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BgpmondConfig {
    /// RPC bind address
    #[serde(default = "default_address")]
    pub address: String,

    /// RPC port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Verbose logging
    #[serde(default)]
    pub debug: bool,

    /// Named session definitions available to `session.open`
    #[serde(default)]
    pub sessions: HashMap<String, SessionConfig>,

    /// Nodes seeded into the node registry when a session opens
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6060
}

fn default_workers() -> usize {
    4
}

impl BgpmondConfig {
    /// Load configuration from `path`, or from `$HOME/.bgpmond.toml` when no
    /// path is given, layered under `BGPMOND_` environment variables.
    pub fn load(path: &Option<String>) -> Result<BgpmondConfig> {
        let mut builder = config::Config::builder();

        match path {
            Some(p) => {
                if !Path::new(p).exists() {
                    return Err(Error::config(format!("config file not found: {}", p)));
                }
                builder = builder.add_source(config::File::with_name(p));
            }
            None => {
                if let Some(home) = dirs::home_dir() {
                    let default = home.join(".bgpmond.toml");
                    if default.exists() {
                        builder = builder.add_source(config::File::from(default));
                    }
                }
            }
        }

        builder =
            builder.add_source(config::Environment::with_prefix("BGPMOND").try_parsing(true));

        let settings = builder.build().map_err(|e| Error::config(e.to_string()))?;
        settings
            .try_deserialize()
            .map_err(|e| Error::config(e.to_string()))
    }

    /// Look up a named session definition
    pub fn session(&self, name: &str) -> Result<&SessionConfig> {
        self.sessions
            .get(name)
            .ok_or_else(|| Error::not_found(format!("session type {}", name)))
    }
}

/// One configured database session
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Backend type: `postgres` (or `cockroachdb`, which is rejected)
    #[serde(rename = "type")]
    pub type_name: String,

    pub user: String,
    pub password: String,
    pub database_name: String,

    /// Database hosts; postgres requires exactly one
    pub hosts: Vec<String>,

    /// Client certificate directory; empty selects the no-SSL template
    #[serde(default)]
    pub cert_dir: String,

    /// Default worker-pool size for streams on this session
    #[serde(default = "default_workers")]
    pub workers: usize,
}

/// One configured BGP observation point
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub ip: String,
    #[serde(default)]
    pub is_collector: bool,
    #[serde(default)]
    pub dump_duration_minutes: i32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub coords: String,
    #[serde(default)]
    pub location: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lookup() {
        let mut config = BgpmondConfig::default();
        config.sessions.insert(
            "LocalPostgres".to_string(),
            SessionConfig {
                type_name: "postgres".to_string(),
                user: "bgpmon".to_string(),
                password: "secret".to_string(),
                database_name: "bgpmon".to_string(),
                hosts: vec!["localhost".to_string()],
                cert_dir: String::new(),
                workers: 4,
            },
        );

        assert!(config.session("LocalPostgres").is_ok());
        assert!(matches!(config.session("missing"), Err(Error::NotFound(_))));
    }
}
