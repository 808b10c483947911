//! Startup configuration.
//!
//! One JSON file, parsed at startup and again on SIGHUP. Only the MOTD,
//! operator credentials, server links, and per-user overrides may change on
//! rehash; listener addresses, identity, and TLS material are fixed for the
//! process lifetime.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use minnow_proto::{names, Sid};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A configured server link. We dial it when not linked; it may dial us.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LinkConfig {
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub pass: String,
    #[serde(default)]
    pub tls: bool,
}

/// Per-user overrides, matched against `user!host` at registration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserConfig {
    pub user_mask: String,
    pub host_mask: String,
    #[serde(default)]
    pub flood_exempt: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub server_name: String,
    pub ts6_sid: Sid,
    pub server_info: String,

    #[serde(default = "defaults::listen_host")]
    pub listen_host: String,
    pub listen_port: Option<u16>,
    pub listen_port_tls: Option<u16>,

    pub certificate_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,

    #[serde(default = "defaults::ping_time")]
    pub ping_time: u64,
    #[serde(default = "defaults::dead_time")]
    pub dead_time: u64,
    #[serde(default = "defaults::connect_attempt_time")]
    pub connect_attempt_time: u64,

    #[serde(default = "defaults::max_nick_length")]
    pub max_nick_length: usize,

    pub motd: Option<PathBuf>,

    /// Operator name to password.
    #[serde(default)]
    pub opers: HashMap<String, String>,
    #[serde(default)]
    pub servers: Vec<LinkConfig>,
    #[serde(default)]
    pub user_configs: Vec<UserConfig>,
}

mod defaults {
    pub fn listen_host() -> String {
        "0.0.0.0".to_string()
    }
    pub fn ping_time() -> u64 {
        30
    }
    pub fn dead_time() -> u64 {
        240
    }
    pub fn connect_attempt_time() -> u64 {
        60
    }
    pub fn max_nick_length() -> usize {
        15
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let config: Config = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !names::is_valid_server_name(&self.server_name) {
            return Err(ConfigError::Invalid(format!(
                "bad server-name: {:?}",
                self.server_name
            )));
        }
        if self.listen_port.is_none() && self.listen_port_tls.is_none() {
            return Err(ConfigError::Invalid(
                "at least one of listen-port and listen-port-tls is required".to_string(),
            ));
        }
        let needs_tls =
            self.listen_port_tls.is_some() || self.servers.iter().any(|link| link.tls);
        if needs_tls && (self.certificate_file.is_none() || self.key_file.is_none()) {
            return Err(ConfigError::Invalid(
                "certificate-file and key-file are required for TLS".to_string(),
            ));
        }
        if self.ping_time == 0 || self.dead_time == 0 || self.connect_attempt_time == 0 {
            return Err(ConfigError::Invalid(
                "ping-time, dead-time and connect-attempt-time must be positive".to_string(),
            ));
        }
        if self.max_nick_length == 0 {
            return Err(ConfigError::Invalid(
                "max-nick-length must be positive".to_string(),
            ));
        }
        for link in &self.servers {
            if !names::is_valid_server_name(&link.name) {
                return Err(ConfigError::Invalid(format!(
                    "bad link name: {:?}",
                    link.name
                )));
            }
        }
        Ok(())
    }

    pub fn ping_time(&self) -> Duration {
        Duration::from_secs(self.ping_time)
    }

    pub fn dead_time(&self) -> Duration {
        Duration::from_secs(self.dead_time)
    }

    pub fn find_link(&self, name: &str) -> Option<&LinkConfig> {
        self.servers.iter().find(|link| link.name == name)
    }

    /// Read the MOTD file into lines; a missing or unset file is an empty
    /// MOTD, not an error.
    pub fn load_motd(&self) -> Vec<String> {
        let Some(path) = &self.motd else {
            return Vec::new();
        };
        match std::fs::read_to_string(path) {
            Ok(text) => text.lines().map(str::to_string).collect(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unable to read MOTD");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<Config, ConfigError> {
        let config: Config = serde_json::from_str(json).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn minimal_config() {
        let config = parse(
            r#"{
                "server-name": "irc.example.com",
                "ts6-sid": "1AA",
                "server-info": "test server",
                "listen-port": 6667
            }"#,
        )
        .unwrap();
        assert_eq!(config.server_name, "irc.example.com");
        assert_eq!(config.ts6_sid.as_str(), "1AA");
        assert_eq!(config.ping_time, 30);
        assert!(config.opers.is_empty());
    }

    #[test]
    fn rejects_missing_listener() {
        let err = parse(
            r#"{
                "server-name": "irc.example.com",
                "ts6-sid": "1AA",
                "server-info": "test server"
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_bad_sid() {
        assert!(parse(
            r#"{
                "server-name": "irc.example.com",
                "ts6-sid": "toolong",
                "server-info": "x",
                "listen-port": 6667
            }"#,
        )
        .is_err());
    }

    #[test]
    fn tls_link_requires_material() {
        let err = parse(
            r#"{
                "server-name": "irc.example.com",
                "ts6-sid": "1AA",
                "server-info": "x",
                "listen-port": 6667,
                "servers": [
                    {"name": "peer.example.com", "hostname": "10.0.0.2",
                     "port": 7000, "pass": "sekrit", "tls": true}
                ]
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
