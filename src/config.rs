//! Runtime configuration, loaded from TOML the same way the teacher's
//! `rhc` node config is: a `serde`-derived struct with `Default`, parsed
//! with the `toml` crate, one file per process.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address a master binds to when publishing a topic.
    pub listen_addr: SocketAddr,
    pub cloner: ClonerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: "127.0.0.1:7890".parse().expect("valid default listen address"),
            cloner: ClonerConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClonerConfig {
    /// How long a cloner waits between failed connection attempts.
    #[serde(with = "duration_secs")]
    pub reconnect_backoff: Duration,
    /// Default timeout `async_request` uses when a caller doesn't supply
    /// one of its own.
    #[serde(with = "duration_secs")]
    pub default_request_timeout: Duration,
}

impl Default for ClonerConfig {
    fn default() -> Self {
        ClonerConfig {
            reconnect_backoff: Duration::from_secs(3),
            default_request_timeout: Duration::from_secs(5),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let cfg = Config::default();
        let s = toml::to_string(&cfg).unwrap();
        let parsed = Config::from_toml_str(&s).unwrap();
        assert_eq!(parsed.listen_addr, cfg.listen_addr);
        assert_eq!(parsed.cloner.reconnect_backoff, cfg.cloner.reconnect_backoff);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg = Config::from_toml_str(r#"listen_addr = "0.0.0.0:9000""#).unwrap();
        assert_eq!(cfg.listen_addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(cfg.cloner.reconnect_backoff, Duration::from_secs(3));
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let err = Config::from_toml_str("not valid toml {{{").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn from_file_reads_and_parses_toml_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kvreplica.toml");
        std::fs::write(&path, r#"listen_addr = "127.0.0.1:4000""#).unwrap();

        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:4000".parse().unwrap());
    }
}
