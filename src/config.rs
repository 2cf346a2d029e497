use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the circuitmap agent.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Control port connection configuration.
    #[serde(default)]
    pub control: ControlConfig,

    /// Geolocation database configuration.
    #[serde(default)]
    pub geoip: GeoIpConfig,

    /// Location of the machine running the relay, included in stream payloads.
    #[serde(default)]
    pub observer: Option<ObserverConfig>,

    /// Live delivery server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Throughput sampler configuration.
    #[serde(default)]
    pub traffic: TrafficConfig,
}

/// Control port connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Control port address (e.g., "127.0.0.1:9051").
    #[serde(default = "default_control_address")]
    pub address: String,

    /// Shared secret for AUTHENTICATE. Empty means no password.
    #[serde(default)]
    pub password: String,

    /// TCP connect timeout. Default: 5s.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Per-request timeout. Default: 10s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Delay before the subscription loop re-establishes a dropped session.
    /// Default: 5s.
    #[serde(default = "default_reconnect_interval", with = "humantime_serde")]
    pub reconnect_interval: Duration,
}

/// Geolocation database configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct GeoIpConfig {
    /// Path to a MaxMind City database (.mmdb).
    #[serde(default)]
    pub database: PathBuf,
}

/// Location of the local observer.
#[derive(Debug, Clone, Deserialize)]
pub struct ObserverConfig {
    /// Public address of the machine running the relay.
    pub ip: String,

    pub latitude: f64,

    pub longitude: f64,

    /// ISO country code, lower case as the relay reports it.
    #[serde(default)]
    pub country: Option<String>,
}

/// Live delivery server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address. ":port" binds all interfaces. Default: ":8080".
    #[serde(default = "default_server_addr")]
    pub addr: String,

    /// Keep-alive comment interval on the event stream. Default: 15s.
    #[serde(default = "default_keep_alive", with = "humantime_serde")]
    pub keep_alive: Duration,

    /// Payloads buffered per subscriber before a slow one starts lagging.
    /// Default: 1024.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

/// Throughput sampler configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TrafficConfig {
    /// Expose the /traffic endpoint. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

// --- Default value functions for serde ---

fn default_control_address() -> String {
    "127.0.0.1:9051".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_reconnect_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_server_addr() -> String {
    ":8080".to_string()
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(15)
}

fn default_broadcast_capacity() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

// --- Default trait impls ---

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            address: default_control_address(),
            password: String::new(),
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            reconnect_interval: default_reconnect_interval(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
            keep_alive: default_keep_alive(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.control.address.is_empty() {
            bail!("control.address is required");
        }

        if self.control.address.parse::<std::net::SocketAddr>().is_err() {
            bail!(
                "control.address must be an ip:port pair, got {:?}",
                self.control.address
            );
        }

        if self.control.connect_timeout.is_zero() {
            bail!("control.connect_timeout must be positive");
        }

        if self.control.request_timeout.is_zero() {
            bail!("control.request_timeout must be positive");
        }

        if self.geoip.database.as_os_str().is_empty() {
            bail!("geoip.database is required");
        }

        if let Some(observer) = &self.observer {
            if observer.ip.is_empty() {
                bail!("observer.ip is required when observer is set");
            }
            if !(-90.0..=90.0).contains(&observer.latitude) {
                bail!("observer.latitude must be within [-90, 90]");
            }
            if !(-180.0..=180.0).contains(&observer.longitude) {
                bail!("observer.longitude must be within [-180, 180]");
            }
        }

        if self.server.addr.is_empty() {
            bail!("server.addr is required");
        }

        if self.server.broadcast_capacity == 0 {
            bail!("server.broadcast_capacity must be positive");
        }

        if self.server.keep_alive.is_zero() {
            bail!("server.keep_alive must be positive");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn valid_config() -> Config {
        Config {
            geoip: GeoIpConfig {
                database: PathBuf::from("/var/lib/geoip/GeoLite2-City.mmdb"),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.control.address, "127.0.0.1:9051");
        assert_eq!(cfg.control.request_timeout, Duration::from_secs(10));
        assert_eq!(cfg.control.connect_timeout, Duration::from_secs(5));
        assert_eq!(cfg.server.addr, ":8080");
        assert_eq!(cfg.server.broadcast_capacity, 1024);
        assert!(cfg.traffic.enabled);
        assert!(cfg.observer.is_none());
    }

    #[test]
    fn test_validation_missing_database() {
        let cfg = Config::default();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("geoip.database"));
    }

    #[test]
    fn test_validation_control_address_needs_ip_and_port() {
        let mut cfg = valid_config();
        cfg.control.address = "localhost:9051".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("control.address"));

        cfg.control.address = "[::1]:9051".to_string();
        cfg.validate().unwrap();
    }

    #[test]
    fn test_validation_zero_request_timeout() {
        let mut cfg = valid_config();
        cfg.control.request_timeout = Duration::ZERO;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("control.request_timeout"));
    }

    #[test]
    fn test_validation_observer_latitude_out_of_range() {
        let mut cfg = valid_config();
        cfg.observer = Some(ObserverConfig {
            ip: "203.0.113.7".to_string(),
            latitude: 123.0,
            longitude: 0.0,
            country: None,
        });
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("observer.latitude"));
    }

    #[test]
    fn test_validation_broadcast_capacity_zero() {
        let mut cfg = valid_config();
        cfg.server.broadcast_capacity = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("server.broadcast_capacity"));
    }

    #[test]
    fn test_load_yaml_with_humantime_durations() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
control:
  address: "10.0.0.2:9151"
  password: "welcome"
  request_timeout: 2s
  reconnect_interval: 500ms
geoip:
  database: ./geoip/GeoLite2-City.mmdb
observer:
  ip: 203.0.113.7
  latitude: 37.5308
  longitude: 126.8751
  country: kr
server:
  addr: ":5050"
"#
        )
        .unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.control.address, "10.0.0.2:9151");
        assert_eq!(cfg.control.password, "welcome");
        assert_eq!(cfg.control.request_timeout, Duration::from_secs(2));
        assert_eq!(cfg.control.reconnect_interval, Duration::from_millis(500));
        assert_eq!(cfg.control.connect_timeout, Duration::from_secs(5));
        assert_eq!(
            cfg.geoip.database,
            PathBuf::from("./geoip/GeoLite2-City.mmdb")
        );

        let observer = cfg.observer.unwrap();
        assert_eq!(observer.country.as_deref(), Some("kr"));
        assert_eq!(cfg.server.addr, ":5050");
        assert_eq!(cfg.server.keep_alive, Duration::from_secs(15));
    }

    #[test]
    fn test_load_rejects_invalid_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "control: [not, a, map]").unwrap();

        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("parsing config file"));
    }
}
