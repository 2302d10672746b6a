//! Konfiguration aus Umgebungsvariablen
//!
//! Alle Werte haben Defaults; ungültige Werte sind ein Fehler statt still
//! ignoriert zu werden.

use crate::transport::{PeerIdentity, TcpRadioConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

pub const ENV_BACKEND: &str = "BLUECALL_BACKEND";
pub const ENV_DEVICE_NAME: &str = "BLUECALL_DEVICE_NAME";
pub const ENV_LISTEN_ADDR: &str = "BLUECALL_LISTEN_ADDR";
pub const ENV_PEERS: &str = "BLUECALL_PEERS";
pub const ENV_DB_PATH: &str = "BLUECALL_DB_PATH";
pub const ENV_READ_TIMEOUT_MS: &str = "BLUECALL_READ_TIMEOUT_MS";
pub const ENV_CONNECT_TIMEOUT_SECS: &str = "BLUECALL_CONNECT_TIMEOUT_SECS";
pub const ENV_SCAN_SECS: &str = "BLUECALL_SCAN_SECS";
pub const ENV_MAX_CALL_SECS: &str = "BLUECALL_MAX_CALL_SECS";

const DEFAULT_DEVICE_NAME: &str = "bluecall";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:7341";
const DEFAULT_READ_TIMEOUT_MS: u64 = 250;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SCAN_SECS: u64 = 10;

/// Poll-Intervall des TCP-Listeners
const ACCEPT_POLL: Duration = Duration::from_millis(100);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.into(),
    }
}

// ============================================================================
// BACKEND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// `host:port` über TCP
    Tcp,
    /// BlueZ RFCOMM (Linux, Feature `bluez`)
    Bluez,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Backend::Tcp),
            "bluez" | "bluetooth" => Ok(Backend::Bluez),
            other => Err(format!("unknown backend '{}', expected tcp or bluez", other)),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Tcp => f.write_str("tcp"),
            Backend::Bluez => f.write_str("bluez"),
        }
    }
}

// ============================================================================
// CALL CONFIG
// ============================================================================

#[derive(Debug, Clone)]
pub struct CallConfig {
    pub backend: Backend,
    pub device_name: String,
    pub listen_addr: SocketAddr,
    /// Bekannte Peers des TCP-Backends
    pub peers: Vec<PeerIdentity>,
    /// `None`: Datei im App-Datenverzeichnis
    pub db_path: Option<PathBuf>,
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
    pub scan_timeout: Duration,
    pub max_call_duration: Option<Duration>,
}

impl CallConfig {
    /// Liest die Konfiguration aus der Prozess-Umgebung
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Liest die Konfiguration über eine beliebige Lookup-Funktion
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backend = match get(ENV_BACKEND) {
            Some(value) => value
                .parse()
                .map_err(|reason: String| invalid(ENV_BACKEND, &value, reason))?,
            None => Backend::Tcp,
        };

        let device_name = get(ENV_DEVICE_NAME)
            .or_else(|| get("HOSTNAME"))
            .or_else(|| get("COMPUTERNAME"))
            .unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string());

        let listen_value = get(ENV_LISTEN_ADDR).unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr = listen_value
            .trim()
            .parse()
            .map_err(|e: std::net::AddrParseError| {
                invalid(ENV_LISTEN_ADDR, &listen_value, e.to_string())
            })?;

        let peers = match get(ENV_PEERS) {
            Some(value) => parse_peers(&value)?,
            None => Vec::new(),
        };

        let read_timeout = Duration::from_millis(positive(
            ENV_READ_TIMEOUT_MS,
            get(ENV_READ_TIMEOUT_MS),
            DEFAULT_READ_TIMEOUT_MS,
        )?);
        let connect_timeout = Duration::from_secs(positive(
            ENV_CONNECT_TIMEOUT_SECS,
            get(ENV_CONNECT_TIMEOUT_SECS),
            DEFAULT_CONNECT_TIMEOUT_SECS,
        )?);
        let scan_timeout =
            Duration::from_secs(positive(ENV_SCAN_SECS, get(ENV_SCAN_SECS), DEFAULT_SCAN_SECS)?);

        let max_call_duration = match get(ENV_MAX_CALL_SECS) {
            Some(value) => Some(Duration::from_secs(positive(ENV_MAX_CALL_SECS, Some(value), 0)?)),
            None => None,
        };

        Ok(Self {
            backend,
            device_name,
            listen_addr,
            peers,
            db_path: get(ENV_DB_PATH).map(PathBuf::from),
            read_timeout,
            connect_timeout,
            scan_timeout,
            max_call_duration,
        })
    }

    /// Einstellungen für das TCP-Backend
    pub fn tcp_radio_config(&self) -> TcpRadioConfig {
        TcpRadioConfig {
            local_name: self.device_name.clone(),
            listen_addr: self.listen_addr,
            known_peers: self.peers.clone(),
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            accept_poll: ACCEPT_POLL,
        }
    }
}

/// Ganzzahl > 0, sonst Fehler; fehlt der Wert, gilt `default`
fn positive(key: &'static str, value: Option<String>, default: u64) -> Result<u64, ConfigError> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.trim().parse::<u64>() {
        Ok(0) => Err(invalid(key, &value, "must be greater than zero")),
        Ok(n) => Ok(n),
        Err(e) => Err(invalid(key, &value, e.to_string())),
    }
}

/// `Name@host:port,host:port,...`; ohne Namen gilt die Adresse als Name
fn parse_peers(value: &str) -> Result<Vec<PeerIdentity>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (name, address) = match entry.rsplit_once('@') {
                Some((name, address)) => (name.trim(), address.trim()),
                None => (entry, entry),
            };
            if name.is_empty() || address.is_empty() {
                return Err(invalid(ENV_PEERS, entry, "expected Name@host:port"));
            }
            Ok(PeerIdentity::new(name, address))
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<CallConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        CallConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.backend, Backend::Tcp);
        assert_eq!(config.device_name, "bluecall");
        assert_eq!(config.listen_addr, "0.0.0.0:7341".parse().unwrap());
        assert!(config.peers.is_empty());
        assert!(config.db_path.is_none());
        assert_eq!(config.read_timeout, Duration::from_millis(250));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.scan_timeout, Duration::from_secs(10));
        assert!(config.max_call_duration.is_none());
    }

    #[test]
    fn test_device_name_falls_back_to_host_name() {
        let config = load(&[("HOSTNAME", "desk")]).unwrap();
        assert_eq!(config.device_name, "desk");

        let config = load(&[("HOSTNAME", "desk"), (ENV_DEVICE_NAME, "Kitchen")]).unwrap();
        assert_eq!(config.device_name, "Kitchen");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            (ENV_BACKEND, "BlueZ"),
            (ENV_LISTEN_ADDR, "127.0.0.1:9000"),
            (ENV_DB_PATH, "/tmp/calls.db"),
            (ENV_READ_TIMEOUT_MS, "100"),
            (ENV_MAX_CALL_SECS, "60"),
        ])
        .unwrap();

        assert_eq!(config.backend, Backend::Bluez);
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/calls.db")));
        assert_eq!(config.read_timeout, Duration::from_millis(100));
        assert_eq!(config.max_call_duration, Some(Duration::from_secs(60)));
        assert_eq!(config.tcp_radio_config().read_timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_peer_list() {
        let config = load(&[(ENV_PEERS, "Kitchen@10.0.0.5:7341, 10.0.0.6:7341,")]).unwrap();
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[0].name, "Kitchen");
        assert_eq!(config.peers[0].address, "10.0.0.5:7341");
        assert_eq!(config.peers[1].name, "10.0.0.6:7341");

        assert!(matches!(
            load(&[(ENV_PEERS, "@10.0.0.5:7341")]),
            Err(ConfigError::Invalid { key: ENV_PEERS, .. })
        ));
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            load(&[(ENV_BACKEND, "serial")]),
            Err(ConfigError::Invalid { key: ENV_BACKEND, .. })
        ));
        assert!(matches!(
            load(&[(ENV_READ_TIMEOUT_MS, "0")]),
            Err(ConfigError::Invalid { key: ENV_READ_TIMEOUT_MS, .. })
        ));
        assert!(matches!(
            load(&[(ENV_LISTEN_ADDR, "nowhere")]),
            Err(ConfigError::Invalid { key: ENV_LISTEN_ADDR, .. })
        ));
        assert!(matches!(
            load(&[(ENV_MAX_CALL_SECS, "soon")]),
            Err(ConfigError::Invalid { key: ENV_MAX_CALL_SECS, .. })
        ));
    }
}
