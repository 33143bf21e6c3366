//! Server configuration surface.
//!
//! Filled in by the caller before start. SSID and passphrase are optional:
//! platforms that cannot host a custom-named group substitute their own
//! values, mirrored back through [`crate::NetworkGroupInfo`] once the group
//! is up.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default proxy listening port.
pub const DEFAULT_PROXY_PORT: u16 = 8228;

/// Ports at or below this are reserved and rejected.
const PRIVILEGED_PORT_MAX: u16 = 1024;

/// Configuration errors surfaced before any group work begins.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The listening port is reserved.
    #[error("invalid port {0}: must be above 1024")]
    InvalidPort(u16),

    /// The SSID is empty or too long.
    #[error("invalid SSID {0:?}: must be 1-32 characters")]
    InvalidSsid(String),

    /// The passphrase does not meet WPA2 length rules.
    #[error("invalid passphrase: must be 8-63 characters")]
    InvalidPassphrase,
}

/// Frequency band preference for the hosted group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerNetworkBand {
    /// Let the radio pick.
    #[default]
    Auto,
    /// Prefer 2.4 GHz for range and older clients.
    Band2G,
    /// Prefer 5 GHz for throughput.
    Band5G,
}

impl ServerNetworkBand {
    /// Returns the band name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerNetworkBand::Auto => "auto",
            ServerNetworkBand::Band2G => "2.4ghz",
            ServerNetworkBand::Band5G => "5ghz",
        }
    }

    /// Parses a band from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(ServerNetworkBand::Auto),
            "2.4ghz" | "2g" | "legacy" => Some(ServerNetworkBand::Band2G),
            "5ghz" | "5g" | "modern" => Some(ServerNetworkBand::Band5G),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServerNetworkBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything a caller supplies before starting the hotspot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Network name; platform default when absent.
    pub ssid: Option<String>,
    /// WPA2 passphrase; platform default when absent.
    pub passphrase: Option<String>,
    /// Proxy listening port on the group's local address.
    pub port: u16,
    /// Frequency band preference.
    pub band: ServerNetworkBand,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ssid: None,
            passphrase: None,
            port: DEFAULT_PROXY_PORT,
            band: ServerNetworkBand::Auto,
        }
    }
}

impl ServerConfig {
    /// Sets a custom network name.
    #[must_use]
    pub fn with_ssid(mut self, ssid: impl Into<String>) -> Self {
        self.ssid = Some(ssid.into());
        self
    }

    /// Sets a custom passphrase.
    #[must_use]
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Sets the proxy listening port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the frequency band preference.
    #[must_use]
    pub fn with_band(mut self, band: ServerNetworkBand) -> Self {
        self.band = band;
        self
    }

    /// Validates the configuration before any group work begins.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port <= PRIVILEGED_PORT_MAX {
            return Err(ConfigError::InvalidPort(self.port));
        }
        if let Some(ssid) = &self.ssid {
            if ssid.is_empty() || ssid.len() > 32 {
                return Err(ConfigError::InvalidSsid(ssid.clone()));
            }
        }
        if let Some(passphrase) = &self.passphrase {
            if passphrase.len() < 8 || passphrase.len() > 63 {
                return Err(ConfigError::InvalidPassphrase);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ServerConfig::default();
        assert_eq!(config.port, DEFAULT_PROXY_PORT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn privileged_port_is_rejected() {
        let config = ServerConfig::default().with_port(80);
        assert_eq!(config.validate(), Err(ConfigError::InvalidPort(80)));

        let config = ServerConfig::default().with_port(1024);
        assert_eq!(config.validate(), Err(ConfigError::InvalidPort(1024)));

        let config = ServerConfig::default().with_port(1025);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn ssid_length_is_checked() {
        let config = ServerConfig::default().with_ssid("");
        assert!(matches!(config.validate(), Err(ConfigError::InvalidSsid(_))));

        let config = ServerConfig::default().with_ssid("x".repeat(33));
        assert!(matches!(config.validate(), Err(ConfigError::InvalidSsid(_))));

        let config = ServerConfig::default().with_ssid("pod-net");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn passphrase_length_is_checked() {
        let config = ServerConfig::default().with_passphrase("short");
        assert_eq!(config.validate(), Err(ConfigError::InvalidPassphrase));

        let config = ServerConfig::default().with_passphrase("x".repeat(64));
        assert_eq!(config.validate(), Err(ConfigError::InvalidPassphrase));

        let config = ServerConfig::default().with_passphrase("longenough");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn band_parse_round_trip() {
        for band in [
            ServerNetworkBand::Auto,
            ServerNetworkBand::Band2G,
            ServerNetworkBand::Band5G,
        ] {
            assert_eq!(ServerNetworkBand::parse(band.as_str()), Some(band));
        }
        assert_eq!(ServerNetworkBand::parse("6ghz"), None);
    }

    #[test]
    fn config_serialization_round_trip() {
        let config = ServerConfig::default()
            .with_ssid("pod-net")
            .with_band(ServerNetworkBand::Band5G);
        let json = serde_json::to_string(&config).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
