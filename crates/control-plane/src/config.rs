use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Control plane configuration
///
/// All values are read once at startup and injected into the server; nothing
/// here is consulted as mutable global state afterwards.
///
/// # Examples
///
/// ```
/// use sipmux_control_plane::ControlPlaneConfig;
///
/// let mut config = ControlPlaneConfig::default();
/// config.shared_secret = "s3cret".to_string();
/// config.advertised_hostports = vec!["198.51.100.10:5060".to_string()];
/// config.validate().expect("configuration should be valid");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// Address and port the client listener binds to
    ///
    /// Remote applications connect here over plain TCP; the channel is
    /// assumed to run on a trusted network or through an external tunnel.
    pub listen_addr: SocketAddr,

    /// Shared secret clients present in their `authenticate` request
    pub shared_secret: String,

    /// SIP `host:port` pairs this server answers on, reported to clients
    /// in the authenticate response so they can build Contact/Via headers
    pub advertised_hostports: Vec<String>,

    /// How long an accepted connection may sit unauthenticated before it
    /// is dropped
    pub auth_timeout: Duration,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9022)),
            shared_secret: "changeme".to_string(),
            advertised_hostports: Vec::new(),
            auth_timeout: Duration::from_secs(2),
        }
    }
}

impl ControlPlaneConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.shared_secret.is_empty() {
            return Err(Error::Configuration(
                "shared_secret must not be empty".to_string(),
            ));
        }
        if self.auth_timeout.is_zero() {
            return Err(Error::Configuration(
                "auth_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ControlPlaneConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.auth_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_empty_secret_rejected() {
        let mut config = ControlPlaneConfig::default();
        config.shared_secret = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_auth_timeout_rejected() {
        let mut config = ControlPlaneConfig::default();
        config.auth_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
