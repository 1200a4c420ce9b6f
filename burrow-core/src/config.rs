use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Log verbosity, from quietest to noisiest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Silent,
    Error,
    Warning,
    Info,
    Debug,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Warning
    }
}

/// Tunnel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// The DNS server address apps on the TUN device believe they are using.
    /// Flows to this address are intercepted and served over DoH.
    pub fake_dns: SocketAddr,
    /// Pre-emptively split every HTTPS connection instead of splitting only
    /// on retry.
    #[serde(default)]
    pub always_split_https: bool,
    /// Idle lifetime of a UDP NAT mapping.
    #[serde(default = "default_udp_timeout")]
    pub udp_timeout: Duration,
    /// TCP connect timeout for outbound dials. `None` leaves it to the OS.
    #[serde(default)]
    pub connect_timeout: Option<Duration>,
    #[serde(default)]
    pub log_level: LogLevel,
}

// RFC 5382 REQ-5 requires a timeout no shorter than 2 hours 4 minutes.
fn default_udp_timeout() -> Duration {
    Duration::from_secs(2 * 60 * 60 + 4 * 60)
}

impl TunnelConfig {
    pub fn new(fake_dns: SocketAddr) -> Self {
        Self {
            fake_dns,
            always_split_https: false,
            udp_timeout: default_udp_timeout(),
            connect_timeout: None,
            log_level: LogLevel::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.fake_dns.port() == 0 {
            return Err(Error::config("fake DNS address needs a port"));
        }
        if self.udp_timeout.is_zero() {
            return Err(Error::config("UDP timeout must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_rfc5382() {
        let config = TunnelConfig::new("10.111.222.3:53".parse().unwrap());
        assert_eq!(config.udp_timeout, Duration::from_secs(7440));
        assert!(!config.always_split_https);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_port_is_rejected() {
        let config = TunnelConfig::new("10.111.222.3:0".parse().unwrap());
        assert!(config.validate().is_err());
    }

    #[test]
    fn round_trips_through_serde() {
        let config = TunnelConfig::new("10.111.222.3:53".parse().unwrap());
        let json = serde_json::to_string(&config).unwrap();
        let back: TunnelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.fake_dns, config.fake_dns);
        assert_eq!(back.udp_timeout, config.udp_timeout);
    }
}
