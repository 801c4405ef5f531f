//! Printer connection configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// MQTT-over-TLS port used by both LAN printers and the cloud broker.
pub const MQTT_PORT: u16 = 8883;

/// Fixed service account used for LAN-mode connections.
pub const LOCAL_USERNAME: &str = "bblp";

/// Default cloud broker host.
pub const CLOUD_BROKER: &str = "us.mqtt.bambulab.com";

/// How a printer is reached, and with which credentials.
///
/// Parsed from TOML with a `mode` discriminator:
///
/// ```toml
/// mode = "local"
/// device_id = "01P00C490700226"
/// ip_address = "192.168.0.33"
/// access_code = "74462393"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum PrinterConfig {
    /// Printer on the local network, broker running on the printer itself.
    Local(LocalConfig),
    /// Printer routed through the vendor cloud broker.
    Cloud(CloudConfig),
}

/// LAN-mode printer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Printer serial number.
    pub device_id: String,
    /// Printer address (IP or host name).
    pub ip_address: String,
    /// Access code from the printer's LAN settings.
    pub access_code: String,
    /// PEM or DER certificate to pin instead of probing the printer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_path: Option<PathBuf>,
}

/// Cloud-routed printer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudConfig {
    /// Printer serial number.
    pub device_id: String,
    /// Account id returned by the cloud login.
    pub user_id: String,
    /// Bearer token returned by the cloud login.
    pub access_token: String,
    /// Cloud broker host.
    #[serde(default = "default_cloud_broker")]
    pub broker: String,
    /// Printer address, needed only by the file-transfer collaborator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Printer access code, needed only by the file-transfer collaborator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_code: Option<String>,
}

fn default_cloud_broker() -> String {
    CLOUD_BROKER.to_string()
}

impl PrinterConfig {
    /// Create a LAN configuration.
    pub fn local(device_id: &str, ip_address: &str, access_code: &str) -> Self {
        Self::Local(LocalConfig {
            device_id: device_id.to_string(),
            ip_address: ip_address.to_string(),
            access_code: access_code.to_string(),
            ca_cert_path: None,
        })
    }

    /// Create a cloud configuration on the default broker.
    pub fn cloud(device_id: &str, user_id: &str, access_token: &str) -> Self {
        Self::Cloud(CloudConfig {
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
            access_token: access_token.to_string(),
            broker: default_cloud_broker(),
            ip_address: None,
            access_code: None,
        })
    }

    /// Pin the certificate stored at `path` instead of probing the printer.
    ///
    /// Has no effect on cloud configurations.
    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        if let Self::Local(local) = &mut self {
            local.ca_cert_path = Some(path.into());
        }
        self
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject configurations with empty mandatory fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_id().is_empty() {
            return Err(ConfigError::Missing("device_id"));
        }
        match self {
            Self::Local(local) => {
                if local.ip_address.is_empty() {
                    return Err(ConfigError::Missing("ip_address"));
                }
                if local.access_code.is_empty() {
                    return Err(ConfigError::Missing("access_code"));
                }
            }
            Self::Cloud(cloud) => {
                if cloud.user_id.is_empty() {
                    return Err(ConfigError::Missing("user_id"));
                }
                if cloud.access_token.is_empty() {
                    return Err(ConfigError::Missing("access_token"));
                }
            }
        }
        Ok(())
    }

    /// Printer serial number.
    pub fn device_id(&self) -> &str {
        match self {
            Self::Local(local) => &local.device_id,
            Self::Cloud(cloud) => &cloud.device_id,
        }
    }

    /// Host running the MQTT broker.
    pub fn broker_host(&self) -> &str {
        match self {
            Self::Local(local) => &local.ip_address,
            Self::Cloud(cloud) => &cloud.broker,
        }
    }

    /// Broker port.
    pub fn broker_port(&self) -> u16 {
        MQTT_PORT
    }

    /// MQTT user name.
    pub fn username(&self) -> String {
        match self {
            Self::Local(_) => LOCAL_USERNAME.to_string(),
            Self::Cloud(cloud) => format!("u_{}", cloud.user_id),
        }
    }

    /// MQTT password: access code for LAN, bearer token for cloud.
    pub fn password(&self) -> &str {
        match self {
            Self::Local(local) => &local.access_code,
            Self::Cloud(cloud) => &cloud.access_token,
        }
    }

    /// Caller-supplied certificate to pin, if any.
    pub fn ca_cert_path(&self) -> Option<&Path> {
        match self {
            Self::Local(local) => local.ca_cert_path.as_deref(),
            Self::Cloud(_) => None,
        }
    }

    /// Whether the broker identity must be pinned rather than checked against public roots.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    /// Topic commands are published on.
    pub fn request_topic(&self) -> String {
        format!("device/{}/request", self.device_id())
    }

    /// Topic reports arrive on.
    pub fn report_topic(&self) -> String {
        format!("device/{}/report", self.device_id())
    }
}

/// What to do when a publish is neither acknowledged nor past its deadline
/// by the end of the fallback window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnackedPublish {
    /// Report [`crate::PubError::AckTimeout`].
    #[default]
    Fail,
    /// Report success without a confirmed acknowledgment.
    AssumeDelivered,
}

/// Timing knobs for a session.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// Default bound on [`crate::Printer::connect`] for callers without their own deadline.
    pub connect_timeout: Duration,
    /// MQTT keep-alive interval.
    pub keep_alive: Duration,
    /// Window after which an unacknowledged publish stops waiting.
    pub publish_fallback: Duration,
    /// Policy applied when the fallback window elapses.
    pub unacked_publish: UnackedPublish,
    /// Grace period for a clean disconnect before the transport is dropped.
    pub disconnect_grace: Duration,
    /// Bound on the certificate capture handshake.
    pub capture_timeout: Duration,
    /// Largest MQTT packet accepted or sent. Full status pushes exceed the MQTT default.
    pub max_packet_size: usize,
    /// Capacity of the transport's outgoing request queue.
    pub queue_capacity: usize,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(30),
            publish_fallback: Duration::from_secs(5),
            unacked_publish: UnackedPublish::default(),
            disconnect_grace: Duration::from_millis(250),
            capture_timeout: Duration::from_secs(5),
            max_packet_size: 256 * 1024,
            queue_capacity: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_credentials() {
        let config = PrinterConfig::local("01P00C490700226", "192.168.0.33", "74462393");
        assert_eq!(config.username(), "bblp");
        assert_eq!(config.password(), "74462393");
        assert_eq!(config.broker_host(), "192.168.0.33");
        assert_eq!(config.broker_port(), 8883);
        assert_eq!(config.request_topic(), "device/01P00C490700226/request");
        assert_eq!(config.report_topic(), "device/01P00C490700226/report");
    }

    #[test]
    fn test_cloud_credentials() {
        let config = PrinterConfig::cloud("01P00C490700226", "1234567", "token");
        assert_eq!(config.username(), "u_1234567");
        assert_eq!(config.password(), "token");
        assert_eq!(config.broker_host(), CLOUD_BROKER);
        assert!(!config.is_local());
    }

    #[test]
    fn test_parse_local_toml() {
        let config = PrinterConfig::from_toml_str(
            r#"
            mode = "local"
            device_id = "01P00C490700226"
            ip_address = "192.168.0.33"
            access_code = "74462393"
            ca_cert_path = "/etc/vcad/printer.pem"
            "#,
        )
        .unwrap();

        assert_eq!(config.device_id(), "01P00C490700226");
        assert_eq!(
            config.ca_cert_path(),
            Some(Path::new("/etc/vcad/printer.pem"))
        );
    }

    #[test]
    fn test_parse_cloud_toml_default_broker() {
        let config = PrinterConfig::from_toml_str(
            r#"
            mode = "cloud"
            device_id = "01P00C490700226"
            user_id = "42"
            access_token = "abc"
            "#,
        )
        .unwrap();

        assert_eq!(config.broker_host(), CLOUD_BROKER);
        assert_eq!(config.username(), "u_42");
    }

    #[test]
    fn test_missing_access_code_rejected() {
        let err = PrinterConfig::from_toml_str(
            r#"
            mode = "local"
            device_id = "01P00C490700226"
            ip_address = "192.168.0.33"
            access_code = ""
            "#,
        )
        .unwrap_err();

        assert!(matches!(err, ConfigError::Missing("access_code")));
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let err = PrinterConfig::from_toml_str(r#"mode = "serial""#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
