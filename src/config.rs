/// Configuration for the MQTT connection and both peers
///
/// One nested shape: [`ServerConfig`] and [`ClientConfig`] each embed a
/// [`MqttConfig`]. Identifier rules are enforced at construction time so a
/// peer never reaches the broker with a topic-breaking id.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::protocol::{ClientCapabilities, RbacConfig, ServerCapabilities};
use crate::topics;

/// Errors detected while validating a configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid identifier '{value}': {reason}")]
    InvalidIdentifier { value: String, reason: String },

    #[error("invalid broker url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Resolved broker network address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// MQTT connection settings shared by both peers
///
/// The transport always speaks MQTT 5.0 with session expiry 0; those are
/// not configurable because the presence scheme depends on them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker address as a url, e.g. `mqtt://localhost:1883`.
    /// A bare `host:port` (or `host`) is accepted as deprecated input.
    pub url: String,
    /// MQTT username
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// MQTT password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Start with a clean session (default true)
    #[serde(default = "default_clean_start")]
    pub clean_start: bool,
    /// Keepalive interval (default 60 s)
    #[serde(default = "default_keepalive")]
    pub keepalive: Duration,
    /// How long to wait for the broker to acknowledge a connect (default 30 s)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// Pause between reconnect attempts after a connection loss (default 1 s)
    #[serde(default = "default_reconnect_period")]
    pub reconnect_period: Duration,
}

fn default_clean_start() -> bool {
    true
}

fn default_keepalive() -> Duration {
    Duration::from_secs(60)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_reconnect_period() -> Duration {
    Duration::from_secs(1)
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            url: "mqtt://localhost:1883".to_string(),
            username: None,
            password: None,
            clean_start: default_clean_start(),
            keepalive: default_keepalive(),
            connect_timeout: default_connect_timeout(),
            reconnect_period: default_reconnect_period(),
        }
    }
}

impl MqttConfig {
    /// Parse the configured url into a concrete broker address
    pub fn broker_address(&self) -> Result<BrokerAddress, ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::MissingField("mqtt.url"));
        }
        if self.url.contains("://") {
            let parsed = Url::parse(&self.url).map_err(|e| ConfigError::InvalidUrl {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;
            let tls = match parsed.scheme() {
                "mqtt" | "tcp" => false,
                "mqtts" | "ssl" => true,
                other => {
                    return Err(ConfigError::InvalidUrl {
                        url: self.url.clone(),
                        reason: format!("unsupported scheme '{}'", other),
                    })
                }
            };
            let host = parsed
                .host_str()
                .ok_or_else(|| ConfigError::InvalidUrl {
                    url: self.url.clone(),
                    reason: "missing host".to_string(),
                })?
                .to_string();
            let port = parsed.port().unwrap_or(if tls { 8883 } else { 1883 });
            return Ok(BrokerAddress { host, port, tls });
        }

        // Deprecated host:port form
        let (host, port) = match self.url.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| ConfigError::InvalidUrl {
                    url: self.url.clone(),
                    reason: format!("invalid port '{}'", port),
                })?;
                (host.to_string(), port)
            }
            None => (self.url.clone(), 1883),
        };
        if host.is_empty() {
            return Err(ConfigError::InvalidUrl {
                url: self.url.clone(),
                reason: "missing host".to_string(),
            });
        }
        Ok(BrokerAddress {
            host,
            port,
            tls: false,
        })
    }
}

/// Configuration of a server peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// MQTT connection settings
    pub mqtt: MqttConfig,
    /// Globally unique server id; doubles as the MQTT client id
    pub server_id: String,
    /// Hierarchical, slash-separated server name (e.g. `vendor/product/role`)
    pub server_name: String,
    /// Implementation name returned in the initialize response
    pub name: String,
    /// Implementation version returned in the initialize response
    pub version: String,
    /// Human-readable description advertised in the presence payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Capabilities declared during initialization
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    /// Optional RBAC roles advertised alongside presence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rbac: Option<RbacConfig>,
}

impl ServerConfig {
    /// Validate identifiers and the broker address
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_id.is_empty() {
            return Err(ConfigError::MissingField("server_id"));
        }
        if self.server_name.is_empty() {
            return Err(ConfigError::MissingField("server_name"));
        }
        validate_identifier("server_id", &self.server_id)?;
        validate_identifier("server_name", &self.server_name)?;
        // "capability" and "presence" are reserved segments under $mcp-server
        if self.server_id == "capability" || self.server_id == "presence" {
            return Err(ConfigError::InvalidIdentifier {
                value: self.server_id.clone(),
                reason: "server_id collides with a reserved topic segment".to_string(),
            });
        }
        if self.server_id.contains('/') {
            return Err(ConfigError::InvalidIdentifier {
                value: self.server_id.clone(),
                reason: "server_id must be a single topic segment".to_string(),
            });
        }
        self.mqtt.broker_address()?;
        Ok(())
    }
}

/// Configuration of a client peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// MQTT connection settings
    pub mqtt: MqttConfig,
    /// MQTT client id; generated fresh per run when absent. A client
    /// re-initializing against the same server requires a distinct identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Implementation name sent in the initialize request
    pub name: String,
    /// Implementation version sent in the initialize request
    pub version: String,
    /// Capabilities declared during initialization
    #[serde(default)]
    pub capabilities: ClientCapabilities,
}

impl ClientConfig {
    /// Validate identifiers and the broker address
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::MissingField("name"));
        }
        if let Some(client_id) = &self.client_id {
            validate_identifier("client_id", client_id)?;
            if client_id.contains('/') {
                return Err(ConfigError::InvalidIdentifier {
                    value: client_id.clone(),
                    reason: "client_id must be a single topic segment".to_string(),
                });
            }
        }
        self.mqtt.broker_address()?;
        Ok(())
    }
}

fn validate_identifier(field: &str, value: &str) -> Result<(), ConfigError> {
    if topics::contains_wildcard(value) {
        return Err(ConfigError::InvalidIdentifier {
            value: value.to_string(),
            reason: format!("{} must not contain '+' or '#'", field),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_config() -> ServerConfig {
        ServerConfig {
            mqtt: MqttConfig::default(),
            server_id: "S1".to_string(),
            server_name: "demo/calc".to_string(),
            name: "Calc".to_string(),
            version: "1.0.0".to_string(),
            description: Some("calculator".to_string()),
            capabilities: ServerCapabilities::default(),
            rbac: None,
        }
    }

    #[test]
    fn valid_server_config_passes() {
        assert!(server_config().validate().is_ok());
    }

    #[test]
    fn wildcards_in_server_name_are_rejected() {
        let mut config = server_config();
        config.server_name = "demo/+/calc".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidIdentifier { .. })
        ));

        config.server_name = "demo/#".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn missing_identifiers_are_rejected() {
        let mut config = server_config();
        config.server_id = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField("server_id"))
        ));

        let mut config = server_config();
        config.server_name = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField("server_name"))
        ));
    }

    #[test]
    fn reserved_server_ids_are_rejected() {
        let mut config = server_config();
        config.server_id = "capability".to_string();
        assert!(config.validate().is_err());
        config.server_id = "presence".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn omitted_connection_settings_fall_back_to_defaults() {
        let config: MqttConfig =
            serde_json::from_value(serde_json::json!({"url": "mqtt://broker.example.com:1883"}))
                .unwrap();
        assert!(config.clean_start);
        assert_eq!(config.keepalive, Duration::from_secs(60));
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.reconnect_period, Duration::from_secs(1));
    }

    #[test]
    fn url_forms_parse() {
        let mut mqtt = MqttConfig::default();
        assert_eq!(
            mqtt.broker_address().unwrap(),
            BrokerAddress {
                host: "localhost".to_string(),
                port: 1883,
                tls: false,
            }
        );

        mqtt.url = "mqtts://broker.example.com".to_string();
        assert_eq!(
            mqtt.broker_address().unwrap(),
            BrokerAddress {
                host: "broker.example.com".to_string(),
                port: 8883,
                tls: true,
            }
        );

        // Deprecated host:port form still accepted
        mqtt.url = "broker.example.com:1884".to_string();
        assert_eq!(
            mqtt.broker_address().unwrap(),
            BrokerAddress {
                host: "broker.example.com".to_string(),
                port: 1884,
                tls: false,
            }
        );

        // Bare host defaults to 1883
        mqtt.url = "broker.example.com".to_string();
        assert_eq!(mqtt.broker_address().unwrap().port, 1883);

        mqtt.url = String::new();
        assert!(mqtt.broker_address().is_err());

        mqtt.url = "http://broker.example.com".to_string();
        assert!(mqtt.broker_address().is_err());
    }
}
