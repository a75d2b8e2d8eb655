//! Configuration for the Mosquitto exporter.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Broker connection settings.
    #[serde(default)]
    pub mosquitto: MosquittoConfig,

    /// HTTP endpoint settings.
    #[serde(default)]
    pub http: HttpConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Mosquitto broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MosquittoConfig {
    /// Broker endpoint URL (default: "tcp://127.0.0.1:1883").
    #[serde(default = "default_broker_url")]
    pub broker_url: String,

    /// Optional MQTT username.
    #[serde(default)]
    pub username: Option<String>,

    /// Optional MQTT password. Redacted from display output.
    #[serde(default)]
    pub password: Option<String>,

    /// Optional MQTT client identifier.
    #[serde(default)]
    pub client_id: Option<String>,

    /// TLS settings.
    #[serde(default)]
    pub tls: TlsConfig,
}

fn default_broker_url() -> String {
    "tcp://127.0.0.1:1883".to_string()
}

impl Default for MosquittoConfig {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            username: None,
            password: None,
            client_id: None,
            tls: TlsConfig::default(),
        }
    }
}

/// TLS/SSL settings for the broker connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Whether TLS is enabled.
    #[serde(default)]
    pub enabled: bool,

    /// Path to the client certificate file (PEM).
    #[serde(default)]
    pub cert_file: Option<String>,

    /// Path to the client private key file (PEM).
    #[serde(default)]
    pub key_file: Option<String>,

    /// Skip server certificate verification.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Address to listen on (default: "0.0.0.0:9234").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for the metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_listen() -> String {
    "0.0.0.0:9234".to_string()
}

fn default_path() -> String {
    "/metrics".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ExporterConfig = json5::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment-variable overrides.
    ///
    /// Newer `MOSQUITTO_*` names take precedence over the legacy names
    /// kept for compatibility with older deployments.
    pub fn apply_env_overrides(&mut self) {
        if let Some(endpoint) = env_either("MOSQUITTO_BROKER_ENDPOINT", "BROKER_ENDPOINT") {
            self.mosquitto.broker_url = endpoint;
        }

        if let Some(username) = env_either("MOSQUITTO_USERNAME", "MQTT_USER") {
            self.mosquitto.username = Some(username);
        }

        if let Some(password) = env_either("MOSQUITTO_PASSWORD", "MQTT_PASS") {
            self.mosquitto.password = Some(password);
        }

        if let Some(client_id) = env_either("MOSQUITTO_CLIENT_ID", "MQTT_CLIENT_ID") {
            self.mosquitto.client_id = Some(client_id);
        }

        // Providing either TLS file also switches TLS on.
        if let Some(cert_file) = env_either("MOSQUITTO_TLS_CERT_FILE", "MQTT_CERT") {
            self.mosquitto.tls.cert_file = Some(cert_file);
            self.mosquitto.tls.enabled = true;
        }

        if let Some(key_file) = env_either("MOSQUITTO_TLS_KEY_FILE", "MQTT_KEY") {
            self.mosquitto.tls.key_file = Some(key_file);
            self.mosquitto.tls.enabled = true;
        }

        if let Ok(skip_verify) = std::env::var("MOSQUITTO_TLS_INSECURE_SKIP_VERIFY")
            && let Ok(value) = skip_verify.parse::<bool>()
        {
            self.mosquitto.tls.insecure_skip_verify = value;
        }

        if let Ok(bind_address) = std::env::var("BIND_ADDRESS")
            && !bind_address.is_empty()
        {
            self.http.listen = bind_address;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mosquitto.broker_url.is_empty() {
            return Err(ConfigError::Validation(
                "broker_url must not be empty".to_string(),
            ));
        }

        if self.http.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.http.listen
            )));
        }

        if !self.http.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        Ok(())
    }

    /// The configuration as displayable JSON, with the password redacted.
    pub fn display(&self) -> String {
        let mut redacted = self.clone();
        if redacted.mosquitto.password.is_some() {
            redacted.mosquitto.password = Some("<redacted>".to_string());
        }
        json5::to_string(&redacted).unwrap_or_default()
    }
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            mosquitto: MosquittoConfig::default(),
            http: HttpConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn env_either(name: &str, legacy_name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| std::env::var(legacy_name).ok().filter(|v| !v.is_empty()))
}
