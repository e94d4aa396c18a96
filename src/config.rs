use serde::Deserialize;
use std::{fmt, path::PathBuf, time::Duration};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub camera: CameraConfig,
    pub inference: InferenceConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    pub results: ResultsConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CameraConfig {
    pub url: String,
    #[serde(default = "default_camera_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_camera_request_timeout_ms() -> u64 {
    5000
}

impl CameraConfig {
    pub fn get_request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Deserialize, Clone)]
pub struct InferenceConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub system_instruction: Option<String>,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
}

fn default_model() -> String {
    "models/gemini-2.0-flash-exp".to_string()
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_connect_retries() -> u32 {
    5
}

impl InferenceConfig {
    /// Endpoint URL with the API key attached as the `key` query parameter.
    pub fn get_address(&self) -> String {
        if self.api_key.is_empty() {
            return self.endpoint.clone();
        }
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.endpoint, separator, self.api_key)
    }

    pub fn get_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

// Keeps the API key out of logs.
impl fmt::Debug for InferenceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("system_instruction", &self.system_instruction)
            .field("handshake_timeout_ms", &self.handshake_timeout_ms)
            .field("connect_retries", &self.connect_retries)
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AcquisitionConfig {
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_probe_delay_ms")]
    pub probe_delay_ms: u64,
    #[serde(default = "default_confirm_delay_ms")]
    pub confirm_delay_ms: u64,
    #[serde(default = "default_confirmation_rounds")]
    pub confirmation_rounds: u32,
    /// Protocol rounds allowed while probing. Unset means retry forever.
    #[serde(default)]
    pub max_probe_attempts: Option<u64>,
    /// Wall time allowed while probing. Unset means retry forever.
    #[serde(default)]
    pub max_probe_duration_ms: Option<u64>,
}

fn default_response_timeout_ms() -> u64 {
    10_000
}

fn default_probe_delay_ms() -> u64 {
    5000
}

fn default_confirm_delay_ms() -> u64 {
    2000
}

fn default_confirmation_rounds() -> u32 {
    3
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout_ms(),
            probe_delay_ms: default_probe_delay_ms(),
            confirm_delay_ms: default_confirm_delay_ms(),
            confirmation_rounds: default_confirmation_rounds(),
            max_probe_attempts: None,
            max_probe_duration_ms: None,
        }
    }
}

impl AcquisitionConfig {
    pub fn get_response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn get_probe_delay(&self) -> Duration {
        Duration::from_millis(self.probe_delay_ms)
    }

    pub fn get_confirm_delay(&self) -> Duration {
        Duration::from_millis(self.confirm_delay_ms)
    }

    pub fn get_max_probe_duration(&self) -> Option<Duration> {
        self.max_probe_duration_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResultsConfig {
    pub directory: PathBuf,
    #[serde(default = "default_retained_detections")]
    pub retained_detections: usize,
}

fn default_retained_detections() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("Failed to read current dir: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("OD")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;

    Ok(config)
}
