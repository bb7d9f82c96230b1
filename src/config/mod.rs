use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use config::builder::DefaultState;
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::websocket::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_MESSAGE_SIZE};

const ENV_PREFIX: &str = "ws";

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SessionConfig {
    pub max_frame_size: usize,
    pub max_message_size: usize,
    pub connect_timeout_secs: u64,
    pub close_timeout_secs: u64,
    // Zero turns keepalive pings off.
    pub ping_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            connect_timeout_secs: 60,
            close_timeout_secs: 5,
            ping_interval_secs: 0,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    pub url: String,
    #[serde(default)]
    pub protocols: Vec<String>,
    pub authorization: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub environment: String,
    pub session: SessionConfig,
    pub client: ClientConfig,
    pub logging: LoggingConfig,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        defaults("development")?
            // Add in settings from the config file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // E.g., `WS_SESSION__CONNECT_TIMEOUT_SECS=10` sets `Settings.session.connect_timeout_secs`
            .add_source(environment(ENV_PREFIX))
            .build()?
            .try_deserialize()
    }

    #[cfg(test)]
    pub fn new_for_test() -> Result<Self, ConfigError> {
        Self::from_env("ws_test")
    }

    #[cfg(test)]
    fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        defaults("test")?
            .set_default("session.connect_timeout_secs", 5)?
            .add_source(environment(prefix))
            .build()?
            .try_deserialize()
    }
}

fn defaults(environment: &str) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let session = SessionConfig::default();
    Config::builder()
        .set_default("environment", environment)?
        .set_default("session.max_frame_size", session.max_frame_size as u64)?
        .set_default("session.max_message_size", session.max_message_size as u64)?
        .set_default("session.connect_timeout_secs", session.connect_timeout_secs)?
        .set_default("session.close_timeout_secs", session.close_timeout_secs)?
        .set_default("session.ping_interval_secs", session.ping_interval_secs)?
        .set_default("client.url", "ws://127.0.0.1:8080/ws")?
        .set_default("client.protocols", Vec::<String>::new())?
        .set_default("logging.level", "info")
}

fn environment(prefix: &str) -> Environment {
    Environment::with_prefix(prefix)
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("client.protocols")
        .try_parsing(true)
}
