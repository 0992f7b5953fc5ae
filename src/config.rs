use crate::error::ConfigError;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Highest interstitial page variant shipped in the pages directory
pub const MAX_STYLE_VARIANT: u8 = 12;

/// Global configuration for the gate
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Master switch; when false the binary exits without doing anything
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Process-wide defaults applied to containers without explicit labels
    #[serde(default)]
    pub defaults: GateDefaults,

    /// Container label naming
    #[serde(default)]
    pub labels: LabelConfig,

    /// Container runtime connection and call policy
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            server: ServerConfig::default(),
            defaults: GateDefaults::default(),
            labels: LabelConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP port (default: 80)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Directory holding the numbered interstitial pages (`1.html` .. `12.html`)
    #[serde(default = "default_pages_dir")]
    pub pages_dir: String,

    /// Which interstitial page to serve while containers thaw (1..=12)
    #[serde(default = "default_style_variant")]
    pub style_variant: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            pages_dir: default_pages_dir(),
            style_variant: default_style_variant(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GateDefaults {
    /// Freeze method for containers without a freeze-method label
    #[serde(default)]
    pub freeze_method: FreezeMethod,

    /// Idle timeout for containers without an idle-timeout label
    #[serde(default = "default_idle_timeout", deserialize_with = "deserialize_duration")]
    pub idle_timeout: Duration,

    /// What to do with each container right after a (re)load
    #[serde(default)]
    pub start_action: StartAction,
}

impl Default for GateDefaults {
    fn default() -> Self {
        Self {
            freeze_method: FreezeMethod::default(),
            idle_timeout: default_idle_timeout(),
            start_action: StartAction::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LabelConfig {
    /// Prefix of the opt-in labels, e.g. `thawgate.enable`
    #[serde(default = "default_label_prefix")]
    pub prefix: String,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            prefix: default_label_prefix(),
        }
    }
}

impl LabelConfig {
    pub fn enable(&self) -> String {
        format!("{}.enable", self.prefix)
    }

    pub fn name(&self) -> String {
        format!("{}.name", self.prefix)
    }

    pub fn freeze_method(&self) -> String {
        format!("{}.freeze-method", self.prefix)
    }

    pub fn idle_timeout(&self) -> String {
        format!("{}.idle-timeout", self.prefix)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Docker endpoint (default: DOCKER_HOST, then the local socket)
    pub docker_host: Option<String>,

    /// Upper bound on a single runtime call
    #[serde(default = "default_call_timeout", deserialize_with = "deserialize_duration")]
    pub call_timeout: Duration,

    /// Attempts per runtime call, including the first one
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay before the first retry; doubles on each further attempt
    #[serde(default = "default_retry_base_delay", deserialize_with = "deserialize_duration")]
    pub retry_base_delay: Duration,

    /// Cap for the backoff delay
    #[serde(default = "default_retry_max_delay", deserialize_with = "deserialize_duration")]
    pub retry_max_delay: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            call_timeout: default_call_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay: default_retry_base_delay(),
            retry_max_delay: default_retry_max_delay(),
        }
    }
}

/// How a container is suspended, which also decides what "online" means
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(try_from = "String", rename_all = "lowercase")]
pub enum FreezeMethod {
    /// `docker stop` / `docker start`; online iff running
    #[default]
    Stop,
    /// `docker pause` / `docker unpause`; online iff running and not paused
    Pause,
}

impl FromStr for FreezeMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stop" => Ok(FreezeMethod::Stop),
            "pause" => Ok(FreezeMethod::Pause),
            _ => Err(ConfigError::InvalidFreezeMethod(s.to_string())),
        }
    }
}

impl TryFrom<String> for FreezeMethod {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for FreezeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FreezeMethod::Stop => f.write_str("stop"),
            FreezeMethod::Pause => f.write_str("pause"),
        }
    }
}

/// State every managed container is driven into right after a (re)load
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StartAction {
    /// Freeze immediately (default)
    #[default]
    Freeze,
    /// Leave running with a fresh idle timer
    Run,
}

impl StartAction {
    /// Unknown values fall back to `Freeze`
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "run" => StartAction::Run,
            "freeze" => StartAction::Freeze,
            other => {
                warn!(value = other, "Unknown start action, defaulting to freeze");
                StartAction::Freeze
            }
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    80
}

fn default_pages_dir() -> String {
    "/app/pages".to_string()
}

fn default_style_variant() -> u8 {
    1
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_label_prefix() -> String {
    "thawgate".to_string()
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_retry_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw, "duration").map_err(serde::de::Error::custom)
}

/// Parse a Go-style duration such as `300ms`, `1m`, `1h30m` or `1.5s`.
///
/// `field` only feeds the error message.
pub fn parse_duration(value: &str, field: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration {
        field: field.to_string(),
        value: value.to_string(),
    };

    let input = value.trim();
    if input == "0" {
        return Ok(Duration::ZERO);
    }
    if input.is_empty() {
        return Err(invalid());
    }

    let mut total_nanos: f64 = 0.0;
    let mut rest = input;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(invalid());
        }
        let number: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit_nanos: f64 = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];

        total_nanos += number * unit_nanos;
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

/// Parse a boolean the way container labels and env vars spell them
pub fn parse_bool(value: &str, field: &str) -> Result<bool, ConfigError> {
    match value.trim() {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            field: field.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Environment variables that override the configuration file
pub mod env {
    pub const ENABLED: &str = "THAWGATE_ENABLED";
    pub const DEFAULT_FREEZE_METHOD: &str = "THAWGATE_DEFAULT_FREEZE_METHOD";
    pub const DEFAULT_IDLE_TIMEOUT: &str = "THAWGATE_DEFAULT_IDLE_TIMEOUT";
    pub const START_ACTION: &str = "THAWGATE_START_ACTION";
    pub const STYLE_VARIANT: &str = "THAWGATE_STYLE_VARIANT";
    pub const BIND: &str = "THAWGATE_BIND";
    pub const PORT: &str = "THAWGATE_PORT";
}

impl Config {
    /// Load from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.normalize();
        Ok(config)
    }

    /// Load from a file if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source. Empty values count as unset.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(value) = get(env::ENABLED) {
            self.enabled = parse_bool(&value, env::ENABLED)?;
        }
        if let Some(value) = get(env::DEFAULT_FREEZE_METHOD) {
            self.defaults.freeze_method = value.parse()?;
        }
        if let Some(value) = get(env::DEFAULT_IDLE_TIMEOUT) {
            self.defaults.idle_timeout = parse_duration(&value, env::DEFAULT_IDLE_TIMEOUT)?;
        }
        if let Some(value) = get(env::START_ACTION) {
            self.defaults.start_action = StartAction::parse_lenient(&value);
        }
        if let Some(value) = get(env::STYLE_VARIANT) {
            self.server.style_variant = match value.trim().parse::<u8>() {
                Ok(variant) => variant,
                Err(_) => {
                    warn!(value = %value, "Invalid style variant, defaulting to 1");
                    1
                }
            };
        }
        if let Some(value) = get(env::BIND) {
            self.server.bind = value;
        }
        if let Some(value) = get(env::PORT) {
            match value.trim().parse::<u16>() {
                Ok(port) => self.server.port = port,
                Err(_) => warn!(value = %value, "Invalid port override, keeping configured port"),
            }
        }

        self.normalize();
        Ok(())
    }

    fn normalize(&mut self) {
        if !(1..=MAX_STYLE_VARIANT).contains(&self.server.style_variant) {
            warn!(
                variant = self.server.style_variant,
                "Style variant out of range, defaulting to 1"
            );
            self.server.style_variant = 1;
        }
        if self.runtime.retry_attempts == 0 {
            self.runtime.retry_attempts = 1;
        }
    }
}
