use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub wifi: WifiConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WifiConfig {
    pub ssid: String,
    pub password: String,
    #[serde(default)]
    pub security: SecurityType,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityType {
    Open,
    Wep,
    Wpa,
    #[default]
    Wpa2,
    WpaWpa2,
    Wpa3,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MonitorConfig {
    /// Span over which the link is monitored for inactivity before a
    /// suspend verdict can be reached.
    pub interval_ms: u64,
    /// Continuous idle duration that qualifies the link for suspension.
    /// Must not exceed interval_ms.
    pub idle_window_ms: u64,
    /// Upper bound on one low-power wait. Absent = wait until woken.
    pub max_wait_ms: Option<u64>,
    /// Pause after a failed suspend attempt before monitoring resumes.
    pub backoff_ms: u64,
    /// Re-check cadence while the link is not yet up.
    pub link_retry_ms: u64,
    /// Where the state API listens. Absent disables the API.
    pub api_listen: Option<SocketAddr>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            idle_window_ms: 250,
            max_wait_ms: None,
            backoff_ms: 1000,
            link_retry_ms: 1000,
            api_listen: Some(([127, 0, 0, 1], 3030).into()),
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn idle_window(&self) -> Duration {
        Duration::from_millis(self.idle_window_ms)
    }

    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait_ms.map(Duration::from_millis)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn link_retry(&self) -> Duration {
        Duration::from_millis(self.link_retry_ms)
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Contradictory policy is fatal here, before any monitoring starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wifi.ssid.is_empty() {
            return Err(ConfigError::InvalidPolicy("wifi.ssid is empty".into()));
        }
        if self.monitor.interval_ms == 0 {
            return Err(ConfigError::InvalidPolicy(
                "monitor.interval_ms must be > 0".into(),
            ));
        }
        if self.monitor.idle_window_ms == 0 {
            return Err(ConfigError::InvalidPolicy(
                "monitor.idle_window_ms must be > 0".into(),
            ));
        }
        if self.monitor.idle_window_ms > self.monitor.interval_ms {
            return Err(ConfigError::InvalidPolicy(format!(
                "idle_window_ms ({}) exceeds interval_ms ({}): the window can never be observed",
                self.monitor.idle_window_ms, self.monitor.interval_ms
            )));
        }
        if self.monitor.max_wait_ms == Some(0) {
            return Err(ConfigError::InvalidPolicy(
                "max_wait_ms of 0 would never sleep; omit it to wait forever".into(),
            ));
        }
        Ok(())
    }
}

/// Starter config written by `netdoze init`.
pub const SAMPLE_CONFIG: &str = r#"[wifi]
ssid = "MY_SSID"
password = "MY_PASSWORD"
security = "wpa2"

[monitor]
interval_ms = 500
idle_window_ms = 250
# max_wait_ms = 60000   # omit to wait forever
backoff_ms = 1000
link_retry_ms = 1000
api_listen = "127.0.0.1:3030"
"#;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),
}
