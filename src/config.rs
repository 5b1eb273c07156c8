use crate::prelude::*;
use crate::client::RetryPolicy;
use crate::codec::ParamMap;

use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds, DurationSecondsWithFrac};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub device: Device,

    #[serde(default)]
    pub params: ParamMap,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub averages: Vec<Average>,

    #[serde(default = "Config::default_mqtt")]
    pub mqtt: Mqtt,

    #[serde(default = "Config::default_storage_dir")]
    pub storage_dir: PathBuf,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,
}

// Device {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Device {
    #[serde(default = "Config::default_device_name")]
    pub name: String,

    pub host: String,
    #[serde(default = "Config::default_device_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    pub device_id: Option<u32>,
    pub max_retries: Option<u32>,

    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    #[serde(default)]
    pub retry_delay: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(default)]
    pub scan_interval: Option<Duration>,
}

impl Device {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => None,
        }
    }

    pub fn device_id(&self) -> u32 {
        self.device_id.unwrap_or(0)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(Duration::from_secs(5))
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(3)
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay.unwrap_or(Duration::from_millis(1500))
    }

    pub fn scan_interval(&self) -> Duration {
        self.scan_interval.unwrap_or(Duration::from_secs(30))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries(),
            retry_delay: self.retry_delay(),
        }
    }
} // }}}

// Average {{{
/// One running average: `source` samples are accumulated while the `status`
/// register reads `running_value`.
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Average {
    pub key: String,
    pub source: String,
    pub status: String,
    pub running_value: String,

    pub precision: Option<u32>,

    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    #[serde(default)]
    pub save_delay: Option<Duration>,
}

impl Average {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn running_value(&self) -> &str {
        &self.running_value
    }

    pub fn precision(&self) -> u32 {
        self.precision.unwrap_or(1)
    }

    pub fn save_delay(&self) -> Duration {
        self.save_delay.unwrap_or(Duration::from_secs(30))
    }
} // }}}

// Mqtt {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Mqtt {
    #[serde(default = "Config::default_mqtt_enabled")]
    pub enabled: bool,

    #[serde(default = "Config::default_mqtt_host")]
    pub host: String,
    #[serde(default = "Config::default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "Config::default_mqtt_namespace")]
    pub namespace: String,
}

impl Mqtt {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &Option<String> {
        &self.username
    }

    pub fn password(&self) -> &Option<String> {
        &self.password
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
} // }}}

pub struct ConfigWrapper {
    config: Arc<Mutex<Config>>,
}

impl Clone for ConfigWrapper {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
        }
    }
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        Ok(Self::from_config(Config::new(file)?))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Config> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn device(&self) -> Device {
        self.lock().device.clone()
    }

    pub fn params(&self) -> ParamMap {
        self.lock().params.clone()
    }

    /// Every tag polled on each tick: the described params followed by the
    /// extra `tags`, without duplicates.
    pub fn poll_tags(&self) -> Vec<String> {
        let config = self.lock();

        let mut keys: Vec<&String> = config.params.keys().collect();
        keys.sort();

        let mut seen = HashSet::new();
        keys.into_iter()
            .chain(config.tags.iter())
            .filter(|t| seen.insert(t.as_str()))
            .cloned()
            .collect()
    }

    pub fn averages(&self) -> Vec<Average> {
        self.lock().averages.clone()
    }

    pub fn mqtt(&self) -> Mqtt {
        self.lock().mqtt.clone()
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.lock().storage_dir.clone()
    }

    pub fn loglevel(&self) -> String {
        self.lock().loglevel.clone()
    }
}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        info!("Reading configuration from {}", file);
        let content = std::fs::read_to_string(&file)
            .map_err(|err| anyhow!("config.rs:error reading {}: {}", file, err))?;

        let config = Self::from_yaml(&content)?;

        info!("Configuration loaded successfully:");
        info!("  Device: {} at {}", config.device.name, config.device.base_url());
        info!("    Device ID: {}", config.device.device_id());
        info!("    Credentials: {}", if config.device.credentials().is_some() { "set" } else { "none" });
        info!("    Timeout: {:?}", config.device.timeout());
        info!("    Max Retries: {}", config.device.max_retries());
        info!("    Retry Delay: {:?}", config.device.retry_delay());
        info!("    Scan Interval: {:?}", config.device.scan_interval());
        info!("  Params: {} described, {} extra tags", config.params.len(), config.tags.len());
        for avg in &config.averages {
            info!(
                "  Average {}: {} while {} = {}",
                avg.key, avg.source, avg.status, avg.running_value
            );
        }
        info!("  MQTT: {}", if config.mqtt.enabled { "enabled" } else { "disabled" });
        if config.mqtt.enabled {
            info!("    Host: {}", config.mqtt.host);
            info!("    Port: {}", config.mqtt.port);
            info!("    Namespace: {}", config.mqtt.namespace);
        }
        info!("  Storage: {}", config.storage_dir.display());
        info!("  Log Level: {}", config.loglevel);

        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let device = &self.device;
        if device.host.is_empty() {
            bail!("config.rs:device host cannot be empty");
        }
        if device.port == 0 {
            bail!("device.port must be between 1 and 65535");
        }
        if device.timeout() == Duration::ZERO {
            bail!("config.rs:device timeout cannot be 0");
        }
        if device.username.is_some() != device.password.is_some() {
            bail!("config.rs:device username and password must be set together");
        }
        if let Err(e) = url::Url::parse(&device.base_url()) {
            bail!("config.rs:invalid device address {}: {}", device.base_url(), e);
        }

        let mut keys = HashSet::new();
        for (i, avg) in self.averages.iter().enumerate() {
            if avg.key.is_empty() || avg.source.is_empty() || avg.status.is_empty() {
                bail!("averages[{}]: key, source and status are required", i);
            }
            if !keys.insert(avg.key.as_str()) {
                bail!("averages[{}]: duplicate key {}", i, avg.key);
            }
        }

        if self.mqtt.enabled {
            if self.mqtt.port == 0 {
                bail!("mqtt.port must be between 1 and 65535");
            }
            if self.mqtt.host.is_empty() {
                bail!("config.rs:MQTT host cannot be empty");
            }
        }

        Ok(())
    }

    fn default_device_name() -> String {
        "evopell".to_string()
    }

    fn default_device_port() -> u16 {
        80
    }

    fn default_mqtt() -> Mqtt {
        Mqtt {
            enabled: Self::default_mqtt_enabled(),
            host: Self::default_mqtt_host(),
            port: Self::default_mqtt_port(),
            username: None,
            password: None,
            namespace: Self::default_mqtt_namespace(),
        }
    }

    fn default_mqtt_enabled() -> bool {
        false
    }

    fn default_mqtt_host() -> String {
        "localhost".to_string()
    }

    fn default_mqtt_port() -> u16 {
        1883
    }

    fn default_mqtt_namespace() -> String {
        "evopell".to_string()
    }

    fn default_storage_dir() -> PathBuf {
        PathBuf::from("state")
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
loglevel: debug
storage_dir: /tmp/evopell
device:
  name: boiler
  host: 192.168.1.50
  port: 8080
  username: admin
  password: secret
  device_id: 2
  timeout: 10
  max_retries: 5
  retry_delay: 0.5
  scan_interval: 60
params:
  T2: Return temperature
  T1: Boiler temperature
tags: [T1, EXTRA]
averages:
  - key: flue_avg
    source: T5
    status: STAT
    running_value: "3"
    precision: 2
    save_delay: 10
mqtt:
  enabled: true
  host: broker
  namespace: boiler
"#;

    #[test]
    fn parses_full_config() {
        let config = ConfigWrapper::from_config(Config::from_yaml(FULL).unwrap());

        let device = config.device();
        assert_eq!(device.base_url(), "http://192.168.1.50:8080");
        assert_eq!(device.credentials(), Some(("admin".to_string(), "secret".to_string())));
        assert_eq!(device.device_id(), 2);
        assert_eq!(device.timeout(), Duration::from_secs(10));
        assert_eq!(
            device.retry_policy(),
            RetryPolicy {
                max_retries: 5,
                retry_delay: Duration::from_millis(500)
            }
        );
        assert_eq!(device.scan_interval(), Duration::from_secs(60));

        assert_eq!(config.poll_tags(), vec!["T1", "T2", "EXTRA"]);

        let avg = &config.averages()[0];
        assert_eq!(avg.precision(), 2);
        assert_eq!(avg.save_delay(), Duration::from_secs(10));

        assert_eq!(config.mqtt().port(), 1883);
        assert_eq!(config.mqtt().namespace(), "boiler");
        assert_eq!(config.loglevel(), "debug");
    }

    #[test]
    fn applies_defaults() {
        let config = Config::from_yaml("device:\n  host: boiler.lan\n").unwrap();
        assert_eq!(config.device.base_url(), "http://boiler.lan:80");
        assert_eq!(config.device.retry_policy(), RetryPolicy::default());
        assert_eq!(config.device.timeout(), Duration::from_secs(5));
        assert_eq!(config.device.scan_interval(), Duration::from_secs(30));
        assert!(config.device.credentials().is_none());
        assert!(!config.mqtt.enabled());
        assert_eq!(config.loglevel, "info");
    }

    #[test]
    fn rejects_invalid_configs() {
        assert!(Config::from_yaml("device:\n  host: ''\n").is_err());
        assert!(Config::from_yaml("device:\n  host: a\n  port: 0\n").is_err());
        assert!(Config::from_yaml("device:\n  host: a\n  timeout: 0\n").is_err());
        assert!(Config::from_yaml("device:\n  host: a\n  username: admin\n").is_err());

        let dup = r#"
device:
  host: a
averages:
  - { key: x, source: T5, status: S, running_value: "1" }
  - { key: x, source: T6, status: S, running_value: "1" }
"#;
        assert!(Config::from_yaml(dup).is_err());
    }
}
