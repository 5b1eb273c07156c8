#![allow(dead_code)]

use evopell_bridge::average::RunningAverage;
use evopell_bridge::client::{Client, RetryPolicy};
use evopell_bridge::codec::ParamMap;
use evopell_bridge::prelude::*;

use std::path::Path;
use std::time::Duration;

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Factory;

impl Factory {
    pub fn client(base_url: &str) -> Client {
        Self::client_with_retries(base_url, 3)
    }

    pub fn client_with_retries(base_url: &str, max_retries: u32) -> Client {
        Client::new(
            base_url,
            0,
            None,
            Duration::from_secs(2),
            RetryPolicy {
                max_retries,
                retry_delay: Duration::from_millis(10),
            },
            Self::params(),
        )
        .unwrap()
    }

    pub fn params() -> ParamMap {
        ParamMap::from([
            ("T5".to_string(), "Flue temperature".to_string()),
            ("STAT".to_string(), "Boiler status".to_string()),
        ])
    }

    /// Config pointing at `host_with_port` (as given by the mock server)
    /// with one flue temperature average stored under `storage_dir`.
    pub fn config(host_with_port: &str, storage_dir: &Path) -> ConfigWrapper {
        ConfigWrapper::from_config(Config::from_yaml(&Self::yaml(host_with_port, storage_dir)).unwrap())
    }

    /// As [`Factory::config`], with MQTT commands enabled. Nothing connects
    /// to a broker unless an `Mqtt` component is started.
    pub fn mqtt_config(host_with_port: &str, storage_dir: &Path) -> ConfigWrapper {
        let yaml = format!(
            "{}mqtt:\n  enabled: true\n  namespace: evopell\n",
            Self::yaml(host_with_port, storage_dir)
        );
        ConfigWrapper::from_config(Config::from_yaml(&yaml).unwrap())
    }

    fn yaml(host_with_port: &str, storage_dir: &Path) -> String {
        let (host, port) = host_with_port.rsplit_once(':').unwrap();

        format!(
            r#"
storage_dir: {dir}
device:
  host: {host}
  port: {port}
  timeout: 2
  max_retries: 1
  retry_delay: 0.01
  scan_interval: 1
params:
  T5: Flue temperature
  STAT: Boiler status
averages:
  - key: flue_avg
    source: T5
    status: STAT
    running_value: "3"
    save_delay: 60
"#,
            dir = storage_dir.display(),
            host = host,
            port = port,
        )
    }

    pub fn average_config(key: &str, save_delay: Duration) -> config::Average {
        config::Average {
            key: key.to_string(),
            source: "T5".to_string(),
            status: "STAT".to_string(),
            running_value: "3".to_string(),
            precision: None,
            save_delay: Some(save_delay),
        }
    }

    pub async fn average(dir: &Path, save_delay: Duration) -> RunningAverage {
        RunningAverage::load(Self::average_config("flue_avg", save_delay), dir).await
    }

    pub fn regs_xml(regs: &[(&str, &str)]) -> String {
        let body: String = regs
            .iter()
            .map(|(tid, v)| format!(r#"<reg tid="{}" v="{}"/>"#, tid, v))
            .collect();
        format!(r#"<?xml version="1.0" encoding="UTF-8"?><regs>{}</regs>"#, body)
    }

    pub fn device_info_xml() -> String {
        Self::regs_xml(&[
            ("devid", "17"),
            ("devname", "Boiler"),
            ("fwver", "2.10"),
            ("hwver", "B"),
            ("mac", "0011223344AA"),
            ("devtype", "EP-25"),
            ("ip", "192.168.1.50"),
        ])
    }
}
