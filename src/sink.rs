use crate::prelude::*;
use crate::client::DeviceInfo;
use crate::error::Error;

use async_trait::async_trait;

/// Receives what the coordinator learns from the device. Only
/// `on_registers_updated` is required; it is called after every successful
/// merge with a consistent snapshot of the whole cache.
#[async_trait]
pub trait DataSink: Send + Sync {
    async fn on_registers_updated(&self, registers: &Registers) -> Result<()>;

    async fn on_average_updated(&self, _key: &str, _mean: Option<f64>) -> Result<()> {
        Ok(())
    }

    async fn on_update_failed(&self, _err: &Error) -> Result<()> {
        Ok(())
    }

    async fn on_device_info(&self, _info: &DeviceInfo) -> Result<()> {
        Ok(())
    }
}

/// Writes updates to the log. Used when no other consumer is configured.
#[derive(Default)]
pub struct LogSink;

#[async_trait]
impl DataSink for LogSink {
    async fn on_registers_updated(&self, registers: &Registers) -> Result<()> {
        info!("{} registers up to date", registers.len());
        for (tag, register) in registers {
            trace!("  {} = {}", tag, register.value);
        }
        Ok(())
    }

    async fn on_average_updated(&self, key: &str, mean: Option<f64>) -> Result<()> {
        match mean {
            Some(mean) => info!("average {} = {}", key, mean),
            None => debug!("average {} has no samples yet", key),
        }
        Ok(())
    }

    async fn on_update_failed(&self, err: &Error) -> Result<()> {
        warn!("device data is stale: {}", err);
        Ok(())
    }

    async fn on_device_info(&self, info: &DeviceInfo) -> Result<()> {
        info!(
            "connected to {} {} \"{}\" (serial {}, firmware {}, hardware {}) at {}",
            info.manufacturer,
            info.model,
            info.name,
            info.serial,
            info.sw_version,
            info.hw_version,
            info.configuration_url
        );
        Ok(())
    }
}
