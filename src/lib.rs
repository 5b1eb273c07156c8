pub mod average;
pub mod batch;
pub mod channels;
pub mod client;
pub mod codec;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod mqtt;
pub mod options;
pub mod prelude;
pub mod register;
pub mod register_cache;
pub mod sink;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::prelude::*;
use crate::average::RunningAverage;
use crate::client::Client;
use crate::coordinator::Coordinator;
use crate::mqtt::{Mqtt, MqttSink};
use crate::sink::LogSink;

use log::LevelFilter;
use std::sync::Arc;
use std::time::Duration;

/// Long-running parts of the bridge, stopped together at shutdown.
pub struct Components {
    pub coordinator: Coordinator,
    pub mqtt: Option<Mqtt>,
}

impl Components {
    /// Stops the coordinator first so no new device requests start, then
    /// the MQTT client.
    pub async fn stop(&self) {
        info!("Stopping all components...");

        self.coordinator.stop();

        if let Some(mqtt) = &self.mqtt {
            let _ = mqtt.stop().await;
        }
    }
}

pub async fn app(options: Options) -> Result<()> {
    init_logging();

    info!("evopell-bridge {} starting", CARGO_PKG_VERSION);

    let config = ConfigWrapper::new(options.config_file.clone()).map_err(|err| {
        error!("Failed to load config: {:?}", err);
        err
    })?;
    apply_loglevel(&config.loglevel());

    let channels = Channels::new();

    let device = config.device();
    info!("device {} at {}", device.name(), device.base_url());
    let client = Client::from_config(&device, config.params())?;
    let averages = RunningAverage::load_all(&config).await;

    let coordinator = Coordinator::new(config.clone(), channels.clone(), client).with_averages(averages);

    let (coordinator, mqtt) = if config.mqtt().enabled() {
        let coordinator = coordinator.with_sink(Arc::new(MqttSink::new(channels.clone())));
        let mqtt = Mqtt::new(config.clone(), channels.clone(), coordinator.stats.clone());
        (coordinator, Some(mqtt))
    } else {
        (coordinator.with_sink(Arc::new(LogSink)), None)
    };

    let mqtt_handle = mqtt.clone().map(|mqtt| {
        tokio::spawn(async move {
            if let Err(e) = mqtt.start().await {
                error!("MQTT task failed: {}", e);
            }
        })
    });

    let mut coordinator_handle = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.start().await })
    };

    let components = Components { coordinator, mqtt };

    let runtime_limit = async {
        match options.runtime {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => futures::future::pending::<()>().await,
        }
    };

    let r = tokio::select! {
        r = &mut coordinator_handle => {
            // only a failed setup ends the coordinator on its own
            components.stop().await;
            r?
        }
        s = tokio::signal::ctrl_c() => {
            match s {
                Ok(()) => info!("ctrl-c received, shutting down"),
                Err(e) => error!("Failed to listen for ctrl+c: {}", e),
            }
            components.stop().await;
            coordinator_handle.await?
        }
        _ = runtime_limit => {
            info!("runtime limit reached, shutting down");
            components.stop().await;
            coordinator_handle.await?
        }
    };

    if let Some(handle) = mqtt_handle {
        if let Err(e) = handle.await {
            error!("Error waiting for MQTT task: {}", e);
        }
    }

    if let Err(e) = &r {
        error!("Coordinator failed: {}", e);
    }
    info!("Application shutdown complete");

    r
}

fn init_logging() {
    // let everything through env_logger unless RUST_LOG says otherwise; the
    // effective level is set from the config once it is read
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace"))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init();

    if std::env::var_os("RUST_LOG").is_none() {
        log::set_max_level(LevelFilter::Info);
    }
}

fn apply_loglevel(level: &str) {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }

    match LevelFilter::from_str(level) {
        Ok(filter) => log::set_max_level(filter),
        Err(_) => warn!("unknown loglevel {}, keeping info", level),
    }
}
