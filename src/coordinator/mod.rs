use crate::prelude::*;
use crate::average::RunningAverage;
use crate::client::{Client, DeviceInfo};
use crate::error::{DeviceResult, Error};
use crate::sink::DataSink;

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::time::MissedTickBehavior;

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChannelData {
    Shutdown,
}

#[derive(Default, Debug)]
pub struct PollStats {
    pub ticks: u64,
    pub successful_ticks: u64,
    pub failed_ticks: u64,
    pub failures_by_kind: BTreeMap<&'static str, u64>,
    pub registers_merged: u64,
    pub writes_ok: u64,
    pub writes_failed: u64,
    pub samples_recorded: u64,
    pub mqtt_messages_sent: u64,
    pub mqtt_errors: u64,
    pub last_error: Option<String>,
}

impl PollStats {
    pub fn print_summary(&self) {
        info!("Poll Statistics:");
        info!("  Ticks: {}", self.ticks);
        info!("    Successful: {}", self.successful_ticks);
        info!("    Failed: {}", self.failed_ticks);
        for (kind, count) in &self.failures_by_kind {
            info!("      {}: {}", kind, count);
        }
        if let Some(last) = &self.last_error {
            info!("    Last error: {}", last);
        }
        info!("  Registers merged: {}", self.registers_merged);
        info!("  Writes:");
        info!("    Acknowledged ok: {}", self.writes_ok);
        info!("    Rejected or failed: {}", self.writes_failed);
        info!("  Average samples recorded: {}", self.samples_recorded);
        info!("  MQTT:");
        info!("    Messages sent: {}", self.mqtt_messages_sent);
        info!("    Errors: {}", self.mqtt_errors);
    }
}

/// Owns the device session: probes the identity once, then polls every
/// `scan_interval` until stopped. Ticks and commands that talk to the device
/// take the same lock, so requests never overlap.
#[derive(Clone)]
pub struct Coordinator {
    config: ConfigWrapper,
    channels: Channels,
    client: Client,
    cache: RegisterCache,
    averages: Vec<RunningAverage>,
    sinks: Vec<Arc<dyn DataSink>>,
    device_info: Arc<Mutex<Option<DeviceInfo>>>,
    device: Arc<tokio::sync::Mutex<()>>,
    pub stats: Arc<Mutex<PollStats>>,
}

impl Coordinator {
    pub fn new(config: ConfigWrapper, channels: Channels, client: Client) -> Self {
        Self {
            config,
            channels,
            client,
            cache: RegisterCache::new(),
            averages: Vec::new(),
            sinks: Vec::new(),
            device_info: Arc::new(Mutex::new(None)),
            device: Arc::new(tokio::sync::Mutex::new(())),
            stats: Arc::new(Mutex::new(PollStats::default())),
        }
    }

    pub fn with_averages(mut self, averages: Vec<RunningAverage>) -> Self {
        self.averages = averages;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn DataSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn cache(&self) -> &RegisterCache {
        &self.cache
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn average(&self, key: &str) -> Option<&RunningAverage> {
        self.averages.iter().find(|a| a.key() == key)
    }

    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.device_info.lock().ok().and_then(|info| info.clone())
    }

    pub async fn start(&self) -> Result<()> {
        // subscribe before the probe so a stop during setup is not missed
        let shutdown = self.channels.to_coordinator.subscribe();
        let commands = self.channels.from_mqtt.subscribe();

        self.setup().await?;

        let r = if self.config.mqtt().enabled() {
            futures::try_join!(self.poller(shutdown), self.command_receiver(commands)).map(|_| ())
        } else {
            self.poller(shutdown).await
        };

        self.flush_averages().await;

        info!("coordinator stopped, final statistics:");
        if let Ok(stats) = self.stats.lock() {
            stats.print_summary();
        }

        r
    }

    pub fn stop(&self) {
        let _ = self.channels.to_coordinator.send(ChannelData::Shutdown);

        if self.config.mqtt().enabled() {
            let _ = self.channels.from_mqtt.send(mqtt::ChannelData::Shutdown);
        }
    }

    /// Probes the device identity. Any failure here ends the session.
    pub async fn setup(&self) -> DeviceResult<DeviceInfo> {
        let info = {
            let _device = self.device.lock().await;
            self.client.read_device_info().await
        };

        let info = match info {
            Ok(info) => info,
            Err(e) => {
                error!("device setup failed ({}): {}", e.kind(), e);
                return Err(e);
            }
        };

        info!("device {} ({}) serial {}", info.name, info.model, info.serial);
        if let Ok(mut current) = self.device_info.lock() {
            *current = Some(info.clone());
        }

        for sink in &self.sinks {
            if let Err(e) = sink.on_device_info(&info).await {
                warn!("sink rejected device info: {}", e);
            }
        }

        Ok(info)
    }

    pub async fn read_device_info(&self) -> bool {
        self.setup().await.is_ok()
    }

    /// The tags each tick reads: the configured ones followed by any other
    /// tag already in the cache.
    pub fn poll_tags(&self) -> Vec<String> {
        let mut tags = self.config.poll_tags();
        let known: HashSet<String> = tags.iter().cloned().collect();

        let mut extra: Vec<String> = self
            .cache
            .tags()
            .into_iter()
            .filter(|t| !known.contains(t))
            .collect();
        extra.sort();

        tags.extend(extra);
        tags
    }

    /// One poll: fetch, merge, sample the averages and notify the sinks.
    /// Every failure comes back as [`Error::UpdateFailed`].
    pub async fn tick(&self) -> DeviceResult<usize> {
        let tags = self.poll_tags();

        let fetched = {
            let _device = self.device.lock().await;
            self.client.fetch_registers(&tags).await
        };

        let registers = match fetched {
            Ok(registers) => registers,
            Err(e) => return Err(self.update_failed(e).await),
        };

        // averages only sample what this tick read, never a cached value
        let fresh: Registers = registers
            .iter()
            .map(|r| (r.tag_id.clone(), r.clone()))
            .collect();

        let merged = self.cache.merge(registers);
        let snapshot = self.cache.snapshot();
        debug!("merged {} registers, cache holds {}", merged, snapshot.len());

        let recorded = self.averages.iter().filter(|a| a.observe(&fresh)).count();

        if let Ok(mut stats) = self.stats.lock() {
            stats.ticks += 1;
            stats.successful_ticks += 1;
            stats.registers_merged += merged as u64;
            stats.samples_recorded += recorded as u64;
        }

        self.notify_registers(&snapshot).await;
        for average in &self.averages {
            self.notify_average(average).await;
        }

        Ok(merged)
    }

    /// Writes `pairs` and applies every ok ack to the cache. Rejected tags
    /// are counted and returned like the others; callers check each status.
    pub async fn write_registers(&self, pairs: &[(String, String)]) -> DeviceResult<Vec<WriteAck>> {
        let acks = {
            let _device = self.device.lock().await;
            self.client.write_registers(pairs).await
        };

        let acks = match acks {
            Ok(acks) => acks,
            Err(e) => {
                error!("write of {} tags failed ({}): {}", pairs.len(), e.kind(), e);
                if let Ok(mut stats) = self.stats.lock() {
                    stats.writes_failed += pairs.len() as u64;
                }
                return Err(e);
            }
        };

        let applied = self.cache.apply_write_acks(&acks).len();

        if let Ok(mut stats) = self.stats.lock() {
            stats.writes_ok += applied as u64;
            stats.writes_failed += (pairs.len() - applied.min(pairs.len())) as u64;
        }

        if applied > 0 {
            self.notify_registers(&self.cache.snapshot()).await;
        }

        Ok(acks)
    }

    pub async fn reset_average(&self, key: &str) -> Result<()> {
        let Some(average) = self.average(key) else {
            bail!("no average named {}", key);
        };

        average.reset().await?;
        self.notify_average(average).await;

        Ok(())
    }

    async fn update_failed(&self, err: Error) -> Error {
        error!("update failed ({}): {}", err.kind(), err);

        if let Ok(mut stats) = self.stats.lock() {
            stats.ticks += 1;
            stats.failed_ticks += 1;
            *stats.failures_by_kind.entry(err.kind()).or_insert(0) += 1;
            stats.last_error = Some(err.to_string());
        }

        let err = Error::UpdateFailed(Box::new(err));
        for sink in &self.sinks {
            if let Err(e) = sink.on_update_failed(&err).await {
                warn!("sink rejected failure notice: {}", e);
            }
        }

        err
    }

    async fn notify_registers(&self, snapshot: &Registers) {
        for sink in &self.sinks {
            if let Err(e) = sink.on_registers_updated(snapshot).await {
                warn!("sink rejected register update: {}", e);
            }
        }
    }

    async fn notify_average(&self, average: &RunningAverage) {
        let mean = average.current_mean();
        for sink in &self.sinks {
            if let Err(e) = sink.on_average_updated(average.key(), mean).await {
                warn!("sink rejected average {}: {}", average.key(), e);
            }
        }
    }

    async fn flush_averages(&self) {
        for average in &self.averages {
            if let Err(e) = average.shutdown().await {
                error!("average {}: final save failed: {}", average.key(), e);
            }
        }
    }

    async fn poller(&self, mut receiver: broadcast::Receiver<ChannelData>) -> Result<()> {
        use tokio::sync::broadcast::error::RecvError;

        let scan_interval = self.config.device().scan_interval();
        info!("polling every {:?}", scan_interval);

        let mut interval = tokio::time::interval(scan_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // failures are logged and counted by tick itself
                    let _ = self.tick().await;
                }
                msg = receiver.recv() => match msg {
                    Ok(ChannelData::Shutdown) | Err(RecvError::Closed) => {
                        info!("poller received shutdown signal");
                        break;
                    }
                    Err(RecvError::Lagged(_)) => {}
                },
            }
        }

        Ok(())
    }

    async fn command_receiver(&self, mut receiver: broadcast::Receiver<mqtt::ChannelData>) -> Result<()> {
        use tokio::sync::broadcast::error::RecvError;

        loop {
            match receiver.recv().await {
                Ok(mqtt::ChannelData::Message(message)) => {
                    if let Err(e) = self.process_message(message).await {
                        warn!("{}", e);
                    }
                }
                Ok(mqtt::ChannelData::Shutdown) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(n)) => {
                    warn!("command receiver lagged, {} commands dropped", n);
                }
            }
        }

        Ok(())
    }

    async fn process_message(&self, message: mqtt::Message) -> Result<()> {
        let command = match message.to_command() {
            Ok(command) => command,
            Err(err) => {
                error!("{:?}", err);
                return Ok(());
            }
        };

        info!("parsed command {:?}", command);
        let payload = match self.process_command(command.clone()).await {
            Ok(()) => "OK",
            Err(e) => {
                warn!("command {:?} failed: {}", command, e);
                "FAIL"
            }
        };

        self.publish_message(command.to_result_topic(), payload.to_string(), false)
    }

    pub async fn process_command(&self, command: Command) -> Result<()> {
        use Command::*;

        match command {
            WriteRegister(tag, value) => {
                let acks = self.write_registers(&[(tag.clone(), value)]).await?;
                match acks.iter().find(|a| a.tag_id == tag) {
                    Some(ack) if ack.is_ok() => Ok(()),
                    Some(ack) => bail!("write to {} rejected: {}", tag, ack.status),
                    None => bail!("device did not acknowledge write to {}", tag),
                }
            }
            ResetAverage(key) => self.reset_average(&key).await,
            Refresh => {
                self.tick().await?;
                Ok(())
            }
        }
    }

    fn publish_message(&self, topic: String, payload: String, retain: bool) -> Result<()> {
        let m = mqtt::Message {
            topic,
            payload,
            retain,
        };
        let channel_data = mqtt::ChannelData::Message(m);
        if self.channels.to_mqtt.send(channel_data).is_err() {
            if let Ok(mut stats) = self.stats.lock() {
                stats.mqtt_errors += 1;
            }
            bail!("send(to_mqtt) failed - channel closed?");
        }
        Ok(())
    }
}
