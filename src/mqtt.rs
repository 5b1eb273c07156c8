use crate::prelude::*;
use crate::client::DeviceInfo;
use crate::coordinator::PollStats;
use crate::error::Error;
use crate::sink::DataSink;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Publish, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const PUBLISH_ATTEMPTS: u32 = 3;

// Message {{{
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub retain: bool,
    pub payload: String,
}

impl Message {
    pub fn for_registers(registers: &Registers) -> Vec<Message> {
        let mut tags: Vec<&String> = registers.keys().collect();
        tags.sort();

        tags.into_iter()
            .map(|tag| Message {
                topic: format!("register/{}", tag),
                retain: true,
                payload: registers[tag].value.to_string(),
            })
            .collect()
    }

    pub fn for_average(key: &str, mean: Option<f64>) -> Result<Message> {
        Ok(Message {
            topic: format!("average/{}", key),
            retain: true,
            payload: serde_json::to_string(&mean)?,
        })
    }

    pub fn for_device_info(info: &DeviceInfo) -> Result<Message> {
        Ok(Message {
            topic: "device_info".to_string(),
            retain: true,
            payload: serde_json::to_string(info)?,
        })
    }

    pub fn for_error(err: &Error) -> Result<Message> {
        Ok(Message {
            topic: "error".to_string(),
            retain: false,
            payload: serde_json::to_string(&serde_json::json!({
                "kind": err.kind(),
                "error": err.to_string(),
            }))?,
        })
    }

    pub fn to_command(&self) -> Result<Command> {
        use Command::*;

        let parts = self.split_cmd_topic()?;

        let r = match parts[..] {
            ["set", tag] if !tag.is_empty() => WriteRegister(tag.to_string(), self.payload_value()?),
            ["reset_average", key] if !key.is_empty() => ResetAverage(key.to_string()),
            ["refresh"] => Refresh,
            [..] => bail!("unhandled: {:?}", self),
        };

        Ok(r)
    }

    // given a cmd Message, return the parts after cmd/
    //
    // eg cmd/set/SP => ['set', 'SP']
    pub fn split_cmd_topic(&self) -> Result<Vec<&str>> {
        let parts: Vec<&str> = self.topic.split('/').collect();

        // this *shouldn't* happen as our subscribe is for {namespace}/cmd/#
        if parts.len() < 2 || parts[0] != "cmd" {
            bail!("ignoring badly formed MQTT topic: {}", self.topic);
        }

        Ok(parts[1..].to_vec())
    }

    fn payload_value(&self) -> Result<String> {
        let value = self.payload.trim();
        if value.is_empty() {
            bail!("payload_value: empty payload for {}", self.topic);
        }
        Ok(value.to_string())
    }
} // }}}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChannelData {
    Message(Message),
    Shutdown,
}

// Mqtt {{{
#[derive(Clone)]
pub struct Mqtt {
    config: ConfigWrapper,
    shutdown: Arc<AtomicBool>,
    channels: Channels,
    shared_stats: Arc<Mutex<PollStats>>,
}

impl Mqtt {
    pub fn new(config: ConfigWrapper, channels: Channels, shared_stats: Arc<Mutex<PollStats>>) -> Self {
        Self {
            config,
            channels,
            shutdown: Arc::new(AtomicBool::new(false)),
            shared_stats,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let c = &self.config;

        if !c.mqtt().enabled() {
            info!("mqtt disabled, skipping");
            return Ok(());
        }

        let mut options = MqttOptions::new("evopell-bridge", c.mqtt().host(), c.mqtt().port());

        let will = LastWill {
            topic: self.status_topic(),
            message: bytes::Bytes::from("offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        options.set_last_will(will);

        options.set_keep_alive(std::time::Duration::from_secs(60));
        if let (Some(u), Some(p)) = (c.mqtt().username(), c.mqtt().password()) {
            options.set_credentials(u, p);
        }

        info!(
            "initializing mqtt at {}:{}",
            c.mqtt().host(),
            c.mqtt().port()
        );

        let (client, eventloop) = AsyncClient::new(options, 10);

        futures::try_join!(
            self.setup(client.clone()),
            self.receiver(eventloop),
            self.sender(client)
        )?;

        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        info!("Stopping MQTT client...");
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.channels.to_mqtt.send(ChannelData::Shutdown);
        Ok(())
    }

    async fn setup(&self, client: AsyncClient) -> Result<()> {
        client
            .publish(self.status_topic(), QoS::AtLeastOnce, true, "online")
            .await?;

        client
            .subscribe(
                format!("{}/cmd/#", self.config.mqtt().namespace()),
                QoS::AtMostOnce,
            )
            .await?;

        Ok(())
    }

    // mqtt -> coordinator
    async fn receiver(&self, mut eventloop: EventLoop) -> Result<()> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("MQTT receiver shutting down");
                break;
            }

            if let Ok(event) =
                tokio::time::timeout(std::time::Duration::from_secs(1), eventloop.poll()).await
            {
                match event {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        if let Err(e) = self.handle_message(publish) {
                            warn!("{}", e);
                        }
                    }
                    Err(e) => {
                        if !self.shutdown.load(Ordering::SeqCst) {
                            error!("{}", e);
                            info!("reconnecting in 5s");
                            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        }
                    }
                    _ => {} // keepalives etc
                }
            }
        }

        info!("MQTT receiver loop exiting");
        Ok(())
    }

    fn handle_message(&self, publish: Publish) -> Result<()> {
        // remove the namespace, including the first /
        let prefix = format!("{}/", self.config.mqtt().namespace());
        let Some(topic) = publish.topic.strip_prefix(&prefix) else {
            bail!("ignoring message outside namespace: {}", publish.topic);
        };

        let message = Message {
            topic: topic.to_owned(),
            retain: publish.retain,
            payload: String::from_utf8(publish.payload.to_vec())?,
        };
        debug!("RX: {:?}", message);
        if self
            .channels
            .from_mqtt
            .send(ChannelData::Message(message))
            .is_err()
        {
            bail!("send(from_mqtt) failed - channel closed?");
        }

        Ok(())
    }

    // coordinator -> mqtt
    async fn sender(&self, client: AsyncClient) -> Result<()> {
        use ChannelData::*;

        let mut receiver = self.channels.to_mqtt.subscribe();

        loop {
            match receiver.recv().await {
                Ok(Shutdown) => {
                    info!("MQTT sender received shutdown signal");
                    let _ = client
                        .publish(self.status_topic(), QoS::AtLeastOnce, true, "offline")
                        .await;
                    let _ = client.disconnect().await;
                    break;
                }
                Ok(Message(message)) => self.publish(&client, message).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("MQTT sender lagged, {} messages dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        info!("MQTT sender loop exiting");
        Ok(())
    }

    async fn publish(&self, client: &AsyncClient, message: Message) {
        let topic = format!("{}/{}", self.config.mqtt().namespace(), message.topic);
        debug!("publishing: {} = {}", topic, message.payload);

        for attempt in 1..=PUBLISH_ATTEMPTS {
            match client
                .publish(&topic, QoS::AtLeastOnce, message.retain, message.payload.as_bytes())
                .await
            {
                Ok(_) => {
                    if let Ok(mut stats) = self.shared_stats.lock() {
                        stats.mqtt_messages_sent += 1;
                    }
                    return;
                }
                Err(err) => {
                    error!(
                        "MQTT publish to {} failed: {:?} (attempt {}/{})",
                        topic, err, attempt, PUBLISH_ATTEMPTS
                    );
                    if let Ok(mut stats) = self.shared_stats.lock() {
                        stats.mqtt_errors += 1;
                    }
                    if attempt < PUBLISH_ATTEMPTS {
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    fn status_topic(&self) -> String {
        format!("{}/status", self.config.mqtt().namespace())
    }
} // }}}

// MqttSink {{{
/// Forwards coordinator updates to the MQTT sender.
pub struct MqttSink {
    channels: Channels,
}

impl MqttSink {
    pub fn new(channels: Channels) -> Self {
        Self { channels }
    }

    fn send(&self, message: Message) -> Result<()> {
        if self
            .channels
            .to_mqtt
            .send(ChannelData::Message(message))
            .is_err()
        {
            bail!("send(to_mqtt) failed - channel closed?");
        }
        Ok(())
    }
}

#[async_trait]
impl DataSink for MqttSink {
    async fn on_registers_updated(&self, registers: &Registers) -> Result<()> {
        for message in Message::for_registers(registers) {
            self.send(message)?;
        }
        Ok(())
    }

    async fn on_average_updated(&self, key: &str, mean: Option<f64>) -> Result<()> {
        self.send(Message::for_average(key, mean)?)
    }

    async fn on_update_failed(&self, err: &Error) -> Result<()> {
        self.send(Message::for_error(err)?)
    }

    async fn on_device_info(&self, info: &DeviceInfo) -> Result<()> {
        self.send(Message::for_device_info(info)?)
    }
} // }}}
