mod common;
use common::*;

use evopell_bridge::average::{AverageStore, RunningAverage};
use evopell_bridge::client::{Client, DeviceInfo};
use evopell_bridge::coordinator::Coordinator;
use evopell_bridge::error::Error;
use evopell_bridge::prelude::*;
use evopell_bridge::sink::DataSink;

use async_trait::async_trait;
use mockito::{Matcher, Mock, ServerGuard};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const POLL_QUERY: &str = "device=0&STAT&T5";

#[derive(Default)]
struct RecordingSink {
    updates: Mutex<Vec<usize>>,
    failures: Mutex<Vec<String>>,
    averages: Mutex<Vec<(String, Option<f64>)>>,
    device_info: Mutex<Option<DeviceInfo>>,
}

#[async_trait]
impl DataSink for RecordingSink {
    async fn on_registers_updated(&self, registers: &Registers) -> Result<()> {
        self.updates.lock().unwrap().push(registers.len());
        Ok(())
    }

    async fn on_average_updated(&self, key: &str, mean: Option<f64>) -> Result<()> {
        self.averages.lock().unwrap().push((key.to_string(), mean));
        Ok(())
    }

    async fn on_update_failed(&self, err: &Error) -> Result<()> {
        assert!(matches!(err, Error::UpdateFailed(_)));
        self.failures.lock().unwrap().push(err.kind().to_string());
        Ok(())
    }

    async fn on_device_info(&self, info: &DeviceInfo) -> Result<()> {
        *self.device_info.lock().unwrap() = Some(info.clone());
        Ok(())
    }
}

async fn mock_device_info(server: &mut ServerGuard) -> Mock {
    server
        .mock("GET", "/getregister.cgi")
        .match_query(Matcher::Regex("devid".to_string()))
        .with_status(200)
        .with_body(Factory::device_info_xml())
        .create_async()
        .await
}

async fn mock_poll(server: &mut ServerGuard, status: usize, body: &str, hits: usize) -> Mock {
    server
        .mock("GET", "/getregister.cgi")
        .match_query(Matcher::Exact(POLL_QUERY.to_string()))
        .with_status(status)
        .with_body(body)
        .expect(hits)
        .create_async()
        .await
}

async fn coordinator(
    server: &ServerGuard,
    dir: &std::path::Path,
    sink: Arc<RecordingSink>,
) -> Result<Coordinator> {
    let config = Factory::config(&server.host_with_port(), dir);
    let client = Client::from_config(&config.device(), config.params())?;
    let averages = RunningAverage::load_all(&config).await;

    Ok(Coordinator::new(config, Channels::new(), client)
        .with_averages(averages)
        .with_sink(sink))
}

#[tokio::test]
async fn setup_reads_device_info() -> Result<()> {
    common_setup();
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir()?;
    let _info = mock_device_info(&mut server).await;

    let sink = Arc::new(RecordingSink::default());
    let coordinator = coordinator(&server, dir.path(), sink.clone()).await?;

    assert!(coordinator.read_device_info().await);
    assert_eq!(coordinator.device_info().map(|i| i.model), Some("EP-25".to_string()));
    assert_eq!(
        sink.device_info.lock().unwrap().as_ref().map(|i| i.serial.clone()),
        Some("17-0011223344AA".to_string())
    );

    Ok(())
}

#[tokio::test]
async fn setup_failure_ends_the_session() -> Result<()> {
    common_setup();
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir()?;

    let _info = server
        .mock("GET", "/getregister.cgi")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(Factory::regs_xml(&[("devid", "17")]))
        .create_async()
        .await;

    let coordinator = coordinator(&server, dir.path(), Arc::new(RecordingSink::default())).await?;

    assert!(!coordinator.read_device_info().await);
    assert!(matches!(coordinator.setup().await, Err(Error::Setup { .. })));

    // start must return instead of polling
    let r = tokio::time::timeout(Duration::from_secs(5), coordinator.start()).await?;
    assert!(r.is_err());

    Ok(())
}

#[tokio::test]
async fn failed_tick_becomes_update_failed() -> Result<()> {
    common_setup();
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir()?;

    let failing = mock_poll(&mut server, 503, "", 1).await;
    let ok = mock_poll(
        &mut server,
        200,
        &Factory::regs_xml(&[("T5", "150"), ("STAT", "3")]),
        1,
    )
    .await;

    let sink = Arc::new(RecordingSink::default());
    let coordinator = coordinator(&server, dir.path(), sink.clone()).await?;

    let err = coordinator.tick().await.unwrap_err();
    assert!(matches!(err, Error::UpdateFailed(_)));
    assert_eq!(err.kind(), "network");
    assert!(coordinator.cache().is_empty());

    // the next tick is unaffected
    assert_eq!(coordinator.tick().await?, 2);
    assert_eq!(coordinator.cache().value("T5"), Some(RegisterValue::Int(150)));

    failing.assert_async().await;
    ok.assert_async().await;

    assert_eq!(*sink.failures.lock().unwrap(), vec!["network".to_string()]);
    assert_eq!(*sink.updates.lock().unwrap(), vec![2]);
    assert_eq!(
        *sink.averages.lock().unwrap(),
        vec![("flue_avg".to_string(), Some(150.0))]
    );

    let stats = coordinator.stats.lock().unwrap();
    assert_eq!(stats.ticks, 2);
    assert_eq!(stats.failed_ticks, 1);
    assert_eq!(stats.failures_by_kind.get("network"), Some(&1));

    Ok(())
}

#[tokio::test]
async fn authentication_failure_is_reported_by_kind() -> Result<()> {
    common_setup();
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir()?;

    let _denied = mock_poll(&mut server, 403, "", 1).await;

    let sink = Arc::new(RecordingSink::default());
    let coordinator = coordinator(&server, dir.path(), sink.clone()).await?;

    let err = coordinator.tick().await.unwrap_err();
    assert!(err.is_authentication());
    assert_eq!(*sink.failures.lock().unwrap(), vec!["authentication".to_string()]);

    Ok(())
}

#[tokio::test]
async fn poll_loop_survives_failures_and_flushes_on_stop() -> Result<()> {
    common_setup();
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir()?;

    let _info = mock_device_info(&mut server).await;
    let _failing = mock_poll(&mut server, 500, "", 1).await;
    let _ok = mock_poll(
        &mut server,
        200,
        &Factory::regs_xml(&[("T5", "120"), ("STAT", "3")]),
        1,
    )
    .await;

    let sink = Arc::new(RecordingSink::default());
    let coordinator = coordinator(&server, dir.path(), sink.clone()).await?;

    let handle = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.start().await })
    };

    // first tick fails straight away, the second one a second later succeeds
    tokio::time::sleep(Duration::from_millis(1500)).await;
    coordinator.stop();
    let r = tokio::time::timeout(Duration::from_secs(5), handle).await??;
    r?;

    assert_eq!(coordinator.cache().value("T5"), Some(RegisterValue::Int(120)));
    {
        let stats = coordinator.stats.lock().unwrap();
        assert!(stats.failed_ticks >= 1);
        assert!(stats.successful_ticks >= 1);
    }

    // the average was flushed although its save delay had not passed
    let stored = AverageStore::new(dir.path(), "flue_avg").load().await;
    assert!(stored.count >= 1);
    assert_eq!(stored.total / stored.count as f64, 120.0);

    Ok(())
}

#[tokio::test]
async fn write_command_updates_cache_only_on_ok() -> Result<()> {
    common_setup();
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir()?;

    let _accepted = server
        .mock("GET", "/setregister.cgi")
        .match_query(Matcher::Exact("device=0&SP=65".to_string()))
        .with_status(200)
        .with_body(r#"<regs><reg vid="1" tid="SP" status="ok"/></regs>"#)
        .create_async()
        .await;
    let _rejected = server
        .mock("GET", "/setregister.cgi")
        .match_query(Matcher::Exact("device=0&SP=999".to_string()))
        .with_status(200)
        .with_body(r#"<regs><reg vid="2" tid="SP" status="err_range"/></regs>"#)
        .create_async()
        .await;

    let coordinator = coordinator(&server, dir.path(), Arc::new(RecordingSink::default())).await?;

    coordinator
        .process_command(Command::WriteRegister("SP".to_string(), "65".to_string()))
        .await?;
    assert_eq!(coordinator.cache().value("SP"), Some(RegisterValue::Int(65)));

    let r = coordinator
        .process_command(Command::WriteRegister("SP".to_string(), "999".to_string()))
        .await;
    assert!(r.is_err());
    assert_eq!(coordinator.cache().value("SP"), Some(RegisterValue::Int(65)));

    let stats = coordinator.stats.lock().unwrap();
    assert_eq!(stats.writes_ok, 1);
    assert_eq!(stats.writes_failed, 1);

    Ok(())
}

#[tokio::test]
async fn reset_average_command() -> Result<()> {
    common_setup();
    let server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir()?;

    let sink = Arc::new(RecordingSink::default());
    let coordinator = coordinator(&server, dir.path(), sink.clone()).await?;

    let average = coordinator.average("flue_avg").unwrap().clone();
    average.record(80.0, "3");

    coordinator
        .process_command(Command::ResetAverage("flue_avg".to_string()))
        .await?;
    assert_eq!(average.current_mean(), None);
    assert_eq!(
        *sink.averages.lock().unwrap(),
        vec![("flue_avg".to_string(), None)]
    );

    assert!(coordinator
        .process_command(Command::ResetAverage("missing".to_string()))
        .await
        .is_err());

    Ok(())
}

#[tokio::test]
async fn refresh_command_polls_now() -> Result<()> {
    common_setup();
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir()?;

    let poll = mock_poll(&mut server, 200, &Factory::regs_xml(&[("STAT", "0")]), 1).await;

    let coordinator = coordinator(&server, dir.path(), Arc::new(RecordingSink::default())).await?;
    coordinator.process_command(Command::Refresh).await?;

    poll.assert_async().await;
    assert_eq!(coordinator.cache().value("STAT"), Some(RegisterValue::Int(0)));
    // status not running, nothing sampled
    assert_eq!(coordinator.average("flue_avg").unwrap().state().count, 0);

    Ok(())
}

#[tokio::test]
async fn command_backlog_does_not_stop_polling() -> Result<()> {
    common_setup();
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir()?;

    let _info = mock_device_info(&mut server).await;
    let _poll = server
        .mock("GET", "/getregister.cgi")
        .match_query(Matcher::Exact(POLL_QUERY.to_string()))
        .with_status(200)
        .with_body(Factory::regs_xml(&[("STAT", "0")]))
        .create_async()
        .await;

    let config = Factory::mqtt_config(&server.host_with_port(), dir.path());
    let client = Client::from_config(&config.device(), config.params())?;
    let channels = Channels::new();
    let mut results = channels.to_mqtt.subscribe();
    let coordinator = Coordinator::new(config, channels.clone(), client);

    let handle = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.start().await })
    };
    // let setup and the first tick finish
    tokio::time::sleep(Duration::from_millis(300)).await;

    // more commands than the channel holds, sent without yielding
    let unknown = mqtt::Message {
        topic: "cmd/unknown".to_string(),
        retain: false,
        payload: String::new(),
    };
    for _ in 0..3000 {
        let _ = channels.from_mqtt.send(mqtt::ChannelData::Message(unknown.clone()));
    }
    let refresh = mqtt::Message {
        topic: "cmd/refresh".to_string(),
        retain: false,
        payload: String::new(),
    };
    channels.from_mqtt.send(mqtt::ChannelData::Message(refresh))?;

    let reply = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(mqtt::ChannelData::Message(m)) = results.recv().await {
                if m.topic == "result/refresh" {
                    return m;
                }
            }
        }
    })
    .await?;
    assert_eq!(reply.payload, "OK");
    assert!(!handle.is_finished());

    coordinator.stop();
    let r = tokio::time::timeout(Duration::from_secs(5), handle).await??;
    r?;

    Ok(())
}
