//! 云端发送通道

use crate::error::SinkError;
use crate::record::UploadBatch;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

/// 云端时序库能力：接收一批记录，整批成功或失败。
#[async_trait]
pub trait CloudSink: Send + Sync {
    async fn send_batch(&self, batch: &UploadBatch) -> Result<(), SinkError>;
}

/// 空发送器（用于接线与测试）。
#[derive(Debug, Default)]
pub struct NoopSink;

#[async_trait]
impl CloudSink for NoopSink {
    async fn send_batch(&self, batch: &UploadBatch) -> Result<(), SinkError> {
        debug!(target: "edge.upload", batch_id = %batch.batch_id, records = batch.len(), "noop_sink_accepted");
        Ok(())
    }
}

/// MQTT 发送器配置。
#[derive(Debug, Clone)]
pub struct MqttSinkConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub topic: String,
    /// 等待 PubAck 的超时。
    pub ack_timeout: Duration,
}

#[derive(Debug)]
enum AckEvent {
    Sent(u16),
    Acked(u16),
}

/// MQTT 发送器：每批一条 line protocol 消息，QoS 1，收到 PubAck 才算成功。
pub struct MqttCloudSink {
    client: AsyncClient,
    topic: String,
    ack_timeout: Duration,
    acks: Mutex<mpsc::UnboundedReceiver<AckEvent>>,
}

impl MqttCloudSink {
    pub fn connect(config: MqttSinkConfig) -> (Self, tokio::task::JoinHandle<()>) {
        let mut options = MqttOptions::new(config.client_id, config.host, config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (config.username, config.password) {
            options.set_credentials(username, password);
        }
        let (client, mut eventloop) = AsyncClient::new(options, 10);
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                        let _ = ack_tx.send(AckEvent::Sent(pkid));
                    }
                    Ok(Event::Incoming(Packet::PubAck(ack))) => {
                        let _ = ack_tx.send(AckEvent::Acked(ack.pkid));
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(target: "edge.upload", "mqtt_sink_connected");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(target: "edge.upload", error = %err, "mqtt_sink_eventloop_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
        (
            Self {
                client,
                topic: config.topic,
                ack_timeout: config.ack_timeout,
                acks: Mutex::new(ack_rx),
            },
            handle,
        )
    }

    async fn await_ack(acks: &mut mpsc::UnboundedReceiver<AckEvent>) -> Result<(), SinkError> {
        let mut pkid = None;
        loop {
            match acks.recv().await {
                Some(AckEvent::Sent(sent)) if pkid.is_none() => pkid = Some(sent),
                Some(AckEvent::Acked(acked)) if pkid == Some(acked) => return Ok(()),
                Some(_) => {}
                None => return Err(SinkError::Transport("mqtt eventloop stopped".to_string())),
            }
        }
    }
}

#[async_trait]
impl CloudSink for MqttCloudSink {
    async fn send_batch(&self, batch: &UploadBatch) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }
        let payload = batch.to_line_protocol();
        // 单上传者：串行发送，按顺序匹配 pkid
        let mut acks = self.acks.lock().await;
        while acks.try_recv().is_ok() {}
        self.client
            .publish(self.topic.clone(), QoS::AtLeastOnce, false, payload.into_bytes())
            .await
            .map_err(|err| SinkError::Transport(err.to_string()))?;
        match tokio::time::timeout(self.ack_timeout, Self::await_ack(&mut acks)).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout(self.ack_timeout.as_millis() as u64)),
        }
    }
}
