//! MQTT publisher built on `rumqttc`.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    Transport,
};
use serde::Deserialize;
use tokio::{task::JoinHandle, time::Instant};

use super::payload::{self, RateLimit};
use crate::{
    module::PostCollection,
    outcome::{ModuleError, Outcome},
    store::Reading,
};

pub const KIND: &str = "mqtt";

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const REQUEST_CAPACITY: usize = 16;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Deserialize)]
pub struct MqttSettings {
    pub host: String,
    #[serde(default = "defaults::port")]
    pub port: u16,
    pub topic: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Enables TLS with this CA bundle.
    #[serde(default)]
    pub ca_file_path: Option<PathBuf>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "defaults::qos")]
    pub qos: u8,
    #[serde(default = "defaults::connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub min_interval_secs: Option<u64>,
    #[serde(default = "payload::default_fields")]
    pub fields: Vec<String>,
}

mod defaults {
    pub fn port() -> u16 {
        8883
    }

    pub fn qos() -> u8 {
        1
    }

    pub fn connect_timeout_secs() -> u64 {
        10
    }
}

pub fn qos(level: u8) -> Result<QoS, ModuleError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(ModuleError::config(format!("{KIND}: invalid qos {other}"))),
    }
}

impl MqttSettings {
    fn options(&self) -> Result<MqttOptions, ModuleError> {
        if self.host.is_empty() || self.topic.is_empty() {
            return Err(ModuleError::config(format!("{KIND}: host and topic are required")));
        }
        let client_id = self
            .client_id
            .clone()
            .unwrap_or_else(|| format!("thmond-{}", uuid::Uuid::new_v4()));
        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options.set_keep_alive(KEEP_ALIVE);
        if let Some(username) = &self.username {
            options.set_credentials(username.clone(), self.password.clone().unwrap_or_default());
        }
        if let Some(ca_path) = &self.ca_file_path {
            let ca = std::fs::read(ca_path).map_err(|e| {
                ModuleError::config(format!("{KIND}: cannot read {}: {e}", ca_path.display()))
            })?;
            options.set_transport(Transport::tls(ca, None, None));
        }
        Ok(options)
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), ModuleError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(ModuleError::sink(format!("broker refused connection: {:?}", ack.code)))
                };
            }
            Ok(_) => {}
            Err(e) => return Err(ModuleError::sink(format!("connect failed: {e}"))),
        }
    }
}

/// Connection state shared between the sink and its driver task.
#[derive(Debug, Default)]
struct Link {
    connected: AtomicBool,
    closing: AtomicBool,
}

/// Keeps the connection alive and logs reconnects. Returns once the
/// DISCONNECT requested by `destroy` has been written.
async fn drive(mut eventloop: EventLoop, endpoint: String, link: Arc<Link>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                debug!("{KIND}: message {} acknowledged", ack.pkid)
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                link.connected.store(true, Ordering::Release);
                info!("{KIND}: reconnected to {endpoint}");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                link.connected.store(false, Ordering::Release);
                debug!("{KIND}: disconnected from {endpoint}");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                if link.closing.load(Ordering::Acquire) {
                    return;
                }
                if link.connected.swap(false, Ordering::AcqRel) {
                    warn!("{KIND}: connection to {endpoint} lost: {e}");
                } else {
                    debug!("{KIND}: reconnect to {endpoint} failed: {e}");
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

pub struct MqttSink {
    client: AsyncClient,
    driver: JoinHandle<()>,
    link: Arc<Link>,
    topic: String,
    qos: QoS,
    fields: Vec<String>,
    limit: RateLimit,
    endpoint: String,
}

impl MqttSink {
    /// Connects and waits for the broker's CONNACK.
    pub async fn connect(settings: MqttSettings) -> Result<Self, ModuleError> {
        let qos = qos(settings.qos)?;
        let options = settings.options()?;
        let endpoint = format!("{}:{}", settings.host, settings.port);
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let timeout = Duration::from_secs(settings.connect_timeout_secs);
        tokio::time::timeout(timeout, await_connack(&mut eventloop))
            .await
            .map_err(|_| {
                ModuleError::sink(format!("no CONNACK from {endpoint} within {timeout:?}"))
            })??;
        info!("{KIND}: connected to {endpoint}, publishing to '{}'", settings.topic);

        let link = Arc::new(Link::default());
        link.connected.store(true, Ordering::Release);
        let driver = tokio::spawn(drive(eventloop, endpoint.clone(), Arc::clone(&link)));
        Ok(Self {
            client,
            driver,
            link,
            topic: settings.topic,
            qos,
            fields: settings.fields,
            limit: RateLimit::new(Duration::from_secs(settings.min_interval_secs.unwrap_or(0))),
            endpoint,
        })
    }

    /// Queues one message without waiting for room in the request channel.
    fn publish(&self, body: String) -> Result<(), ModuleError> {
        if !self.link.connected.load(Ordering::Acquire) {
            return Err(ModuleError::sink(format!("not connected to {}", self.endpoint)));
        }
        self.client
            .try_publish(self.topic.as_str(), self.qos, false, body)
            .map_err(|e| ModuleError::sink(format!("publish to {} failed: {e}", self.endpoint)))
    }
}

#[async_trait]
impl PostCollection for MqttSink {
    fn name(&self) -> &str {
        KIND
    }

    async fn step(&mut self, reading: &Reading) -> Outcome {
        let now = Instant::now();
        if !self.limit.permits(now) {
            return Outcome::Success;
        }
        let body = payload::build(reading, &self.fields, Utc::now()).to_string();
        let result = self.publish(body);
        if result.is_ok() {
            self.limit.mark(now);
            debug!("{KIND}: queued message for {}", self.topic);
        }
        result.into()
    }

    async fn destroy(&mut self) {
        self.link.closing.store(true, Ordering::Release);
        if let Err(e) = self.client.try_disconnect() {
            debug!("{KIND}: disconnect from {}: {e}", self.endpoint);
        }
        if tokio::time::timeout(DISCONNECT_TIMEOUT, &mut self.driver).await.is_err() {
            debug!("{KIND}: DISCONNECT to {} not flushed in time", self.endpoint);
            self.driver.abort();
        }
    }
}
