//! MQTT uplink using rumqttc.
//!
//! QoS-1 publishes return pending handles. rumqttc reports the packet id of every
//! outgoing publish in submission order, so handles are queued in the same order and
//! matched to packet ids as the event loop sends them, then resolved on PUBACK.
//!
//! When the link drops every pending handle fails with `NotConnected`. Publishes resent
//! from the previous connection are recognised by packet id and never complete a handle
//! queued after the reconnect.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use neogate_core::{
    Attributes, DownlinkSender, PublishAck, PublishHandle, PublishResult, QoS, Result,
    TelemetryPoint, Uplink, UplinkConfig, UplinkFactory,
};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    ATTRIBUTES_TOPIC, CONNECT_TOPIC, DISCONNECT_TOPIC, SUBSCRIPTIONS, TELEMETRY_TOPIC,
    attributes_payload, connect_payload, disconnect_payload, parse_downlink, rpc_reply,
    telemetry_payload,
};

const MAX_PACKET_SIZE: usize = 1024 * 1024;
const MIN_BACKOFF: Duration = Duration::from_millis(100);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
    }
}

enum AckSlot {
    Untracked,
    Tracked(PublishAck),
    /// Queued before the link dropped; its handle has already failed.
    Orphaned,
}

#[derive(Default)]
struct AckState {
    /// Submitted to the client, packet id not known yet.
    submitted: VecDeque<AckSlot>,
    /// Sent, waiting for PUBACK.
    inflight: HashMap<u16, PublishAck>,
    /// Packet ids in flight when the link dropped. A resumed session resends them.
    resent: HashSet<u16>,
}

#[derive(Default)]
struct AckTracker {
    state: Mutex<AckState>,
}

impl AckTracker {
    fn submit(&self, slot: AckSlot) {
        self.state.lock().submitted.push_back(slot);
    }

    fn withdraw_last(&self) {
        self.state.lock().submitted.pop_back();
    }

    fn on_outgoing(&self, pkid: u16) {
        let mut state = self.state.lock();
        if state.resent.remove(&pkid) {
            debug!(pkid, "Resent publish from the previous connection");
            return;
        }
        match state.submitted.pop_front() {
            Some(AckSlot::Tracked(ack)) => {
                state.inflight.insert(pkid, ack);
            }
            Some(AckSlot::Untracked | AckSlot::Orphaned) => {}
            None => debug!(pkid, "Outgoing publish without a queued handle"),
        }
    }

    fn on_puback(&self, pkid: u16) {
        if let Some(ack) = self.state.lock().inflight.remove(&pkid) {
            ack.resolve(PublishResult::Success);
        }
    }

    /// The link dropped but the client keeps its queue: fail every handle, remember what
    /// may still be sent.
    fn on_link_lost(&self) {
        let mut state = self.state.lock();
        for slot in state.submitted.iter_mut() {
            if let AckSlot::Tracked(ack) = std::mem::replace(slot, AckSlot::Orphaned) {
                ack.resolve(PublishResult::NotConnected);
            }
        }
        let lost: Vec<u16> = state
            .inflight
            .drain()
            .map(|(pkid, ack)| {
                ack.resolve(PublishResult::NotConnected);
                pkid
            })
            .collect();
        state.resent.extend(lost);
    }

    /// A fresh broker session discards everything queued on the previous connection.
    fn on_session(&self, session_present: bool) {
        if session_present {
            return;
        }
        let mut state = self.state.lock();
        state.resent.clear();
        state.submitted.retain(|slot| !matches!(slot, AckSlot::Orphaned));
    }

    /// The client is gone for good.
    fn fail_all(&self) {
        let mut state = self.state.lock();
        for slot in state.submitted.drain(..) {
            if let AckSlot::Tracked(ack) = slot {
                ack.resolve(PublishResult::NotConnected);
            }
        }
        for (_, ack) in state.inflight.drain() {
            ack.resolve(PublishResult::NotConnected);
        }
        state.resent.clear();
    }
}

struct EventLoopContext {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    acks: Arc<AckTracker>,
    downlink: DownlinkSender,
    min_delay: Duration,
    max_delay: Duration,
}

impl EventLoopContext {
    fn on_disconnected(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            warn!("MQTT uplink disconnected");
        }
        self.acks.on_link_lost();
    }

    fn handle_packet(&self, packet: Packet) {
        match packet {
            Packet::ConnAck(connack) => {
                self.acks.on_session(connack.session_present);
                for topic in SUBSCRIPTIONS {
                    if let Err(e) = self.client.try_subscribe(topic, rumqttc::QoS::AtLeastOnce) {
                        error!(topic, error = %e, "Failed to subscribe");
                    }
                }
                self.connected.store(true, Ordering::Release);
                info!("MQTT uplink connected");
            }
            Packet::PubAck(ack) => self.acks.on_puback(ack.pkid),
            Packet::Publish(publish) => match parse_downlink(&publish.topic, &publish.payload) {
                Ok(messages) => {
                    for message in messages {
                        if self.downlink.send(message).is_err() {
                            warn!("Downlink receiver is gone");
                        }
                    }
                }
                Err(e) => warn!(topic = %publish.topic, error = %e, "Malformed downlink message"),
            },
            Packet::Disconnect => self.on_disconnected(),
            _ => {}
        }
    }

    async fn run(self, mut eventloop: EventLoop, cancel: CancellationToken) {
        let mut delay = self.min_delay;
        loop {
            let notification = tokio::select! {
                _ = cancel.cancelled() => break,
                notification = eventloop.poll() => notification,
            };
            match notification {
                Ok(Event::Incoming(packet)) => {
                    if matches!(packet, Packet::ConnAck(_)) {
                        delay = self.min_delay;
                    }
                    self.handle_packet(packet);
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => self.acks.on_outgoing(pkid),
                Ok(Event::Outgoing(_)) => {}
                Err(e) => {
                    self.on_disconnected();
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "MQTT connection error");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(self.max_delay);
                }
            }
        }
        self.on_disconnected();
        self.acks.fail_all();
        debug!("MQTT event loop stopped");
    }
}

/// Gateway uplink over MQTT.
pub struct MqttUplink {
    config: UplinkConfig,
    client_id: String,
    downlink: DownlinkSender,
    client: Mutex<Option<AsyncClient>>,
    connected: Arc<AtomicBool>,
    acks: Arc<AckTracker>,
    /// Keeps submission order equal to the order handles are queued.
    submit_order: tokio::sync::Mutex<()>,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttUplink {
    pub fn new(config: UplinkConfig, downlink: DownlinkSender) -> Self {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("neogate_{}", Uuid::new_v4()));
        Self {
            config,
            client_id,
            downlink,
            client: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            acks: Arc::new(AckTracker::default()),
            submit_order: tokio::sync::Mutex::new(()),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.config.host, self.config.port);
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs.max(5)));
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        if let Some(token) = &self.config.access_token {
            options.set_credentials(token, self.config.password.clone().unwrap_or_default());
        }
        options
    }

    async fn publish(&self, topic: String, payload: Result<Vec<u8>>, qos: QoS) -> PublishHandle {
        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => return PublishHandle::completed(PublishResult::Error(e.to_string())),
        };
        if !self.is_connected() {
            return PublishHandle::completed(PublishResult::NotConnected);
        }
        let Some(client) = self.client.lock().clone() else {
            return PublishHandle::completed(PublishResult::NotConnected);
        };

        let _order = self.submit_order.lock().await;
        let (handle, slot) = match qos {
            QoS::AtMostOnce => (PublishHandle::completed(PublishResult::Success), AckSlot::Untracked),
            QoS::AtLeastOnce => {
                let (handle, ack) = PublishHandle::pending();
                (handle, AckSlot::Tracked(ack))
            }
        };
        self.acks.submit(slot);
        if let Err(e) = client.publish(topic.as_str(), to_mqtt_qos(qos), false, payload).await {
            self.acks.withdraw_last();
            warn!(topic = %topic, error = %e, "MQTT publish failed");
            return PublishHandle::completed(PublishResult::Error(e.to_string()));
        }
        handle
    }
}

#[async_trait]
impl Uplink for MqttUplink {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn connect(&self) -> Result<()> {
        if self.task.lock().is_some() {
            return Ok(());
        }
        let (client, eventloop) = AsyncClient::new(self.options(), 64);
        let cancel = CancellationToken::new();
        let context = EventLoopContext {
            client: client.clone(),
            connected: self.connected.clone(),
            acks: self.acks.clone(),
            downlink: self.downlink.clone(),
            min_delay: Duration::from_secs(self.config.min_reconnect_delay_secs).max(MIN_BACKOFF),
            max_delay: Duration::from_secs(self.config.max_reconnect_delay_secs).max(MIN_BACKOFF),
        };

        *self.client.lock() = Some(client);
        *self.cancel.lock() = Some(cancel.clone());
        *self.task.lock() = Some(tokio::spawn(context.run(eventloop, cancel)));
        info!(
            host = %self.config.host,
            port = self.config.port,
            client_id = %self.client_id,
            "MQTT uplink connecting"
        );
        Ok(())
    }

    async fn disconnect(&self) {
        let client = self.client.lock().take();
        if let Some(client) = client
            && self.is_connected()
        {
            let _ = tokio::time::timeout(DISCONNECT_TIMEOUT, client.disconnect()).await;
        }
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        let task = self.task.lock().take();
        if let Some(task) = task
            && tokio::time::timeout(DISCONNECT_TIMEOUT, task).await.is_err()
        {
            warn!("MQTT event loop did not stop in time");
        }
        self.connected.store(false, Ordering::Release);
        self.acks.fail_all();
        info!(client_id = %self.client_id, "MQTT uplink closed");
    }

    async fn send_attributes(&self, device: &str, attributes: &Attributes, qos: QoS) -> PublishHandle {
        self.publish(ATTRIBUTES_TOPIC.to_string(), attributes_payload(device, attributes), qos)
            .await
    }

    async fn send_telemetry(&self, device: &str, telemetry: &[TelemetryPoint], qos: QoS) -> PublishHandle {
        self.publish(TELEMETRY_TOPIC.to_string(), telemetry_payload(device, telemetry), qos)
            .await
    }

    async fn send_rpc_reply(
        &self,
        device: Option<&str>,
        request_id: u64,
        payload: &serde_json::Value,
        qos: QoS,
    ) -> PublishHandle {
        match rpc_reply(device, request_id, payload) {
            Ok((topic, body)) => self.publish(topic, Ok(body), qos).await,
            Err(e) => PublishHandle::completed(PublishResult::Error(e.to_string())),
        }
    }

    async fn send_device_connect(&self, device: &str, device_type: &str) -> PublishHandle {
        self.publish(
            CONNECT_TOPIC.to_string(),
            connect_payload(device, device_type),
            QoS::AtLeastOnce,
        )
        .await
    }

    async fn send_device_disconnect(&self, device: &str) -> PublishHandle {
        self.publish(
            DISCONNECT_TOPIC.to_string(),
            disconnect_payload(device),
            QoS::AtLeastOnce,
        )
        .await
    }
}

impl std::fmt::Debug for MqttUplink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttUplink")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("client_id", &self.client_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Builds [`MqttUplink`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct MqttUplinkFactory;

impl UplinkFactory for MqttUplinkFactory {
    fn create(&self, config: &UplinkConfig, downlink: DownlinkSender) -> Result<Arc<dyn Uplink>> {
        config.validate()?;
        Ok(Arc::new(MqttUplink::new(config.clone(), downlink)))
    }
}
