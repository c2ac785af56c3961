//! Subscription manager: one persistent MQTT session for the configured device.
//!
//! # States
//! `Disconnected → Connecting → Subscribed → Disconnected (on error) →
//! Connecting (after backoff) → …`, and `Stopped` once shutdown is observed.
//! The current state is published on a `watch` channel.
//!
//! # Message path
//! The read loop never touches the store. Each PUBLISH is `try_send`-ed onto
//! the bounded pipeline queue (see [`crate::pipeline`]); a full queue drops the
//! message and counts it.
//!
//! # Reconnect
//! Every failure (transport error, refused CONNACK, refused SUBACK) ends the
//! session. The next attempt waits `Backoff::next_delay()`; a successful
//! CONNACK resets the backoff.

use crate::backoff::Backoff;
use crate::gate::IngestCounters;
use crate::pipeline::InboundMessage;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions,
    Outgoing, Packet, QoS, SubscribeReasonCode,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How long to keep polling the event loop after requesting DISCONNECT.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Disconnected,
    Connecting,
    Subscribed,
    Stopped,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscriptionState::Disconnected => "disconnected",
            SubscriptionState::Connecting => "connecting",
            SubscriptionState::Subscribed => "subscribed",
            SubscriptionState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("broker refused connection: {0:?}")]
    Refused(ConnectReturnCode),
    #[error("broker refused subscription to '{0}'")]
    SubscribeRefused(String),
    #[error("connection error: {0}")]
    Connection(ConnectionError),
    #[error("client request failed: {0}")]
    Client(#[from] ClientError),
}

impl From<ConnectionError> for SubscriptionError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::ConnectionRefused(code) => SubscriptionError::Refused(code),
            other => SubscriptionError::Connection(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub topic: String,
    pub keep_alive: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    /// Incoming packet limit; a larger PUBLISH fails the session.
    pub max_packet_bytes: usize,
}

/// Uplink topic for one device: `v3/{username}/devices/{device_id}/up`.
pub fn uplink_topic(username: &str, device_id: &str) -> String {
    format!("v3/{username}/devices/{device_id}/up")
}

pub struct SubscriptionManager {
    config: SubscriptionConfig,
    queue: mpsc::Sender<InboundMessage>,
    counters: Arc<IngestCounters>,
    state_tx: watch::Sender<SubscriptionState>,
}

impl SubscriptionManager {
    pub fn new(
        config: SubscriptionConfig,
        queue: mpsc::Sender<InboundMessage>,
        counters: Arc<IngestCounters>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SubscriptionState::Disconnected);
        SubscriptionManager {
            config,
            queue,
            counters,
            state_tx,
        }
    }

    /// Receiver for state transitions.
    pub fn state(&self) -> watch::Receiver<SubscriptionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: SubscriptionState) {
        self.state_tx.send_replace(state);
    }

    /// Run sessions until shutdown. Consumes the manager so that the queue
    /// sender is dropped on return and the pipeline worker can drain.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(self.config.reconnect_min, self.config.reconnect_max);
        info!(
            host = %self.config.host,
            port = self.config.port,
            topic = %self.config.topic,
            "subscription manager starting"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            self.set_state(SubscriptionState::Connecting);
            match self.run_session(&mut shutdown_rx, &mut backoff).await {
                Ok(()) => break,
                Err(e) => {
                    self.set_state(SubscriptionState::Disconnected);
                    let delay = backoff.next_delay();
                    warn!(
                        error = %e,
                        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "subscription session ended; reconnecting after backoff"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.set_state(SubscriptionState::Stopped);
        info!("subscription manager stopped");
    }

    /// One session. `Ok(())` means shutdown was requested; every other exit
    /// is an error that triggers a reconnect.
    async fn run_session(
        &self,
        shutdown_rx: &mut watch::Receiver<bool>,
        backoff: &mut Backoff,
    ) -> Result<(), SubscriptionError> {
        let cfg = &self.config;
        let mut options = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
        options.set_credentials(cfg.username.clone(), cfg.password.clone());
        options.set_keep_alive(cfg.keep_alive);
        options.set_clean_session(true);
        options.set_max_packet_size(cfg.max_packet_bytes, cfg.max_packet_bytes);

        let (client, mut eventloop) = AsyncClient::new(options, 10);
        debug!(host = %cfg.host, port = cfg.port, "connecting to broker");

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        disconnect(&client, &mut eventloop).await;
                        return Ok(());
                    }
                }
                event = eventloop.poll() => {
                    match event? {
                        Event::Incoming(Packet::ConnAck(ack)) => {
                            if ack.code != ConnectReturnCode::Success {
                                return Err(SubscriptionError::Refused(ack.code));
                            }
                            backoff.reset();
                            info!(host = %cfg.host, "connected to broker");
                            client.try_subscribe(cfg.topic.clone(), QoS::AtLeastOnce)?;
                        }
                        Event::Incoming(Packet::SubAck(ack)) => {
                            if ack
                                .return_codes
                                .iter()
                                .any(|c| matches!(c, SubscribeReasonCode::Failure))
                            {
                                return Err(SubscriptionError::SubscribeRefused(cfg.topic.clone()));
                            }
                            self.set_state(SubscriptionState::Subscribed);
                            info!(topic = %cfg.topic, "subscribed");
                        }
                        Event::Incoming(Packet::Publish(publish)) => {
                            self.dispatch(InboundMessage {
                                topic: publish.topic,
                                payload: publish.payload.to_vec(),
                            });
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn dispatch(&self, msg: InboundMessage) {
        match self.queue.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                self.counters.record_queue_drop();
                warn!(topic = %msg.topic, "pipeline queue full; message dropped");
            }
            Err(TrySendError::Closed(msg)) => {
                error!(topic = %msg.topic, "pipeline worker gone; message dropped");
            }
        }
    }
}

/// Send DISCONNECT and give the event loop a moment to flush it.
async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop) {
    if client.try_disconnect().is_err() {
        return;
    }
    let flushed = tokio::time::timeout(DISCONNECT_GRACE, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if flushed.is_err() {
        debug!("broker session closed without flushing DISCONNECT");
    }
}
