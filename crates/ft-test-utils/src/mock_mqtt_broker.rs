// mock_mqtt_broker: A minimal MQTT 3.1.1 broker for testing the subscription
// manager.
//
// Accepts connections on tcp://127.0.0.1:<port>, answers CONNECT with a
// configurable CONNACK code, acknowledges SUBSCRIBE and PINGREQ, and forwards
// test-injected PUBLISH packets (QoS 0) to every subscribed client.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

const CONNECT: u8 = 0x10;
const SUBSCRIBE: u8 = 0x80;
const PINGREQ: u8 = 0xC0;
const DISCONNECT: u8 = 0xE0;

/// Credentials presented in a CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectInfo {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Default)]
struct BrokerState {
    connects: AtomicUsize,
    connect_infos: Mutex<Vec<ConnectInfo>>,
    subscriptions: Mutex<Vec<String>>,
    /// CONNACK return code; 0 accepts the session.
    connack_code: AtomicU8,
}

#[derive(Clone)]
enum Outbound {
    Publish { topic: String, payload: Vec<u8> },
    Drop,
}

/// A mock MQTT broker for integration testing.
///
/// Binds to port 0 (random). Each test spins up its own instance.
///
/// # Protocol behavior
///
/// - CONNECT is answered with CONNACK carrying the configured return code
///   (0 by default). A non-zero code closes the connection after the CONNACK.
/// - SUBSCRIBE is answered with SUBACK granting QoS 0 for every filter.
/// - PINGREQ is answered with PINGRESP.
/// - [`MockMqttBroker::publish`] sends a QoS 0 PUBLISH to every client that
///   has subscribed, regardless of topic filter.
/// - [`MockMqttBroker::drop_connections`] closes every live connection.
pub struct MockMqttBroker {
    addr: SocketAddr,
    state: Arc<BrokerState>,
    outbound: broadcast::Sender<Outbound>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockMqttBroker {
    /// Start a broker that accepts every CONNECT.
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        Self::start_with_connack(0).await
    }

    /// Start a broker that answers CONNECT with `code`
    /// (e.g. 4 = bad user name or password, 5 = not authorized).
    pub async fn start_with_connack(code: u8) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(BrokerState::default());
        state.connack_code.store(code, Ordering::SeqCst);
        let (outbound, _) = broadcast::channel(256);

        let accept_state = state.clone();
        let accept_outbound = outbound.clone();
        let task = tokio::spawn(async move {
            Self::accept_loop(listener, accept_state, accept_outbound).await;
        });

        Ok(Self {
            addr,
            state,
            outbound,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Change the CONNACK code for future connections.
    pub fn set_connack_code(&self, code: u8) {
        self.state.connack_code.store(code, Ordering::SeqCst);
    }

    /// Number of CONNECT packets received so far.
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn connect_infos(&self) -> Vec<ConnectInfo> {
        self.state.connect_infos.lock().unwrap().clone()
    }

    /// Topic filters from every SUBSCRIBE packet, in arrival order.
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.state.subscriptions.lock().unwrap().clone()
    }

    /// Wait until at least `n` SUBSCRIBE filters have arrived.
    pub async fn wait_for_subscriptions(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.state.subscriptions.lock().unwrap().len() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Wait until at least `n` CONNECT packets have arrived.
    pub async fn wait_for_connects(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.connect_count() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Publish `payload` on `topic` to every subscribed client.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        let _ = self.outbound.send(Outbound::Publish {
            topic: topic.to_owned(),
            payload: payload.into(),
        });
    }

    /// Close every live client connection (simulates a broker-side drop).
    pub fn drop_connections(&self) {
        let _ = self.outbound.send(Outbound::Drop);
    }

    // -- internal --

    async fn accept_loop(
        listener: TcpListener,
        state: Arc<BrokerState>,
        outbound: broadcast::Sender<Outbound>,
    ) {
        while let Ok((stream, _peer)) = listener.accept().await {
            let state = state.clone();
            let outbound_rx = outbound.subscribe();
            tokio::spawn(async move {
                // Connection errors are expected when clients go away.
                let _ = Self::handle_connection(stream, state, outbound_rx).await;
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        state: Arc<BrokerState>,
        outbound_rx: broadcast::Receiver<Outbound>,
    ) -> std::io::Result<()> {
        let (mut read, write) = stream.into_split();
        let (reply_tx, reply_rx) = mpsc::channel::<Vec<u8>>(64);
        let subscribed = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(Self::write_loop(
            write,
            reply_rx,
            outbound_rx,
            subscribed.clone(),
        ));

        while let Some((header, body)) = read_packet(&mut read).await? {
            match header & 0xF0 {
                CONNECT => {
                    state.connects.fetch_add(1, Ordering::SeqCst);
                    if let Some(info) = parse_connect(&body) {
                        state.connect_infos.lock().unwrap().push(info);
                    }
                    let code = state.connack_code.load(Ordering::SeqCst);
                    let _ = reply_tx.send(vec![0x20, 0x02, 0x00, code]).await;
                    if code != 0 {
                        break;
                    }
                }
                SUBSCRIBE => {
                    let (packet_id, filters) = parse_subscribe(&body);
                    let mut suback = vec![0x90];
                    encode_remaining_length(2 + filters.len(), &mut suback);
                    suback.extend_from_slice(&packet_id.to_be_bytes());
                    suback.extend(std::iter::repeat_n(0x00, filters.len()));
                    subscribed.store(true, Ordering::SeqCst);
                    state.subscriptions.lock().unwrap().extend(filters);
                    let _ = reply_tx.send(suback).await;
                }
                PINGREQ => {
                    let _ = reply_tx.send(vec![0xD0, 0x00]).await;
                }
                DISCONNECT => break,
                _ => {}
            }
        }

        drop(reply_tx);
        let _ = writer.await;
        Ok(())
    }

    async fn write_loop(
        mut write: OwnedWriteHalf,
        mut reply_rx: mpsc::Receiver<Vec<u8>>,
        mut outbound_rx: broadcast::Receiver<Outbound>,
        subscribed: Arc<AtomicBool>,
    ) {
        loop {
            let frame = tokio::select! {
                reply = reply_rx.recv() => match reply {
                    Some(frame) => frame,
                    None => break,
                },
                msg = outbound_rx.recv() => match msg {
                    Ok(Outbound::Publish { topic, payload }) => {
                        if !subscribed.load(Ordering::SeqCst) {
                            continue;
                        }
                        encode_publish(&topic, &payload)
                    }
                    Ok(Outbound::Drop) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            if write.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = write.shutdown().await;
    }
}

// ---------------------------------------------------------------------------
// Packet codec (just enough of MQTT 3.1.1)
// ---------------------------------------------------------------------------

async fn read_packet(read: &mut OwnedReadHalf) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    let mut header = [0u8; 1];
    if read.read(&mut header).await? == 0 {
        return Ok(None);
    }

    let mut remaining = 0usize;
    let mut multiplier = 1usize;
    for _ in 0..4 {
        let mut byte = [0u8; 1];
        read.read_exact(&mut byte).await?;
        remaining += usize::from(byte[0] & 0x7F) * multiplier;
        if byte[0] & 0x80 == 0 {
            break;
        }
        multiplier *= 128;
    }

    let mut body = vec![0u8; remaining];
    read.read_exact(&mut body).await?;
    Ok(Some((header[0], body)))
}

fn encode_remaining_length(mut len: usize, out: &mut Vec<u8>) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

fn encode_publish(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x30];
    encode_remaining_length(2 + topic.len() + payload.len(), &mut frame);
    frame.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    frame.extend_from_slice(topic.as_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn read_string(body: &[u8], pos: &mut usize) -> Option<String> {
    let len = usize::from(u16::from_be_bytes([*body.get(*pos)?, *body.get(*pos + 1)?]));
    let start = *pos + 2;
    let bytes = body.get(start..start + len)?;
    *pos = start + len;
    Some(String::from_utf8_lossy(bytes).into_owned())
}

fn parse_connect(body: &[u8]) -> Option<ConnectInfo> {
    let mut pos = 0;
    let _protocol_name = read_string(body, &mut pos)?;
    let _level = *body.get(pos)?;
    let flags = *body.get(pos + 1)?;
    pos += 4; // level, flags, keep-alive (2)

    let client_id = read_string(body, &mut pos)?;
    if flags & 0x04 != 0 {
        read_string(body, &mut pos)?; // will topic
        read_string(body, &mut pos)?; // will message
    }
    let username = if flags & 0x80 != 0 {
        Some(read_string(body, &mut pos)?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(read_string(body, &mut pos)?)
    } else {
        None
    };
    Some(ConnectInfo {
        client_id,
        username,
        password,
    })
}

fn parse_subscribe(body: &[u8]) -> (u16, Vec<String>) {
    let packet_id = match body {
        [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
        _ => 0,
    };
    let mut filters = Vec::new();
    let mut pos = 2;
    while pos < body.len() {
        match read_string(body, &mut pos) {
            Some(filter) => {
                filters.push(filter);
                pos += 1; // requested QoS
            }
            None => break,
        }
    }
    (packet_id, filters)
}
