//! ==============================================================================
//! feed.rs - mqtt sensor feed
//! ==============================================================================
//!
//! purpose:
//!     owns the single mqtt connection to the broker. subscribes to the
//!     configured topic filter once the broker acknowledges the connection,
//!     then hands every publish to a [`SensorSink`], one at a time, in the
//!     order the broker delivered them.
//!
//! failure model:
//!     the first connection error ends the feed. the event loop is not polled
//!     again, so rumqttc never gets the chance to reconnect. callers decide
//!     what that means (the relay keeps serving http without live data).
//!
//!     a publish larger than `broker.max_packet_size` is the exception: it is
//!     one bad message, not a dead broker. it is logged and discarded and the
//!     event loop is polled again, which re-establishes the session and the
//!     subscription. rumqttc drops the connection when it rejects the frame,
//!     so messages that arrived in the same read are lost with it. after
//!     MAX_OVERSIZE_RECOVERIES in a row with no publish delivered in between
//!     (a retained oversized message, for instance) the feed gives up.
//!
//! relationships:
//!     - used by: main.rs (relay and listen modes)
//!     - sinks: bridge.rs (relay), listener.rs (console)
//!
//! ==============================================================================

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::mqttbytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, MqttOptions, Packet, QoS, StateError,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;

/// consecutive oversized publishes tolerated before the feed stops
pub const MAX_OVERSIZE_RECOVERIES: u32 = 3;

/// Receives raw broker messages, strictly one at a time.
#[async_trait]
pub trait SensorSink: Send + Sync {
    async fn on_message(&self, topic: &str, payload: &[u8]);
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("mqtt connection to {addr} failed: {source}")]
    Connection {
        addr: String,
        #[source]
        source: ConnectionError,
    },
    #[error("broker {addr} refused connection: {code:?}")]
    Refused { addr: String, code: ConnectReturnCode },
    #[error("subscribe to {topic} failed: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: rumqttc::ClientError,
    },
}

pub struct SensorFeed {
    options: MqttOptions,
    topic: String,
    request_capacity: usize,
    max_packet_size: usize,
}

impl SensorFeed {
    pub fn new(config: &BrokerConfig) -> Self {
        let mut options = MqttOptions::new(config.client_id(), config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keepalive_seconds.max(5)));
        options.set_max_packet_size(config.max_packet_size, config.max_packet_size);

        Self {
            options,
            topic: config.topic.clone(),
            request_capacity: config.request_capacity.max(1),
            max_packet_size: config.max_packet_size,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn addr(&self) -> String {
        let (host, port) = self.options.broker_address();
        format!("{host}:{port}")
    }

    /// Connect and pump messages into `sink` until the connection fails.
    pub async fn run<S>(self, sink: &S) -> Result<(), FeedError>
    where
        S: SensorSink + ?Sized,
    {
        let addr = self.addr();
        info!(broker = %addr, topic = %self.topic, "connecting to mqtt broker");

        let (client, mut eventloop) = AsyncClient::new(self.options, self.request_capacity);
        let mut oversized_in_a_row = 0;

        loop {
            let event = match eventloop.poll().await {
                Ok(event) => event,
                Err(ConnectionError::MqttState(StateError::Deserialization(
                    mqttbytes::Error::PayloadSizeLimitExceeded(size),
                ))) if oversized_in_a_row < MAX_OVERSIZE_RECOVERIES => {
                    oversized_in_a_row += 1;
                    warn!(
                        broker = %addr,
                        size,
                        limit = self.max_packet_size,
                        "oversized publish discarded, resubscribing"
                    );
                    continue;
                }
                Err(ConnectionError::ConnectionRefused(code)) => {
                    return Err(FeedError::Refused { addr, code });
                }
                Err(source) => return Err(FeedError::Connection { addr, source }),
            };

            match event {
                Event::Incoming(Packet::ConnAck(_)) => {
                    info!(broker = %addr, "connected to mqtt broker");
                    // queued request; the event loop sends it on the next poll
                    client
                        .try_subscribe(self.topic.as_str(), QoS::AtMostOnce)
                        .map_err(|source| FeedError::Subscribe {
                            topic: self.topic.clone(),
                            source,
                        })?;
                }
                Event::Incoming(Packet::SubAck(_)) => {
                    info!(topic = %self.topic, "subscribed");
                }
                Event::Incoming(Packet::Publish(publish)) => {
                    oversized_in_a_row = 0;
                    debug!(topic = %publish.topic, bytes = publish.payload.len(), "publish received");
                    sink.on_message(&publish.topic, &publish.payload).await;
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl SensorSink for Recorder {
        async fn on_message(&self, topic: &str, payload: &[u8]) {
            self.seen.lock().unwrap().push((topic.to_string(), payload.to_vec()));
        }
    }

    /// forwards every message to the test body as it arrives
    struct Forward(mpsc::UnboundedSender<(String, Vec<u8>)>);

    #[async_trait]
    impl SensorSink for Forward {
        async fn on_message(&self, topic: &str, payload: &[u8]) {
            let _ = self.0.send((topic.to_string(), payload.to_vec()));
        }
    }

    // minimal mqtt 3.1.1 broker side, just enough for one subscriber

    async fn read_packet(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        let header = stream.read_u8().await.unwrap();
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await.unwrap();
            len |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await.unwrap();
        (header >> 4, body)
    }

    fn publish_frame(topic: &str, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        body.extend_from_slice(topic.as_bytes());
        body.extend_from_slice(payload);

        let mut frame = vec![0x30];
        let mut len = body.len();
        loop {
            let mut byte = (len % 128) as u8;
            len /= 128;
            if len > 0 {
                byte |= 0x80;
            }
            frame.push(byte);
            if len == 0 {
                break;
            }
        }
        frame.extend_from_slice(&body);
        frame
    }

    /// Accept one client, ack its connect and subscribe, then publish.
    ///
    /// All publishes go out in a single write. The stream is returned so the
    /// session stays open.
    async fn serve_session(listener: &TcpListener, publishes: &[(&str, Vec<u8>)]) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();

        let (kind, _) = read_packet(&mut stream).await;
        assert_eq!(kind, 1, "expected CONNECT");
        stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

        let (kind, body) = read_packet(&mut stream).await;
        assert_eq!(kind, 8, "expected SUBSCRIBE");
        stream.write_all(&[0x90, 0x03, body[0], body[1], 0x00]).await.unwrap();

        let mut frames = Vec::new();
        for (topic, payload) in publishes {
            frames.extend(publish_frame(topic, payload));
        }
        stream.write_all(&frames).await.unwrap();
        stream
    }

    async fn local_broker() -> (TcpListener, BrokerConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: listener.local_addr().unwrap().port(),
            ..BrokerConfig::default()
        };
        (listener, config)
    }

    fn spawn_feed(
        config: &BrokerConfig,
    ) -> (tokio::task::JoinHandle<Result<(), FeedError>>, mpsc::UnboundedReceiver<(String, Vec<u8>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let feed = SensorFeed::new(config);
        let sink = Arc::new(Forward(tx));
        let task = tokio::spawn(async move { feed.run(sink.as_ref()).await });
        (task, rx)
    }

    async fn next_message(rx: &mut mpsc::UnboundedReceiver<(String, Vec<u8>)>) -> (String, Vec<u8>) {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("message not delivered in time")
            .expect("feed ended")
    }

    #[test]
    fn options_follow_broker_config() {
        let config = BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: 1884,
            client_id: Some("vase-test".to_string()),
            keepalive_seconds: 30,
            max_packet_size: 64 * 1024,
            ..BrokerConfig::default()
        };
        let feed = SensorFeed::new(&config);

        assert_eq!(feed.options.broker_address(), ("127.0.0.1".to_string(), 1884));
        assert_eq!(feed.options.client_id(), "vase-test");
        assert_eq!(feed.options.keep_alive(), Duration::from_secs(30));
        assert_eq!(feed.options.max_packet_size(), 64 * 1024);
        assert_eq!(feed.topic(), "murad/vase/#");
        assert_eq!(feed.addr(), "127.0.0.1:1884");
    }

    #[tokio::test]
    async fn unreachable_broker_ends_feed_without_retry() {
        // grab a free port and release it so nothing is listening there
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = BrokerConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..BrokerConfig::default()
        };
        let sink = Recorder::default();

        let result = tokio::time::timeout(Duration::from_secs(10), SensorFeed::new(&config).run(&sink))
            .await
            .expect("feed should fail fast, not retry");

        let err = result.unwrap_err();
        assert!(matches!(err, FeedError::Connection { .. }), "unexpected error: {err}");
        assert!(err.to_string().contains(&format!("127.0.0.1:{port}")));
        assert!(sink.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn large_tap_payload_is_delivered_with_its_neighbours() {
        let (listener, config) = local_broker().await;
        let (feed, mut rx) = spawn_feed(&config);

        let big_tap = vec![b'x'; 20 * 1024];
        let _session = serve_session(
            &listener,
            &[
                ("murad/vase/moisture", b"2000".to_vec()),
                ("murad/vase/events", big_tap.clone()),
                ("murad/vase/moisture", b"1000".to_vec()),
            ],
        )
        .await;

        assert_eq!(next_message(&mut rx).await, ("murad/vase/moisture".to_string(), b"2000".to_vec()));
        assert_eq!(next_message(&mut rx).await, ("murad/vase/events".to_string(), big_tap));
        assert_eq!(next_message(&mut rx).await, ("murad/vase/moisture".to_string(), b"1000".to_vec()));
        assert!(!feed.is_finished());
        feed.abort();
    }

    #[tokio::test]
    async fn publish_over_limit_is_discarded_and_feed_continues() {
        let (listener, mut config) = local_broker().await;
        config.max_packet_size = 1024;
        let (feed, mut rx) = spawn_feed(&config);

        let _first = serve_session(&listener, &[("murad/vase/events", vec![b'x'; 4096])]).await;
        // the client drops the connection on the oversized frame and comes back
        let _second = serve_session(&listener, &[("murad/vase/moisture", b"1000".to_vec())]).await;

        assert_eq!(next_message(&mut rx).await, ("murad/vase/moisture".to_string(), b"1000".to_vec()));
        assert!(!feed.is_finished());
        feed.abort();
    }

    #[tokio::test]
    async fn repeated_oversized_publishes_end_the_feed() {
        let (listener, mut config) = local_broker().await;
        config.max_packet_size = 1024;
        let (feed, mut rx) = spawn_feed(&config);

        let oversized = [("murad/vase/moisture", vec![b'9'; 4096])];
        let mut sessions = Vec::new();
        for _ in 0..=MAX_OVERSIZE_RECOVERIES {
            sessions.push(serve_session(&listener, &oversized).await);
        }

        let result = tokio::time::timeout(Duration::from_secs(10), feed)
            .await
            .expect("feed should give up")
            .unwrap();
        let err = result.unwrap_err();
        assert!(matches!(err, FeedError::Connection { .. }), "unexpected error: {err}");
        assert!(rx.try_recv().is_err());
    }
}
