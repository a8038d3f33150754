//! Broker connection tests against a scripted in-process broker

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;

use super::*;
use crate::codec::{Decoder, Encoder};
use crate::protocol::{ConnAck, ConnectReturnCode, Packet, PubAck, Publish, QoS, SubAck, SubAckCode};
use crate::shutdown::Shutdown;

const WAIT: Duration = Duration::from_secs(5);

/// Broker side of one accepted connection
struct Peer {
    stream: TcpStream,
    buf: BytesMut,
    decoder: Decoder,
}

impl Peer {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        Self {
            stream,
            buf: BytesMut::new(),
            decoder: Decoder::new(),
        }
    }

    /// Accept, expect CONNECT, answer with `code`
    async fn handshake(listener: &TcpListener, code: ConnectReturnCode) -> Self {
        let mut peer = Self::accept(listener).await;
        match peer.read().await {
            Packet::Connect(_) => {}
            other => panic!("expected CONNECT, got {:?}", other),
        }
        peer.write(Packet::ConnAck(ConnAck {
            session_present: false,
            return_code: code,
        }))
        .await;
        peer
    }

    async fn read(&mut self) -> Packet {
        loop {
            if let Some((packet, n)) = self.decoder.decode(&self.buf).unwrap() {
                self.buf.advance(n);
                return packet;
            }
            let n = timeout(WAIT, self.stream.read_buf(&mut self.buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0, "client closed the connection");
        }
    }

    async fn write(&mut self, packet: Packet) {
        let mut buf = BytesMut::new();
        Encoder::new().encode(&packet, &mut buf).unwrap();
        self.stream.write_all(&buf).await.unwrap();
    }

    /// Read SUBSCRIBE, acknowledge it, return its filters
    async fn expect_subscribe(&mut self) -> Vec<String> {
        match self.read().await {
            Packet::Subscribe(subscribe) => {
                self.write(Packet::SubAck(SubAck {
                    packet_id: subscribe.packet_id,
                    return_codes: subscribe
                        .subscriptions
                        .iter()
                        .map(|s| SubAckCode::Granted(s.qos))
                        .collect(),
                }))
                .await;
                subscribe.subscriptions.into_iter().map(|s| s.filter).collect()
            }
            other => panic!("expected SUBSCRIBE, got {:?}", other),
        }
    }
}

fn test_config(port: u16) -> BrokerConfig {
    BrokerConfig {
        host: "127.0.0.1".to_string(),
        port,
        client_id: "chatmq-test".to_string(),
        keepalive: 0,
        connect_timeout: Duration::from_secs(1),
        reconnect_interval: Duration::from_millis(20),
        max_reconnect_interval: Duration::from_millis(100),
        ..Default::default()
    }
}

struct Running {
    connection: BrokerConnection,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Running {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        for task in self.tasks {
            timeout(WAIT, task).await.unwrap().unwrap();
        }
    }
}

fn start(config: BrokerConfig, topics: &[&str]) -> Running {
    let (connection, pump, drain) = BrokerConnection::new(config);
    for topic in topics {
        connection.subscribe(Topic::parse(topic));
    }
    let (shutdown, rx) = broadcast::channel(1);
    let tasks = vec![
        tokio::spawn(pump.run(Shutdown::new(rx.resubscribe()))),
        tokio::spawn(drain.run(Shutdown::new(rx))),
    ];
    Running {
        connection,
        shutdown,
        tasks,
    }
}

async fn wait_for_status(connection: &BrokerConnection, status: ConnectionStatus) {
    timeout(WAIT, async {
        while connection.status() != status {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[test]
fn test_subscribe_is_idempotent() {
    let (connection, _pump, _drain) = BrokerConnection::new(BrokerConfig::default());
    assert!(connection.subscribe(Topic::parse("b11y/dev/echo")));
    assert!(!connection.subscribe(Topic::parse("/b11y/dev/echo/")));
    assert!(connection.subscribe(Topic::parse("a")));
    assert_eq!(
        connection.subscriptions(),
        vec![Topic::parse("a"), Topic::parse("b11y/dev/echo")]
    );

    assert!(!connection.unsubscribe(&Topic::parse("absent")));
    assert!(connection.unsubscribe(&Topic::parse("a")));
    assert_eq!(connection.subscriptions(), vec![Topic::parse("b11y/dev/echo")]);
}

#[test]
fn test_subscribe_rejects_invalid_filter() {
    let (connection, _pump, _drain) = BrokerConnection::new(BrokerConfig::default());
    assert!(!connection.subscribe(Topic::empty()));
    assert!(!connection.subscribe(Topic::parse("a/#/b")));
    assert!(connection.subscriptions().is_empty());
}

#[tokio::test]
async fn test_publish_without_pump_is_not_connected() {
    let (connection, pump, _drain) = BrokerConnection::new(BrokerConfig::default());
    drop(pump);
    let result = connection.publish(Message::new("t", "x")).await;
    assert!(matches!(result, Err(ConnectionError::NotConnected)));
}

#[tokio::test]
async fn test_connect_subscribe_and_receive() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let running = start(test_config(port), &["b11y/echo"]);

    let mut peer = Peer::handshake(&listener, ConnectReturnCode::Accepted).await;
    assert_eq!(peer.expect_subscribe().await, vec!["b11y/echo".to_string()]);
    wait_for_status(&running.connection, ConnectionStatus::Connected).await;

    // Subscribing on a live session issues SUBSCRIBE right away
    assert!(running.connection.subscribe(Topic::parse("b11y/other")));
    assert_eq!(peer.expect_subscribe().await, vec!["b11y/other".to_string()]);

    for payload in ["one", "two", "three"] {
        peer.write(Packet::Publish(Publish {
            topic: Arc::from("b11y/echo"),
            payload: Bytes::from(payload),
            ..Default::default()
        }))
        .await;
    }
    for payload in ["one", "two", "three"] {
        let message = timeout(WAIT, running.connection.receive()).await.unwrap().unwrap();
        assert_eq!(message, Message::new("b11y/echo", payload));
    }

    running.stop().await;
    assert_eq!(peer.read().await, Packet::Disconnect);
}

#[tokio::test]
async fn test_outbound_drain_publishes_in_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let running = start(test_config(port), &[]);

    let mut peer = Peer::handshake(&listener, ConnectReturnCode::Accepted).await;
    wait_for_status(&running.connection, ConnectionStatus::Connected).await;

    for i in 0..5 {
        running.connection.send(Message::new("out", format!("m{}", i)));
    }
    for i in 0..5 {
        match peer.read().await {
            Packet::Publish(publish) => {
                assert_eq!(&*publish.topic, "out");
                assert_eq!(publish.payload, Bytes::from(format!("m{}", i)));
                assert_eq!(publish.qos, QoS::AtMostOnce);
            }
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    running.stop().await;
}

#[tokio::test]
async fn test_resubscribe_after_reconnect_before_delivery() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let running = start(test_config(port), &["a", "b/c"]);

    let mut first = Peer::handshake(&listener, ConnectReturnCode::Accepted).await;
    assert_eq!(
        first.expect_subscribe().await,
        vec!["a".to_string(), "b/c".to_string()]
    );
    wait_for_status(&running.connection, ConnectionStatus::Connected).await;
    drop(first);

    // The very first thing after CONNACK on the new session is the full SUBSCRIBE
    let mut second = Peer::handshake(&listener, ConnectReturnCode::Accepted).await;
    assert_eq!(
        second.expect_subscribe().await,
        vec!["a".to_string(), "b/c".to_string()]
    );
    second
        .write(Packet::Publish(Publish {
            topic: Arc::from("b/c"),
            payload: Bytes::from_static(b"after"),
            ..Default::default()
        }))
        .await;

    let message = timeout(WAIT, running.connection.receive()).await.unwrap().unwrap();
    assert_eq!(message, Message::new("b/c", "after"));

    running.stop().await;
}

#[tokio::test]
async fn test_rejected_connack_is_retried() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let running = start(test_config(port), &["t"]);

    let refused = Peer::handshake(&listener, ConnectReturnCode::NotAuthorized).await;
    assert_ne!(running.connection.status(), ConnectionStatus::Connected);
    drop(refused);

    let mut accepted = Peer::handshake(&listener, ConnectReturnCode::Accepted).await;
    assert_eq!(accepted.expect_subscribe().await, vec!["t".to_string()]);
    wait_for_status(&running.connection, ConnectionStatus::Connected).await;

    running.stop().await;

    // Nothing reconnects after shutdown
    let reconnect = timeout(Duration::from_millis(200), listener.accept()).await;
    assert!(reconnect.is_err(), "pump reconnected after shutdown");
}

#[tokio::test]
async fn test_qos1_delivery_is_acknowledged() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let running = start(test_config(port), &["q"]);

    let mut peer = Peer::handshake(&listener, ConnectReturnCode::Accepted).await;
    peer.expect_subscribe().await;

    peer.write(Packet::Publish(Publish {
        qos: QoS::AtLeastOnce,
        topic: Arc::from("q"),
        packet_id: Some(77),
        payload: Bytes::from_static(b"x"),
        ..Default::default()
    }))
    .await;

    assert_eq!(peer.read().await, Packet::PubAck(PubAck { packet_id: 77 }));
    let message = timeout(WAIT, running.connection.receive()).await.unwrap().unwrap();
    assert_eq!(message.payload, Bytes::from_static(b"x"));

    running.stop().await;
}

#[tokio::test]
async fn test_publish_during_backoff_is_dropped() {
    // Nothing listens on this port
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut config = test_config(port);
    config.reconnect_interval = Duration::from_secs(5);
    config.max_reconnect_interval = Duration::from_secs(5);
    let running = start(config, &[]);

    wait_for_status(&running.connection, ConnectionStatus::Backoff).await;
    let result = running.connection.publish(Message::new("t", "x")).await;
    assert!(matches!(result, Err(ConnectionError::NotConnected)));

    let connection = running.connection.clone();
    running.stop().await;
    assert_eq!(connection.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_oversized_publish_is_skipped_without_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut config = test_config(port);
    config.max_packet_size = 1024;
    let running = start(config, &["big", "small"]);

    let mut peer = Peer::handshake(&listener, ConnectReturnCode::Accepted).await;
    peer.expect_subscribe().await;
    wait_for_status(&running.connection, ConnectionStatus::Connected).await;

    peer.write(Packet::Publish(Publish {
        topic: Arc::from("big"),
        payload: Bytes::from(vec![b'x'; 64 * 1024]),
        ..Default::default()
    }))
    .await;
    peer.write(Packet::Publish(Publish {
        topic: Arc::from("small"),
        payload: Bytes::from_static(b"fits"),
        ..Default::default()
    }))
    .await;

    let message = timeout(WAIT, running.connection.receive()).await.unwrap().unwrap();
    assert_eq!(message, Message::new("small", "fits"));
    assert_eq!(running.connection.status(), ConnectionStatus::Connected);

    let reconnect = timeout(Duration::from_millis(200), listener.accept()).await;
    assert!(reconnect.is_err(), "oversized packet forced a reconnect");

    running.stop().await;
    assert_eq!(peer.read().await, Packet::Disconnect);
}
