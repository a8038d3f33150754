//! A single MQTT session over TCP

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::ConnectionError;
use crate::codec::{read_string, read_variable_int, Decoder, Encoder};
use crate::config::BrokerConfig;
use crate::protocol::{
    Connect, DecodeError, Packet, PubAck, Publish, QoS, Subscribe, Subscription, Unsubscribe,
};
use crate::topic::Topic;

const READ_CHUNK: usize = 4096;

const PUBLISH_TYPE: u8 = 3;

/// An established session: CONNACK accepted, socket owned
pub(crate) struct Session {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    encoder: Encoder,
    decoder: Decoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    next_packet_id: u16,
    /// Bytes of an oversized packet still to be thrown away
    discard: usize,
}

impl Session {
    /// TCP connect plus CONNECT/CONNACK, both bounded by `connect_timeout`
    pub(crate) async fn open(config: &BrokerConfig) -> Result<Self, ConnectionError> {
        let stream = timeout(config.connect_timeout, TcpStream::connect(config.address()))
            .await
            .map_err(|_| ConnectionError::Timeout)??;
        stream.set_nodelay(true)?;

        debug!("Broker: TCP connected to {}", config.address());

        let (reader, writer) = stream.into_split();
        let mut session = Self {
            reader,
            writer,
            encoder: Encoder::new(),
            decoder: Decoder::new().with_max_packet_size(config.max_packet_size),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::with_capacity(READ_CHUNK),
            next_packet_id: 1,
            discard: 0,
        };

        // A password is only legal together with a username
        let password = config
            .username
            .as_ref()
            .and(config.password.as_ref())
            .map(|p| Bytes::copy_from_slice(p.expose().as_bytes()));

        let connect = Packet::Connect(Box::new(Connect {
            client_id: config.client_id.clone(),
            clean_session: config.clean_session,
            keep_alive: config.keepalive,
            username: config.username.clone(),
            password,
        }));
        session.send(&connect).await?;

        let packet = timeout(config.connect_timeout, session.read_packet())
            .await
            .map_err(|_| ConnectionError::Timeout)??;

        match packet {
            Packet::ConnAck(connack) if connack.return_code.is_accepted() => {
                debug!(
                    "Broker: CONNACK accepted (session_present={})",
                    connack.session_present
                );
                Ok(session)
            }
            Packet::ConnAck(connack) => Err(ConnectionError::Rejected(connack.return_code)),
            other => Err(ConnectionError::Protocol(format!(
                "expected CONNACK, got packet type {}",
                other.packet_type()
            ))),
        }
    }

    fn next_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
        id
    }

    pub(crate) async fn send(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        self.encoder.encode(packet, &mut self.write_buf)?;
        self.writer.write_all(&self.write_buf).await?;
        Ok(())
    }

    /// Read the next whole packet. Cancel safe: partial reads stay buffered.
    ///
    /// Packets above `max_packet_size` are skipped without ending the session.
    pub(crate) async fn read_packet(&mut self) -> Result<Packet, ConnectionError> {
        loop {
            if self.discard > 0 {
                let n = self.discard.min(self.read_buf.len());
                self.read_buf.advance(n);
                self.discard -= n;
            }

            if self.discard == 0 {
                match self.decoder.decode(&self.read_buf) {
                    Ok(Some((packet, consumed))) => {
                        self.read_buf.advance(consumed);
                        return Ok(packet);
                    }
                    Ok(None) => {}
                    Err(DecodeError::PacketTooLarge) => {
                        self.skip_oversized()?;
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            self.read_buf.reserve(READ_CHUNK);
            let n = self.reader.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::ConnectionLost(
                    "Connection closed by broker".to_string(),
                ));
            }
        }
    }

    /// Mark the packet at the head of the buffer for discarding
    fn skip_oversized(&mut self) -> Result<(), ConnectionError> {
        let (remaining, len_bytes) = read_variable_int(&self.read_buf[1..])?;
        let body = 1 + len_bytes;

        // The topic is the first field of a PUBLISH; it may not be buffered yet
        let topic = if self.read_buf[0] >> 4 == PUBLISH_TYPE {
            read_string(&self.read_buf[body..])
                .ok()
                .map(|(topic, _)| topic.to_string())
        } else {
            None
        };

        warn!(
            "Broker: dropping {} byte packet (type {}) on '{}', limit is {}",
            remaining,
            self.read_buf[0] >> 4,
            topic.as_deref().unwrap_or("?"),
            self.decoder.max_packet_size()
        );

        self.discard = body + remaining as usize;
        Ok(())
    }

    pub(crate) async fn publish(
        &mut self,
        topic: &Topic,
        payload: Bytes,
        qos: QoS,
    ) -> Result<(), ConnectionError> {
        let packet_id = match qos {
            QoS::AtMostOnce => None,
            _ => Some(self.next_packet_id()),
        };

        let publish = Packet::Publish(Publish {
            dup: false,
            qos,
            retain: false,
            topic: topic.as_str().into(),
            packet_id,
            payload,
        });
        self.send(&publish).await
    }

    /// One SUBSCRIBE carrying every topic; no-op for an empty list
    pub(crate) async fn subscribe(
        &mut self,
        topics: &[Topic],
        qos: QoS,
    ) -> Result<(), ConnectionError> {
        if topics.is_empty() {
            return Ok(());
        }

        let subscribe = Packet::Subscribe(Subscribe {
            packet_id: self.next_packet_id(),
            subscriptions: topics
                .iter()
                .map(|topic| Subscription {
                    filter: topic.to_string(),
                    qos,
                })
                .collect(),
        });
        self.send(&subscribe).await
    }

    pub(crate) async fn unsubscribe(&mut self, topics: &[Topic]) -> Result<(), ConnectionError> {
        if topics.is_empty() {
            return Ok(());
        }

        let unsubscribe = Packet::Unsubscribe(Unsubscribe {
            packet_id: self.next_packet_id(),
            filters: topics.iter().map(Topic::to_string).collect(),
        });
        self.send(&unsubscribe).await
    }

    pub(crate) async fn puback(&mut self, packet_id: u16) -> Result<(), ConnectionError> {
        self.send(&Packet::PubAck(PubAck { packet_id })).await
    }

    /// Send DISCONNECT and close the socket, ignoring errors
    pub(crate) async fn disconnect(mut self) {
        let _ = self.send(&Packet::Disconnect).await;
        let _ = self.writer.shutdown().await;
    }
}
