//! Network pump and outbound drain
//!
//! The pump is the only task that touches the broker socket. It connects,
//! replays the subscription set, then multiplexes keepalive, inbound packets
//! and requests from [`BrokerConnection`](super::BrokerConnection) until the
//! session drops, at which point it backs off and reconnects.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::session::Session;
use super::{BrokerCommand, BrokerConnection, ConnectionError, ConnectionStatus, Shared};
use crate::config::BrokerConfig;
use crate::protocol::{Packet, QoS, SubAckCode};
use crate::queue::{Message, QueueReceiver, QueueSender};
use crate::shutdown::Shutdown;
use crate::topic::Topic;

/// Drives the broker session: connect, keepalive, inbound delivery, reconnect
pub struct BrokerPump {
    config: BrokerConfig,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<BrokerCommand>,
    inbound: QueueSender,
}

impl BrokerPump {
    pub(super) fn new(
        config: BrokerConfig,
        shared: Arc<Shared>,
        commands: mpsc::UnboundedReceiver<BrokerCommand>,
        inbound: QueueSender,
    ) -> Self {
        Self {
            config,
            shared,
            commands,
            inbound,
        }
    }

    /// Establish a session and re-subscribe the whole subscription set.
    ///
    /// The SUBSCRIBE is written before anything is read from the socket, so
    /// no inbound message can overtake it.
    pub(crate) async fn connect(&self) -> Result<Session, ConnectionError> {
        let mut session = Session::open(&self.config).await?;

        // Holding the set while flipping the status means a concurrent
        // subscribe either lands in this snapshot or sends its own SUBSCRIBE
        let topics: Vec<Topic> = {
            let subscriptions = self.shared.subscriptions.read();
            *self.shared.status.write() = ConnectionStatus::Connected;
            subscriptions.iter().cloned().collect()
        };
        session.subscribe(&topics, self.qos()).await?;
        if !topics.is_empty() {
            debug!("Broker: re-subscribed {} topics", topics.len());
        }

        Ok(session)
    }

    fn qos(&self) -> QoS {
        self.config.qos()
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.shared.status.write() = status;
    }

    /// Run the connection loop until shutdown
    pub async fn run(mut self, mut shutdown: Shutdown) {
        let mut retry_interval = self.config.reconnect_interval;
        let max_retry = self.config.max_reconnect_interval;

        loop {
            self.set_status(ConnectionStatus::Connecting);
            debug!("Broker: Connecting to {}", self.config.address());

            let result = tokio::select! {
                result = self.connect() => result,
                _ = shutdown.recv() => break,
            };

            match result {
                Ok(session) => {
                    info!("Broker: Connected to {}", self.config.address());
                    retry_interval = self.config.reconnect_interval;

                    match self.run_session(session, &mut shutdown).await {
                        Ok(()) => {
                            info!("Broker: Disconnected gracefully");
                            break;
                        }
                        Err(e) => warn!("Broker: {}", e),
                    }
                }
                Err(e) => error!("Broker: Connection failed: {}", e),
            }

            self.set_status(ConnectionStatus::Backoff);
            debug!("Broker: Reconnecting in {:?}", retry_interval);

            if !self.backoff(retry_interval, &mut shutdown).await {
                break;
            }
            retry_interval = std::cmp::min(retry_interval * 2, max_retry);
        }

        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Sleep before the next attempt, refusing publishes in the meantime.
    /// Returns `false` if shutdown arrived first.
    async fn backoff(&mut self, delay: Duration, shutdown: &mut Shutdown) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = shutdown.recv() => return false,
                Some(command) = self.commands.recv() => match command {
                    BrokerCommand::Publish { ack, .. } => {
                        let _ = ack.send(Err(ConnectionError::NotConnected));
                    }
                    // The subscription set is replayed on connect
                    BrokerCommand::Subscribe(_) | BrokerCommand::Unsubscribe(_) => {}
                },
            }
        }
    }

    async fn run_session(
        &mut self,
        mut session: Session,
        shutdown: &mut Shutdown,
    ) -> Result<(), ConnectionError> {
        let mut keepalive = self.config.keepalive_duration().map(|period| {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });
        let mut awaiting_pingresp = false;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    session.disconnect().await;
                    return Ok(());
                }

                Some(command) = self.commands.recv() => {
                    self.handle_command(&mut session, command).await?;
                }

                packet = session.read_packet() => {
                    self.handle_packet(&mut session, packet?, &mut awaiting_pingresp).await?;
                }

                _ = tick(&mut keepalive) => {
                    if awaiting_pingresp {
                        return Err(ConnectionError::ConnectionLost(
                            "No PINGRESP within keepalive".to_string(),
                        ));
                    }
                    session.send(&Packet::PingReq).await?;
                    awaiting_pingresp = true;
                }
            }
        }
    }

    async fn handle_command(
        &self,
        session: &mut Session,
        command: BrokerCommand,
    ) -> Result<(), ConnectionError> {
        match command {
            BrokerCommand::Publish { message, ack } => {
                match session
                    .publish(&message.topic, message.payload, self.qos())
                    .await
                {
                    Ok(()) => {
                        trace!("Broker: PUBLISH {}", message.topic);
                        let _ = ack.send(Ok(()));
                        Ok(())
                    }
                    Err(e) => {
                        let _ = ack.send(Err(ConnectionError::ConnectionLost(e.to_string())));
                        Err(e)
                    }
                }
            }
            BrokerCommand::Subscribe(topic) => {
                debug!("Broker: SUBSCRIBE {}", topic);
                session.subscribe(&[topic], self.qos()).await
            }
            BrokerCommand::Unsubscribe(topic) => {
                debug!("Broker: UNSUBSCRIBE {}", topic);
                session.unsubscribe(&[topic]).await
            }
        }
    }

    async fn handle_packet(
        &self,
        session: &mut Session,
        packet: Packet,
        awaiting_pingresp: &mut bool,
    ) -> Result<(), ConnectionError> {
        match packet {
            Packet::Publish(publish) => {
                let message = Message {
                    topic: Topic::parse(&publish.topic),
                    payload: publish.payload,
                };
                trace!("Broker: inbound {} ({} bytes)", message.topic, message.payload.len());
                if !self.inbound.push(message) {
                    debug!("Broker: inbound queue closed, dropping message");
                }

                if publish.qos == QoS::AtLeastOnce {
                    if let Some(packet_id) = publish.packet_id {
                        session.puback(packet_id).await?;
                    }
                }
                Ok(())
            }
            Packet::PingResp => {
                trace!("Broker: PINGRESP received");
                *awaiting_pingresp = false;
                Ok(())
            }
            Packet::SubAck(suback) => {
                let refused = suback
                    .return_codes
                    .iter()
                    .filter(|code| **code == SubAckCode::Failure)
                    .count();
                if refused > 0 {
                    warn!(
                        "Broker: {} of {} subscriptions refused (packet {})",
                        refused,
                        suback.return_codes.len(),
                        suback.packet_id
                    );
                } else {
                    debug!("Broker: SUBACK received");
                }
                Ok(())
            }
            Packet::PubAck(_) | Packet::UnsubAck(_) => Ok(()),
            Packet::Disconnect => Err(ConnectionError::ConnectionLost(
                "Broker sent DISCONNECT".to_string(),
            )),
            other => Err(ConnectionError::Protocol(format!(
                "unexpected packet type {} from broker",
                other.packet_type()
            ))),
        }
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => pending::<()>().await,
    }
}

/// Drains the outbound queue into the pump, one publish at a time
pub struct OutboundDrain {
    outbound: QueueReceiver,
    connection: BrokerConnection,
}

impl OutboundDrain {
    pub(super) fn new(outbound: QueueReceiver, connection: BrokerConnection) -> Self {
        Self {
            outbound,
            connection,
        }
    }

    /// Publish queued messages in enqueue order until shutdown.
    ///
    /// A message that cannot be published because the session is down is
    /// logged and dropped.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        loop {
            let message = tokio::select! {
                message = self.outbound.pop() => match message {
                    Some(message) => message,
                    None => break,
                },
                _ = shutdown.recv() => break,
            };

            let topic = message.topic.clone();
            if let Err(e) = self.connection.publish(message).await {
                warn!("Broker: dropping outbound message for {}: {}", topic, e);
            }
        }
        debug!("Broker: outbound drain stopped");
    }
}
