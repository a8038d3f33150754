//! Chat session over WebSocket

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

use super::irc::{self, IrcMessage};
use super::{ChatError, OutgoingMessage, RoomListener, RoomMessage};
use crate::config::ChatConfig;
use crate::shutdown::Shutdown;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// NOTICE texts the server sends when it refuses our credentials
const LOGIN_FAILURES: &[&str] = &[
    "Login authentication failed",
    "Login unsuccessful",
    "Improperly formatted auth",
];

/// Owns the chat session and services its event stream
pub struct ChatClient {
    config: ChatConfig,
    outgoing: mpsc::UnboundedReceiver<OutgoingMessage>,
    listener: Arc<dyn RoomListener>,
}

impl ChatClient {
    /// `outgoing` is the receiving half of [`ChatSender::channel`](super::ChatSender::channel)
    pub fn new(
        config: ChatConfig,
        outgoing: mpsc::UnboundedReceiver<OutgoingMessage>,
        listener: Arc<dyn RoomListener>,
    ) -> Self {
        Self {
            config,
            outgoing,
            listener,
        }
    }

    /// Service the chat session until shutdown.
    ///
    /// Dropped sessions are reconnected with exponential backoff. Only a
    /// refused login ends the loop with an error.
    pub async fn run(mut self, mut shutdown: Shutdown) -> Result<(), ChatError> {
        let mut retry_interval = self.config.reconnect_interval;
        let max_retry = self.config.max_reconnect_interval;

        loop {
            debug!("Chat: Connecting to {}", self.config.url);

            let result = tokio::select! {
                result = self.connect() => result,
                _ = shutdown.recv() => return Ok(()),
            };

            match result {
                Ok(ws) => {
                    retry_interval = self.config.reconnect_interval;
                    match self.run_session(ws, &mut shutdown).await {
                        Ok(()) => {
                            info!("Chat: Disconnected gracefully");
                            return Ok(());
                        }
                        Err(e) if e.is_fatal() => {
                            error!("Chat: {}", e);
                            return Err(e);
                        }
                        Err(e) => warn!("Chat: {}", e),
                    }
                }
                Err(e) => error!("Chat: Connection failed: {}", e),
            }

            debug!("Chat: Reconnecting in {:?}", retry_interval);
            if !self.backoff(retry_interval, &mut shutdown).await {
                return Ok(());
            }
            retry_interval = std::cmp::min(retry_interval * 2, max_retry);
        }
    }

    /// Open the WebSocket and send the login sequence
    async fn connect(&self) -> Result<WsStream, ChatError> {
        let connect = connect_async(self.config.url.as_str());
        let (mut ws, _) = timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| ChatError::Timeout)??;

        for line in self.login_lines() {
            ws.send(Message::Text(line)).await?;
        }
        debug!(
            "Chat: Login sent for {}, joining {} rooms",
            self.config.nick,
            self.config.rooms.len()
        );
        Ok(ws)
    }

    fn login_lines(&self) -> Vec<String> {
        let token = self.config.token.expose();
        let token = token.strip_prefix("oauth:").unwrap_or(token);

        let mut lines = vec![
            format!("PASS oauth:{}", token),
            format!("NICK {}", self.config.nick),
            "CAP REQ :twitch.tv/tags twitch.tv/commands".to_string(),
        ];
        lines.extend(self.config.rooms.iter().map(|room| format!("JOIN #{}", room)));
        lines
    }

    /// Drop outbound chat while waiting to reconnect.
    /// Returns `false` if shutdown arrived first.
    async fn backoff(&mut self, delay: Duration, shutdown: &mut Shutdown) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = shutdown.recv() => return false,
                Some(message) = self.outgoing.recv() => {
                    warn!("Chat: Not connected, dropping message for #{}", message.room);
                }
            }
        }
    }

    async fn run_session(
        &mut self,
        ws: WsStream,
        shutdown: &mut Shutdown,
    ) -> Result<(), ChatError> {
        let (mut sink, mut stream) = ws.split();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }

                Some(outgoing) = self.outgoing.recv() => {
                    let line = irc::privmsg(&outgoing.room, &outgoing.text);
                    trace!("Chat: > {}", line);
                    sink.send(Message::Text(line)).await?;
                }

                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        for line in text.split('\n').map(|l| l.trim_end_matches('\r')) {
                            if !line.is_empty() {
                                self.handle_line(line, &mut sink).await?;
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return Err(ChatError::ConnectionLost(format!(
                            "closed by server: {:?}",
                            frame
                        )));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        return Err(ChatError::ConnectionLost("stream ended".to_string()));
                    }
                },
            }
        }
    }

    async fn handle_line(&self, line: &str, sink: &mut WsSink) -> Result<(), ChatError> {
        trace!("Chat: < {}", line);
        let Some(msg) = IrcMessage::parse(line) else {
            debug!("Chat: Unparseable line: {}", line);
            return Ok(());
        };

        match msg.command.as_str() {
            "PING" => {
                let token = msg.trailing().unwrap_or("tmi.twitch.tv");
                sink.send(Message::Text(format!("PONG :{}", token))).await?;
            }
            "001" => info!("Chat: Logged in as {}", self.config.nick),
            "JOIN" if msg.nick() == Some(self.config.nick.as_str()) => {
                info!("Chat: Joined {}", msg.params.first().map_or("?", String::as_str));
            }
            "NOTICE" => {
                let text = msg.trailing().unwrap_or_default();
                if LOGIN_FAILURES.iter().any(|failure| text.contains(failure)) {
                    return Err(ChatError::LoginFailed(text.to_string()));
                }
                info!("Chat: NOTICE {}", text);
            }
            "RECONNECT" => {
                return Err(ChatError::ConnectionLost(
                    "server requested reconnect".to_string(),
                ));
            }
            "PRIVMSG" => match RoomMessage::from_privmsg(&msg) {
                Some(message) => self.listener.on_room_message(message).await,
                None => debug!("Chat: Ignoring malformed PRIVMSG"),
            },
            _ => {}
        }
        Ok(())
    }
}
