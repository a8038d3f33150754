//! Chat adapter tests

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use super::irc::{self, IrcMessage};
use super::*;
use crate::config::{ChatConfig, Secret};
use crate::shutdown::Shutdown;

const WAIT: Duration = Duration::from_secs(5);

fn privmsg(line: &str) -> RoomMessage {
    RoomMessage::from_privmsg(&IrcMessage::parse(line).unwrap()).unwrap()
}

#[test]
fn test_room_message_from_tags() {
    let msg = privmsg(
        "@badges=subscriber/12;display-name=SomeViewer;mod=1;tmi-sent-ts=1700000000123 \
         :someviewer!someviewer@someviewer.tmi.twitch.tv PRIVMSG #B11y :!ping",
    );
    assert_eq!(
        msg,
        RoomMessage {
            timestamp: 1_700_000_000_123,
            author: "SomeViewer".to_string(),
            author_is_moderator: true,
            room: "b11y".to_string(),
            text: "!ping".to_string(),
        }
    );
}

#[test]
fn test_broadcaster_counts_as_moderator() {
    let msg = privmsg("@badges=broadcaster/1,subscriber/0;mod=0 :jkiv!jkiv@jkiv PRIVMSG #jkiv :hi");
    assert!(msg.author_is_moderator);

    let msg = privmsg("@badges=subscriber/0;mod=0 :viewer!viewer@viewer PRIVMSG #jkiv :hi");
    assert!(!msg.author_is_moderator);
}

#[test]
fn test_author_falls_back_to_nick() {
    let msg = privmsg("@display-name= :plainnick!plainnick@host PRIVMSG #room :hello");
    assert_eq!(msg.author, "plainnick");

    let msg = privmsg(":untagged!untagged@host PRIVMSG #room :hello");
    assert_eq!(msg.author, "untagged");
    assert!(!msg.author_is_moderator);
    assert!(msg.timestamp > 0);
}

#[test]
fn test_action_is_unwrapped() {
    let msg = privmsg(":a!a@a PRIVMSG #room :\u{1}ACTION waves\u{1}");
    assert_eq!(msg.text, "waves");
}

#[test]
fn test_non_privmsg_is_not_a_room_message() {
    let ping = IrcMessage::parse("PING :tmi.twitch.tv").unwrap();
    assert!(RoomMessage::from_privmsg(&ping).is_none());
}

#[tokio::test]
async fn test_chat_sender_normalizes_room() {
    let (sender, mut rx) = ChatSender::channel();
    sender.send_to_room("#JKiv", "hello");
    assert_eq!(
        rx.recv().await.unwrap(),
        OutgoingMessage {
            room: "jkiv".to_string(),
            text: "hello".to_string(),
        }
    );

    drop(rx);
    // Logged, not escalated
    sender.send_to_room("jkiv", "nobody listens");
}

// ============================================================================
// Live session against an in-process IRC-over-WebSocket server
// ============================================================================

struct Recorder {
    tx: mpsc::UnboundedSender<RoomMessage>,
}

#[async_trait]
impl RoomListener for Recorder {
    async fn on_room_message(&self, message: RoomMessage) {
        let _ = self.tx.send(message);
    }
}

struct Server {
    ws: WebSocketStream<TcpStream>,
}

impl Server {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        Self {
            ws: accept_async(stream).await.unwrap(),
        }
    }

    async fn line(&mut self) -> String {
        loop {
            match timeout(WAIT, self.ws.next()).await.unwrap() {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }

    async fn send(&mut self, line: &str) {
        self.ws.send(Message::Text(format!("{}\r\n", line))).await.unwrap();
    }

    /// Consume the login sequence, returning it
    async fn login(&mut self, rooms: usize) -> Vec<String> {
        let mut lines = Vec::new();
        for _ in 0..3 + rooms {
            lines.push(self.line().await);
        }
        lines
    }
}

fn chat_config(port: u16) -> ChatConfig {
    ChatConfig {
        url: format!("ws://127.0.0.1:{}", port),
        token: Secret::new("oauth:s3cret"),
        nick: "b11ybot".to_string(),
        rooms: vec!["jkiv".to_string(), "other".to_string()],
        reconnect_interval: Duration::from_millis(20),
        max_reconnect_interval: Duration::from_millis(100),
        ..Default::default()
    }
}

struct Session {
    sender: ChatSender,
    messages: mpsc::UnboundedReceiver<RoomMessage>,
    shutdown: broadcast::Sender<()>,
    task: tokio::task::JoinHandle<Result<(), ChatError>>,
}

fn start(config: ChatConfig) -> Session {
    let (sender, outgoing) = ChatSender::channel();
    let (tx, messages) = mpsc::unbounded_channel();
    let client = ChatClient::new(config, outgoing, Arc::new(Recorder { tx }));
    let (shutdown, rx) = broadcast::channel(1);
    let task = tokio::spawn(client.run(Shutdown::new(rx)));
    Session {
        sender,
        messages,
        shutdown,
        task,
    }
}

#[tokio::test]
async fn test_login_ping_and_messages() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut session = start(chat_config(port));

    let mut server = Server::accept(&listener).await;
    assert_eq!(
        server.login(2).await,
        vec![
            "PASS oauth:s3cret".to_string(),
            "NICK b11ybot".to_string(),
            "CAP REQ :twitch.tv/tags twitch.tv/commands".to_string(),
            "JOIN #jkiv".to_string(),
            "JOIN #other".to_string(),
        ]
    );

    server.send(":tmi.twitch.tv 001 b11ybot :Welcome, GLHF!").await;
    server.send("PING :tmi.twitch.tv").await;
    assert_eq!(server.line().await, "PONG :tmi.twitch.tv");

    // Two lines in one frame
    server
        .ws
        .send(Message::Text(
            "@display-name=A;mod=0 :a!a@a PRIVMSG #jkiv :first\r\n\
             @display-name=B;mod=1 :b!b@b PRIVMSG #other :second\r\n"
                .to_string(),
        ))
        .await
        .unwrap();

    let first = timeout(WAIT, session.messages.recv()).await.unwrap().unwrap();
    assert_eq!((first.author.as_str(), first.room.as_str(), first.text.as_str()), ("A", "jkiv", "first"));
    let second = timeout(WAIT, session.messages.recv()).await.unwrap().unwrap();
    assert!(second.author_is_moderator);
    assert_eq!(second.text, "second");

    session.sender.send_to_room("jkiv", "pong @A!");
    assert_eq!(server.line().await, "PRIVMSG #jkiv :pong @A!");

    let _ = session.shutdown.send(());
    let result = timeout(WAIT, session.task).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_login_failure_is_fatal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let session = start(chat_config(port));

    let mut server = Server::accept(&listener).await;
    server.login(2).await;
    server.send(":tmi.twitch.tv NOTICE * :Login authentication failed").await;

    let result = timeout(WAIT, session.task).await.unwrap().unwrap();
    assert!(matches!(result, Err(ChatError::LoginFailed(_))));
}

#[tokio::test]
async fn test_reconnect_after_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let session = start(chat_config(port));

    let mut first = Server::accept(&listener).await;
    first.login(2).await;
    drop(first);

    // Same login sequence on the new session
    let mut second = Server::accept(&listener).await;
    let lines = second.login(2).await;
    assert_eq!(lines[0], "PASS oauth:s3cret");
    assert_eq!(lines[4], "JOIN #other");

    second.send(":tmi.twitch.tv RECONNECT").await;
    let mut third = Server::accept(&listener).await;
    assert_eq!(third.login(2).await.len(), 5);

    let _ = session.shutdown.send(());
    let result = timeout(WAIT, session.task).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_long_reply_is_truncated() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let session = start(chat_config(port));

    let mut server = Server::accept(&listener).await;
    server.login(2).await;

    session.sender.send_to_room("jkiv", "x".repeat(2000));
    let line = server.line().await;
    assert!(line.starts_with("PRIVMSG #jkiv :xxx"));
    assert_eq!(line.len(), irc::MAX_LINE_LEN);

    let _ = session.shutdown.send(());
}

#[tokio::test]
async fn test_stalled_handshake_uses_configured_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut config = chat_config(port);
    config.connect_timeout = Duration::from_millis(100);
    let session = start(config);

    // Accept the TCP connection but never answer the WebSocket upgrade
    let (_stalled, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();

    let mut server = Server::accept(&listener).await;
    assert_eq!(server.login(2).await.len(), 5);

    let _ = session.shutdown.send(());
    let result = timeout(WAIT, session.task).await.unwrap().unwrap();
    assert!(result.is_ok());
}
