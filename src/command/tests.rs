use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use test_case::test_case;
use tokio::sync::mpsc;

use super::*;
use crate::chat::OutgoingMessage;
use crate::queue::{self, Message, QueueReceiver};

struct Harness {
    dispatcher: CommandDispatcher,
    replies: mpsc::UnboundedReceiver<OutgoingMessage>,
    outbound: QueueReceiver,
}

fn harness(registry: CommandRegistry, prefix: Option<&str>, mods_only: bool) -> Harness {
    let (chat, replies) = ChatSender::channel();
    let (outbound_tx, outbound) = queue::unbounded();
    let context = CommandContext::new(chat, outbound_tx, prefix.map(Topic::parse), mods_only);
    Harness {
        dispatcher: CommandDispatcher::new('!', Arc::new(registry), context),
        replies,
        outbound,
    }
}

fn builtins() -> Harness {
    harness(CommandRegistry::with_builtins(), None, false)
}

fn message(author: &str, moderator: bool, text: &str) -> RoomMessage {
    RoomMessage {
        timestamp: 1_700_000_000_000,
        author: author.to_string(),
        author_is_moderator: moderator,
        room: "jkiv".to_string(),
        text: text.to_string(),
    }
}

/// Counts invocations and remembers the last one
#[derive(Default)]
struct Counter {
    calls: AtomicUsize,
    last: parking_lot::Mutex<Option<Invocation>>,
}

#[async_trait]
impl CommandHandler for Counter {
    async fn handle(&self, _ctx: &CommandContext, invocation: &Invocation) -> Result<(), CommandError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock() = Some(invocation.clone());
        Ok(())
    }
}

#[test_case("hello there" => None ; "plain chat")]
#[test_case("!ping" => Some(("ping".to_string(), String::new())) ; "bare keyword")]
#[test_case("!PING  extra  words " => Some(("ping".to_string(), "extra  words".to_string())) ; "keyword is lowercased")]
#[test_case("  !relay a b" => Some(("relay".to_string(), "a b".to_string())) ; "leading whitespace")]
fn test_parse_command(text: &str) -> Option<(String, String)> {
    parse_command(text, '!').unwrap()
}

#[test]
fn test_parse_missing_keyword() {
    assert_eq!(parse_command("!", '!'), Err(CommandError::MissingKeyword));
    assert_eq!(parse_command("! ping", '!'), Err(CommandError::MissingKeyword));
}

#[test]
fn test_registry_builtins() {
    let registry = CommandRegistry::with_builtins();
    assert_eq!(registry.names(), vec!["mqtt", "ping", "relay", "togglemod"]);
    assert_eq!(registry.is_moderator_only("togglemod"), Some(true));
    assert_eq!(registry.is_moderator_only("Ping"), Some(false));
    assert_eq!(registry.is_moderator_only("nope"), None);
}

#[tokio::test]
async fn test_registry_last_writer_wins() {
    let first = Arc::new(Counter::default());
    let second = Arc::new(Counter::default());

    let mut registry = CommandRegistry::new();
    assert!(!registry.register("echo", first.clone(), false));
    assert!(registry.register("ECHO", second.clone(), false));
    assert_eq!(registry.len(), 1);

    let h = harness(registry, None, false);
    let outcome = h.dispatcher.dispatch(&message("viewer", false, "!echo hi")).await;
    assert_eq!(outcome, CommandOutcome::Handled);
    assert_eq!(first.calls.load(Ordering::SeqCst), 0);
    assert_eq!(second.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_handler_sees_author_room_and_remainder() {
    let counter = Arc::new(Counter::default());
    let mut registry = CommandRegistry::new();
    registry.register("echo", counter.clone(), false);
    let h = harness(registry, None, false);

    h.dispatcher
        .dispatch(&message("Viewer", false, "!echo   some text "))
        .await;

    assert_eq!(
        counter.last.lock().clone(),
        Some(Invocation {
            author: "Viewer".to_string(),
            author_is_moderator: false,
            room: "jkiv".to_string(),
            command: "echo".to_string(),
            args: "some text".to_string(),
        })
    );
}

#[tokio::test]
async fn test_ping_replies_in_room() {
    let mut h = builtins();
    let outcome = h.dispatcher.dispatch(&message("SomeViewer", false, "!ping")).await;
    assert_eq!(outcome, CommandOutcome::Handled);
    assert_eq!(
        h.replies.try_recv().unwrap(),
        OutgoingMessage {
            room: "jkiv".to_string(),
            text: "pong @SomeViewer!".to_string(),
        }
    );
}

#[tokio::test]
async fn test_relay_enqueues_exactly_one_message() {
    let mut h = builtins();
    let outcome = h
        .dispatcher
        .dispatch(&message("viewer", false, "!relay foo bar baz"))
        .await;
    assert_eq!(outcome, CommandOutcome::Handled);

    assert_eq!(h.outbound.try_pop(), Some(Message::new("foo", "bar baz")));
    assert_eq!(h.outbound.try_pop(), None);
    assert!(h.replies.try_recv().is_err());
}

#[tokio::test]
async fn test_relay_applies_topic_prefix() {
    let mut h = harness(CommandRegistry::with_builtins(), Some("b11y/dev"), false);
    h.dispatcher
        .dispatch(&message("viewer", false, "!mqtt /lights/ on"))
        .await;
    assert_eq!(
        h.outbound.try_pop(),
        Some(Message::new("b11y/dev/lights", "on"))
    );
}

#[tokio::test]
async fn test_relay_rejected() {
    let mut h = builtins();
    for text in ["!relay foo", "!relay", "!relay foo/+ on", "!relay /// on"] {
        let outcome = h.dispatcher.dispatch(&message("viewer", false, text)).await;
        assert!(
            matches!(
                outcome,
                CommandOutcome::Rejected(CommandError::MalformedArguments(_))
            ),
            "{}: {:?}",
            text,
            outcome
        );
    }
    assert_eq!(h.outbound.try_pop(), None);
}

#[tokio::test]
async fn test_ordinary_chat_is_ignored() {
    let mut h = builtins();
    let outcome = h.dispatcher.dispatch(&message("viewer", false, "ping relay")).await;
    assert_eq!(outcome, CommandOutcome::Ignored);
    assert!(h.replies.try_recv().is_err());
}

#[tokio::test]
async fn test_unknown_and_missing_keyword_rejected() {
    let h = builtins();
    assert_eq!(
        h.dispatcher.dispatch(&message("viewer", false, "!dance")).await,
        CommandOutcome::Rejected(CommandError::UnknownCommand("dance".to_string()))
    );
    assert_eq!(
        h.dispatcher.dispatch(&message("viewer", false, "!")).await,
        CommandOutcome::Rejected(CommandError::MissingKeyword)
    );
}

#[tokio::test]
async fn test_mods_only_drops_non_moderators() {
    let mut h = harness(CommandRegistry::with_builtins(), None, true);

    for text in ["!ping", "!relay foo bar", "!togglemod", "!dance"] {
        let outcome = h.dispatcher.dispatch(&message("viewer", false, text)).await;
        assert_eq!(outcome, CommandOutcome::Dropped, "{}", text);
    }
    assert!(h.replies.try_recv().is_err());
    assert_eq!(h.outbound.try_pop(), None);
    assert!(h.dispatcher.context().mods_only());

    let outcome = h.dispatcher.dispatch(&message("modperson", true, "!ping")).await;
    assert_eq!(outcome, CommandOutcome::Handled);
}

#[tokio::test]
async fn test_togglemod_is_moderator_only() {
    let mut h = builtins();

    let outcome = h.dispatcher.dispatch(&message("viewer", false, "!togglemod")).await;
    assert_eq!(outcome, CommandOutcome::Dropped);
    assert!(!h.dispatcher.context().mods_only());
    assert!(h.replies.try_recv().is_err());

    let outcome = h.dispatcher.dispatch(&message("modperson", true, "!togglemod")).await;
    assert_eq!(outcome, CommandOutcome::Handled);
    assert!(h.dispatcher.context().mods_only());
    assert_eq!(
        h.replies.try_recv().unwrap().text,
        "Commands are now moderator only"
    );

    h.dispatcher.dispatch(&message("modperson", true, "!togglemod")).await;
    assert!(!h.dispatcher.context().mods_only());
    assert_eq!(
        h.replies.try_recv().unwrap().text,
        "Commands are now open to everyone"
    );
}

#[tokio::test]
async fn test_closed_outbound_queue_fails_relay() {
    let h = builtins();
    let Harness {
        dispatcher,
        outbound,
        ..
    } = h;
    drop(outbound);

    let outcome = dispatcher.dispatch(&message("viewer", false, "!relay foo bar")).await;
    assert!(matches!(
        outcome,
        CommandOutcome::Rejected(CommandError::Failed(_))
    ));
}

#[test]
fn test_toggle_returns_new_mode() {
    let (chat, _replies) = ChatSender::channel();
    let (outbound, _rx) = queue::unbounded();
    let ctx = CommandContext::new(chat, outbound, None, false);
    assert!(ctx.toggle_mods_only());
    assert!(!ctx.toggle_mods_only());
    ctx.set_mods_only(true);
    assert!(ctx.mods_only());
}
