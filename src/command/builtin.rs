//! Built-in chat commands

use async_trait::async_trait;
use tracing::info;

use super::{CommandContext, CommandError, CommandHandler, Invocation};
use crate::queue::Message;
use crate::topic::Topic;

/// `ping`: answer in the room
pub struct Ping;

#[async_trait]
impl CommandHandler for Ping {
    async fn handle(&self, ctx: &CommandContext, invocation: &Invocation) -> Result<(), CommandError> {
        ctx.reply(invocation, format!("pong @{}!", invocation.author));
        Ok(())
    }
}

/// `relay <topic> <payload>`: publish the payload on the broker
pub struct Relay;

#[async_trait]
impl CommandHandler for Relay {
    async fn handle(&self, ctx: &CommandContext, invocation: &Invocation) -> Result<(), CommandError> {
        let (topic, payload) = invocation
            .args
            .split_once(char::is_whitespace)
            .map(|(topic, payload)| (topic, payload.trim_start()))
            .filter(|(_, payload)| !payload.is_empty())
            .ok_or_else(|| {
                CommandError::MalformedArguments(format!(
                    "expected '{} <topic> <payload>'",
                    invocation.command
                ))
            })?;

        let topic = Topic::parse(topic);
        topic.validate_name().map_err(|reason| {
            CommandError::MalformedArguments(format!("invalid topic '{}': {}", topic, reason))
        })?;
        let topic = topic.with_prefix(ctx.topic_prefix());

        info!(
            "Command: {} relays {} bytes to {}",
            invocation.author,
            payload.len(),
            topic
        );
        if !ctx.outbound().push(Message::new(topic, payload.to_string())) {
            return Err(CommandError::Failed("outbound queue closed".to_string()));
        }
        Ok(())
    }
}

/// `togglemod`: flip moderator-only mode
pub struct ToggleMod;

#[async_trait]
impl CommandHandler for ToggleMod {
    async fn handle(&self, ctx: &CommandContext, invocation: &Invocation) -> Result<(), CommandError> {
        let enabled = ctx.toggle_mods_only();
        info!(
            "Command: {} turned moderator-only mode {}",
            invocation.author,
            if enabled { "on" } else { "off" }
        );
        let reply = if enabled {
            "Commands are now moderator only"
        } else {
            "Commands are now open to everyone"
        };
        ctx.reply(invocation, reply);
        Ok(())
    }
}
