//! Telegram update handlers.
//!
//! Each inbound `/command` is parsed, handed to the command surface on the
//! blocking pool (the core does synchronous file I/O), and the typed result is
//! rendered back to the originating chat.

use std::sync::Arc;

use teloxide::{prelude::*, types::Message};

use nvx_core::{
    commands::{verb_carries_secret, CommandError},
    domain::{Channel, ChatId, UserId},
};

use crate::{
    render::{parse_command, render_error, render_reply, Rendered},
    router::AppState,
};

pub async fn handle_message(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    if !text.starts_with('/') {
        return Ok(());
    }
    let Some(user) = msg.from() else {
        return Ok(());
    };

    let actor = UserId(user.id.0 as i64);
    let channel = Channel {
        chat_id: ChatId(msg.chat.id.0),
        is_private: msg.chat.is_private(),
    };
    let (verb, args) = parse_command(text);

    // Secrets should not linger in chat history, whatever the outcome.
    if verb_carries_secret(&verb) && !args.is_empty() {
        if let Err(e) = state.replier.delete(msg.chat.id, msg.id).await {
            tracing::warn!(user = %actor, verb = %verb, "could not delete message containing a secret: {e}");
        }
    }

    let surface = state.surface.clone();
    let result = tokio::task::spawn_blocking(move || surface.handle(actor, &channel, &verb, &args))
        .await
        .unwrap_or_else(|e| Err(CommandError::Internal(format!("command task failed: {e}"))));

    let rendered = match result {
        Ok(reply) => {
            if reply.is_sensitive() {
                tracing::warn!(user = %actor, chat = msg.chat.id.0, "sending secret-bearing export");
            }
            render_reply(&reply)
        }
        Err(e) => {
            tracing::debug!(user = %actor, kind = e.kind(), "command rejected");
            Rendered::Html(render_error(&e))
        }
    };

    if let Err(e) = state.replier.send(msg.chat.id, rendered).await {
        tracing::error!(user = %actor, "failed to send reply: {e}");
    }
    Ok(())
}
