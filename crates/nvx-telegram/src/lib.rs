//! Telegram adapter (teloxide).
//!
//! Turns inbound `/commands` into [`nvx_core::commands::CommandSurface`] calls
//! and renders the typed replies back as HTML.

use teloxide::{
    prelude::*,
    types::{ChatId, InputFile, MessageId, ParseMode},
    RequestError,
};
use tokio::time::sleep;

use nvx_core::errors::Error;

pub mod handlers;
pub mod render;
pub mod router;

use render::{split_message, Rendered, TELEGRAM_MESSAGE_LIMIT};

/// Thin sending wrapper with one retry on Telegram flood control.
#[derive(Clone)]
pub struct TelegramReplier {
    bot: Bot,
}

impl TelegramReplier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    fn map_err(e: RequestError) -> Error {
        Error::External(format!("telegram error: {e}"))
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> nvx_core::Result<T>
    where
        Fut: std::future::IntoFuture<Output = Result<T, RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(RequestError::RetryAfter(d)) if attempts < MAX_RETRIES => {
                    attempts += 1;
                    sleep(d).await;
                }
                Err(other) => return Err(Self::map_err(other)),
            }
        }
    }

    pub async fn send(&self, chat_id: ChatId, rendered: Rendered) -> nvx_core::Result<()> {
        match rendered {
            Rendered::Html(html) => {
                for chunk in split_message(&html, TELEGRAM_MESSAGE_LIMIT) {
                    self.with_retry(|| {
                        self.bot
                            .send_message(chat_id, chunk.clone())
                            .parse_mode(ParseMode::Html)
                    })
                    .await?;
                }
            }
            Rendered::Document {
                file_name,
                bytes,
                caption,
            } => {
                self.with_retry(|| {
                    self.bot
                        .send_document(
                            chat_id,
                            InputFile::memory(bytes.clone()).file_name(file_name.clone()),
                        )
                        .caption(caption.clone())
                        .parse_mode(ParseMode::Html)
                })
                .await?;
            }
        }
        Ok(())
    }

    pub async fn delete(&self, chat_id: ChatId, message_id: MessageId) -> nvx_core::Result<()> {
        self.with_retry(|| self.bot.delete_message(chat_id, message_id))
            .await?;
        Ok(())
    }
}
