use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};

use nvx_core::{commands::CommandSurface, domain::SecretString};

use crate::{handlers, TelegramReplier};

#[derive(Clone)]
pub struct AppState {
    pub surface: Arc<CommandSurface>,
    pub replier: TelegramReplier,
}

/// Long-poll Telegram until the dispatcher stops.
pub async fn run_polling(token: SecretString, surface: Arc<CommandSurface>) -> anyhow::Result<()> {
    let bot = Bot::new(token.expose());

    match bot.get_me().await {
        Ok(me) => tracing::info!(username = %me.username(), "bot started"),
        Err(e) => anyhow::bail!("telegram rejected the bot token: {e}"),
    }

    let state = Arc::new(AppState {
        surface,
        replier: TelegramReplier::new(bot.clone()),
    });

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build()
        .dispatch()
        .await;

    tracing::info!("dispatcher stopped");
    Ok(())
}
