use std::sync::Arc;

use nvx_core::{
    commands::CommandSurface,
    config::Config,
    credentials::{sealing::Sealer, CredentialStore},
    events::EventLog,
    security::{IdentityGuard, PrivateChatBinding, RateLimiter},
    Error,
};

#[tokio::main]
async fn main() -> Result<(), Error> {
    nvx_core::logging::init("nvx")?;

    let cfg = Config::load()?;

    let events = Arc::new(EventLog::open(
        &cfg.security_log_path,
        cfg.security_log_capacity,
    )?);
    let sealer = Sealer::new(cfg.master_key.as_ref())?;

    // An unreadable credential record is fatal; never run on an assumed-empty store.
    let store = Arc::new(CredentialStore::open(&cfg.token_file, sealer, events.clone())?);

    let mut guard = IdentityGuard::new(cfg.owner_id, cfg.admin_ids.iter().copied(), events.clone());
    if cfg.owner_private_chat_only {
        guard = guard.with_binding(PrivateChatBinding);
    }
    let limiter = RateLimiter::new(
        cfg.rate_limit_enabled,
        cfg.rate_limit_max,
        cfg.rate_limit_interval,
    );

    let token = match store.get(None) {
        Ok(token) => token,
        Err(Error::NotFound(_)) => {
            let Some(token) = cfg.telegram_bot_token.clone() else {
                return Err(Error::Config(
                    "no active credential in the store and TELEGRAM_BOT_TOKEN is not set".to_string(),
                ));
            };
            tracing::warn!("no active stored credential; using TELEGRAM_BOT_TOKEN from the environment");
            token
        }
        Err(e) => return Err(e),
    };

    let surface = Arc::new(CommandSurface::new(
        store,
        events,
        Arc::new(guard),
        Arc::new(limiter),
        cfg.rate_limit_interval,
    ));

    nvx_telegram::router::run_polling(token, surface)
        .await
        .map_err(|e| Error::External(format!("telegram bot failed: {e}")))?;

    Ok(())
}
