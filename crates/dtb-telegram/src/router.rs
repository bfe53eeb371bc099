use std::{collections::HashMap, sync::Arc};

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

use dtb_core::{
    api::ApiClient,
    config::Config,
    logging,
    messaging::MessagingPort,
    mtproto::ClientManager,
    protocol::{ProtocolConnector, ProtocolCredentials},
    store::JsonFileStore,
};

use crate::handlers;
use crate::TelegramMessenger;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub api: ApiClient,
    pub manager: ClientManager,
    pub messenger: Arc<dyn MessagingPort>,
    pub chat_locks: Arc<ChatLocks>,
}

/// Serializes message handling per chat so login replies are processed in order.
#[derive(Default)]
pub struct ChatLocks {
    inner: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl ChatLocks {
    pub async fn lock_chat(&self, chat_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(chat_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Run the bot until the dispatcher stops.
///
/// `connect` builds the MTProto stack from the `TG_API_ID` / `TG_API_HASH` pair.
pub async fn run_polling<C>(cfg: Arc<Config>, connect: C) -> anyhow::Result<()>
where
    C: FnOnce(ProtocolCredentials) -> Arc<dyn ProtocolConnector>,
{
    logging::init("dtb_telegram")?;
    let bot = Bot::new(cfg.telegram_token.clone());

    if let Ok(me) = bot.get_me().await {
        info!(username = %me.username(), "bot started");
    }

    let state = Arc::new(app_state(cfg, bot.clone(), connect).await?);

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build()
        .dispatch()
        .await;

    Ok(())
}

async fn app_state<C>(cfg: Arc<Config>, bot: Bot, connect: C) -> anyhow::Result<AppState>
where
    C: FnOnce(ProtocolCredentials) -> Arc<dyn ProtocolConnector>,
{
    let credentials = cfg.protocol_credentials()?;
    let api = ApiClient::new(&cfg.api)?;
    info!(base_url = %cfg.api.base_url, "delivery backend client ready");

    let store = Arc::new(JsonFileStore::open(cfg.session_store_path.clone()).await?);
    info!(path = %store.path().display(), "session store opened");

    let manager = ClientManager::new(&cfg.client, store, connect(credentials));
    let messenger: Arc<dyn MessagingPort> =
        Arc::new(TelegramMessenger::new(bot, cfg.messaging_retry));

    Ok(AppState {
        cfg,
        api,
        manager,
        messenger,
        chat_locks: Arc::new(ChatLocks::default()),
    })
}
