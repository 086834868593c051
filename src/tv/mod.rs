//! TVManager: the IRC client for the streaming-chat service.
//!
//! Owns one IRC connection, a set of joined per-streamer channels, and a
//! join/part request queue populated by [`crate::chat_command`]'s `join`/
//! `part` commands. Grounded on the same connect/reconnect shape as
//! [`crate::query_router::QueryRouter`], since both are single IRC clients
//! driven by a `tokio::select!` read loop.

mod budget;
mod channel;

use crate::chat_command::{ChannelControl, ChatCommandEngine};
use crate::chat_source::{ChatSource, SourceIdent};
use crate::configuration::TwitchSettings;
use crate::errors::BeemError;
use crate::query_router::QueryRouter;
use crate::user_store::UserStore;
use budget::MessageBudget;
pub use channel::TvChannel;
use irc::client::prelude::*;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RECONNECT_TIMEOUT: Duration = Duration::from_secs(5);

struct WatchRequest {
    channel: String,
    parted: bool,
}

struct ChannelEntry {
    channel: Arc<TvChannel>,
    last_activity: Instant,
}

pub struct TvManager {
    settings: TwitchSettings,
    store: Arc<UserStore>,
    query_router: Arc<QueryRouter>,
    chat_command: Arc<ChatCommandEngine>,
    channels: Mutex<HashMap<String, ChannelEntry>>,
    queue: Mutex<VecDeque<WatchRequest>>,
    budget: Mutex<MessageBudget>,
    client: RwLock<Option<Client>>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl TvManager {
    pub fn new(
        settings: TwitchSettings,
        store: Arc<UserStore>,
        query_router: Arc<QueryRouter>,
        chat_command: Arc<ChatCommandEngine>,
        cancel: CancellationToken,
    ) -> Self {
        let budget = MessageBudget::new(settings.message_limit, settings.moderator_message_limit, Duration::from_secs(settings.message_timeout));
        TvManager {
            settings,
            store,
            query_router,
            chat_command,
            channels: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            budget: Mutex::new(budget),
            client: RwLock::new(None),
            next_id: AtomicU64::new(1),
            cancel,
        }
    }

    pub fn enqueue_join(&self, channel: &str) {
        self.queue.lock().unwrap().push_back(WatchRequest { channel: normalize(channel), parted: false });
    }

    pub fn enqueue_part(&self, channel: &str) {
        self.queue.lock().unwrap().push_back(WatchRequest { channel: normalize(channel), parted: true });
    }

    /// Drains the watch queue, joining/parting channels and applying the
    /// admission-with-eviction rule from the spec.
    pub async fn process_queue(self: &Arc<Self>) {
        let requests: Vec<WatchRequest> = {
            let mut queue = self.queue.lock().unwrap();
            std::mem::take(&mut *queue).into_iter().collect()
        };

        for request in requests {
            if request.parted {
                self.part_channel(&request.channel).await;
                continue;
            }
            if self.channels.lock().unwrap().contains_key(&request.channel) {
                continue;
            }
            if self.channels.lock().unwrap().len() >= self.settings.max_watched_subscribers {
                let min_idle = Duration::from_secs(self.settings.min_idle);
                match self.most_idle_evictable(min_idle) {
                    Some(victim) => self.part_channel(&victim).await,
                    None => {
                        // Re-queue: capacity may free up on a later tick.
                        self.queue.lock().unwrap().push_back(WatchRequest { channel: request.channel, parted: false });
                        continue;
                    }
                }
            }
            self.join_channel(request.channel).await;
        }
    }

    fn most_idle_evictable(&self, min_idle: Duration) -> Option<String> {
        let channels = self.channels.lock().unwrap();
        channels
            .iter()
            .filter(|(_, entry)| entry.last_activity.elapsed() >= min_idle)
            .max_by_key(|(_, entry)| entry.last_activity.elapsed())
            .map(|(name, _)| name.clone())
    }

    async fn join_channel(self: &Arc<Self>, channel_name: String) {
        if !self.consume_budget(false) {
            warn!(channel = %channel_name, "TV: join suppressed, message budget exhausted");
            return;
        }
        if let Err(e) = self.send_raw(Command::JOIN(channel_name.clone(), None, None)).await {
            error!(channel = %channel_name, error = %e, "TV: join failed");
            return;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let source_ident = SourceIdent { service: crate::chat_source::ServiceKind::Tv, id };
        let tv_channel = Arc::new(TvChannel::new(source_ident, channel_name.clone(), self.store.clone(), Arc::downgrade(self)));
        self.channels.lock().unwrap().insert(
            channel_name.clone(),
            ChannelEntry { channel: tv_channel, last_activity: Instant::now() },
        );
        info!(channel = %channel_name, "TV: joined channel");
    }

    async fn part_channel(&self, channel_name: &str) {
        if self.channels.lock().unwrap().remove(channel_name).is_none() {
            return;
        }
        if self.consume_budget(false) {
            let _ = self.send_raw(Command::PART(channel_name.to_string(), None)).await;
        }
        info!(channel = %channel_name, "TV: parted channel");
    }

    pub fn resolve(&self, ident: SourceIdent) -> Option<Arc<dyn ChatSource>> {
        self.channels
            .lock()
            .unwrap()
            .values()
            .find(|e| e.channel.source_ident() == ident)
            .map(|e| e.channel.clone() as Arc<dyn ChatSource>)
    }

    fn touch(&self, channel_name: &str) {
        if let Some(entry) = self.channels.lock().unwrap().get_mut(channel_name) {
            entry.last_activity = Instant::now();
        }
    }

    /// Consumes one unit from the message budget. Returns false (and
    /// suppresses the action) when the budget is exhausted.
    fn consume_budget(&self, moderator: bool) -> bool {
        self.budget.lock().unwrap().consume(moderator)
    }

    pub(crate) async fn send_privmsg(&self, target: &str, message: &str, moderator: bool) -> Result<(), BeemError> {
        if !self.consume_budget(moderator) {
            debug!(target, "TV: message suppressed, budget exhausted");
            return Ok(());
        }
        self.touch(target);
        let escaped = channel::escape_outbound(message);
        self.send_raw(Command::PRIVMSG(target.to_string(), escaped)).await
    }

    async fn send_raw(&self, command: Command) -> Result<(), BeemError> {
        let guard = self.client.read().await;
        let client = guard.as_ref().ok_or_else(|| BeemError::ConnectFailed("not connected to TV IRC".into()))?;
        client.send(command).map_err(|e| BeemError::WriteFailed(e.to_string()))
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            if let Err(e) = self.connect_and_serve().await {
                error!(error = %e, "TV: connection error");
            }
            if self.cancel.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_TIMEOUT) => {}
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    async fn connect_and_serve(self: &Arc<Self>) -> Result<(), BeemError> {
        info!(hostname = %self.settings.hostname, nick = %self.settings.nick, "TV: connecting");
        let config = Config {
            nickname: Some(self.settings.nick.clone()),
            server: Some(self.settings.hostname.clone()),
            port: Some(self.settings.port),
            password: Some(secrecy::ExposeSecret::expose_secret(&self.settings.password).to_string()),
            use_tls: Some(true),
            ..Config::default()
        };
        let mut client = Client::from_config(config).await.map_err(|e| BeemError::ConnectFailed(e.to_string()))?;
        client.identify().map_err(|e| BeemError::ConnectFailed(e.to_string()))?;
        client
            .send(Command::CAP(None, irc::proto::CapSubCommand::REQ, None, Some("twitch.tv/membership".to_string())))
            .map_err(|e| BeemError::ConnectFailed(e.to_string()))?;
        let mut stream = client.stream().map_err(|e| BeemError::ConnectFailed(e.to_string()))?;
        *self.client.write().await = Some(client);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                next = futures_util::StreamExt::next(&mut stream) => {
                    match next {
                        None => return Err(BeemError::ReadFailed("TV stream closed".into())),
                        Some(Err(e)) => return Err(BeemError::ReadFailed(e.to_string())),
                        Some(Ok(message)) => self.handle_message(message).await,
                    }
                }
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, message: Message) {
        let Command::PRIVMSG(target, text) = &message.command else { return };
        let Some(Prefix::Nickname(sender, _, _)) = &message.prefix else { return };
        if sender.eq_ignore_ascii_case(&self.settings.nick) {
            return;
        }
        self.touch(target);
        let source = self.channels.lock().unwrap().get(target).map(|e| e.channel.clone());
        let Some(source) = source else { return };
        let dyn_source: Arc<dyn ChatSource> = source;

        if self.chat_command.is_command(text) {
            self.chat_command.handle_chat_line(dyn_source, sender, text).await;
            return;
        }

        if let Ok(handled) = self.query_router.route_query(dyn_source, sender, text).await {
            if !handled {
                debug!(sender, "TV: chat line not a recognized query");
            }
        }
    }
}

impl ChannelControl for Arc<TvManager> {
    fn enqueue_join(&self, channel: &str) {
        TvManager::enqueue_join(self, channel);
    }
    fn enqueue_part(&self, channel: &str) {
        TvManager::enqueue_part(self, channel);
    }
}

fn normalize(channel: &str) -> String {
    if channel.starts_with('#') {
        channel.to_string()
    } else {
        format!("#{channel}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_source::{ServiceKind, SourceRegistry};
    use std::path::Path;

    #[test]
    fn normalize_adds_hash_prefix() {
        assert_eq!(normalize("streamerx"), "#streamerx");
        assert_eq!(normalize("#streamerx"), "#streamerx");
    }

    async fn tv_manager() -> Arc<TvManager> {
        let store = Arc::new(UserStore::load(Path::new(":memory:")).await.unwrap());
        let chat_command = Arc::new(ChatCommandEngine::new(
            ServiceKind::Tv,
            "gammabot".into(),
            "hi".into(),
            vec![],
            Duration::from_secs(10),
            3,
            false,
            store.clone(),
        ));
        struct NullRegistry;
        impl SourceRegistry for NullRegistry {
            fn resolve(&self, _ident: SourceIdent) -> Option<Arc<dyn ChatSource>> {
                None
            }
        }
        let query_router = Arc::new(
            QueryRouter::new(
                crate::configuration::DcssSettings {
                    hostname: "irc.example.test".into(),
                    port: 6667,
                    nick: "gammabot".into(),
                    username: None,
                    password: None,
                    use_ssl: false,
                    fake_connect: true,
                    bad_patterns: vec![],
                    bots: vec![],
                },
                Arc::new(NullRegistry),
                CancellationToken::new(),
            )
            .unwrap(),
        );
        Arc::new(TvManager::new(
            TwitchSettings {
                hostname: "irc.example.test".into(),
                port: 6667,
                nick: "gammabot".into(),
                password: secrecy::SecretString::from("secret".to_string()),
                message_limit: 20,
                moderator_message_limit: 100,
                message_timeout: 30,
                max_chat_idle: 3600,
                request_expire_time: 100,
                max_watched_subscribers: 5,
                min_idle: 60,
                watch_user: None,
                never_watch: vec![],
                admins: vec![],
            },
            store,
            query_router,
            chat_command,
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn own_nick_is_ignored_and_does_not_touch_channel_activity() {
        let manager = tv_manager().await;
        let ident = SourceIdent { service: ServiceKind::Tv, id: 1 };
        let tv_channel = Arc::new(TvChannel::new(ident, "#streamerx".into(), manager.store.clone(), Arc::downgrade(&manager)));
        let before = Instant::now() - Duration::from_secs(1);
        manager.channels.lock().unwrap().insert("#streamerx".into(), ChannelEntry { channel: tv_channel, last_activity: before });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let message = Message::new(Some("GammaBot!gammabot@example.test"), "PRIVMSG", vec!["#streamerx", "!help"]).unwrap();
        manager.handle_message(message).await;

        let after = manager.channels.lock().unwrap().get("#streamerx").unwrap().last_activity;
        assert_eq!(before, after);
    }
}
