//! WTManager: reconciles the live lobby table against policy every tick and
//! drives creation/destruction of [`WTGameSession`]s.

use super::lobby::{meets_minimum_version, LobbyEntry, WTLobby};
use super::protocol::{inflate_frame, Frame, OutgoingMessage, WireMessage};
use super::scheduler::{
    can_watch_user, is_ready_to_watch, is_subscribed, pick_autowatch_candidate, should_drop_queue_entry,
    WatchQueueEntry,
};
use super::session::{SessionConfig, SessionState, WTGameSession};
use crate::chat_command::{ChatCommandEngine, SchedulerStatus};
use crate::chat_source::{ChatSource, ServiceKind, SourceIdent, SourceRegistry};
use crate::configuration::WebtilesSettings;
use crate::errors::BeemError;
use crate::query_router::QueryRouter;
use crate::tv::TvManager;
use crate::user_store::UserStore;
use futures_util::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{error, info};

const SCHEDULER_TICK: Duration = Duration::from_millis(500);
const RECONNECT_TIMEOUT: Duration = Duration::from_secs(5);

struct Autowatch {
    session: Arc<WTGameSession>,
    game_id: String,
}

pub struct WTManager {
    settings: WebtilesSettings,
    store: Arc<UserStore>,
    chat_command: Arc<ChatCommandEngine>,
    query_router: Arc<QueryRouter>,
    tv: Option<Arc<TvManager>>,
    lobby: Mutex<WTLobby>,
    autowatch: Mutex<Option<Autowatch>>,
    connections: Mutex<HashMap<String, Arc<WTGameSession>>>,
    watch_queue: Mutex<Vec<WatchQueueEntry>>,
    next_id: AtomicU64,
    cancel: tokio_util::sync::CancellationToken,
}

impl WTManager {
    pub fn new(
        settings: WebtilesSettings,
        store: Arc<UserStore>,
        chat_command: Arc<ChatCommandEngine>,
        query_router: Arc<QueryRouter>,
        tv: Option<Arc<TvManager>>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Self {
        WTManager {
            settings,
            store,
            chat_command,
            query_router,
            tv,
            lobby: Mutex::new(WTLobby::new()),
            autowatch: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
            watch_queue: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            cancel,
        }
    }

    pub fn resolve(&self, ident: SourceIdent) -> Option<Arc<dyn ChatSource>> {
        if let Some(autowatch) = self.autowatch.lock().unwrap().as_ref() {
            if autowatch.session.source_ident() == ident {
                return Some(autowatch.session.clone() as Arc<dyn ChatSource>);
            }
        }
        self.connections
            .lock()
            .unwrap()
            .values()
            .find(|s| s.source_ident() == ident)
            .map(|s| s.clone() as Arc<dyn ChatSource>)
    }

    /// Runs the lobby connection and the scheduler tick loop until cancelled.
    pub async fn run(self: Arc<Self>) {
        let scheduler = {
            let manager = self.clone();
            tokio::spawn(async move { manager.scheduler_loop().await })
        };
        self.lobby_loop().await;
        scheduler.abort();
    }

    async fn scheduler_loop(self: &Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(SCHEDULER_TICK) => {}
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    async fn tick(self: &Arc<Self>) {
        if !self.lobby.lock().unwrap().is_complete() {
            return;
        }
        let candidate = self.process_lobby();
        self.apply_autowatch_candidate(candidate);
        self.process_watch_queue();
    }

    /// Walks the lobby, appends subscriber watch-queue entries, and returns
    /// the winning autowatch candidate (if any).
    fn process_lobby(&self) -> Option<(String, String)> {
        let lobby = self.lobby.lock().unwrap();
        let now = Instant::now();
        let eligible: Vec<&LobbyEntry> = lobby
            .entries()
            .filter(|e| can_watch_user(&e.username, &self.store, &self.settings))
            .filter(|e| meets_minimum_version(&e.game_id))
            .filter(|e| e.effective_idle(now) < self.settings.max_game_idle)
            .collect();

        {
            let mut queue = self.watch_queue.lock().unwrap();
            for entry in &eligible {
                if is_subscribed(&entry.username, &self.store)
                    && !queue.iter().any(|q| q.username == entry.username && q.game_id == entry.game_id)
                {
                    queue.push(WatchQueueEntry { username: entry.username.clone(), game_id: entry.game_id.clone(), time_end: None });
                }
            }
        }

        if !self.settings.autowatch_enabled {
            return None;
        }
        let current = self.autowatch.lock().unwrap().as_ref().map(|a| (a.session.username().to_string(), a.game_id.clone()));
        let current_ref = current.as_ref().map(|(u, g)| (u.as_str(), g.as_str()));
        let subscriber_slots_full = self.connections.lock().unwrap().len() >= self.settings.max_watched_subscribers;
        pick_autowatch_candidate(&eligible, current_ref, self.settings.min_autowatch_spectators, subscriber_slots_full, &self.store)
            .map(|(u, g)| (u.to_string(), g.to_string()))
    }

    fn apply_autowatch_candidate(self: &Arc<Self>, candidate: Option<(String, String)>) {
        let current = self.autowatch.lock().unwrap().as_ref().map(|a| (a.session.username().to_string(), a.game_id.clone()));
        match candidate {
            Some((username, game_id)) if current.as_ref().map(|(u, _)| u.as_str()) != Some(username.as_str()) => {
                if let Some(old) = self.autowatch.lock().unwrap().take() {
                    old.session.request_stop();
                }
                let session = self.spawn_session(username);
                *self.autowatch.lock().unwrap() = Some(Autowatch { session, game_id });
            }
            Some(_) => {}
            None => {
                let should_stop = match self.autowatch.lock().unwrap().as_ref() {
                    None => false,
                    Some(autowatch) => {
                        !can_watch_user(autowatch.session.username(), &self.store, &self.settings) || !autowatch.session.is_watching()
                    }
                };
                if should_stop {
                    if let Some(old) = self.autowatch.lock().unwrap().take() {
                        old.session.request_stop();
                    }
                }
            }
        }
    }

    fn process_watch_queue(self: &Arc<Self>) {
        let entries: Vec<WatchQueueEntry> = self.watch_queue.lock().unwrap().clone();
        let mut next: Vec<WatchQueueEntry> = Vec::new();
        let now = Instant::now();
        let lobby = self.lobby.lock().unwrap();

        for mut entry in entries {
            if let Some(session) = self.connections.lock().unwrap().get(&entry.username).cloned() {
                let ineligible = !can_watch_user(&entry.username, &self.store, &self.settings);
                let gone = session.state() == SessionState::Gone;
                if ineligible || gone {
                    if ineligible {
                        session.request_stop();
                    }
                    self.connections.lock().unwrap().remove(&entry.username);
                    entry.time_end = Some(now);
                    next.push(entry);
                    continue;
                }
                next.push(entry);
                continue;
            }

            if should_drop_queue_entry(&entry, &lobby, &self.store, &self.settings, now) {
                continue;
            }

            if is_ready_to_watch(&entry, &lobby, now) && self.connections.lock().unwrap().len() < self.settings.max_watched_subscribers {
                let session = self.spawn_session(entry.username.clone());
                self.connections.lock().unwrap().insert(entry.username.clone(), session);
            }
            next.push(entry);
        }
        drop(lobby);
        *self.watch_queue.lock().unwrap() = next;
    }

    fn spawn_session(self: &Arc<Self>, username: String) -> Arc<WTGameSession> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ident = SourceIdent { service: ServiceKind::Webtiles, id };
        let config = SessionConfig {
            server_url: self.settings.server_url.clone(),
            login_username: self.settings.username.clone(),
            login_password: self.settings.password.clone(),
            greeting_text: self.settings.greeting_text.clone(),
            twitch_reminder_text: self.settings.twitch_reminder_text.clone(),
            twitch_reminder_period: Duration::from_secs(self.settings.twitch_reminder_period),
        };
        let session = WTGameSession::new(
            ident,
            username,
            config,
            self.store.clone(),
            self.chat_command.clone(),
            self.query_router.clone(),
            self.tv.clone(),
        );
        tokio::spawn(session.clone().run());
        session
    }

    async fn lobby_loop(self: &Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            if let Err(e) = self.connect_lobby().await {
                error!(error = %e, "WT: lobby connection error");
            }
            self.lobby.lock().unwrap().apply_clear();
            if self.cancel.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_TIMEOUT) => {}
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    async fn connect_lobby(self: &Arc<Self>) -> Result<(), BeemError> {
        info!(url = %self.settings.server_url, "WT: connecting lobby socket");
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.settings.server_url)
            .await
            .map_err(|e| BeemError::ConnectFailed(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let login = OutgoingMessage::Login {
            username: self.settings.username.clone(),
            password: ExposeSecret::expose_secret(&self.settings.password).to_string(),
        };
        let text = serde_json::to_string(&login).map_err(|e| BeemError::WriteFailed(e.to_string()))?;
        write.send(WsMessage::Text(text)).await.map_err(|e| BeemError::WriteFailed(e.to_string()))?;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                frame = read.next() => {
                    match frame {
                        None => return Err(BeemError::ReadFailed("WT lobby socket closed".into())),
                        Some(Err(e)) => return Err(BeemError::ReadFailed(e.to_string())),
                        Some(Ok(WsMessage::Close(_))) => return Ok(()),
                        Some(Ok(WsMessage::Binary(data))) => {
                            let text = inflate_frame(&data)?;
                            self.handle_lobby_text(&text, &mut write).await?;
                        }
                        Some(Ok(WsMessage::Text(text))) => self.handle_lobby_text(&text, &mut write).await?,
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    async fn handle_lobby_text<S>(&self, text: &str, write: &mut S) -> Result<(), BeemError>
    where
        S: futures_util::Sink<WsMessage> + Unpin,
        S::Error: std::fmt::Display,
    {
        for message in Frame::parse(text)? {
            match message {
                WireMessage::Ping => {
                    let pong = serde_json::to_string(&OutgoingMessage::Pong).unwrap();
                    write.send(WsMessage::Text(pong)).await.map_err(|e| BeemError::WriteFailed(e.to_string()))?;
                }
                WireMessage::LoginFail { reason } => {
                    return Err(BeemError::AuthFailed(reason.unwrap_or_else(|| "WT lobby login failed".into())));
                }
                WireMessage::LobbyEntry { id, username, game_id, spectator_count, idle_time } => {
                    self.lobby.lock().unwrap().apply_entry(id, username, game_id, spectator_count, idle_time);
                }
                WireMessage::LobbyRemove { id } => self.lobby.lock().unwrap().apply_remove(&id),
                WireMessage::LobbyClear => self.lobby.lock().unwrap().apply_clear(),
                WireMessage::LobbyComplete => self.lobby.lock().unwrap().apply_complete(),
                _ => {}
            }
        }
        Ok(())
    }
}

impl SourceRegistry for WTManager {
    fn resolve(&self, ident: SourceIdent) -> Option<Arc<dyn ChatSource>> {
        WTManager::resolve(self, ident)
    }
}

impl SchedulerStatus for WTManager {
    fn status_report(&self) -> String {
        let autowatch = self.autowatch.lock().unwrap().as_ref().map(|a| a.session.username().to_string());
        let subscribers = self.connections.lock().unwrap().len();
        match autowatch {
            Some(user) => format!(
                "Autowatching {user}. {subscribers}/{} subscriber slots in use.",
                self.settings.max_watched_subscribers
            ),
            None => format!("No autowatch target. {subscribers}/{} subscriber slots in use.", self.settings.max_watched_subscribers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn settings() -> WebtilesSettings {
        WebtilesSettings {
            server_url: "wss://example.test/socket".into(),
            protocol_version: 2,
            username: "gammabot".into(),
            password: secrecy::SecretString::from("secret".to_string()),
            help_text: "hi".into(),
            max_watched_subscribers: 1,
            max_game_idle: 300,
            game_rewatch_timeout: 60,
            autowatch_enabled: true,
            min_autowatch_spectators: 3,
            greeting_text: None,
            twitch_reminder_text: None,
            twitch_reminder_period: 3600,
            never_watch: vec![],
            admins: vec![],
            watch_username: None,
            command_period: 10,
            command_limit: 3,
        }
    }

    async fn manager() -> Arc<WTManager> {
        let store = Arc::new(UserStore::load(Path::new(":memory:")).await.unwrap());
        let chat_command = Arc::new(ChatCommandEngine::new(
            ServiceKind::Webtiles,
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
                tokio_util::sync::CancellationToken::new(),
            )
            .unwrap(),
        );
        Arc::new(WTManager::new(
            settings(),
            store,
            chat_command,
            query_router,
            None,
            tokio_util::sync::CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn status_report_reflects_empty_state() {
        let manager = manager().await;
        assert_eq!(manager.status_report(), "No autowatch target. 0/1 subscriber slots in use.");
    }

    #[tokio::test]
    async fn tick_ignores_incomplete_lobby_snapshot() {
        let manager = manager().await;
        manager.lobby.lock().unwrap().apply_entry("1".into(), "alice".into(), "crawl-0.32".into(), 5, 0);
        manager.tick().await;
        assert!(manager.autowatch.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn process_watch_queue_keeps_a_connecting_session_alive() {
        let manager = manager().await;
        manager.store.add_row(crate::user_store::schema::WEBTILES_USERS.name, "alice").await.unwrap();
        manager
            .store
            .set_row_field(crate::user_store::schema::WEBTILES_USERS.name, "alice", "subscription", crate::user_store::FieldValue::Int(1))
            .await
            .unwrap();

        let ident = SourceIdent { service: ServiceKind::Webtiles, id: 1 };
        let session = WTGameSession::new(
            ident,
            "alice".into(),
            SessionConfig {
                server_url: "wss://example.test/socket".into(),
                login_username: "gammabot".into(),
                login_password: secrecy::SecretString::from("secret".to_string()),
                greeting_text: None,
                twitch_reminder_text: None,
                twitch_reminder_period: Duration::from_secs(3600),
            },
            manager.store.clone(),
            manager.chat_command.clone(),
            manager.query_router.clone(),
            None,
        );
        assert!(!session.is_watching());
        manager.connections.lock().unwrap().insert("alice".into(), session.clone());
        manager.watch_queue.lock().unwrap().push(WatchQueueEntry { username: "alice".into(), game_id: "crawl-0.32".into(), time_end: None });

        manager.process_watch_queue();

        assert!(manager.connections.lock().unwrap().contains_key("alice"));
        assert_eq!(session.state(), SessionState::Connecting);
    }

    #[tokio::test]
    async fn process_lobby_queues_subscribed_players() {
        let manager = manager().await;
        manager.store.add_row(crate::user_store::schema::WEBTILES_USERS.name, "alice").await.unwrap();
        manager
            .store
            .set_row_field(crate::user_store::schema::WEBTILES_USERS.name, "alice", "subscription", crate::user_store::FieldValue::Int(1))
            .await
            .unwrap();
        manager.lobby.lock().unwrap().apply_entry("1".into(), "alice".into(), "crawl-0.32".into(), 1, 0);
        manager.process_lobby();
        let queue = manager.watch_queue.lock().unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].username, "alice");
    }
}
