//! WTGameSession: one WebSocket connection watching a single WebTiles game,
//! surfacing its chat to [`crate::chat_command::ChatCommandEngine`] and
//! [`crate::query_router::QueryRouter`], and detecting when the game (or the
//! watch itself) has ended.

use super::protocol::{inflate_frame, Frame, OutgoingMessage, WireMessage};
use crate::chat_command::ChatCommandEngine;
use crate::chat_source::{ChatKind, ChatSource, SourceIdent};
use crate::errors::BeemError;
use crate::query_router::QueryRouter;
use crate::tv::TvManager;
use crate::user_store::{schema, UserStore};
use futures_util::{SinkExt, StreamExt};
use scraper::{Html, Selector};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

/// Lifecycle of a single watch. Transitions happen only in response to the
/// events named on each variant; anything else this session receives while
/// in that state is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    WatchRequested,
    Watching,
    Stopping,
    Gone,
}

pub struct SessionConfig {
    pub server_url: String,
    pub login_username: String,
    pub login_password: SecretString,
    pub greeting_text: Option<String>,
    pub twitch_reminder_text: Option<String>,
    pub twitch_reminder_period: Duration,
}

pub struct WTGameSession {
    ident: SourceIdent,
    username: String,
    config: SessionConfig,
    store: Arc<UserStore>,
    chat_command: Arc<ChatCommandEngine>,
    query_router: Arc<QueryRouter>,
    tv: Option<Arc<TvManager>>,
    state: Mutex<SessionState>,
    spectators: AtomicU64,
    need_greeting: AtomicBool,
    last_reminder_time: Mutex<Option<Instant>>,
    outbox: mpsc::UnboundedSender<OutgoingMessage>,
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<OutgoingMessage>>>,
}

impl WTGameSession {
    pub fn new(
        ident: SourceIdent,
        username: String,
        config: SessionConfig,
        store: Arc<UserStore>,
        chat_command: Arc<ChatCommandEngine>,
        query_router: Arc<QueryRouter>,
        tv: Option<Arc<TvManager>>,
    ) -> Arc<Self> {
        let subscribed = store.get_row(schema::WEBTILES_USERS.name, &username).int("subscription") == 1;
        let need_greeting = !subscribed && config.greeting_text.is_some();
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(WTGameSession {
            ident,
            username,
            config,
            store,
            chat_command,
            query_router,
            tv,
            state: Mutex::new(SessionState::Connecting),
            spectators: AtomicU64::new(0),
            need_greeting: AtomicBool::new(need_greeting),
            last_reminder_time: Mutex::new(None),
            outbox: tx,
            outbox_rx: Mutex::new(Some(rx)),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn is_watching(&self) -> bool {
        self.state() == SessionState::Watching
    }

    /// Requests teardown; the run loop notices `Stopping`/`Gone` and exits.
    pub fn request_stop(&self) {
        *self.state.lock().unwrap() = SessionState::Stopping;
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    pub async fn run(self: Arc<Self>) {
        if let Err(e) = self.connect_and_serve().await {
            warn!(username = %self.username, error = %e, "WT: session error");
        }
        self.set_state(SessionState::Gone);
    }

    async fn connect_and_serve(self: &Arc<Self>) -> Result<(), BeemError> {
        info!(username = %self.username, url = %self.config.server_url, "WT: connecting");
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.config.server_url)
            .await
            .map_err(|e| BeemError::ConnectFailed(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        self.set_state(SessionState::Authenticating);
        self.send_now(
            &mut write,
            OutgoingMessage::Login {
                username: self.config.login_username.clone(),
                password: ExposeSecret::expose_secret(&self.config.login_password).to_string(),
            },
        )
        .await?;

        let mut outbox_rx = self
            .outbox_rx
            .lock()
            .unwrap()
            .take()
            .expect("connect_and_serve only runs once per session");

        loop {
            if self.state() == SessionState::Stopping || self.state() == SessionState::Gone {
                return Ok(());
            }
            tokio::select! {
                outgoing = outbox_rx.recv() => {
                    match outgoing {
                        Some(msg) => self.send_now(&mut write, msg).await?,
                        None => return Ok(()),
                    }
                }
                frame = read.next() => {
                    match frame {
                        None => return Err(BeemError::ReadFailed("WT socket closed".into())),
                        Some(Err(e)) => return Err(BeemError::ReadFailed(e.to_string())),
                        Some(Ok(WsMessage::Binary(data))) => self.handle_frame_bytes(&data).await?,
                        Some(Ok(WsMessage::Text(text))) => self.handle_frame_text(&text).await?,
                        Some(Ok(WsMessage::Close(_))) => return Ok(()),
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    async fn send_now<S>(&self, write: &mut S, msg: OutgoingMessage) -> Result<(), BeemError>
    where
        S: futures_util::Sink<WsMessage> + Unpin,
        S::Error: std::fmt::Display,
    {
        let text = serde_json::to_string(&msg).map_err(|e| BeemError::WriteFailed(e.to_string()))?;
        write
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| BeemError::WriteFailed(e.to_string()))
    }

    async fn handle_frame_bytes(self: &Arc<Self>, data: &[u8]) -> Result<(), BeemError> {
        let text = inflate_frame(data)?;
        self.handle_frame_text(&text).await
    }

    async fn handle_frame_text(self: &Arc<Self>, text: &str) -> Result<(), BeemError> {
        for message in Frame::parse(text)? {
            self.handle_wire_message(message).await;
        }
        Ok(())
    }

    async fn handle_wire_message(self: &Arc<Self>, message: WireMessage) {
        match message {
            WireMessage::Ping => {
                let _ = self.outbox.send(OutgoingMessage::Pong);
            }
            WireMessage::LoginSuccess { .. } => {
                self.set_state(SessionState::WatchRequested);
                let _ = self.outbox.send(OutgoingMessage::Watch { username: self.username.clone() });
            }
            WireMessage::LoginFail { reason } => {
                warn!(username = %self.username, reason = ?reason, "WT: login failed");
                self.request_stop();
            }
            WireMessage::WatchingStarted => {
                self.set_state(SessionState::Watching);
                info!(username = %self.username, "WT: watch established");
                self.send_greeting_and_reminder();
            }
            WireMessage::UpdateSpectators { spectator_count } => {
                self.spectators.store(spectator_count, Ordering::Relaxed);
            }
            WireMessage::GameEnded => {
                if self.is_watching() {
                    self.request_stop();
                }
            }
            WireMessage::GoLobby => {
                if self.is_watching() {
                    self.request_stop();
                }
            }
            WireMessage::Go { path } => {
                if self.is_watching() && path.as_deref() == Some("/") {
                    self.request_stop();
                }
            }
            WireMessage::Chat { content } => self.handle_chat(&content).await,
            WireMessage::Dump { url } => self.forward_dump(&url).await,
            WireMessage::Unrecognized => debug!(username = %self.username, "WT: unrecognized message type"),
            // Lobby events only ever arrive on the dedicated lobby socket.
            WireMessage::LobbyEntry { .. }
            | WireMessage::LobbyRemove { .. }
            | WireMessage::LobbyClear
            | WireMessage::LobbyComplete => {
                debug!(username = %self.username, "WT: unexpected lobby event on a game session");
            }
        }
    }

    fn send_greeting_and_reminder(self: &Arc<Self>) {
        if self.need_greeting.swap(false, Ordering::Relaxed) {
            if let Some(greeting) = &self.config.greeting_text {
                self.send_chat(greeting, ChatKind::Normal);
            }
        }
        if self.tv.is_none() || self.config.twitch_reminder_text.is_none() {
            return;
        }
        let row = self.store.get_row(schema::WEBTILES_USERS.name, &self.username);
        if row.int("twitch_reminder") == 0 || !row.text("twitch_username").is_empty() {
            return;
        }
        let mut last = self.last_reminder_time.lock().unwrap();
        let due = last.map(|t| t.elapsed() >= self.config.twitch_reminder_period).unwrap_or(true);
        if !due {
            return;
        }
        *last = Some(Instant::now());
        drop(last);
        if let Some(text) = &self.config.twitch_reminder_text {
            self.send_chat(text, ChatKind::Normal);
        }
    }

    async fn handle_chat(self: &Arc<Self>, content: &str) {
        let Some((user, text)) = parse_chat_html(content) else {
            return;
        };
        if user.eq_ignore_ascii_case(&self.config.login_username) {
            return;
        }
        let source: Arc<dyn ChatSource> = self.clone();
        if self.chat_command.is_command(&text) {
            self.chat_command.handle_chat_line(source, &user, &text).await;
        } else if let Err(e) = self.query_router.route_query(source, &user, &text).await {
            error!(username = %self.username, error = %e, "WT: query routing failed");
        }
    }

    async fn forward_dump(&self, url: &str) {
        let Some(tv) = &self.tv else { return };
        let row = self.store.get_row(schema::WEBTILES_USERS.name, &self.username);
        let handle = row.text("twitch_username");
        if handle.is_empty() {
            return;
        }
        let channel = format!("#{handle}");
        if let Err(e) = tv.send_privmsg(&channel, &format!("Dump: {url}"), false).await {
            warn!(channel = %channel, error = %e, "WT: failed to forward dump to TV");
        }
    }
}

impl ChatSource for WTGameSession {
    fn send_chat(&self, message: &str, kind: ChatKind) {
        let payload = match kind {
            ChatKind::Action => format!("*{}* {}", self.username, escape_outbound(message)),
            _ => escape_outbound(message),
        };
        let _ = self.outbox.send(OutgoingMessage::ChatMsg { text: payload });
    }

    fn describe(&self) -> String {
        format!("WT game {}", self.username)
    }

    fn source_ident(&self) -> SourceIdent {
        self.ident
    }

    fn dcss_nick(&self, user: &str) -> String {
        user.to_string()
    }

    fn chat_dcss_nicks(&self, requester: &str) -> HashSet<String> {
        [requester.to_string(), self.username.clone()].into_iter().collect()
    }

    fn player_nick(&self) -> Option<String> {
        Some(self.username.clone())
    }

    fn is_disallowed_user(&self, user: &str) -> bool {
        if user.eq_ignore_ascii_case(&self.username) {
            return false;
        }
        self.store.get_row(schema::WEBTILES_USERS.name, &self.username).int("player_only") != 0
    }
}

fn escape_outbound(message: &str) -> String {
    if message.starts_with('!') {
        format!("]{message}")
    } else {
        message.to_string()
    }
}

/// Parses WT's `<span>user</span>: <span>msg</span>` chat HTML, applying a
/// single pass of the fixed entity-unescape table over each captured text.
fn parse_chat_html(content: &str) -> Option<(String, String)> {
    let document = Html::parse_fragment(content);
    let selector = Selector::parse("span").ok()?;
    let mut spans = document.select(&selector);
    let user = spans.next()?.text().collect::<String>();
    let rest = spans.next()?.text().collect::<String>();
    let rest = rest.strip_prefix(' ').unwrap_or(&rest);
    Some((unescape_entities(&user), unescape_entities(rest)))
}

/// Single-pass unescape of the fixed entity set the spec names; a doubly
/// escaped input (e.g. `&amp;amp;`) is deliberately left half-resolved.
fn unescape_entities(input: &str) -> String {
    const ENTITIES: &[(&str, &str)] = &[
        ("&amp;", "&"),
        ("&AMP;", "&"),
        ("&percnt;", "%"),
        ("&gt;", ">"),
        ("&lt;", "<"),
        ("&quot;", "\""),
        ("&apos;", "'"),
        ("&#39;", "'"),
        ("&nbsp;", "\u{a0}"),
    ];
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    'outer: while !rest.is_empty() {
        if let Some(amp) = rest.find('&') {
            for (entity, replacement) in ENTITIES {
                if rest[amp..].starts_with(entity) {
                    out.push_str(&rest[..amp]);
                    out.push_str(replacement);
                    rest = &rest[amp + entity.len()..];
                    continue 'outer;
                }
            }
            out.push_str(&rest[..=amp]);
            rest = &rest[amp + 1..];
        } else {
            out.push_str(rest);
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_user_and_message_from_span_markup() {
        let (user, msg) = parse_chat_html("<span>alice</span>: <span>hello there</span>").unwrap();
        assert_eq!(user, "alice");
        assert_eq!(msg, "hello there");
    }

    #[test]
    fn unescapes_the_fixed_entity_set_once() {
        assert_eq!(unescape_entities("Tom &amp; Jerry"), "Tom & Jerry");
        assert_eq!(unescape_entities("50&percnt; off"), "50% off");
        assert_eq!(unescape_entities("&lt;tag&gt;"), "<tag>");
    }

    #[test]
    fn double_escaped_input_is_not_fully_resolved() {
        // One pass turns `&amp;amp;` into `&amp;`, not `&`.
        assert_eq!(unescape_entities("&amp;amp;"), "&amp;");
    }

    #[test]
    fn bang_prefixed_outbound_chat_is_escaped() {
        assert_eq!(escape_outbound("!lg"), "]!lg");
        assert_eq!(escape_outbound("hello"), "hello");
    }
}
