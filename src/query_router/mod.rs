//! Routes recognized chat queries to the knowledge-bot IRC network,
//! demultiplexes replies back to the originating chat source, and performs
//! bot-to-bot relaying.
//!
//! Grounded on the single IRC connection + per-bot queue design in the
//! original `DCSSManager`/`IRCBot` pair, generalized to the 62-character
//! relay ID space the current knowledge-bot protocol actually uses.

mod ids;

use crate::chat_source::{ChatKind, ChatSource, SourceIdent, SourceRegistry};
use crate::configuration::{CompiledBot, DcssSettings};
use crate::errors::BeemError;
use base64::Engine;
use ids::IdSpace;
use irc::client::prelude::*;
use irc::client::ClientStream;
use irc::proto::CapSubCommand;
use secrecy::ExposeSecret;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long an allocated query ID stays reserved before it can be reused.
const MAX_REQUEST_TIME: Duration = Duration::from_secs(100);
/// Delay before a fresh connection attempt after a read error.
const RECONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Stats,
    Monster,
    Repo,
}

impl QueryKind {
    fn as_chat_kind(self) -> ChatKind {
        match self {
            QueryKind::Stats => ChatKind::Normal,
            QueryKind::Monster => ChatKind::Monster,
            QueryKind::Repo => ChatKind::Repo,
        }
    }
}

#[derive(Debug, Clone)]
struct QueryEntry {
    requester: String,
    source: SourceIdent,
    submit_time: Instant,
    kind: QueryKind,
}

struct BotState {
    use_relay: bool,
    id_space: IdSpace,
    queries: HashMap<usize, QueryEntry>,
    queue: VecDeque<usize>,
    last_answered: Option<QueryEntry>,
}

impl BotState {
    fn new(bot: &CompiledBot) -> Self {
        BotState {
            use_relay: bot.use_relay,
            id_space: if bot.use_relay {
                IdSpace::SixtyTwoChar
            } else {
                IdSpace::TwoDigit
            },
            queries: HashMap::new(),
            queue: VecDeque::new(),
            last_answered: None,
        }
    }

    fn allocate_id(&self) -> Result<usize, BeemError> {
        let now = Instant::now();
        for i in 0..self.id_space.capacity() {
            match self.queries.get(&i) {
                None => return Ok(i),
                Some(entry) if now.duration_since(entry.submit_time) >= MAX_REQUEST_TIME => {
                    return Ok(i);
                }
                Some(_) => continue,
            }
        }
        Err(BeemError::QueueFull)
    }
}

pub struct QueryRouter {
    settings: DcssSettings,
    bots: Vec<CompiledBot>,
    bad_patterns: Vec<regex::Regex>,
    state: Mutex<HashMap<String, BotState>>,
    registry: Arc<dyn SourceRegistry>,
    client: RwLock<Option<Client>>,
    cancel: CancellationToken,
}

impl QueryRouter {
    pub fn new(
        settings: DcssSettings,
        registry: Arc<dyn SourceRegistry>,
        cancel: CancellationToken,
    ) -> Result<Self, BeemError> {
        let bots = settings
            .bots
            .iter()
            .map(CompiledBot::compile)
            .collect::<Result<Vec<_>, _>>()?;
        let bad_patterns = settings
            .bad_patterns
            .iter()
            .map(|p| regex::Regex::new(p).map_err(|e| BeemError::ConfigInvalid(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        let state = bots.iter().map(|b| (b.nick.clone(), BotState::new(b))).collect();

        Ok(QueryRouter {
            settings,
            bots,
            bad_patterns,
            state: Mutex::new(state),
            registry,
            client: RwLock::new(None),
            cancel,
        })
    }

    /// Dispatches `message` to whichever configured bot's patterns match
    /// first, if any. Returns `Ok(false)` when nothing matched, which the
    /// caller should treat as "not a knowledge-bot query".
    pub async fn route_query(
        &self,
        source: Arc<dyn ChatSource>,
        requester: &str,
        message: &str,
    ) -> Result<bool, BeemError> {
        if self.bad_patterns.iter().any(|p| p.is_match(message)) {
            debug!(message, "DCSS: ignoring bad-pattern message");
            return Ok(false);
        }

        for bot in &self.bots {
            if let Some(kind) = bot.matches(message) {
                self.send_query(&bot.nick, kind, &source, requester, message)
                    .await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn send_query(
        &self,
        bot_nick: &str,
        kind: QueryKind,
        source: &Arc<dyn ChatSource>,
        requester: &str,
        message: &str,
    ) -> Result<(), BeemError> {
        let (index, use_relay, id_space) = {
            let mut state = self.state.lock().unwrap();
            let bot_state = state
                .get_mut(bot_nick)
                .ok_or_else(|| BeemError::NotFound(bot_nick.to_string()))?;
            let index = bot_state.allocate_id()?;
            bot_state.queries.insert(
                index,
                QueryEntry {
                    requester: requester.to_string(),
                    source: source.source_ident(),
                    submit_time: Instant::now(),
                    kind,
                },
            );
            if !bot_state.use_relay {
                bot_state.queue.push_back(index);
            }
            (index, bot_state.use_relay, bot_state.id_space)
        };

        let wire_message = if use_relay {
            build_relay_message(source.as_ref(), requester, id_space.encode(index), message)
        } else {
            message.to_string()
        };

        if let Err(e) = self.send_privmsg(bot_nick, &wire_message).await {
            let mut state = self.state.lock().unwrap();
            if let Some(bot_state) = state.get_mut(bot_nick) {
                bot_state.queries.remove(&index);
                if !use_relay {
                    bot_state.queue.retain(|&i| i != index);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    async fn handle_bot_reply(&self, bot_nick: &str, raw_message: &str) {
        let message = strip_control_sequences(raw_message);

        let resolved = {
            let mut state = self.state.lock().unwrap();
            let Some(bot_state) = state.get_mut(bot_nick) else {
                return;
            };

            let indexed = if bot_state.use_relay {
                bot_state.id_space.decode(&message)
            } else {
                bot_state.queue.pop_front().map(|index| (index, message.as_str()))
            };

            let (entry, remainder) = match indexed {
                Some((index, remainder)) => {
                    let Some(entry) = bot_state.queries.remove(&index) else {
                        debug!(bot = bot_nick, "DCSS: reply for unknown query id");
                        return;
                    };
                    if entry.submit_time.elapsed() >= MAX_REQUEST_TIME {
                        debug!(bot = bot_nick, "DCSS: dropping stale reply");
                        return;
                    }
                    (entry, remainder.to_string())
                }
                None if bot_state.use_relay => {
                    // No valid id prefix: treat as a stray follow-on line and
                    // route it back to whoever the last resolved reply went to.
                    let Some(entry) = bot_state.last_answered.clone() else {
                        warn!(bot = bot_nick, "DCSS: reply with invalid prefix and no prior query to fall back to");
                        return;
                    };
                    (entry, message.clone())
                }
                None => {
                    error!(bot = bot_nick, "DCSS: reply but no request queued");
                    return;
                }
            };

            bot_state.last_answered = Some(entry.clone());
            Some((entry, remainder))
        };

        let Some((entry, remainder)) = resolved else {
            return;
        };

        let Some(source) = self.registry.resolve(entry.source) else {
            warn!(bot = bot_nick, "DCSS: reply for a source that no longer exists");
            return;
        };

        let primary_bot = self.bots.iter().find(|b| b.nick == bot_nick);
        if primary_bot.map(|b| b.use_relay).unwrap_or(false) {
            for other in self.bots.iter().filter(|b| b.nick != bot_nick) {
                if let Some(other_kind) = other.matches(&remainder) {
                    if let Err(e) = self
                        .send_query(&other.nick, other_kind, &source, &entry.requester, &remainder)
                        .await
                    {
                        error!(
                            target = %other.nick, requester = %entry.requester,
                            error = %e, "DCSS: unable to relay reply to another bot"
                        );
                    }
                    return;
                }
            }
        }

        if let Some(action_text) = strip_action_prefix(&remainder) {
            source.send_chat(action_text, ChatKind::Action);
        } else {
            source.send_chat(&remainder, entry.kind.as_chat_kind());
        }
    }

    async fn send_privmsg(&self, target: &str, message: &str) -> Result<(), BeemError> {
        if self.settings.fake_connect {
            debug!(target, message, "DCSS: fake_connect, not sending");
            return Ok(());
        }
        let guard = self.client.read().await;
        let client = guard
            .as_ref()
            .ok_or_else(|| BeemError::ConnectFailed("not connected to DCSS IRC".into()))?;
        client
            .send_privmsg(target, message)
            .map_err(|e| BeemError::WriteFailed(e.to_string()))
    }

    /// Runs the connect/read/reconnect loop until cancelled.
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            if let Err(e) = self.connect_and_serve().await {
                error!(error = %e, "DCSS: connection error");
                if matches!(e, BeemError::AuthFailed(_)) {
                    error!("DCSS: SASL authentication failed, shutting down");
                    self.cancel.cancel();
                    return;
                }
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

    async fn connect_and_serve(&self) -> Result<(), BeemError> {
        if self.settings.fake_connect {
            info!("DCSS: fake_connect enabled, skipping IRC connection");
            self.cancel.cancelled().await;
            return Ok(());
        }

        info!(hostname = %self.settings.hostname, nick = %self.settings.nick, "DCSS: connecting");
        let config = build_irc_config(&self.settings);
        let mut client = Client::from_config(config)
            .await
            .map_err(|e| BeemError::ConnectFailed(e.to_string()))?;
        let mut stream = client
            .stream()
            .map_err(|e| BeemError::ConnectFailed(e.to_string()))?;

        if self.settings.password.is_some() {
            negotiate_sasl(&client, &mut stream, &self.settings).await?;
        } else {
            client
                .identify()
                .map_err(|e| BeemError::ConnectFailed(e.to_string()))?;
        }

        *self.client.write().await = Some(client);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                next = futures_util::StreamExt::next(&mut stream) => {
                    match next {
                        None => return Err(BeemError::ReadFailed("DCSS stream closed".into())),
                        Some(Err(e)) => return Err(BeemError::ReadFailed(e.to_string())),
                        Some(Ok(message)) => self.handle_message(message).await,
                    }
                }
            }
        }
    }

    async fn handle_message(&self, message: Message) {
        if let Command::PRIVMSG(_, text) = &message.command {
            if let Some(Prefix::Nickname(nick, _, _)) = &message.prefix {
                let is_known = self.state.lock().unwrap().contains_key(nick);
                if is_known {
                    self.handle_bot_reply(nick, text).await;
                }
            }
        }
    }
}

fn build_irc_config(settings: &DcssSettings) -> Config {
    let username = settings.username.clone().unwrap_or_else(|| settings.nick.clone());
    Config {
        nickname: Some(settings.nick.clone()),
        username: Some(username),
        realname: Some(settings.nick.clone()),
        server: Some(settings.hostname.clone()),
        port: Some(settings.port),
        use_tls: Some(settings.use_ssl),
        ..Config::default()
    }
}

async fn negotiate_sasl(
    client: &Client,
    stream: &mut ClientStream,
    settings: &DcssSettings,
) -> Result<(), BeemError> {
    client
        .send(Command::CAP(None, CapSubCommand::REQ, None, Some("sasl".to_string())))
        .map_err(|e| BeemError::ConnectFailed(e.to_string()))?;

    loop {
        let message = next_or_closed(stream).await?;
        match message.command {
            Command::CAP(_, CapSubCommand::ACK, _, _) => break,
            Command::CAP(_, CapSubCommand::NAK, _, _) => {
                return Err(BeemError::AuthFailed("server rejected sasl capability".into()));
            }
            _ => continue,
        }
    }

    client
        .send(Command::AUTHENTICATE("PLAIN".to_string()))
        .map_err(|e| BeemError::ConnectFailed(e.to_string()))?;

    loop {
        let message = next_or_closed(stream).await?;
        match message.command {
            Command::AUTHENTICATE(data) if data == "+" => break,
            _ => continue,
        }
    }

    let username = settings.username.clone().unwrap_or_else(|| settings.nick.clone());
    let password = settings
        .password
        .as_ref()
        .ok_or_else(|| BeemError::AuthFailed("sasl requested without a password".into()))?;
    let payload = format!("\0{}\0{}", username, password.expose_secret());
    let encoded = base64::engine::general_purpose::STANDARD.encode(payload);
    client
        .send_sasl(encoded)
        .map_err(|e| BeemError::ConnectFailed(e.to_string()))?;

    loop {
        let message = next_or_closed(stream).await?;
        match message.command {
            Command::Response(Response::RPL_SASLSUCCESS, _) => break,
            Command::Response(Response::ERR_SASLFAIL, _) => {
                return Err(BeemError::AuthFailed("904: sasl authentication failed".into()));
            }
            _ => continue,
        }
    }

    client
        .send(Command::CAP(None, CapSubCommand::END, None, None))
        .map_err(|e| BeemError::ConnectFailed(e.to_string()))?;
    client
        .send(Command::NICK(settings.nick.clone()))
        .map_err(|e| BeemError::ConnectFailed(e.to_string()))?;
    client
        .send(Command::USER(username.clone(), "0".to_string(), username))
        .map_err(|e| BeemError::ConnectFailed(e.to_string()))?;
    Ok(())
}

async fn next_or_closed(stream: &mut ClientStream) -> Result<Message, BeemError> {
    use futures_util::StreamExt;
    match stream.next().await {
        None => Err(BeemError::ReadFailed("DCSS stream closed during registration".into())),
        Some(Err(e)) => Err(BeemError::ReadFailed(e.to_string())),
        Some(Ok(message)) => Ok(message),
    }
}

static CONTROL_SEQUENCE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"[\x1f\x02\x12\x0f\x16]|\x03(?:\d{1,2}(?:,\d{1,2})?)?").unwrap()
});

fn strip_control_sequences(message: &str) -> String {
    CONTROL_SEQUENCE.replace_all(message, "").into_owned()
}

static SUBSTITUTE_PLAYER: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$p\b|\$\{p\}").unwrap());
static SUBSTITUTE_CHAT: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$chat\b|\$\{chat\}").unwrap());

fn build_relay_message(
    source: &dyn ChatSource,
    requester: &str,
    prefix: String,
    message: &str,
) -> String {
    let player = source.player_nick().unwrap_or_default();
    let message = SUBSTITUTE_PLAYER.replace_all(message, player.as_str());

    let chat_nicks: Vec<String> = source
        .chat_dcss_nicks(requester)
        .into_iter()
        .map(|n| format!("@{n}"))
        .collect();
    let message = SUBSTITUTE_CHAT.replace_all(&message, chat_nicks.join("|").as_str());

    format!(
        "!RELAY -nick {} -prefix {} -n 1 {}",
        source.dcss_nick(requester),
        prefix,
        message
    )
}

fn strip_action_prefix(message: &str) -> Option<&str> {
    if message.len() >= 4 && message[..4].eq_ignore_ascii_case("/me ") {
        Some(&message[4..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::BotSettings;
    use std::collections::HashSet;

    struct FakeSource {
        nicks: HashMap<String, String>,
        player: Option<String>,
        sent: Mutex<Vec<(String, ChatKind)>>,
    }

    impl ChatSource for FakeSource {
        fn send_chat(&self, message: &str, kind: ChatKind) {
            self.sent.lock().unwrap().push((message.to_string(), kind));
        }
        fn describe(&self) -> String {
            "fake".into()
        }
        fn source_ident(&self) -> SourceIdent {
            SourceIdent { service: crate::chat_source::ServiceKind::Webtiles, id: 1 }
        }
        fn dcss_nick(&self, user: &str) -> String {
            self.nicks.get(user).cloned().unwrap_or_else(|| user.to_string())
        }
        fn chat_dcss_nicks(&self, requester: &str) -> HashSet<String> {
            [self.dcss_nick(requester)].into_iter().collect()
        }
        fn player_nick(&self) -> Option<String> {
            self.player.clone()
        }
    }

    #[test]
    fn strip_control_sequences_removes_color_codes() {
        let input = "\x0312red\x03text\x02bold\x02";
        assert_eq!(strip_control_sequences(input), "redtextbold");
    }

    #[test]
    fn action_prefix_is_case_insensitive() {
        assert_eq!(strip_action_prefix("/ME waves"), Some("waves"));
        assert_eq!(strip_action_prefix("hello"), None);
    }

    #[test]
    fn relay_message_substitutes_player_and_chat() {
        let source = FakeSource {
            nicks: [("alice".to_string(), "AliceDCSS".to_string())].into_iter().collect(),
            player: Some("Minmay".to_string()),
            sent: Mutex::new(Vec::new()),
        };
        let out = build_relay_message(&source, "alice", "a".to_string(), "!lg $p wins");
        assert_eq!(out, "!RELAY -nick AliceDCSS -prefix a -n 1 !lg Minmay wins");
    }

    #[test]
    fn bot_state_reuses_stale_ids() {
        let bot = CompiledBot::compile(&BotSettings {
            nick: "Sequell".into(),
            stats_patterns: vec!["^!lg".into()],
            monster_patterns: vec![],
            repo_patterns: vec![],
            use_relay: true,
        })
        .unwrap();
        let mut state = BotState::new(&bot);
        let first = state.allocate_id().unwrap();
        state.queries.insert(
            first,
            QueryEntry {
                requester: "alice".into(),
                source: SourceIdent { service: crate::chat_source::ServiceKind::Webtiles, id: 1 },
                submit_time: Instant::now() - MAX_REQUEST_TIME - Duration::from_secs(1),
                kind: QueryKind::Stats,
            },
        );
        let reused = state.allocate_id().unwrap();
        assert_eq!(first, reused);
    }

    struct FakeRegistry {
        source: Arc<FakeSource>,
    }

    impl SourceRegistry for FakeRegistry {
        fn resolve(&self, _ident: SourceIdent) -> Option<Arc<dyn ChatSource>> {
            Some(self.source.clone())
        }
    }

    #[tokio::test]
    async fn stray_reply_with_no_prefix_falls_back_to_last_answered() {
        let source = Arc::new(FakeSource {
            nicks: HashMap::new(),
            player: None,
            sent: Mutex::new(Vec::new()),
        });
        let registry = Arc::new(FakeRegistry { source: source.clone() });
        let router = QueryRouter::new(
            DcssSettings {
                hostname: "irc.example.test".into(),
                port: 6667,
                nick: "gammabot".into(),
                username: None,
                password: None,
                use_ssl: false,
                fake_connect: true,
                bad_patterns: vec![],
                bots: vec![BotSettings {
                    nick: "Sequell".into(),
                    stats_patterns: vec!["^!lg".into()],
                    monster_patterns: vec![],
                    repo_patterns: vec![],
                    use_relay: true,
                }],
            },
            registry,
            CancellationToken::new(),
        )
        .unwrap();

        router.route_query(source.clone(), "alice", "!lg").await.unwrap();
        let prefix = {
            let mut state = router.state.lock().unwrap();
            let bot_state = state.get_mut("Sequell").unwrap();
            let index = *bot_state.queries.keys().next().unwrap();
            bot_state.id_space.encode(index)
        };
        router.handle_bot_reply("Sequell", &format!("{prefix}1 game")).await;
        assert_eq!(source.sent.lock().unwrap().len(), 1);

        // A follow-on line with no valid id prefix (the alphabet is
        // alphanumeric only) should still reach the same source instead of
        // being dropped.
        router.handle_bot_reply("Sequell", "*** trailing text").await;
        let sent = source.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].0, "*** trailing text");
    }

    #[test]
    fn bot_state_exhausts_id_space() {
        let bot = CompiledBot::compile(&BotSettings {
            nick: "Gretell".into(),
            stats_patterns: vec![],
            monster_patterns: vec!["^\\?\\?".into()],
            repo_patterns: vec![],
            use_relay: false,
        })
        .unwrap();
        let mut state = BotState::new(&bot);
        for i in 0..state.id_space.capacity() {
            state.queries.insert(
                i,
                QueryEntry {
                    requester: "alice".into(),
                    source: SourceIdent { service: crate::chat_source::ServiceKind::Webtiles, id: 1 },
                    submit_time: Instant::now(),
                    kind: QueryKind::Monster,
                },
            );
        }
        assert!(matches!(state.allocate_id(), Err(BeemError::QueueFull)));
    }
}
