//! Parses and dispatches administrative chat commands.
//!
//! Grounded on `ChatWatcher.read_beem_command`/`read_chat` in the original
//! `beem/chat.py`: a single-character command prefix, a rolling per-source
//! rate limit, an admin-target override, and a per-command argument
//! pattern. The per-service command tables (`services[service]["commands"]`
//! in the source) become two `CommandSpec` tables here, one per
//! [`ServiceKind`].

use crate::chat_source::{ChatKind, ChatSource, ServiceKind, SourceIdent};
use crate::errors::{BeemError, CommandOutcome};
use crate::user_store::{schema, FieldValue, UserStore};
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info};

pub struct ArgSpec {
    pub description: &'static str,
    pub required: bool,
    pub pattern: Option<&'static str>,
}

pub struct CommandSpec {
    pub name: &'static str,
    pub require_admin: bool,
    pub require_user_source: bool,
    pub require_bot_source: bool,
    pub disallow_single_user_mode: bool,
    pub args: &'static [ArgSpec],
}

/// Reports autowatch/subscriber-slot occupancy for the `status` command.
/// Implemented by the watch scheduler; the engine only holds a handle.
pub trait SchedulerStatus: Send + Sync {
    fn status_report(&self) -> String;
}

/// Lets the `join`/`part` commands reach the TV channel manager without the
/// engine depending on its concrete type.
pub trait ChannelControl: Send + Sync {
    fn enqueue_join(&self, channel: &str);
    fn enqueue_part(&self, channel: &str);
}

const NICK: CommandSpec = CommandSpec {
    name: "nick",
    require_admin: false,
    require_user_source: true,
    require_bot_source: false,
    disallow_single_user_mode: false,
    args: &[ArgSpec { description: "nick", required: false, pattern: Some(r"^\S+$") }],
};

const BOTHELP: CommandSpec = CommandSpec {
    name: "bothelp",
    require_admin: false,
    require_user_source: false,
    require_bot_source: false,
    disallow_single_user_mode: false,
    args: &[],
};

const SUBSCRIBE: CommandSpec = CommandSpec {
    name: "subscribe",
    require_admin: false,
    require_user_source: true,
    require_bot_source: false,
    disallow_single_user_mode: true,
    args: &[],
};

const UNSUBSCRIBE: CommandSpec = CommandSpec {
    name: "unsubscribe",
    require_admin: false,
    require_user_source: true,
    require_bot_source: false,
    disallow_single_user_mode: true,
    args: &[],
};

const TWITCH_USER: CommandSpec = CommandSpec {
    name: "twitch-user",
    require_admin: false,
    require_user_source: true,
    require_bot_source: false,
    disallow_single_user_mode: false,
    args: &[ArgSpec { description: "twitch handle", required: false, pattern: Some(r"^\S+$") }],
};

const TWITCH_REMINDER: CommandSpec = CommandSpec {
    name: "twitch-reminder",
    require_admin: false,
    require_user_source: true,
    require_bot_source: false,
    disallow_single_user_mode: false,
    args: &[ArgSpec { description: "on|off", required: false, pattern: Some(r"^(?i:on|off)$") }],
};

const PLAYER_ONLY: CommandSpec = CommandSpec {
    name: "player-only",
    require_admin: false,
    require_user_source: true,
    require_bot_source: false,
    disallow_single_user_mode: false,
    args: &[ArgSpec { description: "on|off", required: false, pattern: Some(r"^(?i:on|off)$") }],
};

const JOIN: CommandSpec = CommandSpec {
    name: "join",
    require_admin: true,
    require_user_source: false,
    require_bot_source: true,
    disallow_single_user_mode: false,
    args: &[ArgSpec { description: "channel", required: true, pattern: Some(r"^\S+$") }],
};

const PART: CommandSpec = CommandSpec {
    name: "part",
    require_admin: true,
    require_user_source: false,
    require_bot_source: true,
    disallow_single_user_mode: false,
    args: &[ArgSpec { description: "channel", required: true, pattern: Some(r"^\S+$") }],
};

const STATUS: CommandSpec = CommandSpec {
    name: "status",
    require_admin: true,
    require_user_source: false,
    require_bot_source: true,
    disallow_single_user_mode: false,
    args: &[],
};

fn webtiles_commands() -> Vec<&'static CommandSpec> {
    vec![&BOTHELP, &NICK, &SUBSCRIBE, &UNSUBSCRIBE, &TWITCH_USER, &TWITCH_REMINDER, &PLAYER_ONLY, &STATUS]
}

fn tv_commands() -> Vec<&'static CommandSpec> {
    vec![&BOTHELP, &NICK, &JOIN, &PART, &STATUS]
}

pub struct ChatCommandEngine {
    service: ServiceKind,
    bot_name: String,
    help_text: String,
    admins: Vec<String>,
    command_prefix: char,
    admin_target_prefix: char,
    command_period: Duration,
    command_limit: usize,
    single_user_mode: bool,
    table: Vec<&'static CommandSpec>,
    store: Arc<UserStore>,
    scheduler_status: Option<Arc<dyn SchedulerStatus>>,
    channel_control: Option<Arc<dyn ChannelControl>>,
    rate_limits: Mutex<HashMap<SourceIdent, VecDeque<Instant>>>,
}

impl ChatCommandEngine {
    pub fn new(
        service: ServiceKind,
        bot_name: String,
        help_text: String,
        admins: Vec<String>,
        command_period: Duration,
        command_limit: usize,
        single_user_mode: bool,
        store: Arc<UserStore>,
    ) -> Self {
        let table = match service {
            ServiceKind::Webtiles => webtiles_commands(),
            ServiceKind::Tv => tv_commands(),
        };
        ChatCommandEngine {
            service,
            bot_name,
            help_text,
            admins: admins.into_iter().map(|a| a.to_lowercase()).collect(),
            command_prefix: '!',
            admin_target_prefix: '^',
            command_period,
            command_limit,
            single_user_mode,
            table,
            store,
            scheduler_status: None,
            channel_control: None,
            rate_limits: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_scheduler_status(mut self, status: Arc<dyn SchedulerStatus>) -> Self {
        self.scheduler_status = Some(status);
        self
    }

    pub fn with_channel_control(mut self, control: Arc<dyn ChannelControl>) -> Self {
        self.channel_control = Some(control);
        self
    }

    fn is_admin(&self, user: &str) -> bool {
        self.admins.iter().any(|a| a == &user.to_lowercase())
    }

    fn table_name(&self) -> &'static str {
        match self.service {
            ServiceKind::Webtiles => schema::WEBTILES_USERS.name,
            ServiceKind::Tv => schema::TV_USERS.name,
        }
    }

    fn parse(&self, message: &str) -> Option<(String, Vec<String>)> {
        let trimmed = message.trim_end();
        if !trimmed.starts_with(self.command_prefix) {
            return None;
        }
        let rest = &trimmed[self.command_prefix.len_utf8()..];
        let mut tokens = rest.split_whitespace();
        let first = tokens.next()?;
        let mut command = first.to_lowercase();
        if command == "help" || command == self.bot_name.to_lowercase() {
            command = "bothelp".to_string();
        }
        let args = tokens.map(|s| s.to_string()).collect();
        Some((command, args))
    }

    /// Records this attempt in the source's rolling window and reports
    /// whether it should be let through. Non-admins over `command_limit`
    /// within `command_period` are denied; the attempt is still recorded,
    /// per the spec's "failed parsing still counts toward the limit" note.
    fn check_rate_limit(&self, ident: SourceIdent, sender: &str) -> bool {
        let now = Instant::now();
        let mut limits = self.rate_limits.lock().unwrap();
        let window = limits.entry(ident).or_default();
        window.retain(|t| now.duration_since(*t) < self.command_period);
        window.push_back(now);
        self.is_admin(sender) || window.len() <= self.command_limit
    }

    /// Whether `message` looks like a command at all, i.e. starts with the
    /// configured prefix. Lets a chat source decide whether to dispatch to
    /// this engine or fall through to query-pattern matching instead.
    pub fn is_command(&self, message: &str) -> bool {
        message.trim_end().starts_with(self.command_prefix)
    }

    fn usage(&self, spec: &CommandSpec) -> String {
        let mut msg = format!("Usage: !{} {}", self.bot_name, spec.name);
        if let Some(arg) = spec.args.first() {
            msg.push_str(&format!(" [{}]", arg.description));
        }
        msg
    }

    pub async fn handle_chat_line(&self, source: Arc<dyn ChatSource>, sender: &str, message: &str) {
        if sender.eq_ignore_ascii_case(&self.bot_name) || source.is_disallowed_user(sender) {
            return;
        }

        let Some((command, args)) = self.parse(message) else {
            return;
        };

        if !self.check_rate_limit(source.source_ident(), sender) {
            info!(sender, command, "chat command ignored: rate limit exceeded");
            return;
        }

        match self.process(&source, sender, &command, args).await {
            Ok(CommandOutcome::Ok) => {}
            Ok(CommandOutcome::UserFacing(msg)) => source.send_chat(&msg, ChatKind::Normal),
            Err(e) => error!(sender, command, error = %e, "chat command failed"),
        }
    }

    async fn process(
        &self,
        source: &Arc<dyn ChatSource>,
        sender: &str,
        command: &str,
        mut args: Vec<String>,
    ) -> Result<CommandOutcome, BeemError> {
        let Some(spec) = self.table.iter().find(|c| c.name == command) else {
            return Ok(CommandOutcome::UserFacing(format!(
                "Unknown command. Type !{} help for assistance",
                self.bot_name
            )));
        };

        let admin = self.is_admin(sender);

        if spec.require_admin && !admin {
            return Ok(CommandOutcome::UserFacing("This command is for admins only.".into()));
        }
        if spec.disallow_single_user_mode && self.single_user_mode {
            return Ok(CommandOutcome::UserFacing(
                "This command is unavailable while the bot is in single-user mode.".into(),
            ));
        }
        if spec.require_bot_source && !source.is_bot_channel() {
            return Ok(CommandOutcome::UserFacing(
                "This command can only be used in the bot's own channel.".into(),
            ));
        }
        if spec.require_user_source && source.is_bot_channel() {
            return Ok(CommandOutcome::UserFacing(
                "This command can only be used from your own session.".into(),
            ));
        }

        let target_user = if !args.is_empty() && args[0].starts_with(self.admin_target_prefix) {
            if !admin {
                return Ok(CommandOutcome::UserFacing(
                    "Only admins may target another user's account.".into(),
                ));
            }
            let name = args.remove(0);
            let name = &name[self.admin_target_prefix.len_utf8()..];
            if name.is_empty() {
                return Ok(CommandOutcome::UserFacing("Expected a user name after ^.".into()));
            }
            name.to_lowercase()
        } else {
            sender.to_lowercase()
        };

        if args.len() > spec.args.len() {
            return Ok(CommandOutcome::UserFacing(self.usage(spec)));
        }
        for (i, arg_spec) in spec.args.iter().enumerate() {
            match args.get(i) {
                Some(value) => {
                    if let Some(pattern) = arg_spec.pattern {
                        let re = Regex::new(pattern).expect("built-in arg patterns are valid");
                        if !re.is_match(value) {
                            return Ok(CommandOutcome::UserFacing(self.usage(spec)));
                        }
                    }
                }
                None if arg_spec.required => return Ok(CommandOutcome::UserFacing(self.usage(spec))),
                None => {}
            }
        }

        self.execute(spec.name, source, &target_user, &args, admin).await
    }

    async fn execute(
        &self,
        command: &str,
        source: &Arc<dyn ChatSource>,
        target_user: &str,
        args: &[String],
        admin: bool,
    ) -> Result<CommandOutcome, BeemError> {
        match command {
            "bothelp" => self.cmd_bothelp(source),
            "nick" => self.cmd_nick(source, target_user, args.first()).await,
            "subscribe" => self.cmd_subscribe(source, target_user).await,
            "unsubscribe" => self.cmd_unsubscribe(source, target_user).await,
            "twitch-user" => self.cmd_twitch_user(source, target_user, args.first(), admin).await,
            "twitch-reminder" => self.cmd_twitch_reminder(source, target_user, args.first()).await,
            "player-only" => self.cmd_player_only(source, target_user, args.first()).await,
            "join" => self.cmd_join(source, args.first()),
            "part" => self.cmd_part(source, args.first()),
            "status" => self.cmd_status(source),
            other => Err(BeemError::NotFound(format!("no handler wired for command {other}"))),
        }
    }

    fn cmd_bothelp(&self, source: &Arc<dyn ChatSource>) -> Result<CommandOutcome, BeemError> {
        let text = self.help_text.replace('\n', " ").replace("%n", &self.bot_name);
        source.send_chat(&text, ChatKind::Normal);
        Ok(CommandOutcome::Ok)
    }

    async fn cmd_nick(
        &self,
        source: &Arc<dyn ChatSource>,
        target_user: &str,
        nick: Option<&String>,
    ) -> Result<CommandOutcome, BeemError> {
        let table = self.table_name();
        match nick {
            None => {
                let row = self.store.get_row(table, target_user);
                let text = if row.is_empty() || row.text("nick").is_empty() {
                    format!("No nick for user {target_user}")
                } else {
                    format!("Nick for user {}: {}", target_user, row.text("nick"))
                };
                source.send_chat(&text, ChatKind::Normal);
            }
            Some(nick) => {
                if !self.store.contains(table, target_user) {
                    self.store.add_row(table, target_user).await?;
                }
                self.store
                    .set_row_field(table, target_user, "nick", FieldValue::Text(nick.clone()))
                    .await?;
                source.send_chat(&format!("Nick for user {target_user} set to {nick}"), ChatKind::Normal);
            }
        }
        Ok(CommandOutcome::Ok)
    }

    async fn cmd_subscribe(
        &self,
        source: &Arc<dyn ChatSource>,
        target_user: &str,
    ) -> Result<CommandOutcome, BeemError> {
        let table = self.table_name();
        if !self.store.contains(table, target_user) {
            self.store.add_row(table, target_user).await?;
        }
        self.store
            .set_row_field(table, target_user, "subscription", FieldValue::Int(1))
            .await?;
        source.send_chat(&format!("{target_user} is now subscribed."), ChatKind::Normal);
        Ok(CommandOutcome::Ok)
    }

    async fn cmd_unsubscribe(
        &self,
        source: &Arc<dyn ChatSource>,
        target_user: &str,
    ) -> Result<CommandOutcome, BeemError> {
        let table = self.table_name();
        if !self.store.contains(table, target_user) {
            self.store.add_row(table, target_user).await?;
        }
        self.store
            .set_row_field(table, target_user, "subscription", FieldValue::Int(-1))
            .await?;
        let mut text = format!("{target_user} is now unsubscribed.");
        if source.player_nick().as_deref() == Some(target_user) {
            text.push_str(" Farewell!");
        }
        source.send_chat(&text, ChatKind::Normal);
        Ok(CommandOutcome::Ok)
    }

    async fn cmd_twitch_user(
        &self,
        source: &Arc<dyn ChatSource>,
        target_user: &str,
        handle: Option<&String>,
        admin: bool,
    ) -> Result<CommandOutcome, BeemError> {
        let table = self.table_name();
        match handle {
            None => {
                let row = self.store.get_row(table, target_user);
                let text = if row.is_empty() || row.text("twitch_username").is_empty() {
                    format!("No Twitch username linked for {target_user}")
                } else {
                    format!("Twitch username for {}: {}", target_user, row.text("twitch_username"))
                };
                source.send_chat(&text, ChatKind::Normal);
                Ok(CommandOutcome::Ok)
            }
            Some(_) if !admin => Ok(CommandOutcome::UserFacing(
                "Twitch usernames for WebTiles accounts must be set by an admin.".into(),
            )),
            Some(handle) => {
                if !self.store.contains(table, target_user) {
                    self.store.add_row(table, target_user).await?;
                }
                self.store
                    .set_row_field(table, target_user, "twitch_username", FieldValue::Text(handle.clone()))
                    .await?;
                source.send_chat(
                    &format!("Twitch username for {target_user} set to {handle}"),
                    ChatKind::Normal,
                );
                Ok(CommandOutcome::Ok)
            }
        }
    }

    async fn cmd_twitch_reminder(
        &self,
        source: &Arc<dyn ChatSource>,
        target_user: &str,
        setting: Option<&String>,
    ) -> Result<CommandOutcome, BeemError> {
        self.toggle_flag(source, target_user, "twitch_reminder", setting, "Twitch reminder").await
    }

    async fn cmd_player_only(
        &self,
        source: &Arc<dyn ChatSource>,
        target_user: &str,
        setting: Option<&String>,
    ) -> Result<CommandOutcome, BeemError> {
        self.toggle_flag(source, target_user, "player_only", setting, "Player-only mode").await
    }

    async fn toggle_flag(
        &self,
        source: &Arc<dyn ChatSource>,
        target_user: &str,
        field: &str,
        setting: Option<&String>,
        label: &str,
    ) -> Result<CommandOutcome, BeemError> {
        let table = self.table_name();
        match setting {
            None => {
                let row = self.store.get_row(table, target_user);
                let state = if row.int(field) != 0 { "on" } else { "off" };
                source.send_chat(&format!("{label} for {target_user} is {state}."), ChatKind::Normal);
            }
            Some(value) => {
                if !self.store.contains(table, target_user) {
                    self.store.add_row(table, target_user).await?;
                }
                let flag = value.eq_ignore_ascii_case("on");
                self.store
                    .set_row_field(table, target_user, field, FieldValue::Int(flag as i64))
                    .await?;
                let state = if flag { "on" } else { "off" };
                source.send_chat(&format!("{label} for {target_user} set to {state}."), ChatKind::Normal);
            }
        }
        Ok(CommandOutcome::Ok)
    }

    fn cmd_join(&self, source: &Arc<dyn ChatSource>, channel: Option<&String>) -> Result<CommandOutcome, BeemError> {
        let Some(channel) = channel else {
            return Ok(CommandOutcome::UserFacing(self.usage(&JOIN)));
        };
        match &self.channel_control {
            Some(control) => {
                control.enqueue_join(channel);
                source.send_chat(&format!("Queued join for {channel}"), ChatKind::Normal);
                Ok(CommandOutcome::Ok)
            }
            None => Ok(CommandOutcome::UserFacing("Channel management is not available.".into())),
        }
    }

    fn cmd_part(&self, source: &Arc<dyn ChatSource>, channel: Option<&String>) -> Result<CommandOutcome, BeemError> {
        let Some(channel) = channel else {
            return Ok(CommandOutcome::UserFacing(self.usage(&PART)));
        };
        match &self.channel_control {
            Some(control) => {
                control.enqueue_part(channel);
                source.send_chat(&format!("Parted {channel}"), ChatKind::Normal);
                Ok(CommandOutcome::Ok)
            }
            None => Ok(CommandOutcome::UserFacing("Channel management is not available.".into())),
        }
    }

    fn cmd_status(&self, source: &Arc<dyn ChatSource>) -> Result<CommandOutcome, BeemError> {
        let text = match &self.scheduler_status {
            Some(status) => status.status_report(),
            None => "No scheduler status is available.".to_string(),
        };
        source.send_chat(&text, ChatKind::Normal);
        Ok(CommandOutcome::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;

    struct FakeSource {
        ident: SourceIdent,
        bot_channel: bool,
        sent: StdMutex<Vec<(String, ChatKind)>>,
    }

    impl FakeSource {
        fn new(bot_channel: bool) -> Self {
            FakeSource {
                ident: SourceIdent { service: ServiceKind::Webtiles, id: 1 },
                bot_channel,
                sent: StdMutex::new(Vec::new()),
            }
        }
        fn last(&self) -> String {
            self.sent.lock().unwrap().last().unwrap().0.clone()
        }
    }

    impl ChatSource for FakeSource {
        fn send_chat(&self, message: &str, kind: ChatKind) {
            self.sent.lock().unwrap().push((message.to_string(), kind));
        }
        fn describe(&self) -> String {
            "fake".into()
        }
        fn source_ident(&self) -> SourceIdent {
            self.ident
        }
        fn dcss_nick(&self, user: &str) -> String {
            user.to_string()
        }
        fn chat_dcss_nicks(&self, _requester: &str) -> HashSet<String> {
            HashSet::new()
        }
        fn is_bot_channel(&self) -> bool {
            self.bot_channel
        }
    }

    async fn engine() -> ChatCommandEngine {
        let store = Arc::new(UserStore::load(Path::new(":memory:")).await.unwrap());
        ChatCommandEngine::new(
            ServiceKind::Webtiles,
            "gammabot".into(),
            "Hi, I'm %n!".into(),
            vec!["admin1".into()],
            Duration::from_secs(60),
            3,
            false,
            store,
        )
    }

    async fn tv_engine() -> ChatCommandEngine {
        let store = Arc::new(UserStore::load(Path::new(":memory:")).await.unwrap());
        ChatCommandEngine::new(
            ServiceKind::Tv,
            "gammabot".into(),
            "Hi, I'm %n!".into(),
            vec!["admin1".into()],
            Duration::from_secs(60),
            3,
            false,
            store,
        )
    }

    #[tokio::test]
    async fn bothelp_replaces_bot_name() {
        let engine = engine().await;
        let source = Arc::new(FakeSource::new(false));
        let dyn_source: Arc<dyn ChatSource> = source.clone();
        engine.handle_chat_line(dyn_source, "alice", "!help").await;
        assert_eq!(source.last(), "Hi, I'm gammabot!");
    }

    #[tokio::test]
    async fn own_sender_is_ignored() {
        let engine = engine().await;
        let source = Arc::new(FakeSource::new(false));
        let dyn_source: Arc<dyn ChatSource> = source.clone();
        engine.handle_chat_line(dyn_source, "GammaBot", "!help").await;
        assert!(source.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn nick_round_trips() {
        let engine = engine().await;
        let source = Arc::new(FakeSource::new(false));
        let dyn_source: Arc<dyn ChatSource> = source.clone();
        engine.handle_chat_line(dyn_source.clone(), "alice", "!nick Minmay").await;
        assert_eq!(source.last(), "Nick for user alice set to Minmay");
        engine.handle_chat_line(dyn_source, "alice", "!nick").await;
        assert_eq!(source.last(), "Nick for user alice: Minmay");
    }

    #[tokio::test]
    async fn admin_target_redirects_to_another_user() {
        let engine = engine().await;
        let source = Arc::new(FakeSource::new(false));
        let dyn_source: Arc<dyn ChatSource> = source.clone();
        engine.handle_chat_line(dyn_source, "admin1", "!nick ^bob Sparky").await;
        assert_eq!(source.last(), "Nick for user bob set to Sparky");
    }

    #[tokio::test]
    async fn non_admin_cannot_redirect() {
        let engine = engine().await;
        let source = Arc::new(FakeSource::new(false));
        let dyn_source: Arc<dyn ChatSource> = source.clone();
        engine.handle_chat_line(dyn_source, "alice", "!nick ^bob Sparky").await;
        assert_eq!(source.last(), "Only admins may target another user's account.");
    }

    #[tokio::test]
    async fn rate_limit_silently_drops_excess_commands() {
        let engine = engine().await;
        let source = Arc::new(FakeSource::new(false));
        let dyn_source: Arc<dyn ChatSource> = source.clone();
        for _ in 0..3 {
            engine.handle_chat_line(dyn_source.clone(), "alice", "!help").await;
        }
        let count_before = source.sent.lock().unwrap().len();
        engine.handle_chat_line(dyn_source, "alice", "!help").await;
        let count_after = source.sent.lock().unwrap().len();
        assert_eq!(count_before, count_after);
    }

    #[tokio::test]
    async fn join_requires_bot_channel() {
        let engine = tv_engine().await;
        let source = Arc::new(FakeSource::new(false));
        let dyn_source: Arc<dyn ChatSource> = source.clone();
        engine.handle_chat_line(dyn_source, "admin1", "!join #dcss").await;
        assert_eq!(source.last(), "This command can only be used in the bot's own channel.");
    }
}
