//! A single joined TV (streaming chat) channel, exposed as a [`ChatSource`].

use super::TvManager;
use crate::chat_source::{ChatKind, ChatSource, SourceIdent};
use crate::user_store::{schema, UserStore};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tracing::warn;

pub struct TvChannel {
    ident: SourceIdent,
    name: String,
    store: Arc<UserStore>,
    manager: Weak<TvManager>,
}

impl TvChannel {
    pub fn new(ident: SourceIdent, name: String, store: Arc<UserStore>, manager: Weak<TvManager>) -> Self {
        TvChannel { ident, name, store, manager }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl ChatSource for TvChannel {
    fn send_chat(&self, message: &str, kind: ChatKind) {
        let Some(manager) = self.manager.upgrade() else {
            warn!(channel = %self.name, "TV: channel outlived its manager, dropping message");
            return;
        };
        let payload = match kind {
            ChatKind::Action => format!("/me {}", escape_outbound(message)),
            _ => escape_outbound(message),
        };
        let name = self.name.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.send_privmsg(&name, &payload, false).await {
                warn!(channel = %name, error = %e, "TV: send_chat failed");
            }
        });
    }

    fn describe(&self) -> String {
        format!("TV channel {}", self.name)
    }

    fn source_ident(&self) -> SourceIdent {
        self.ident
    }

    fn dcss_nick(&self, user: &str) -> String {
        let row = self.store.get_row(schema::TV_USERS.name, user);
        if row.is_empty() || row.text("nick").is_empty() {
            user.to_string()
        } else {
            row.text("nick").to_string()
        }
    }

    fn chat_dcss_nicks(&self, requester: &str) -> HashSet<String> {
        [self.dcss_nick(requester)].into_iter().collect()
    }

    fn is_bot_channel(&self) -> bool {
        false
    }
}

/// Neutralizes server-side command interpretation (`.`/`/` prefixes) and
/// escapes anything that would otherwise look like a bot command (`!`).
pub fn escape_outbound(message: &str) -> String {
    if message.starts_with('.') || message.starts_with('/') {
        let mut out = String::with_capacity(message.len() + 1);
        out.push(' ');
        out.push_str(message);
        out
    } else if message.starts_with('!') {
        format!("]{message}")
    } else {
        message.to_string()
    }
}
