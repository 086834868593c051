//! The `ChatSource` abstraction: anything that can receive a knowledge-bot
//! reply or a chat command and knows how to turn a DCSS username into the
//! right chat mention.
//!
//! Both the WT game session and the TV channel state implement this trait.
//! [`QueryRouter`](crate::query_router::QueryRouter) and
//! [`ChatCommandEngine`](crate::chat_command::ChatCommandEngine) are
//! written against the trait only, never against a concrete session type.

use std::collections::HashSet;

/// How a delivered message should be rendered in the destination chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Normal,
    Action,
    Monster,
    Repo,
}

/// Which service a source belongs to. Used only to route a [`SourceIdent`]
/// back to the right registry; never branched on for business logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Webtiles,
    Tv,
}

/// An opaque handle a [`ChatSource`] hands out so it can be re-resolved
/// later without the holder needing a strong reference to it.
///
/// This is the "index/handle resolved through a lookup map" the design
/// notes call for in place of a back-reference cycle between query router
/// and source managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceIdent {
    pub service: ServiceKind,
    pub id: u64,
}

pub trait ChatSource: Send + Sync {
    fn send_chat(&self, message: &str, kind: ChatKind);
    fn describe(&self) -> String;
    fn source_ident(&self) -> SourceIdent;
    /// The chat-facing nick for a DCSS username, e.g. prefixed with `@` on TV.
    fn dcss_nick(&self, user: &str) -> String;
    /// Nicks of everyone in this source's chat, for `$chat` substitution.
    /// `requester` is included even if the source only tracks spectators,
    /// per the `get_chat_dcss_nicks` contract.
    fn chat_dcss_nicks(&self, requester: &str) -> HashSet<String>;
    /// The DCSS nick of the player being watched, for `$p` substitution.
    /// `None` for sources with no single watched player (e.g. TV channels).
    fn player_nick(&self) -> Option<String> {
        None
    }
    /// Whether this source is the bot's own administrative channel, as
    /// opposed to a per-player WT game or a per-viewer TV session. Gates
    /// `join`/`part`/`status` in the chat command engine.
    fn is_bot_channel(&self) -> bool {
        false
    }
    /// Whether `user` is barred from issuing commands or triggering
    /// queries from this source (e.g. a muted or ignored chatter).
    fn is_disallowed_user(&self, _user: &str) -> bool {
        false
    }
}

/// Resolves a [`SourceIdent`] back to a live source. Owned by the
/// top-level orchestrator; [`QueryRouter`](crate::query_router::QueryRouter)
/// holds only a handle to implementations of this trait, never the
/// sources themselves.
pub trait SourceRegistry: Send + Sync {
    fn resolve(&self, ident: SourceIdent) -> Option<std::sync::Arc<dyn ChatSource>>;
}
