//! WT (WebTiles) integration: a single lobby connection feeding [`WTLobby`],
//! one game session per watched player, and the scheduler that decides
//! which games get a slot.

pub mod lobby;
pub mod manager;
pub mod protocol;
pub mod scheduler;
pub mod session;

pub use lobby::{parse_version, meets_minimum_version, LobbyEntry, WTLobby};
pub use manager::WTManager;
pub use protocol::{inflate_frame, Frame, OutgoingMessage, WireMessage};
pub use scheduler::{can_watch_user, eligible_entries, is_ready_to_watch, pick_autowatch_candidate, should_drop_queue_entry, WatchQueueEntry, REWATCH_WAIT};
pub use session::{SessionConfig, SessionState, WTGameSession};
