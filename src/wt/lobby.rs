//! WTLobby: the live table of currently running games, fed by a single
//! WebSocket connection to the WT lobby endpoint.

use std::collections::HashMap;
use std::time::Instant;

/// One running game as reported by the lobby feed, keyed by the
/// lobby-assigned id (not `(username, game_id)` directly, since that's what
/// `lobby_remove` addresses).
#[derive(Debug, Clone)]
pub struct LobbyEntry {
    pub username: String,
    pub game_id: String,
    pub spectator_count: u64,
    pub idle_time: u64,
    pub time_last_update: Instant,
}

impl LobbyEntry {
    /// `idle_time` as reported, plus however long has elapsed since the
    /// last update we received for it.
    pub fn effective_idle(&self, now: Instant) -> u64 {
        self.idle_time + now.saturating_duration_since(self.time_last_update).as_secs()
    }
}

#[derive(Default)]
pub struct WTLobby {
    entries: HashMap<String, LobbyEntry>,
    complete: bool,
}

impl WTLobby {
    pub fn new() -> Self {
        WTLobby::default()
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn entries(&self) -> impl Iterator<Item = &LobbyEntry> {
        self.entries.values()
    }

    pub fn apply_entry(&mut self, id: String, username: String, game_id: String, spectator_count: u64, idle_time: u64) {
        self.entries.insert(
            id,
            LobbyEntry { username, game_id, spectator_count, idle_time, time_last_update: Instant::now() },
        );
    }

    pub fn apply_remove(&mut self, id: &str) {
        self.entries.remove(id);
    }

    pub fn apply_clear(&mut self) {
        self.entries.clear();
        self.complete = false;
    }

    pub fn apply_complete(&mut self) {
        self.complete = true;
    }
}

/// Parses a `game_id` like `crawl-0.32` into a comparable `(major, minor)`
/// pair. Returns `None` for anything that doesn't carry a recognizable
/// dotted version suffix, which the scheduler treats as ineligible.
pub fn parse_version(game_id: &str) -> Option<(u32, u32)> {
    let version = game_id.rsplit('-').next()?;
    let mut parts = version.split('.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Whether `game_id` meets the spec's "below 0.10" exclusion.
pub fn meets_minimum_version(game_id: &str) -> bool {
    match parse_version(game_id) {
        Some(version) => version >= (0, 10),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn version_0_10_is_eligible_0_09_is_not() {
        assert!(meets_minimum_version("crawl-0.10"));
        assert!(!meets_minimum_version("crawl-0.09"));
        assert!(meets_minimum_version("crawl-0.32"));
    }

    #[test]
    fn unparseable_version_is_ineligible() {
        assert!(!meets_minimum_version("crawl-trunk"));
    }

    #[test]
    fn effective_idle_adds_elapsed_time_since_last_update() {
        let entry = LobbyEntry {
            username: "alice".into(),
            game_id: "crawl-0.32".into(),
            spectator_count: 1,
            idle_time: 5,
            time_last_update: Instant::now() - Duration::from_secs(10),
        };
        assert_eq!(entry.effective_idle(Instant::now()), 15);
    }

    #[test]
    fn lobby_entry_lifecycle() {
        let mut lobby = WTLobby::new();
        lobby.apply_entry("1".into(), "alice".into(), "crawl-0.32".into(), 2, 0);
        assert_eq!(lobby.entries().count(), 1);

        lobby.apply_entry("1".into(), "alice".into(), "crawl-0.32".into(), 4, 0);
        assert_eq!(lobby.entries().next().unwrap().spectator_count, 4);

        lobby.apply_remove("1");
        assert_eq!(lobby.entries().count(), 0);

        lobby.apply_entry("2".into(), "bob".into(), "crawl-0.32".into(), 1, 0);
        lobby.apply_complete();
        assert!(lobby.is_complete());
        lobby.apply_clear();
        assert!(!lobby.is_complete());
        assert_eq!(lobby.entries().count(), 0);
    }
}
