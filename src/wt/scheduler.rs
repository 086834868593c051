//! The watch-scheduler decision logic: which games get a subscriber slot,
//! which one (if any) wins the autowatch slot, and when queued watches are
//! dropped. Kept as pure functions over small, fully-materialized snapshots
//! so the tie-breaking and eligibility rules in the spec are directly
//! testable without a live lobby connection.

use super::lobby::{meets_minimum_version, LobbyEntry, WTLobby};
use crate::configuration::WebtilesSettings;
use crate::user_store::{schema, UserStore};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct WatchQueueEntry {
    pub username: String,
    pub game_id: String,
    pub time_end: Option<Instant>,
}

/// How long after a session ends the scheduler still considers the queue
/// entry "fresh enough" to retry, per the spec's `REWATCH_WAIT`.
pub const REWATCH_WAIT: Duration = Duration::from_secs(5);

/// Whether `username` is eligible to be watched at all: not blocked
/// (`subscription = -1`), not on `never_watch`, and — in single-user mode —
/// the one configured user.
pub fn can_watch_user(username: &str, store: &UserStore, settings: &WebtilesSettings) -> bool {
    if let Some(only) = &settings.watch_username {
        if !only.eq_ignore_ascii_case(username) {
            return false;
        }
    }
    if settings.never_watch.iter().any(|u| u.eq_ignore_ascii_case(username)) {
        return false;
    }
    let row = store.get_row(schema::WEBTILES_USERS.name, username);
    row.int("subscription") != -1
}

pub fn is_subscribed(username: &str, store: &UserStore) -> bool {
    store.get_row(schema::WEBTILES_USERS.name, username).int("subscription") == 1
}

/// A lobby entry judged eligible for scheduling consideration: not idle
/// past `max_game_idle`, version-eligible, and the user is allowed to be
/// watched at all.
pub fn eligible_entries<'a>(
    lobby: &'a WTLobby,
    store: &UserStore,
    settings: &WebtilesSettings,
    now: Instant,
) -> Vec<&'a LobbyEntry> {
    lobby
        .entries()
        .filter(|e| can_watch_user(&e.username, store, settings))
        .filter(|e| meets_minimum_version(&e.game_id))
        .filter(|e| e.effective_idle(now) < settings.max_game_idle)
        .collect()
}

/// Picks the single autowatch candidate for this tick, applying the spec's
/// tie-break rule: the incumbent autowatch wins equal-spectator ties over
/// every other candidate; otherwise strict-greater spectator count wins.
pub fn pick_autowatch_candidate<'a>(
    candidates: &[&'a LobbyEntry],
    current_autowatch: Option<(&str, &str)>,
    min_autowatch_spectators: u64,
    subscriber_slots_full: bool,
    store: &UserStore,
) -> Option<(&'a str, &'a str)> {
    let mut best: Option<&LobbyEntry> = None;
    for entry in candidates {
        if entry.spectator_count < min_autowatch_spectators {
            continue;
        }
        let subscribed = is_subscribed(&entry.username, store);
        if subscribed && !subscriber_slots_full {
            continue;
        }

        let is_incumbent = current_autowatch == Some((entry.username.as_str(), entry.game_id.as_str()));
        best = match best {
            None => Some(entry),
            Some(current_best) => {
                let current_is_incumbent =
                    current_autowatch == Some((current_best.username.as_str(), current_best.game_id.as_str()));
                if is_incumbent && entry.spectator_count >= current_best.spectator_count {
                    Some(entry)
                } else if current_is_incumbent && entry.spectator_count <= current_best.spectator_count {
                    Some(current_best)
                } else if entry.spectator_count > current_best.spectator_count {
                    Some(entry)
                } else {
                    Some(current_best)
                }
            }
        };
    }
    best.map(|e| (e.username.as_str(), e.game_id.as_str()))
}

/// Whether a queue entry should be dropped outright this tick: user no
/// longer allowed, its lobby entry went idle, or (with no current lobby
/// entry) the post-end cooldown has exceeded `game_rewatch_timeout`.
pub fn should_drop_queue_entry(
    entry: &WatchQueueEntry,
    lobby: &WTLobby,
    store: &UserStore,
    settings: &WebtilesSettings,
    now: Instant,
) -> bool {
    if !can_watch_user(&entry.username, store, settings) {
        return true;
    }
    let live = lobby
        .entries()
        .find(|e| e.username == entry.username && e.game_id == entry.game_id);
    match live {
        Some(live) => live.effective_idle(now) >= settings.max_game_idle,
        None => match entry.time_end {
            Some(time_end) => now.saturating_duration_since(time_end) > Duration::from_secs(settings.game_rewatch_timeout),
            None => false,
        },
    }
}

/// Whether a queued, session-less entry is ready to be promoted to an
/// open subscriber slot: its lobby entry exists and the post-end cooldown
/// (if any) has elapsed.
pub fn is_ready_to_watch(entry: &WatchQueueEntry, lobby: &WTLobby, now: Instant) -> bool {
    let has_lobby_entry = lobby
        .entries()
        .any(|e| e.username == entry.username && e.game_id == entry.game_id);
    if !has_lobby_entry {
        return false;
    }
    match entry.time_end {
        Some(time_end) => now.saturating_duration_since(time_end) >= REWATCH_WAIT,
        None => true,
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
            max_watched_subscribers: 2,
            max_game_idle: 300,
            game_rewatch_timeout: 60,
            autowatch_enabled: true,
            min_autowatch_spectators: 3,
            greeting_text: None,
            twitch_reminder_text: None,
            twitch_reminder_period: 3600,
            never_watch: vec!["blocked_user".into()],
            admins: vec![],
            watch_username: None,
            command_period: 10,
            command_limit: 3,
        }
    }

    fn entry(username: &str, game_id: &str, spectators: u64) -> LobbyEntry {
        LobbyEntry {
            username: username.into(),
            game_id: game_id.into(),
            spectator_count: spectators,
            idle_time: 0,
            time_last_update: Instant::now(),
        }
    }

    async fn store() -> UserStore {
        UserStore::load(Path::new(":memory:")).await.unwrap()
    }

    #[tokio::test]
    async fn never_watch_list_blocks_eligibility() {
        let store = store().await;
        let settings = settings();
        assert!(!can_watch_user("blocked_user", &store, &settings));
        assert!(can_watch_user("alice", &store, &settings));
    }

    #[tokio::test]
    async fn subscription_minus_one_blocks_eligibility() {
        let store = store().await;
        store.add_row(schema::WEBTILES_USERS.name, "eve").await.unwrap();
        store
            .set_row_field(schema::WEBTILES_USERS.name, "eve", "subscription", crate::user_store::FieldValue::Int(-1))
            .await
            .unwrap();
        assert!(!can_watch_user("eve", &store, &settings()));
    }

    #[tokio::test]
    async fn single_user_mode_restricts_to_one_username() {
        let mut settings = settings();
        settings.watch_username = Some("alice".into());
        let store = store().await;
        assert!(can_watch_user("alice", &store, &settings));
        assert!(!can_watch_user("bob", &store, &settings));
    }

    #[tokio::test]
    async fn autowatch_tie_favors_incumbent() {
        let store = store().await;
        let alice = entry("alice", "crawl-0.32", 5);
        let carol = entry("carol", "crawl-0.32", 5);
        let candidates = vec![&alice, &carol];
        let pick = pick_autowatch_candidate(&candidates, Some(("carol", "crawl-0.32")), 3, true, &store);
        assert_eq!(pick, Some(("carol", "crawl-0.32")));
    }

    #[tokio::test]
    async fn strict_surplus_evicts_incumbent() {
        let store = store().await;
        let incumbent = entry("carol", "crawl-0.32", 4);
        let challenger = entry("dave", "crawl-0.32", 9);
        let candidates = vec![&incumbent, &challenger];
        let pick = pick_autowatch_candidate(&candidates, Some(("carol", "crawl-0.32")), 3, true, &store);
        assert_eq!(pick, Some(("dave", "crawl-0.32")));
    }

    #[tokio::test]
    async fn below_spectator_threshold_does_not_compete() {
        let store = store().await;
        let low = entry("alice", "crawl-0.32", 1);
        let candidates = vec![&low];
        let pick = pick_autowatch_candidate(&candidates, None, 3, true, &store);
        assert_eq!(pick, None);
    }

    #[tokio::test]
    async fn subscribed_user_only_competes_when_slots_are_full() {
        let store = store().await;
        store.add_row(schema::WEBTILES_USERS.name, "alice").await.unwrap();
        store
            .set_row_field(schema::WEBTILES_USERS.name, "alice", "subscription", crate::user_store::FieldValue::Int(1))
            .await
            .unwrap();
        let alice = entry("alice", "crawl-0.32", 10);
        let candidates = vec![&alice];

        let pick_with_open_slots = pick_autowatch_candidate(&candidates, None, 3, false, &store);
        assert_eq!(pick_with_open_slots, None);

        let pick_with_full_slots = pick_autowatch_candidate(&candidates, None, 3, true, &store);
        assert_eq!(pick_with_full_slots, Some(("alice", "crawl-0.32")));
    }

    #[tokio::test]
    async fn queue_entry_with_no_lobby_entry_drops_after_rewatch_timeout() {
        let store = store().await;
        let settings = settings();
        let lobby = WTLobby::new();
        let entry = WatchQueueEntry {
            username: "alice".into(),
            game_id: "crawl-0.32".into(),
            time_end: Some(Instant::now() - Duration::from_secs(settings.game_rewatch_timeout + 1)),
        };
        assert!(should_drop_queue_entry(&entry, &lobby, &store, &settings, Instant::now()));
    }

    #[tokio::test]
    async fn queue_entry_waits_for_rewatch_cooldown_before_reattempt() {
        let mut lobby = WTLobby::new();
        lobby.apply_entry("1".into(), "alice".into(), "crawl-0.32".into(), 2, 0);
        let entry = WatchQueueEntry { username: "alice".into(), game_id: "crawl-0.32".into(), time_end: Some(Instant::now()) };
        assert!(!is_ready_to_watch(&entry, &lobby, Instant::now()));
        let entry_after_cooldown = WatchQueueEntry {
            username: "alice".into(),
            game_id: "crawl-0.32".into(),
            time_end: Some(Instant::now() - REWATCH_WAIT - Duration::from_secs(1)),
        };
        assert!(is_ready_to_watch(&entry_after_cooldown, &lobby, Instant::now()));
    }
}
