//! Session lifecycle: open, close, archive.
//!
//! A session is the aggregation window the UI reads. Battle mode bounds it
//! by combat edges and an idle timeout, zone mode by the observed zone
//! server, manual mode by explicit control input. Closed sessions are
//! frozen (ticks compacted to totals) and pushed onto a bounded history
//! ring, newest first.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::capture::Endpoint;

use super::aggregate::Stats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Battle,
    Zone,
    Manual,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Mode::Battle => "battle",
            Mode::Zone => "zone",
            Mode::Manual => "manual",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    CombatState,
    Idle,
    ZoneChange,
    ManualStop,
    ModeChange,
    ArchiveNow,
    StreamEnd,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::CombatState => "combat_state",
            CloseReason::Idle => "idle",
            CloseReason::ZoneChange => "zone_change",
            CloseReason::ManualStop => "manual_stop",
            CloseReason::ModeChange => "mode_change",
            CloseReason::ArchiveNow => "archive_now",
            CloseReason::StreamEnd => "stream_end",
        }
    }
}

#[derive(Debug)]
pub struct LiveSession {
    pub id: u64,
    pub mode: Mode,
    pub started_at: f64,
    pub endpoint: Option<Endpoint>,
    pub per_actor: BTreeMap<String, Stats>,
    pub fame: u64,
    pub last_attributed: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActorTotals {
    pub damage: u64,
    pub heal: u64,
}

/// A frozen session. Immutable except for late-join backfill merges, which
/// only add to actor totals.
#[derive(Debug, Clone)]
pub struct ArchivedSession {
    pub id: u64,
    pub mode: Mode,
    pub label: String,
    pub started_at: f64,
    pub ended_at: f64,
    pub endpoint: Option<Endpoint>,
    pub actors: BTreeMap<String, ActorTotals>,
    pub fame: u64,
    pub reason: CloseReason,
}

impl ArchivedSession {
    pub fn duration(&self) -> f64 {
        (self.ended_at - self.started_at).max(0.0)
    }
}

pub struct SessionManager {
    mode: Mode,
    battle_timeout_s: f64,
    history_cap: usize,
    live: Option<LiveSession>,
    history: VecDeque<ArchivedSession>,
    next_id: u64,
    battle_seq: u32,
    manual_seq: u32,
    manual_active: bool,
    zone: Option<(Endpoint, String)>,
    last_seen: f64,
}

impl SessionManager {
    pub fn new(mode: Mode, battle_timeout_s: f64, history_cap: usize) -> Self {
        Self {
            mode,
            battle_timeout_s,
            history_cap: history_cap.max(1),
            live: None,
            history: VecDeque::new(),
            next_id: 1,
            battle_seq: 0,
            manual_seq: 0,
            manual_active: false,
            zone: None,
            last_seen: 0.0,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn live(&self) -> Option<&LiveSession> {
        self.live.as_ref()
    }

    pub fn live_mut(&mut self) -> Option<&mut LiveSession> {
        self.live.as_mut()
    }

    pub fn history(&self) -> &VecDeque<ArchivedSession> {
        &self.history
    }

    pub fn zone_label(&self) -> Option<&str> {
        self.zone.as_ref().map(|(_, label)| label.as_str())
    }

    pub fn manual_active(&self) -> bool {
        self.manual_active
    }

    pub fn set_mode(&mut self, mode: Mode, now: f64) {
        if mode == self.mode {
            return;
        }
        self.close(CloseReason::ModeChange, now);
        tracing::info!(%mode, "session mode changed");
        self.mode = mode;
        self.manual_active = false;
        if self.mode == Mode::Zone && self.zone.is_some() {
            self.open(now);
        }
    }

    /// Toggle the manual session. Returns the new active state; a no-op
    /// outside manual mode.
    pub fn manual_toggle(&mut self, now: f64) -> bool {
        if self.mode != Mode::Manual {
            return false;
        }
        if self.manual_active {
            self.manual_active = false;
            self.close(CloseReason::ManualStop, now);
            false
        } else {
            self.manual_active = true;
            self.open(now);
            true
        }
    }

    pub fn archive_now(&mut self, now: f64) {
        self.manual_active = false;
        self.close(CloseReason::ArchiveNow, now);
    }

    /// Stream is over; freeze whatever is live.
    pub fn finalize(&mut self) {
        let end = self
            .live
            .as_ref()
            .and_then(|live| live.last_attributed)
            .unwrap_or(self.last_seen);
        self.close(CloseReason::StreamEnd, end);
    }

    /// Track the zone server this capture is talking to. A change closes
    /// the zone-keyed session and opens the next one.
    pub fn observe_zone(&mut self, endpoint: Endpoint, label: String, now: f64) {
        match &self.zone {
            None => {
                self.zone = Some((endpoint, label));
                if self.mode == Mode::Zone {
                    self.open(now);
                }
            }
            Some((current, _)) if *current != endpoint => {
                let previous = self.zone.take().map(|(_, label)| label);
                tracing::info!(zone = %label, "zone endpoint changed");
                self.zone = Some((endpoint, label));
                if self.mode == Mode::Zone {
                    self.close_labeled(CloseReason::ZoneChange, now, previous);
                    self.open(now);
                }
            }
            Some(_) => {}
        }
    }

    /// Explicit zone-change signal (world-join response). The endpoint may
    /// not change, so re-key on the next observed packet.
    pub fn zone_changed(&mut self, now: f64) {
        let previous = self.zone.take().map(|(_, label)| label);
        if self.mode == Mode::Zone {
            self.close_labeled(CloseReason::ZoneChange, now, previous);
        }
    }

    /// Attribute a delta. Opens a session where the mode allows it.
    pub fn record(&mut self, ts: f64, name: &str, damage: u64, heal: u64) {
        if self.mode == Mode::Manual && !self.manual_active {
            return;
        }
        self.last_seen = self.last_seen.max(ts);
        if self.live.is_none() {
            self.open(ts);
        }
        if let Some(live) = &mut self.live {
            live.per_actor
                .entry(name.to_owned())
                .or_default()
                .record(ts, damage, heal);
            live.last_attributed = Some(live.last_attributed.unwrap_or(ts).max(ts));
        }
    }

    /// Apply a replayed deferred delta at its original timestamp.
    ///
    /// Falls into the archived session covering the timestamp when the live
    /// one does not; otherwise records live (opening a session at the
    /// original timestamp if none is active).
    pub fn backfill(&mut self, ts: f64, name: &str, damage: u64, heal: u64) {
        let live_covers = self
            .live
            .as_ref()
            .map(|live| ts >= live.started_at)
            .unwrap_or(false);
        if !live_covers {
            for archived in self.history.iter_mut() {
                if ts >= archived.started_at && ts <= archived.ended_at {
                    let totals = archived.actors.entry(name.to_owned()).or_default();
                    totals.damage += damage;
                    totals.heal += heal;
                    return;
                }
            }
        }
        self.record(ts, name, damage, heal);
    }

    /// Local-player combat edge; drives battle-mode boundaries only.
    pub fn combat_state_self(&mut self, in_combat: bool, ts: f64) {
        if self.mode != Mode::Battle {
            return;
        }
        self.last_seen = self.last_seen.max(ts);
        if in_combat {
            if self.live.is_none() {
                self.open(ts);
            }
        } else {
            let end = self
                .live
                .as_ref()
                .and_then(|live| live.last_attributed)
                .unwrap_or(ts)
                .min(ts);
            self.close(CloseReason::CombatState, end);
        }
    }

    pub fn add_fame(&mut self, fame: u64) {
        if let Some(live) = &mut self.live {
            live.fame += fame;
        }
    }

    /// Clock advance without events: battle idle timeout.
    pub fn tick(&mut self, now: f64) {
        self.last_seen = self.last_seen.max(now);
        if self.mode != Mode::Battle {
            return;
        }
        let Some(live) = &self.live else {
            return;
        };
        // A session opened by a combat edge may never see an attributable
        // event; the timeout then measures from the open.
        let last = live.last_attributed.unwrap_or(live.started_at);
        if now - last >= self.battle_timeout_s {
            tracing::info!("battle session idle timeout");
            self.close(CloseReason::Idle, last);
        }
    }

    fn open(&mut self, ts: f64) {
        if self.live.is_some() {
            return;
        }
        let id = self.next_id;
        self.next_id += 1;
        tracing::info!(id, mode = %self.mode, "session opened");
        self.live = Some(LiveSession {
            id,
            mode: self.mode,
            started_at: ts,
            endpoint: self.zone.as_ref().map(|(endpoint, _)| *endpoint),
            per_actor: BTreeMap::new(),
            fame: 0,
            last_attributed: None,
        });
    }

    fn close(&mut self, reason: CloseReason, end_ts: f64) {
        self.close_labeled(reason, end_ts, None);
    }

    fn close_labeled(&mut self, reason: CloseReason, end_ts: f64, zone_label: Option<String>) {
        let Some(mut live) = self.live.take() else {
            return;
        };
        // Nothing attributable happened: discard rather than archive noise.
        if live.per_actor.is_empty() && live.fame == 0 {
            return;
        }

        let label = match live.mode {
            Mode::Battle => {
                self.battle_seq += 1;
                format!("Battle {}", self.battle_seq)
            }
            Mode::Zone => zone_label
                .or_else(|| self.zone_label().map(str::to_owned))
                .unwrap_or_else(|| "unknown zone".to_owned()),
            Mode::Manual => {
                self.manual_seq += 1;
                format!("Manual {}", self.manual_seq)
            }
        };

        let mut actors = BTreeMap::new();
        for (name, stats) in &mut live.per_actor {
            stats.compact();
            actors.insert(
                name.clone(),
                ActorTotals {
                    damage: stats.damage,
                    heal: stats.heal,
                },
            );
        }

        let ended_at = end_ts.max(live.started_at);
        tracing::info!(
            id = live.id,
            label = %label,
            reason = reason.as_str(),
            "session archived"
        );
        self.history.push_front(ArchivedSession {
            id: live.id,
            mode: live.mode,
            label,
            started_at: live.started_at,
            ended_at,
            endpoint: live.endpoint,
            actors,
            fame: live.fame,
            reason,
        });
        while self.history.len() > self.history_cap {
            self.history.pop_back();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn endpoint(last: u8, port: u16) -> Endpoint {
        Endpoint::new(Ipv4Addr::new(10, 0, 0, last), port)
    }

    fn battle_manager() -> SessionManager {
        SessionManager::new(Mode::Battle, 20.0, 20)
    }

    #[test]
    fn battle_session_opens_on_first_delta() {
        let mut sessions = battle_manager();
        sessions.record(1.0, "Alice", 100, 0);
        let live = sessions.live().expect("live session");
        assert_eq!(live.started_at, 1.0);
        assert_eq!(live.per_actor["Alice"].damage, 100);
    }

    #[test]
    fn battle_idle_timeout_archives_with_label() {
        let mut sessions = SessionManager::new(Mode::Battle, 5.0, 20);
        sessions.record(0.0, "Alice", 100, 0);
        sessions.tick(4.9);
        assert!(sessions.live().is_some());
        sessions.tick(5.1);
        assert!(sessions.live().is_none());

        let history = sessions.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].label, "Battle 1");
        assert_eq!(history[0].actors["Alice"].damage, 100);
        assert_eq!(history[0].reason, CloseReason::Idle);
        // Idle close ends at the last attributed event, not the tick.
        assert_eq!(history[0].ended_at, 0.0);
    }

    #[test]
    fn combat_opened_session_times_out_without_events() {
        // The combat-false edge can be lost (disconnect); the timeout must
        // still reap a session that never attributed anything.
        let mut sessions = SessionManager::new(Mode::Battle, 5.0, 20);
        sessions.combat_state_self(true, 1.0);
        assert!(sessions.live().is_some());

        sessions.tick(5.9);
        assert!(sessions.live().is_some());
        sessions.tick(6.1);
        assert!(sessions.live().is_none());
        // Nothing was attributed, so nothing is archived either.
        assert!(sessions.history().is_empty());
    }

    #[test]
    fn combat_edges_bound_battle_sessions() {
        let mut sessions = battle_manager();
        sessions.combat_state_self(true, 1.0);
        sessions.record(2.0, "Alice", 50, 0);
        sessions.combat_state_self(false, 3.0);
        assert!(sessions.live().is_none());
        assert_eq!(sessions.history()[0].label, "Battle 1");
        assert_eq!(sessions.history()[0].reason, CloseReason::CombatState);
    }

    #[test]
    fn empty_sessions_are_discarded() {
        let mut sessions = battle_manager();
        sessions.combat_state_self(true, 1.0);
        sessions.combat_state_self(false, 2.0);
        assert!(sessions.history().is_empty());

        // The next real battle still gets number 1.
        sessions.record(3.0, "Alice", 10, 0);
        sessions.combat_state_self(false, 4.0);
        assert_eq!(sessions.history()[0].label, "Battle 1");
    }

    #[test]
    fn zone_mode_keys_sessions_by_endpoint() {
        let mut sessions = SessionManager::new(Mode::Zone, 20.0, 20);
        sessions.observe_zone(endpoint(1, 5056), "Old Town".into(), 0.0);
        sessions.record(1.0, "Alice", 100, 0);
        sessions.observe_zone(endpoint(2, 5056), "Harbor".into(), 10.0);

        assert_eq!(sessions.history().len(), 1);
        assert_eq!(sessions.history()[0].label, "Old Town");
        let live = sessions.live().expect("new zone session");
        assert_eq!(live.started_at, 10.0);
        assert_eq!(sessions.zone_label(), Some("Harbor"));
    }

    #[test]
    fn manual_mode_ignores_deltas_until_toggled() {
        let mut sessions = SessionManager::new(Mode::Manual, 20.0, 20);
        sessions.record(1.0, "Alice", 100, 0);
        assert!(sessions.live().is_none());

        assert!(sessions.manual_toggle(2.0));
        sessions.record(3.0, "Alice", 100, 0);
        assert!(!sessions.manual_toggle(4.0));
        assert_eq!(sessions.history()[0].label, "Manual 1");
        assert_eq!(sessions.history()[0].actors["Alice"].damage, 100);
    }

    #[test]
    fn mode_change_archives_current_session() {
        let mut sessions = battle_manager();
        sessions.record(1.0, "Alice", 100, 0);
        sessions.set_mode(Mode::Manual, 2.0);
        assert!(sessions.live().is_none());
        assert_eq!(sessions.history()[0].reason, CloseReason::ModeChange);
    }

    #[test]
    fn history_ring_evicts_oldest() {
        let mut sessions = SessionManager::new(Mode::Battle, 20.0, 2);
        for i in 0..3 {
            let base = f64::from(i) * 10.0;
            sessions.record(base, "Alice", 10, 0);
            sessions.archive_now(base + 1.0);
        }
        let history = sessions.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].label, "Battle 3");
        assert_eq!(history[1].label, "Battle 2");
    }

    #[test]
    fn backfill_merges_into_covering_archived_session() {
        let mut sessions = battle_manager();
        sessions.record(1.0, "Alice", 100, 0);
        sessions.archive_now(5.0);

        sessions.backfill(2.0, "Bob", 40, 0);
        let history = sessions.history();
        assert_eq!(history[0].actors["Bob"].damage, 40);
        assert!(sessions.live().is_none());
    }

    #[test]
    fn backfill_opens_session_at_original_timestamp() {
        let mut sessions = battle_manager();
        sessions.backfill(0.0, "Bob", 50, 0);
        let live = sessions.live().expect("opened by backfill");
        assert_eq!(live.started_at, 0.0);
        assert_eq!(live.per_actor["Bob"].damage, 50);
    }

    #[test]
    fn fame_accrues_to_live_session() {
        let mut sessions = battle_manager();
        sessions.record(1.0, "Alice", 10, 0);
        sessions.add_fame(250);
        sessions.archive_now(2.0);
        assert_eq!(sessions.history()[0].fame, 250);
    }
}
