//! Read-only snapshot projection.
//!
//! The projector turns live pipeline state into an immutable view for the
//! UI and JSON export. It never mutates session state beyond pruning rate
//! windows, and readers hold the finished `Snapshot` by `Arc`, so the
//! pipeline is free to continue the moment projection ends.

use serde::Serialize;

use crate::domain::{ItemCatalog, Roster};

use super::aggregate::{rank_indices, SortKey};
use super::fame::FameTracker;
use super::session::{ArchivedSession, Mode, SessionManager};

/// Dropped-item counters per the degradation policy. All monotonic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub malformed_packet_total: u64,
    pub unknown_command_total: u64,
    pub reassembly_failed_total: u64,
    pub reassembly_evicted_total: u64,
    pub malformed_total: u64,
    pub unknown_tag_total: u64,
    pub unknown_event_total: u64,
    pub deferred_evicted_total: u64,
    pub capture_drop_total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActorRow {
    pub name: String,
    pub damage: u64,
    pub heal: u64,
    pub dps: f64,
    pub hps: f64,
    pub weapon: Option<String>,
    /// Requested-key share of the leader, clamped to [0, 1]. UI-only;
    /// excluded from the export schema.
    #[serde(skip_serializing)]
    pub bar_ratio: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryActor {
    pub name: String,
    pub damage: u64,
    pub heal: u64,
    pub dps: f64,
    pub hps: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistorySummary {
    pub label: String,
    pub started_at: f64,
    pub ended_at: f64,
    pub actors: Vec<HistoryActor>,
    pub fame: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub mode: Mode,
    pub zone: Option<String>,
    pub elapsed_s: f64,
    pub fame: u64,
    pub fame_per_hour: f64,
    pub actors: Vec<ActorRow>,
    pub history: Vec<HistorySummary>,
    pub counters: Counters,
}

impl Snapshot {
    pub fn empty(mode: Mode) -> Self {
        Self {
            mode,
            zone: None,
            elapsed_s: 0.0,
            fame: 0,
            fame_per_hour: 0.0,
            actors: Vec::new(),
            history: Vec::new(),
            counters: Counters::default(),
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub fn project(
    sessions: &mut SessionManager,
    roster: &Roster,
    items: &ItemCatalog,
    fame: &FameTracker,
    counters: Counters,
    sort: SortKey,
    window: f64,
    now: f64,
) -> Snapshot {
    // Prune rate windows before reading them.
    if let Some(live) = sessions.live_mut() {
        let cutoff = now - window;
        for stats in live.per_actor.values_mut() {
            stats.prune(cutoff);
        }
    }

    let zone = sessions.zone_label().map(str::to_owned);
    let mode = sessions.mode();
    let mut actors = Vec::new();
    let mut elapsed_s = 0.0;

    if let Some(live) = sessions.live() {
        elapsed_s = (now - live.started_at).max(0.0);
        let rows: Vec<(String, f64, u64)> = live
            .per_actor
            .iter()
            .map(|(name, stats)| {
                let key = match sort {
                    SortKey::Damage => stats.damage as f64,
                    SortKey::Heal => stats.heal as f64,
                    SortKey::Dps => stats.dps(now, window),
                    SortKey::Hps => stats.hps(now, window),
                };
                (name.clone(), key, stats.damage)
            })
            .collect();
        let max_key = rows.iter().map(|row| row.1).fold(0.0_f64, f64::max);

        for index in rank_indices(&rows) {
            let (name, key, _) = &rows[index];
            let stats = &live.per_actor[name];
            let bar_ratio = if max_key > 0.0 {
                (key / max_key).clamp(0.0, 1.0)
            } else {
                0.0
            };
            actors.push(ActorRow {
                name: name.clone(),
                damage: stats.damage,
                heal: stats.heal,
                dps: stats.dps(now, window),
                hps: stats.hps(now, window),
                weapon: roster
                    .weapon_of(name)
                    .and_then(|item| items.category_for(item)),
                bar_ratio,
            });
        }
    }

    let history = sessions.history().iter().map(summarize).collect();

    Snapshot {
        mode,
        zone,
        elapsed_s,
        fame: fame.total(),
        fame_per_hour: fame.per_hour(now),
        actors,
        history,
        counters,
    }
}

fn summarize(archived: &ArchivedSession) -> HistorySummary {
    let duration = archived.duration();
    let mut actors: Vec<HistoryActor> = archived
        .actors
        .iter()
        .map(|(name, totals)| {
            let (dps, hps) = if duration > 0.0 {
                (
                    totals.damage as f64 / duration,
                    totals.heal as f64 / duration,
                )
            } else {
                (0.0, 0.0)
            };
            HistoryActor {
                name: name.clone(),
                damage: totals.damage,
                heal: totals.heal,
                dps,
                hps,
            }
        })
        .collect();
    actors.sort_by(|a, b| b.damage.cmp(&a.damage).then_with(|| a.name.cmp(&b.name)));

    HistorySummary {
        label: archived.label.clone(),
        started_at: archived.started_at,
        ended_at: archived.ended_at,
        actors,
        fame: archived.fame,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Roster;
    use crate::meter::session::Mode;

    fn fixtures() -> (SessionManager, Roster, ItemCatalog, FameTracker) {
        (
            SessionManager::new(Mode::Battle, 20.0, 20),
            Roster::new(256),
            ItemCatalog::empty(),
            FameTracker::default(),
        )
    }

    #[test]
    fn actors_rank_by_requested_key() {
        let (mut sessions, roster, items, fame) = fixtures();
        sessions.record(1.0, "Alice", 100, 0);
        sessions.record(2.0, "Bob", 300, 0);
        sessions.record(3.0, "Carol", 0, 500);

        let snapshot = project(
            &mut sessions,
            &roster,
            &items,
            &fame,
            Counters::default(),
            SortKey::Damage,
            10.0,
            4.0,
        );
        let names: Vec<&str> = snapshot.actors.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["Bob", "Alice", "Carol"]);
        assert!((snapshot.actors[0].bar_ratio - 1.0).abs() < 1e-9);
        assert!((snapshot.actors[1].bar_ratio - 100.0 / 300.0).abs() < 1e-9);
    }

    #[test]
    fn rolling_rates_use_the_window() {
        let (mut sessions, roster, items, fame) = fixtures();
        sessions.record(0.0, "Alice", 100, 0);
        sessions.record(15.0, "Alice", 50, 0);

        let snapshot = project(
            &mut sessions,
            &roster,
            &items,
            &fame,
            Counters::default(),
            SortKey::Dps,
            10.0,
            20.0,
        );
        // Only the tick at t=15 is inside [10, 20].
        assert!((snapshot.actors[0].dps - 5.0).abs() < 1e-9);
        assert_eq!(snapshot.actors[0].damage, 150);
    }

    #[test]
    fn export_schema_field_names_are_stable() {
        let (mut sessions, roster, items, mut fame) = fixtures();
        sessions.record(1.0, "Alice", 100, 0);
        fame.add(500, 1.0);
        sessions.archive_now(2.0);
        sessions.record(3.0, "Alice", 10, 0);

        let snapshot = project(
            &mut sessions,
            &roster,
            &items,
            &fame,
            Counters::default(),
            SortKey::Dps,
            10.0,
            4.0,
        );
        let json = serde_json::to_value(&snapshot).expect("serialize");
        assert_eq!(json["mode"], "battle");
        assert!(json["elapsed_s"].is_number());
        assert_eq!(json["fame"], 500);
        assert!(json["fame_per_hour"].is_number());
        let actor = &json["actors"][0];
        for field in ["name", "damage", "heal", "dps", "hps", "weapon"] {
            assert!(actor.get(field).is_some(), "missing actor field {field}");
        }
        assert!(actor.get("bar_ratio").is_none());
        let entry = &json["history"][0];
        for field in ["label", "started_at", "ended_at", "actors", "fame"] {
            assert!(entry.get(field).is_some(), "missing history field {field}");
        }
        assert!(json["counters"]["capture_drop_total"].is_number());
    }

    #[test]
    fn empty_snapshot_is_well_formed() {
        let snapshot = Snapshot::empty(Mode::Zone);
        let json = serde_json::to_value(&snapshot).expect("serialize");
        assert_eq!(json["mode"], "zone");
        assert!(json["actors"].as_array().expect("array").is_empty());
    }
}
