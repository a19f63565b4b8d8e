//! Self/party identity tracking and the aggregation gate.
//!
//! The safety invariant of the whole meter lives here: no health delta
//! reaches aggregation unless the resolved player name is the local player
//! or a current party member. Deltas from ids we cannot resolve yet are
//! deferred in a bounded per-id queue and replayed in original order once a
//! roster message names them ("late-join backfill").
//!
//! Entity ids are zone-scoped, so a zone change clears every id-keyed
//! structure while `self_*` and the party name set survive.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Engine entity id. Only unique within a zone.
pub type ActorId = u32;

/// A combat delta waiting for its actor id to resolve to a party name.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Deferred {
    pub ts: f64,
    pub damage: u64,
    pub heal: u64,
}

/// Deferred tuples released by a roster message that named their actor.
#[derive(Debug, Clone, PartialEq)]
pub struct Backfill {
    pub actor_id: ActorId,
    pub name: String,
    pub tuples: Vec<Deferred>,
}

/// Outcome of the aggregation gate for one actor id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Attribute to this player name.
    Accepted(String),
    /// Unknown id: buffer the delta and wait for a roster message.
    Deferred,
    /// Known id, resolved to a non-party name: drop outright.
    Rejected,
}

#[derive(Debug, Clone, Default)]
pub struct ActorRecord {
    pub name: Option<String>,
    pub weapon_item: Option<u32>,
    pub first_seen: f64,
    pub last_seen: f64,
}

pub struct Roster {
    self_id: Option<ActorId>,
    self_name: Option<String>,
    party: BTreeSet<String>,
    id_to_name: BTreeMap<ActorId, String>,
    records: BTreeMap<ActorId, ActorRecord>,
    pending: BTreeMap<ActorId, VecDeque<Deferred>>,
    deferred_cap: usize,
    pub deferred_evicted_total: u64,
}

impl Roster {
    pub fn new(deferred_cap: usize) -> Self {
        Self {
            self_id: None,
            self_name: None,
            party: BTreeSet::new(),
            id_to_name: BTreeMap::new(),
            records: BTreeMap::new(),
            pending: BTreeMap::new(),
            deferred_cap: deferred_cap.max(1),
            deferred_evicted_total: 0,
        }
    }

    /// Apply startup seeds. Seeds are provisional: the first observed
    /// self-identification overrides both.
    pub fn seed(&mut self, name: Option<String>, id: Option<ActorId>) {
        if let Some(name) = name {
            if !name.is_empty() {
                self.ensure_self_in_party(&name);
                self.self_name = Some(name);
            }
        }
        if let Some(id) = id {
            self.self_id = Some(id);
        }
    }

    pub fn self_id(&self) -> Option<ActorId> {
        self.self_id
    }

    pub fn self_name(&self) -> Option<&str> {
        self.self_name.as_deref()
    }

    pub fn party(&self) -> &BTreeSet<String> {
        &self.party
    }

    pub fn id_to_name(&self) -> &BTreeMap<ActorId, String> {
        &self.id_to_name
    }

    pub fn pending_ids(&self) -> impl Iterator<Item = ActorId> + '_ {
        self.pending.keys().copied()
    }

    /// The local player introduced themselves. Overrides any seed.
    pub fn identify_self(&mut self, actor_id: ActorId, name: String, ts: f64) -> Option<Backfill> {
        tracing::info!(actor_id, name = %name, "self identified");
        if let Some(previous) = self.self_name.take() {
            if previous != name {
                self.party.remove(&previous);
            }
        }
        self.ensure_self_in_party(&name);
        self.self_name = Some(name.clone());
        self.self_id = Some(actor_id);
        self.id_to_name.insert(actor_id, name.clone());
        self.touch(actor_id, Some(&name), None, ts);
        self.release_pending(actor_id)
    }

    /// A player entity appeared with its name and equipment.
    pub fn player_joined(
        &mut self,
        actor_id: ActorId,
        name: &str,
        items: &[i64],
        ts: f64,
    ) -> Option<Backfill> {
        let weapon = main_weapon(items);
        self.id_to_name.insert(actor_id, name.to_owned());
        self.touch(actor_id, Some(name), weapon, ts);
        // A non-party name keeps its buffered deltas: party membership can
        // be learned after the name, and the next party update will either
        // release or drop them.
        if self.is_meter_name(name) {
            self.release_pending(actor_id)
        } else {
            None
        }
    }

    pub fn item_equipped(&mut self, actor_id: ActorId, items: &[i64], ts: f64) {
        if let Some(weapon) = main_weapon(items) {
            self.touch(actor_id, None, Some(weapon), ts);
        }
    }

    /// Replace the party set wholesale. An empty list is a disband and
    /// leaves only the local player.
    pub fn set_party(&mut self, names: Vec<String>) -> Vec<Backfill> {
        self.party = names
            .into_iter()
            .filter(|name| !name.is_empty())
            .collect();
        // self_name is a party member whenever the party is non-empty, and
        // a disband leaves exactly the local player.
        if let Some(self_name) = self.self_name.clone() {
            self.party.insert(self_name);
        }
        tracing::info!(party = ?self.party, "party updated");

        // Deferred deltas for ids now known to be outside the party are
        // dropped; ids that just became resolvable replay.
        let mut backfills = Vec::new();
        let pending_ids: Vec<ActorId> = self.pending.keys().copied().collect();
        for actor_id in pending_ids {
            match self.id_to_name.get(&actor_id) {
                Some(name) if self.is_meter_name(name) => {
                    if let Some(backfill) = self.release_pending(actor_id) {
                        backfills.push(backfill);
                    }
                }
                Some(_) => {
                    self.pending.remove(&actor_id);
                }
                None => {}
            }
        }
        backfills
    }

    pub fn disband(&mut self) -> Vec<Backfill> {
        self.set_party(Vec::new())
    }

    /// The aggregation gate.
    pub fn admit(&self, actor_id: ActorId) -> Admission {
        if Some(actor_id) == self.self_id {
            return Admission::Accepted(
                self.self_name
                    .clone()
                    .unwrap_or_else(|| actor_id.to_string()),
            );
        }
        match self.id_to_name.get(&actor_id) {
            Some(name) if self.is_meter_name(name) => Admission::Accepted(name.clone()),
            Some(_) => Admission::Rejected,
            None => Admission::Deferred,
        }
    }

    /// Buffer a delta for an unresolved id, bounded per id with FIFO
    /// eviction.
    pub fn defer(&mut self, actor_id: ActorId, ts: f64, damage: u64, heal: u64) {
        let queue = self.pending.entry(actor_id).or_default();
        if queue.len() >= self.deferred_cap {
            queue.pop_front();
            self.deferred_evicted_total += 1;
        }
        queue.push_back(Deferred { ts, damage, heal });
    }

    /// Entity ids do not survive a zone load; names do.
    pub fn zone_change(&mut self) {
        tracing::info!("zone change: clearing id mappings");
        self.id_to_name.clear();
        self.records.clear();
        self.pending.clear();
    }

    /// Weapon item for a player name, if any record carries one.
    pub fn weapon_of(&self, name: &str) -> Option<u32> {
        self.records
            .values()
            .find(|record| record.name.as_deref() == Some(name))
            .and_then(|record| record.weapon_item)
    }

    fn is_meter_name(&self, name: &str) -> bool {
        self.party.contains(name) || self.self_name.as_deref() == Some(name)
    }

    fn ensure_self_in_party(&mut self, name: &str) {
        if !self.party.is_empty() {
            self.party.insert(name.to_owned());
        }
    }

    fn release_pending(&mut self, actor_id: ActorId) -> Option<Backfill> {
        let queue = self.pending.remove(&actor_id)?;
        if queue.is_empty() {
            return None;
        }
        let name = match self.admit(actor_id) {
            Admission::Accepted(name) => name,
            _ => return None,
        };
        tracing::debug!(actor_id, name = %name, count = queue.len(), "replaying deferred deltas");
        Some(Backfill {
            actor_id,
            name,
            tuples: queue.into_iter().collect(),
        })
    }

    fn touch(&mut self, actor_id: ActorId, name: Option<&str>, weapon: Option<u32>, ts: f64) {
        let record = self.records.entry(actor_id).or_insert_with(|| ActorRecord {
            first_seen: ts,
            last_seen: ts,
            ..ActorRecord::default()
        });
        record.last_seen = ts;
        if let Some(name) = name {
            record.name = Some(name.to_owned());
        }
        if let Some(weapon) = weapon {
            record.weapon_item = Some(weapon);
        }
    }
}

fn main_weapon(items: &[i64]) -> Option<u32> {
    items
        .first()
        .and_then(|id| u32::try_from(*id).ok())
        .filter(|id| *id > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster_with_party(self_name: &str, self_id: ActorId, party: &[&str]) -> Roster {
        let mut roster = Roster::new(256);
        roster.seed(Some(self_name.to_owned()), Some(self_id));
        roster.set_party(party.iter().map(|s| s.to_string()).collect());
        roster
    }

    #[test]
    fn self_is_always_admitted() {
        let mut roster = Roster::new(256);
        roster.seed(Some("Alice".into()), Some(7));
        assert_eq!(roster.admit(7), Admission::Accepted("Alice".into()));
    }

    #[test]
    fn seeded_id_without_name_uses_id_label() {
        let mut roster = Roster::new(256);
        roster.seed(None, Some(7));
        assert_eq!(roster.admit(7), Admission::Accepted("7".into()));
    }

    #[test]
    fn unknown_id_defers_and_party_outsider_rejects() {
        let mut roster = roster_with_party("Alice", 1, &["Alice", "Bob"]);
        assert_eq!(roster.admit(3), Admission::Deferred);
        roster.player_joined(3, "Carol", &[], 0.0);
        assert_eq!(roster.admit(3), Admission::Rejected);
    }

    #[test]
    fn party_member_resolves_through_id_map() {
        let mut roster = roster_with_party("Alice", 1, &["Alice", "Bob"]);
        roster.player_joined(2, "Bob", &[801], 0.0);
        assert_eq!(roster.admit(2), Admission::Accepted("Bob".into()));
        assert_eq!(roster.weapon_of("Bob"), Some(801));
    }

    #[test]
    fn late_join_backfill_replays_in_order() {
        let mut roster = roster_with_party("Alice", 1, &["Alice", "Bob"]);
        roster.defer(9, 0.0, 50, 0);
        roster.defer(9, 0.5, 30, 0);

        let backfill = roster.player_joined(9, "Bob", &[], 1.0).expect("backfill");
        assert_eq!(backfill.name, "Bob");
        assert_eq!(
            backfill.tuples,
            vec![
                Deferred {
                    ts: 0.0,
                    damage: 50,
                    heal: 0
                },
                Deferred {
                    ts: 0.5,
                    damage: 30,
                    heal: 0
                },
            ]
        );
        assert_eq!(roster.pending_ids().count(), 0);
    }

    #[test]
    fn non_party_join_retains_deferred_until_party_update() {
        let mut roster = roster_with_party("Alice", 1, &["Alice"]);
        roster.defer(9, 0.0, 50, 0);
        // Mallory is named but not in the party: deltas stay buffered in
        // case the party update naming her is simply late.
        assert!(roster.player_joined(9, "Mallory", &[], 1.0).is_none());
        assert_eq!(roster.pending_ids().count(), 1);

        // A party update without her settles it.
        let backfills = roster.set_party(vec!["Alice".into(), "Bob".into()]);
        assert!(backfills.is_empty());
        assert_eq!(roster.pending_ids().count(), 0);
    }

    #[test]
    fn late_party_update_releases_named_outsider() {
        let mut roster = roster_with_party("Alice", 1, &["Alice"]);
        roster.defer(9, 0.0, 50, 0);
        roster.player_joined(9, "Bob", &[], 1.0);

        let backfills = roster.set_party(vec!["Alice".into(), "Bob".into()]);
        assert_eq!(backfills.len(), 1);
        assert_eq!(backfills[0].name, "Bob");
        assert_eq!(backfills[0].tuples.len(), 1);
    }

    #[test]
    fn deferred_queue_is_bounded_fifo() {
        let mut roster = roster_with_party("Alice", 1, &["Alice", "Bob"]);
        for i in 0..300 {
            roster.defer(9, f64::from(i), 1, 0);
        }
        assert_eq!(roster.deferred_evicted_total, 300 - 256);

        let backfill = roster.player_joined(9, "Bob", &[], 400.0).expect("backfill");
        assert_eq!(backfill.tuples.len(), 256);
        // Oldest were evicted; the first surviving tuple is number 44.
        assert_eq!(backfill.tuples[0].ts, 44.0);
    }

    #[test]
    fn party_update_releases_resolvable_pending() {
        let mut roster = Roster::new(256);
        roster.seed(Some("Alice".into()), Some(1));
        roster.player_joined(9, "Bob", &[], 0.0);
        // Bob is known but not yet in the party: deltas defer.
        assert_eq!(roster.admit(9), Admission::Rejected);
        roster.defer(8, 0.0, 10, 0);
        roster.player_joined(8, "Dana", &[], 0.1);

        let backfills = roster.set_party(vec!["Alice".into(), "Dana".into()]);
        assert_eq!(backfills.len(), 1);
        assert_eq!(backfills[0].name, "Dana");
    }

    #[test]
    fn disband_keeps_self_and_drops_mapped_outsiders() {
        let mut roster = roster_with_party("Alice", 1, &["Alice", "Bob"]);
        roster.player_joined(2, "Bob", &[], 0.0);
        roster.defer(3, 0.0, 5, 0);
        roster.player_joined(3, "Carol", &[], 0.1);

        roster.disband();
        assert_eq!(roster.party().len(), 1);
        assert!(roster.party().contains("Alice"));
        assert_eq!(roster.admit(2), Admission::Rejected);
        assert_eq!(roster.pending_ids().count(), 0);
    }

    #[test]
    fn zone_change_clears_ids_keeps_identity() {
        let mut roster = roster_with_party("Alice", 1, &["Alice", "Bob"]);
        roster.player_joined(5, "Bob", &[], 0.0);
        roster.defer(6, 0.0, 10, 0);

        roster.zone_change();
        assert!(roster.id_to_name().is_empty());
        assert_eq!(roster.pending_ids().count(), 0);
        assert_eq!(roster.self_name(), Some("Alice"));
        assert_eq!(roster.party().len(), 2);
        assert!(roster.party().contains("Bob"));
    }

    #[test]
    fn self_identify_overrides_seed() {
        let mut roster = Roster::new(256);
        roster.seed(Some("WrongGuess".into()), Some(99));
        roster.identify_self(7, "Alice".into(), 0.0);
        assert_eq!(roster.self_id(), Some(7));
        assert_eq!(roster.self_name(), Some("Alice"));
        assert_eq!(roster.admit(7), Admission::Accepted("Alice".into()));
    }

    #[test]
    fn self_identify_releases_pending_self_deltas() {
        let mut roster = Roster::new(256);
        roster.seed(Some("Alice".into()), None);
        roster.defer(7, 0.0, 100, 0);
        let backfill = roster.identify_self(7, "Alice".into(), 1.0).expect("backfill");
        assert_eq!(backfill.tuples.len(), 1);
        assert_eq!(backfill.tuples[0].damage, 100);
    }
}
