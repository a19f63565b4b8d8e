//! The single-threaded pipeline core.
//!
//! Owns every piece of mutable state: reassembly, classification, event
//! semantics, roster, sessions, and counters. Data flows strictly one way;
//! the only external mutations are the control calls, and the only output
//! is the published snapshot. No locks are held while processing because
//! nothing else touches this state.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::capture::{Endpoint, RawPacket};
use crate::config::Config;
use crate::domain::{Admission, Backfill, DomainEvent, EventRegistry, ItemCatalog, Roster};
use crate::meter::{
    project, Counters, FameTracker, Mode, SessionManager, Snapshot, SortKey,
};
use crate::photon::{classify, LogicalMessage, Reassembler, TransportMessage, UnknownSink};

const PUBLISH_INTERVAL_S: f64 = 1.0;

pub struct Pipeline {
    registry: EventRegistry,
    reassembler: Reassembler,
    roster: Roster,
    sessions: SessionManager,
    fame: FameTracker,
    items: ItemCatalog,
    sink: UnknownSink,
    zone_ports: Vec<u16>,
    zone_names: BTreeMap<String, String>,
    zone_endpoint: Option<Endpoint>,
    window_s: f64,
    sort: SortKey,
    last_ts: f64,
    last_publish: Option<f64>,
    malformed_messages: u64,
    unknown_tags: u64,
    unknown_events: u64,
    capture_drops: u64,
    published: Arc<RwLock<Arc<Snapshot>>>,
    scratch: Vec<TransportMessage>,
}

impl Pipeline {
    pub fn new(config: &Config) -> Self {
        let mut roster = Roster::new(config.limits.deferred_per_actor);
        roster.seed(config.self_name.clone(), config.self_id);
        let published = Arc::new(RwLock::new(Arc::new(Snapshot::empty(config.mode))));
        Self {
            registry: EventRegistry::with_codes(&config.codes),
            reassembler: Reassembler::new(&config.limits),
            roster,
            sessions: SessionManager::new(
                config.mode,
                config.battle_timeout_seconds,
                config.history_limit,
            ),
            fame: FameTracker::default(),
            items: ItemCatalog::load(&config.items),
            sink: UnknownSink::new(config.dump_dir.clone(), config.limits.dump_dedup_seconds),
            zone_ports: config.codes.zone_ports.clone(),
            zone_names: config.zone_names.clone(),
            zone_endpoint: None,
            window_s: config.window_seconds,
            sort: SortKey::default(),
            last_ts: 0.0,
            last_publish: None,
            malformed_messages: 0,
            unknown_tags: 0,
            unknown_events: 0,
            capture_drops: 0,
            published,
            scratch: Vec::new(),
        }
    }

    /// Shared handle readers clone snapshots out of.
    pub fn snapshot_handle(&self) -> Arc<RwLock<Arc<Snapshot>>> {
        self.published.clone()
    }

    /// Swap in a registry with extra or patched event codes.
    pub fn set_registry(&mut self, registry: EventRegistry) {
        self.registry = registry;
    }

    /// Drive one captured packet through stages 2..8.
    pub fn handle_packet(&mut self, packet: &RawPacket) {
        self.last_ts = self.last_ts.max(packet.ts);
        self.observe_endpoints(packet);

        let mut messages = std::mem::take(&mut self.scratch);
        messages.clear();
        self.reassembler
            .ingest(packet.flow(), packet.ts, &packet.payload, &mut messages);
        for transport in &messages {
            self.handle_transport(transport, packet.ts);
        }
        self.scratch = messages;

        self.sessions.tick(packet.ts);
        self.maybe_publish(packet.ts);
    }

    /// Clock advance with no packet (idle live capture). Runs session
    /// timeouts and keeps the published snapshot fresh.
    ///
    /// `now` must come from the same clock domain as the packet stream;
    /// for a file-clock source that means a timestamp from the file's own
    /// timeline, never the wall clock.
    pub fn idle_tick(&mut self, now: f64) {
        if now < self.last_ts {
            return;
        }
        self.last_ts = now;
        self.sessions.tick(now);
        self.publish(now);
    }

    /// End of stream: freeze the live session and publish a final view.
    pub fn finalize(&mut self) {
        self.sessions.finalize();
        self.publish(self.last_ts);
    }

    pub fn set_capture_drops(&mut self, dropped_total: u64) {
        self.capture_drops = dropped_total;
    }

    // Control surface. These are the only outside mutations.

    pub fn set_mode(&mut self, mode: Mode) {
        self.sessions.set_mode(mode, self.last_ts);
        self.publish(self.last_ts);
    }

    pub fn manual_toggle(&mut self) -> bool {
        let active = self.sessions.manual_toggle(self.last_ts);
        self.publish(self.last_ts);
        active
    }

    pub fn archive_now(&mut self) {
        self.sessions.archive_now(self.last_ts);
        self.publish(self.last_ts);
    }

    pub fn reset_fame(&mut self) {
        self.fame.reset();
        self.publish(self.last_ts);
    }

    pub fn seed_self(&mut self, name: Option<String>, id: Option<u32>) {
        self.roster.seed(name, id);
    }

    pub fn set_sort(&mut self, sort: SortKey) {
        self.sort = sort;
        self.publish(self.last_ts);
    }

    /// Project a fresh snapshot, publish it, and hand it back.
    pub fn request_snapshot(&mut self) -> Arc<Snapshot> {
        self.publish(self.last_ts);
        self.published
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_else(|_| Arc::new(Snapshot::empty(self.sessions.mode())))
    }

    fn handle_transport(&mut self, transport: &TransportMessage, ts: f64) {
        let message = match classify(transport) {
            Ok(message) => message,
            Err(e) => {
                self.malformed_messages += 1;
                tracing::debug!(error = %e, "dropped malformed message");
                return;
            }
        };

        if let Some(tag) = message.unknown_tag {
            self.unknown_tags += 1;
            tracing::debug!(
                tag,
                code = message.code,
                kind = message.kind.label(),
                "payload contains unknown tag"
            );
            self.sink
                .write(epoch_ms(ts), message.kind, message.code, &transport.body);
        }

        match self.registry.build(&message) {
            Some(event) => self.apply_event(event, ts),
            None => self.unrecognized(&message, &transport.body, ts),
        }
    }

    fn unrecognized(&mut self, message: &LogicalMessage, body: &[u8], ts: f64) {
        if message.unknown_tag.is_some() {
            return; // already counted and dumped
        }
        self.unknown_events += 1;
        self.sink
            .write(epoch_ms(ts), message.kind, message.code, body);
    }

    fn apply_event(&mut self, event: DomainEvent, ts: f64) {
        match event {
            DomainEvent::Health {
                target_id,
                delta,
                actor_id,
                post_value,
            } => {
                let (damage, heal) = split_delta(delta, post_value);
                if damage == 0 && heal == 0 {
                    return;
                }
                // Absent actor means a self-affecting tick (regen, food):
                // the target is the acting entity.
                let actor = actor_id.unwrap_or(target_id);
                match self.roster.admit(actor) {
                    Admission::Accepted(name) => {
                        self.sessions.record(ts, &name, damage, heal);
                    }
                    Admission::Deferred => self.roster.defer(actor, ts, damage, heal),
                    Admission::Rejected => {}
                }
            }
            DomainEvent::PlayerJoined {
                actor_id,
                name,
                items,
            } => {
                let backfill = self.roster.player_joined(actor_id, &name, &items, ts);
                self.replay(backfill.into_iter().collect());
            }
            DomainEvent::ItemEquipped { actor_id, items } => {
                self.roster.item_equipped(actor_id, &items, ts);
            }
            DomainEvent::PartyUpdate { names } => {
                let backfills = self.roster.set_party(names);
                self.replay(backfills);
            }
            DomainEvent::PartyDisbanded => {
                let backfills = self.roster.disband();
                self.replay(backfills);
            }
            DomainEvent::SelfIdentified { actor_id, name } => {
                let backfill = self.roster.identify_self(actor_id, name, ts);
                self.replay(backfill.into_iter().collect());
            }
            DomainEvent::ZoneChanged => {
                self.roster.zone_change();
                self.sessions.zone_changed(ts);
                self.zone_endpoint = None;
            }
            DomainEvent::CombatState {
                actor_id,
                in_combat,
            } => {
                if Some(actor_id) == self.roster.self_id() {
                    self.sessions.combat_state_self(in_combat, ts);
                }
            }
            DomainEvent::FameGained { fame } => {
                self.fame.add(fame, ts);
                self.sessions.add_fame(fame);
            }
        }
    }

    fn replay(&mut self, backfills: Vec<Backfill>) {
        for backfill in backfills {
            for tuple in &backfill.tuples {
                self.sessions
                    .backfill(tuple.ts, &backfill.name, tuple.damage, tuple.heal);
            }
        }
    }

    fn observe_endpoints(&mut self, packet: &RawPacket) {
        let endpoint = if self.zone_ports.contains(&packet.src.port) {
            Some(packet.src)
        } else if self.zone_ports.contains(&packet.dst.port) {
            Some(packet.dst)
        } else {
            None
        };
        let Some(endpoint) = endpoint else {
            return;
        };
        if self.zone_endpoint == Some(endpoint) {
            return;
        }
        // A different zone server means the old entity ids are dead.
        if self.zone_endpoint.is_some() {
            self.roster.zone_change();
        }
        self.zone_endpoint = Some(endpoint);
        let key = endpoint.to_string();
        let label = self
            .zone_names
            .get(&key)
            .cloned()
            .unwrap_or(key);
        self.sessions.observe_zone(endpoint, label, packet.ts);
    }

    fn maybe_publish(&mut self, now: f64) {
        let due = match self.last_publish {
            None => true,
            Some(last) => now - last >= PUBLISH_INTERVAL_S,
        };
        if due {
            self.publish(now);
        }
    }

    fn publish(&mut self, now: f64) {
        let counters = self.counters();
        let snapshot = project(
            &mut self.sessions,
            &self.roster,
            &self.items,
            &self.fame,
            counters,
            self.sort,
            self.window_s,
            now,
        );
        if let Ok(mut guard) = self.published.write() {
            *guard = Arc::new(snapshot);
        }
        self.last_publish = Some(now);
    }

    pub fn counters(&self) -> Counters {
        let transport = &self.reassembler.counters;
        Counters {
            malformed_packet_total: transport.malformed_datagrams,
            unknown_command_total: transport.unknown_commands,
            reassembly_failed_total: transport.reassembly_failed,
            reassembly_evicted_total: transport.reassembly_evicted,
            malformed_total: self.malformed_messages,
            unknown_tag_total: self.unknown_tags,
            unknown_event_total: self.unknown_events,
            deferred_evicted_total: self.roster.deferred_evicted_total,
            capture_drop_total: self.capture_drops,
        }
    }
}

/// Split a signed health delta into damage/heal, clamping overkill when the
/// dialect reports the post-hit value: damage past zero health inflates the
/// delta but not the victim's actual loss.
fn split_delta(delta: f64, post_value: Option<f64>) -> (u64, u64) {
    if delta < 0.0 {
        let mut damage = -delta;
        if let Some(post) = post_value {
            if post < 0.0 {
                damage = (damage + post).max(0.0);
            }
        }
        (damage.round() as u64, 0)
    } else {
        (0, delta.round() as u64)
    }
}

fn epoch_ms(ts: f64) -> u64 {
    if ts <= 0.0 {
        0
    } else {
        (ts * 1000.0) as u64
    }
}
