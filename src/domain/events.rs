//! Semantic mapping from classified messages to domain events.
//!
//! Which `(kind, code)` pair means what is empirical knowledge that shifts
//! with game patches, so the mapping is a data-driven registry populated
//! from `EventCodes` at init. Adding a recognized event is a table entry,
//! not a new type.

use std::collections::BTreeMap;

use crate::config::EventCodes;
use crate::photon::{LogicalMessage, MessageKind, ParamMap};

const KEY_TARGET: u8 = 0;
const KEY_NAME: u8 = 1;
const KEY_DELTA: u8 = 2;
const KEY_POST_VALUE: u8 = 3;
const KEY_PARTY_NAMES: u8 = 5;
const KEY_ACTOR: u8 = 6;
const KEY_EQUIPPED: u8 = 40;
const KEY_EQUIP_CHANGE: u8 = 2;
const KEY_FAME: u8 = 1;
const KEY_FAME_FIXED_POINT: u8 = 252;
const KEY_COMBAT_FLAG: u8 = 1;

/// Fame arrives as a fixed-point value scaled by 10^4 in some dialects.
const FAME_FIXED_POINT_SCALE: f64 = 10_000.0;

#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    Health {
        target_id: u32,
        /// Negative = damage, positive = heal.
        delta: f64,
        actor_id: Option<u32>,
        /// Target health after the hit, when the dialect includes it.
        post_value: Option<f64>,
    },
    PlayerJoined {
        actor_id: u32,
        name: String,
        /// Equipped item indexes; slot 0 is the main weapon.
        items: Vec<i64>,
    },
    ItemEquipped {
        actor_id: u32,
        items: Vec<i64>,
    },
    PartyUpdate {
        names: Vec<String>,
    },
    PartyDisbanded,
    SelfIdentified {
        actor_id: u32,
        name: String,
    },
    ZoneChanged,
    CombatState {
        actor_id: u32,
        in_combat: bool,
    },
    FameGained {
        fame: u64,
    },
}

pub type EventBuilder = fn(&ParamMap) -> Option<DomainEvent>;

pub struct EventRegistry {
    builders: BTreeMap<(MessageKind, u8), EventBuilder>,
}

impl EventRegistry {
    pub fn empty() -> Self {
        Self {
            builders: BTreeMap::new(),
        }
    }

    pub fn with_codes(codes: &EventCodes) -> Self {
        let mut registry = Self::empty();
        registry.register(MessageKind::Event, codes.health_update, build_health);
        registry.register(MessageKind::Event, codes.combat_state, build_combat_state);
        registry.register(MessageKind::Event, codes.player_joined, build_player_joined);
        registry.register(MessageKind::Event, codes.fame_gained, build_fame);
        registry.register(MessageKind::Event, codes.item_equipped, build_item_equipped);
        registry.register(MessageKind::Event, codes.party_update, build_party_update);
        registry.register(MessageKind::Event, codes.party_disbanded, |_| {
            Some(DomainEvent::PartyDisbanded)
        });
        registry.register(MessageKind::Event, codes.self_identified, build_self_identified);
        registry.register(MessageKind::Response, codes.join_world_response, |_| {
            Some(DomainEvent::ZoneChanged)
        });
        registry
    }

    pub fn register(&mut self, kind: MessageKind, code: u8, builder: EventBuilder) {
        self.builders.insert((kind, code), builder);
    }

    /// Map a classified message to a domain event. `None` means the
    /// `(kind, code)` pair is not recognized; the caller decides whether to
    /// persist the payload for offline analysis.
    pub fn build(&self, message: &LogicalMessage) -> Option<DomainEvent> {
        let builder = self.builders.get(&(message.kind, message.code))?;
        builder(&message.params)
    }
}

fn param_u32(params: &ParamMap, key: u8) -> Option<u32> {
    params
        .get(&key)
        .and_then(|v| v.as_i64())
        .and_then(|v| u32::try_from(v).ok())
}

fn build_health(params: &ParamMap) -> Option<DomainEvent> {
    let target_id = param_u32(params, KEY_TARGET)?;
    let delta = params.get(&KEY_DELTA)?.as_f64()?;
    Some(DomainEvent::Health {
        target_id,
        delta,
        actor_id: param_u32(params, KEY_ACTOR),
        post_value: params.get(&KEY_POST_VALUE).and_then(|v| v.as_f64()),
    })
}

fn build_combat_state(params: &ParamMap) -> Option<DomainEvent> {
    let actor_id = param_u32(params, KEY_TARGET)?;
    let in_combat = params.get(&KEY_COMBAT_FLAG)?.as_bool()?;
    Some(DomainEvent::CombatState {
        actor_id,
        in_combat,
    })
}

fn build_player_joined(params: &ParamMap) -> Option<DomainEvent> {
    let actor_id = param_u32(params, KEY_TARGET)?;
    let name = params.get(&KEY_NAME)?.as_str()?.to_owned();
    if name.is_empty() {
        return None;
    }
    let items = params
        .get(&KEY_EQUIPPED)
        .and_then(|v| v.as_int_slice())
        .unwrap_or_default();
    Some(DomainEvent::PlayerJoined {
        actor_id,
        name,
        items,
    })
}

fn build_item_equipped(params: &ParamMap) -> Option<DomainEvent> {
    let actor_id = param_u32(params, KEY_TARGET)?;
    let items = params.get(&KEY_EQUIP_CHANGE)?.as_int_slice()?;
    Some(DomainEvent::ItemEquipped { actor_id, items })
}

fn build_party_update(params: &ParamMap) -> Option<DomainEvent> {
    let names = params
        .get(&KEY_PARTY_NAMES)
        .and_then(|v| v.as_str_slice())
        .unwrap_or_default();
    Some(DomainEvent::PartyUpdate { names })
}

fn build_self_identified(params: &ParamMap) -> Option<DomainEvent> {
    let actor_id = param_u32(params, KEY_TARGET)?;
    let name = params.get(&KEY_NAME)?.as_str()?.to_owned();
    if name.is_empty() {
        return None;
    }
    Some(DomainEvent::SelfIdentified { actor_id, name })
}

fn build_fame(params: &ParamMap) -> Option<DomainEvent> {
    let raw = params.get(&KEY_FAME)?.as_f64()?;
    let fixed_point = params
        .get(&KEY_FAME_FIXED_POINT)
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let fame = if fixed_point {
        raw / FAME_FIXED_POINT_SCALE
    } else {
        raw
    };
    if fame < 0.0 {
        return None;
    }
    Some(DomainEvent::FameGained { fame: fame as u64 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::photon::protocol16::Value;
    use crate::photon::{classify, wire, TransportMessage};

    fn event_message(code: u8, params: ParamMap) -> LogicalMessage {
        let body = wire::message_body(MessageKind::Event, code, &params);
        classify(&TransportMessage {
            channel: 1,
            reliable: true,
            seq: 0,
            body: Bytes::from(body),
        })
        .expect("classify")
    }

    fn registry() -> EventRegistry {
        EventRegistry::with_codes(&EventCodes::default())
    }

    #[test]
    fn health_update_builds_with_actor() {
        let mut params = ParamMap::new();
        params.insert(0, Value::I32(900));
        params.insert(2, Value::F64(-120.0));
        params.insert(6, Value::I32(77));
        let event = registry().build(&event_message(6, params)).expect("event");
        assert_eq!(
            event,
            DomainEvent::Health {
                target_id: 900,
                delta: -120.0,
                actor_id: Some(77),
                post_value: None,
            }
        );
    }

    #[test]
    fn health_update_without_actor_falls_back_later() {
        let mut params = ParamMap::new();
        params.insert(0, Value::I32(900));
        params.insert(2, Value::F32(55.5));
        let event = registry().build(&event_message(6, params)).expect("event");
        let DomainEvent::Health {
            actor_id, delta, ..
        } = event
        else {
            panic!("expected health event");
        };
        assert!(actor_id.is_none());
        assert!(delta > 0.0);
    }

    #[test]
    fn player_joined_carries_equipment() {
        let mut params = ParamMap::new();
        params.insert(0, Value::I32(42));
        params.insert(1, Value::Str("Bob".into()));
        params.insert(40, Value::IntArray(vec![801, 0, 305]));
        let event = registry().build(&event_message(29, params)).expect("event");
        assert_eq!(
            event,
            DomainEvent::PlayerJoined {
                actor_id: 42,
                name: "Bob".into(),
                items: vec![801, 0, 305],
            }
        );
    }

    #[test]
    fn party_update_replaces_wholesale() {
        let mut params = ParamMap::new();
        params.insert(5, Value::StrArray(vec!["Alice".into(), "Bob".into()]));
        let event = registry().build(&event_message(213, params)).expect("event");
        assert_eq!(
            event,
            DomainEvent::PartyUpdate {
                names: vec!["Alice".into(), "Bob".into()],
            }
        );
    }

    #[test]
    fn empty_party_update_still_builds() {
        let event = registry()
            .build(&event_message(213, ParamMap::new()))
            .expect("event");
        assert_eq!(event, DomainEvent::PartyUpdate { names: vec![] });
    }

    #[test]
    fn fame_fixed_point_is_scaled() {
        let mut params = ParamMap::new();
        params.insert(1, Value::I64(1_250_000));
        params.insert(252, Value::Bool(true));
        let event = registry().build(&event_message(72, params)).expect("event");
        assert_eq!(event, DomainEvent::FameGained { fame: 125 });
    }

    #[test]
    fn join_world_response_is_a_zone_change() {
        let body = wire::response_body(2, 0, "", &ParamMap::new());
        let message = classify(&TransportMessage {
            channel: 1,
            reliable: true,
            seq: 0,
            body: Bytes::from(body),
        })
        .expect("classify");
        assert_eq!(registry().build(&message), Some(DomainEvent::ZoneChanged));
    }

    #[test]
    fn unrecognized_code_builds_nothing() {
        assert!(registry().build(&event_message(201, ParamMap::new())).is_none());
    }

    #[test]
    fn registry_is_extensible_at_runtime() {
        let mut registry = registry();
        registry.register(MessageKind::Event, 201, |_| {
            Some(DomainEvent::PartyDisbanded)
        });
        assert_eq!(
            registry.build(&event_message(201, ParamMap::new())),
            Some(DomainEvent::PartyDisbanded)
        );
    }
}
