use crate::actions::Action;
use crate::types::{BlockKey, OwnerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

// ─── Stable event names ───────────────────────────────────────

pub mod names {
    pub const TICK: &str = "tick";
    pub const NEXT: &str = "next";
    pub const STACK_PUSH: &str = "stack:push";
    pub const STACK_POP: &str = "stack:pop";
    pub const TIMER_TICK: &str = "timer:tick";
    pub const TIMER_COMPLETE: &str = "timer:complete";
    pub const BLOCK_COMPLETE: &str = "block:complete";
    pub const ROUNDS_CHANGED: &str = "rounds:changed";
    pub const INTERVAL_COMPLETE: &str = "interval:complete";
    pub const SOUND_PLAY: &str = "sound:play";
}

// ─── Events ───────────────────────────────────────────────────

/// A name-addressed event. Dispatched synchronously; handlers return
/// actions and never execute them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(name: &str, timestamp: DateTime<Utc>, data: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            timestamp,
            data,
        }
    }

    pub fn tick(timestamp: DateTime<Utc>) -> Self {
        Self::new(names::TICK, timestamp, json!({}))
    }

    pub fn next(timestamp: DateTime<Utc>) -> Self {
        Self::new(names::NEXT, timestamp, json!({}))
    }

    pub fn timer_complete(block: BlockKey, timestamp: DateTime<Utc>) -> Self {
        Self::new(
            names::TIMER_COMPLETE,
            timestamp,
            json!({ "blockId": block.as_uuid() }),
        )
    }

    /// The `blockId` field of the payload, when present.
    pub fn block_id(&self) -> Option<BlockKey> {
        serde_json::from_value(self.data.get("blockId")?.clone()).ok()
    }

    pub fn int_field(&self, field: &str) -> Option<i64> {
        self.data.get(field).and_then(|v| v.as_i64())
    }
}

// ─── Bus ──────────────────────────────────────────────────────

pub type HandlerId = u64;

type HandlerFn = Box<dyn Fn(&Event) -> Vec<Action>>;

struct Registration {
    id: HandlerId,
    event_name: String,
    owner: OwnerId,
    priority: i32,
    handler: HandlerFn,
}

/// Name-addressed dispatch with owner-scoped handlers.
///
/// Handlers run in priority order (higher first), then registration order.
/// A handler's panics are caught and logged and never abort dispatch.
/// Block behaviors do not register here — the driver forwards dispatched
/// events to the stack directly; the bus carries external collaborators
/// (sound players, UIs) and runtime-owned routing.
#[derive(Default)]
pub struct EventBus {
    registrations: Vec<Registration>,
    next_id: HandlerId,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        event_name: &str,
        owner: OwnerId,
        priority: i32,
        handler: impl Fn(&Event) -> Vec<Action> + 'static,
    ) -> HandlerId {
        let id = self.next_id;
        self.next_id += 1;
        self.registrations.push(Registration {
            id,
            event_name: event_name.to_string(),
            owner,
            priority,
            handler: Box::new(handler),
        });
        id
    }

    pub fn unregister(&mut self, id: HandlerId) {
        self.registrations.retain(|r| r.id != id);
    }

    /// Drop every handler a block registered, atomically; called on pop.
    pub fn unregister_by_owner(&mut self, owner: OwnerId) {
        self.registrations.retain(|r| r.owner != owner);
    }

    /// Invoke matching handlers and collect their actions in order.
    pub fn dispatch(&self, event: &Event) -> Vec<Action> {
        let mut matching: Vec<&Registration> = self
            .registrations
            .iter()
            .filter(|r| r.event_name == event.name)
            .collect();
        // Stable sort keeps registration order within a priority.
        matching.sort_by_key(|r| std::cmp::Reverse(r.priority));

        let mut actions = Vec::new();
        for registration in matching {
            match catch_unwind(AssertUnwindSafe(|| (registration.handler)(event))) {
                Ok(mut returned) => actions.append(&mut returned),
                Err(_) => {
                    error!(
                        event = %event.name,
                        owner = %registration.owner,
                        "event handler panicked; continuing dispatch"
                    );
                }
            }
        }
        actions
    }

    pub fn clear(&mut self) {
        self.registrations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockKey;

    fn make_event(name: &str) -> Event {
        Event::new(name, Utc::now(), json!({}))
    }

    #[test]
    fn dispatch_orders_by_priority_then_registration() {
        let mut bus = EventBus::new();
        bus.register(names::TICK, OwnerId::Runtime, 0, |e| {
            vec![Action::EmitEvent(Event::new("first", e.timestamp, json!({})))]
        });
        bus.register(names::TICK, OwnerId::Runtime, 10, |e| {
            vec![Action::EmitEvent(Event::new("high", e.timestamp, json!({})))]
        });
        bus.register(names::TICK, OwnerId::Runtime, 0, |e| {
            vec![Action::EmitEvent(Event::new("second", e.timestamp, json!({})))]
        });

        let actions = bus.dispatch(&make_event(names::TICK));
        let labels: Vec<&str> = actions
            .iter()
            .map(|a| match a {
                Action::EmitEvent(e) => e.name.as_str(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(labels, vec!["high", "first", "second"]);
    }

    #[test]
    fn dispatch_filters_by_name() {
        let mut bus = EventBus::new();
        bus.register(names::NEXT, OwnerId::Runtime, 0, |e| {
            vec![Action::EmitEvent(e.clone())]
        });
        assert!(bus.dispatch(&make_event(names::TICK)).is_empty());
        assert_eq!(bus.dispatch(&make_event(names::NEXT)).len(), 1);
    }

    #[test]
    fn unregister_by_owner_is_atomic() {
        let mut bus = EventBus::new();
        let block = OwnerId::Block(BlockKey::new());
        bus.register(names::TICK, block, 0, |e| vec![Action::EmitEvent(e.clone())]);
        bus.register(names::NEXT, block, 0, |e| vec![Action::EmitEvent(e.clone())]);
        bus.register(names::TICK, OwnerId::Runtime, 0, |e| {
            vec![Action::EmitEvent(e.clone())]
        });

        bus.unregister_by_owner(block);
        assert_eq!(bus.dispatch(&make_event(names::TICK)).len(), 1);
        assert!(bus.dispatch(&make_event(names::NEXT)).is_empty());
    }

    #[test]
    fn panicking_handler_does_not_abort_dispatch() {
        let mut bus = EventBus::new();
        bus.register(names::TICK, OwnerId::Runtime, 5, |_| panic!("handler bug"));
        bus.register(names::TICK, OwnerId::Runtime, 0, |e| {
            vec![Action::EmitEvent(e.clone())]
        });
        assert_eq!(bus.dispatch(&make_event(names::TICK)).len(), 1);
    }

    #[test]
    fn block_id_field_round_trips() {
        let key = BlockKey::new();
        let event = Event::timer_complete(key, Utc::now());
        assert_eq!(event.block_id(), Some(key));
        assert_eq!(make_event(names::TICK).block_id(), None);
    }
}
