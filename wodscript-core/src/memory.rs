use crate::clock::Clock;
use crate::output::ExecutionSpan;
use crate::types::{DurationMs, OwnerId, TimeSpan};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use tracing::{error, warn};
use uuid::Uuid;

// ─── Stable memory type tags ──────────────────────────────────

pub mod memtags {
    pub const METRIC_REPS: &str = "metric.reps";
    pub const TIMER_SPANS: &str = "timer.spans";
    pub const TIMER_IS_RUNNING: &str = "timer.isRunning";
    pub const SPAN_EXECUTION: &str = "span.execution";
    pub const SOUND_STATE: &str = "sound.state";
    pub const ROUND_SPAN: &str = "round.span";
    pub const LOOP_INDEX: &str = "loop.index";
    pub const INTERVAL_WAITING: &str = "interval.waiting";
}

// ─── Values ───────────────────────────────────────────────────

/// One recorded round of a loop coordinator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundSpan {
    /// 1-based round number.
    pub round: u32,
    pub target_reps: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl RoundSpan {
    pub fn duration_ms(&self, now: DateTime<Utc>) -> DurationMs {
        (self.ended_at.unwrap_or(now) - self.started_at)
            .num_milliseconds()
            .max(0)
    }
}

/// Trigger state of one sound cue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CueState {
    pub cue_id: String,
    pub triggered: bool,
}

/// Rep target inherited from a rep scheme, plus progress against it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepTarget {
    pub target: u32,
    pub completed: u32,
}

/// The closed set of values a memory slot can hold.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MemoryValue {
    Bool(bool),
    Int(i64),
    Text(String),
    Reps(RepTarget),
    TimerSpans(Vec<TimeSpan>),
    Span(ExecutionSpan),
    RoundSpans(Vec<RoundSpan>),
    CueStates(Vec<CueState>),
    Json(serde_json::Value),
}

impl MemoryValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MemoryValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            MemoryValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_reps(&self) -> Option<RepTarget> {
        match self {
            MemoryValue::Reps(r) => Some(*r),
            _ => None,
        }
    }
}

// ─── References ───────────────────────────────────────────────

/// Visibility of a memory ref to blocks other than its owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Readable only by the owner.
    Private,
    /// Readable by any block while the owner is live.
    Public,
    /// Readable by descendants of the owner via ancestor-walking search.
    Inherited,
}

/// Handle to a memory slot. Cheap to clone; resolving a ref after its
/// owner popped yields `None`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRef {
    pub id: Uuid,
    pub owner: OwnerId,
    pub type_tag: String,
    pub visibility: Visibility,
}

/// Predicate for `Memory::search`. Unset fields match anything.
#[derive(Clone, Debug, Default)]
pub struct SearchCriteria {
    pub type_tag: Option<String>,
    pub owner: Option<OwnerId>,
    pub visibility: Option<Visibility>,
}

impl SearchCriteria {
    pub fn of_type(type_tag: &str) -> Self {
        Self {
            type_tag: Some(type_tag.to_string()),
            ..Default::default()
        }
    }

    pub fn owned_by(mut self, owner: OwnerId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn visible_as(mut self, visibility: Visibility) -> Self {
        self.visibility = Some(visibility);
        self
    }
}

// ─── Subscriptions ────────────────────────────────────────────

pub type SubscriptionId = u64;

#[derive(Clone, Copy, Debug, Default)]
pub struct SubscribeOptions {
    /// Fire once with the current value at registration.
    pub immediate: bool,
    /// Coalesce notifications inside this window.
    pub throttle_ms: Option<DurationMs>,
}

struct Subscriber {
    id: SubscriptionId,
    callback: Box<dyn FnMut(&MemoryValue)>,
    throttle_ms: Option<DurationMs>,
    last_fired: Option<DateTime<Utc>>,
}

// ─── Store ────────────────────────────────────────────────────

struct Slot {
    handle: MemoryRef,
    value: MemoryValue,
    seq: u64,
    subscribers: Vec<Subscriber>,
}

/// Keyed, typed, owner-scoped value store. Allocation requires a live
/// owner; releasing an owner drops its refs and subscriptions atomically.
pub struct Memory {
    clock: Rc<dyn Clock>,
    slots: HashMap<Uuid, Slot>,
    by_owner: HashMap<OwnerId, Vec<Uuid>>,
    live_owners: HashSet<OwnerId>,
    subscription_slots: HashMap<SubscriptionId, Uuid>,
    next_seq: u64,
    next_subscription: SubscriptionId,
}

impl Memory {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        let mut live_owners = HashSet::new();
        // The runtime sentinel owner is always live.
        live_owners.insert(OwnerId::Runtime);
        Self {
            clock,
            slots: HashMap::new(),
            by_owner: HashMap::new(),
            live_owners,
            subscription_slots: HashMap::new(),
            next_seq: 0,
            next_subscription: 0,
        }
    }

    pub fn register_owner(&mut self, owner: OwnerId) {
        self.live_owners.insert(owner);
    }

    pub fn is_live(&self, owner: OwnerId) -> bool {
        self.live_owners.contains(&owner)
    }

    /// Create a new typed slot. Returns `None` if the owner is not a live
    /// block (the runtime sentinel is always live).
    pub fn allocate(
        &mut self,
        type_tag: &str,
        owner: OwnerId,
        initial: MemoryValue,
        visibility: Visibility,
    ) -> Option<MemoryRef> {
        if !self.is_live(owner) {
            warn!(%owner, type_tag, "memory allocate refused: owner is not live");
            return None;
        }
        let handle = MemoryRef {
            id: Uuid::now_v7(),
            owner,
            type_tag: type_tag.to_string(),
            visibility,
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots.insert(
            handle.id,
            Slot {
                handle: handle.clone(),
                value: initial,
                seq,
                subscribers: Vec::new(),
            },
        );
        self.by_owner.entry(owner).or_default().push(handle.id);
        Some(handle)
    }

    /// O(1). `None` once the owning block has popped.
    pub fn get(&self, handle: &MemoryRef) -> Option<MemoryValue> {
        self.slots.get(&handle.id).map(|slot| slot.value.clone())
    }

    /// O(1) write. Subscribers fire after the value is committed, in
    /// registration order. Returns false for a released ref.
    pub fn set(&mut self, handle: &MemoryRef, value: MemoryValue) -> bool {
        self.update(handle, |slot| *slot = value)
    }

    /// In-place mutation of a slot value, with the same notification
    /// semantics as `set`.
    pub fn update(&mut self, handle: &MemoryRef, f: impl FnOnce(&mut MemoryValue)) -> bool {
        let now = self.clock.now();
        let Some(slot) = self.slots.get_mut(&handle.id) else {
            return false;
        };
        f(&mut slot.value);
        notify_subscribers(slot, now);
        true
    }

    /// Refs matching the criteria, in allocation order. Ancestor-ordered
    /// inherited lookups are composed by the runtime, which knows the stack.
    pub fn search(&self, criteria: &SearchCriteria) -> Vec<MemoryRef> {
        let mut hits: Vec<(u64, MemoryRef)> = self
            .slots
            .values()
            .filter(|slot| {
                criteria
                    .type_tag
                    .as_ref()
                    .is_none_or(|t| &slot.handle.type_tag == t)
                    && criteria.owner.is_none_or(|o| slot.handle.owner == o)
                    && criteria
                        .visibility
                        .is_none_or(|v| slot.handle.visibility == v)
            })
            .map(|slot| (slot.seq, slot.handle.clone()))
            .collect();
        hits.sort_by_key(|(seq, _)| *seq);
        hits.into_iter().map(|(_, handle)| handle).collect()
    }

    /// Drop every ref owned by `owner` and its live registration. Invoked
    /// by the driver after pop; refs become unreachable.
    pub fn release(&mut self, owner: OwnerId) {
        self.live_owners.remove(&owner);
        let Some(ids) = self.by_owner.remove(&owner) else {
            return;
        };
        for id in ids {
            if let Some(slot) = self.slots.remove(&id) {
                for sub in &slot.subscribers {
                    self.subscription_slots.remove(&sub.id);
                }
            }
        }
    }

    /// Notify on every committed write to the slot. Callback panics are
    /// caught and logged; they never abort the write.
    pub fn subscribe(
        &mut self,
        handle: &MemoryRef,
        callback: impl FnMut(&MemoryValue) + 'static,
        options: SubscribeOptions,
    ) -> Option<SubscriptionId> {
        let now = self.clock.now();
        let slot = self.slots.get_mut(&handle.id)?;
        let id = self.next_subscription;
        self.next_subscription += 1;
        let mut subscriber = Subscriber {
            id,
            callback: Box::new(callback),
            throttle_ms: options.throttle_ms,
            last_fired: None,
        };
        if options.immediate {
            fire_subscriber(&mut subscriber, &slot.value, now);
        }
        slot.subscribers.push(subscriber);
        self.subscription_slots.insert(id, handle.id);
        Some(id)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        let Some(slot_id) = self.subscription_slots.remove(&id) else {
            return;
        };
        if let Some(slot) = self.slots.get_mut(&slot_id) {
            slot.subscribers.retain(|sub| sub.id != id);
        }
    }

    /// Release every owner except the runtime sentinel; used by dispose.
    pub fn release_all(&mut self) {
        let owners: Vec<OwnerId> = self.by_owner.keys().copied().collect();
        for owner in owners {
            self.release(owner);
        }
        self.live_owners.clear();
        self.live_owners.insert(OwnerId::Runtime);
    }
}

fn notify_subscribers(slot: &mut Slot, now: DateTime<Utc>) {
    for subscriber in &mut slot.subscribers {
        if let (Some(throttle), Some(last)) = (subscriber.throttle_ms, subscriber.last_fired) {
            if (now - last).num_milliseconds() < throttle {
                // Coalesced: the next write outside the window delivers.
                continue;
            }
        }
        fire_subscriber(subscriber, &slot.value, now);
    }
}

fn fire_subscriber(subscriber: &mut Subscriber, value: &MemoryValue, now: DateTime<Utc>) {
    subscriber.last_fired = Some(now);
    let result = catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(value)));
    if result.is_err() {
        error!(
            subscription = subscriber.id,
            "memory subscription callback panicked; continuing"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::BlockKey;
    use std::cell::RefCell;

    fn make_memory() -> (Memory, ManualClock) {
        let clock = ManualClock::starting_at(Utc::now());
        (Memory::new(Rc::new(clock.clone())), clock)
    }

    #[test]
    fn allocate_requires_live_owner() {
        let (mut memory, _clock) = make_memory();
        let dead = OwnerId::Block(BlockKey::new());
        assert!(memory
            .allocate("metric.reps", dead, MemoryValue::Int(0), Visibility::Private)
            .is_none());

        memory.register_owner(dead);
        assert!(memory
            .allocate("metric.reps", dead, MemoryValue::Int(0), Visibility::Private)
            .is_some());

        // The runtime sentinel is always live.
        assert!(memory
            .allocate(
                "timer.isRunning",
                OwnerId::Runtime,
                MemoryValue::Bool(true),
                Visibility::Public,
            )
            .is_some());
    }

    #[test]
    fn get_after_release_returns_none() {
        let (mut memory, _clock) = make_memory();
        let owner = OwnerId::Block(BlockKey::new());
        memory.register_owner(owner);
        let handle = memory
            .allocate("metric.reps", owner, MemoryValue::Int(21), Visibility::Inherited)
            .unwrap();
        assert_eq!(memory.get(&handle), Some(MemoryValue::Int(21)));

        memory.release(owner);
        assert_eq!(memory.get(&handle), None);
        assert!(!memory.set(&handle, MemoryValue::Int(9)));
        assert!(!memory.is_live(owner));
    }

    #[test]
    fn search_filters_by_type_owner_visibility() {
        let (mut memory, _clock) = make_memory();
        let a = OwnerId::Block(BlockKey::new());
        let b = OwnerId::Block(BlockKey::new());
        memory.register_owner(a);
        memory.register_owner(b);

        memory
            .allocate("metric.reps", a, MemoryValue::Int(21), Visibility::Inherited)
            .unwrap();
        memory
            .allocate("metric.reps", b, MemoryValue::Int(15), Visibility::Private)
            .unwrap();
        memory
            .allocate("timer.isRunning", a, MemoryValue::Bool(true), Visibility::Public)
            .unwrap();

        let reps = memory.search(&SearchCriteria::of_type("metric.reps"));
        assert_eq!(reps.len(), 2);
        // Allocation order.
        assert_eq!(reps[0].owner, a);
        assert_eq!(reps[1].owner, b);

        let inherited = memory.search(
            &SearchCriteria::of_type("metric.reps").visible_as(Visibility::Inherited),
        );
        assert_eq!(inherited.len(), 1);
        assert_eq!(inherited[0].owner, a);

        let owned = memory.search(&SearchCriteria::default().owned_by(b));
        assert_eq!(owned.len(), 1);
    }

    #[test]
    fn subscriptions_fire_after_commit_in_registration_order() {
        let (mut memory, _clock) = make_memory();
        let handle = memory
            .allocate("loop.index", OwnerId::Runtime, MemoryValue::Int(0), Visibility::Private)
            .unwrap();

        let seen: Rc<RefCell<Vec<(u8, i64)>>> = Rc::new(RefCell::new(Vec::new()));
        let first = seen.clone();
        memory.subscribe(
            &handle,
            move |v| first.borrow_mut().push((1, v.as_int().unwrap())),
            SubscribeOptions::default(),
        );
        let second = seen.clone();
        memory.subscribe(
            &handle,
            move |v| second.borrow_mut().push((2, v.as_int().unwrap())),
            SubscribeOptions::default(),
        );

        memory.set(&handle, MemoryValue::Int(3));
        assert_eq!(*seen.borrow(), vec![(1, 3), (2, 3)]);
    }

    #[test]
    fn immediate_subscription_fires_once_at_registration() {
        let (mut memory, _clock) = make_memory();
        let handle = memory
            .allocate("loop.index", OwnerId::Runtime, MemoryValue::Int(7), Visibility::Private)
            .unwrap();
        let seen: Rc<RefCell<Vec<i64>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        memory.subscribe(
            &handle,
            move |v| sink.borrow_mut().push(v.as_int().unwrap()),
            SubscribeOptions {
                immediate: true,
                throttle_ms: None,
            },
        );
        assert_eq!(*seen.borrow(), vec![7]);
    }

    #[test]
    fn throttle_coalesces_consecutive_notifications() {
        let (mut memory, clock) = make_memory();
        let handle = memory
            .allocate("loop.index", OwnerId::Runtime, MemoryValue::Int(0), Visibility::Private)
            .unwrap();
        let seen: Rc<RefCell<Vec<i64>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        memory.subscribe(
            &handle,
            move |v| sink.borrow_mut().push(v.as_int().unwrap()),
            SubscribeOptions {
                immediate: false,
                throttle_ms: Some(100),
            },
        );

        memory.set(&handle, MemoryValue::Int(1));
        memory.set(&handle, MemoryValue::Int(2)); // inside the window
        clock.advance_ms(150);
        memory.set(&handle, MemoryValue::Int(3));
        assert_eq!(*seen.borrow(), vec![1, 3]);
    }

    #[test]
    fn panicking_callback_is_caught() {
        let (mut memory, _clock) = make_memory();
        let handle = memory
            .allocate("loop.index", OwnerId::Runtime, MemoryValue::Int(0), Visibility::Private)
            .unwrap();
        memory.subscribe(
            &handle,
            |_| panic!("subscriber bug"),
            SubscribeOptions::default(),
        );
        let seen: Rc<RefCell<Vec<i64>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        memory.subscribe(
            &handle,
            move |v| sink.borrow_mut().push(v.as_int().unwrap()),
            SubscribeOptions::default(),
        );

        // The panic is logged; later subscribers still fire.
        assert!(memory.set(&handle, MemoryValue::Int(5)));
        assert_eq!(*seen.borrow(), vec![5]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let (mut memory, _clock) = make_memory();
        let handle = memory
            .allocate("loop.index", OwnerId::Runtime, MemoryValue::Int(0), Visibility::Private)
            .unwrap();
        let seen: Rc<RefCell<Vec<i64>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let sub = memory
            .subscribe(
                &handle,
                move |v| sink.borrow_mut().push(v.as_int().unwrap()),
                SubscribeOptions::default(),
            )
            .unwrap();

        memory.set(&handle, MemoryValue::Int(1));
        memory.unsubscribe(sub);
        memory.set(&handle, MemoryValue::Int(2));
        assert_eq!(*seen.borrow(), vec![1]);
    }
}
