use crate::actions::Action;
use crate::behaviors::Behavior;
use crate::events::Event;
use crate::runtime::ScriptRuntime;
use crate::types::{BlockKey, BlockType, ExecutionTiming, Fragment, OwnerId, StatementId};
use chrono::{DateTime, Utc};
use std::cell::{Cell, RefCell};
use tracing::{debug, error};

/// The executable unit: identity, source provenance, an ordered behavior
/// list, and timing stamped by the driver.
///
/// There is no block hierarchy — every composite is this one type
/// parameterized by its behaviors. `block_type` exists for logging, span
/// typing, and tests. Durable per-block state lives in the runtime's
/// memory under this block's key, never on the behaviors themselves.
pub struct RuntimeBlock {
    key: BlockKey,
    source_ids: Vec<StatementId>,
    block_type: BlockType,
    label: String,
    fragments: Vec<Fragment>,
    behaviors: Vec<Behavior>,
    timing: RefCell<ExecutionTiming>,
    complete: Cell<bool>,
}

impl RuntimeBlock {
    pub fn new(
        key: BlockKey,
        source_ids: Vec<StatementId>,
        block_type: BlockType,
        label: impl Into<String>,
        fragments: Vec<Fragment>,
        behaviors: Vec<Behavior>,
    ) -> Self {
        Self {
            key,
            source_ids,
            block_type,
            label: label.into(),
            fragments,
            behaviors,
            timing: RefCell::new(ExecutionTiming::default()),
            complete: Cell::new(false),
        }
    }

    pub fn key(&self) -> BlockKey {
        self.key
    }

    pub fn owner(&self) -> OwnerId {
        OwnerId::Block(self.key)
    }

    pub fn source_ids(&self) -> &[StatementId] {
        &self.source_ids
    }

    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn behaviors(&self) -> &[Behavior] {
        &self.behaviors
    }

    /// The block's loop coordinator, if it carries one.
    pub fn loop_coordinator(&self) -> Option<&crate::behaviors::LoopCoordinatorBehavior> {
        self.behaviors.iter().find_map(|b| match b {
            Behavior::Loop(coordinator) => Some(coordinator),
            _ => None,
        })
    }

    /// The block's timer behavior, if it carries one.
    pub fn timer_behavior(&self) -> Option<&crate::behaviors::TimerBehavior> {
        self.behaviors.iter().find_map(|b| match b {
            Behavior::Timer(timer) => Some(timer),
            _ => None,
        })
    }

    pub fn timing(&self) -> ExecutionTiming {
        *self.timing.borrow()
    }

    pub(crate) fn stamp_start(&self, at: DateTime<Utc>) {
        self.timing.borrow_mut().start_time = Some(at);
    }

    pub(crate) fn stamp_completed(&self, at: DateTime<Utc>) {
        self.timing.borrow_mut().completed_at = Some(at);
    }

    /// Monotonic while the block is on the stack: once set, never reverts.
    pub fn mark_complete(&self) {
        self.complete.set(true);
    }

    pub fn is_complete(&self) -> bool {
        self.complete.get()
    }

    // ─── Lifecycle entry points ───────────────────────────────
    //
    // Each delegates to the behaviors in declaration order and
    // concatenates their action lists. A behavior fault is logged with
    // behavior and block identity and skipped; it never crashes the
    // runtime.

    pub(crate) fn mount(&self, rt: &mut ScriptRuntime, at: DateTime<Utc>) -> Vec<Action> {
        debug!(block = %self.key, block_type = %self.block_type, "mount");
        self.collect(|behavior| behavior.on_push(rt, self, at))
    }

    pub(crate) fn next(&self, rt: &mut ScriptRuntime, at: DateTime<Utc>) -> Vec<Action> {
        debug!(block = %self.key, block_type = %self.block_type, "next");
        self.collect(|behavior| behavior.on_next(rt, self, at))
    }

    pub(crate) fn unmount(&self, rt: &mut ScriptRuntime, at: DateTime<Utc>) -> Vec<Action> {
        debug!(block = %self.key, block_type = %self.block_type, "unmount");
        self.collect(|behavior| behavior.on_pop(rt, self, at))
    }

    pub(crate) fn handle_event(&self, rt: &mut ScriptRuntime, event: &Event) -> Vec<Action> {
        self.collect(|behavior| behavior.on_event(rt, self, event))
    }

    pub(crate) fn dispose(&self, rt: &mut ScriptRuntime) {
        for behavior in &self.behaviors {
            behavior.on_dispose(rt, self);
        }
    }

    fn collect(
        &self,
        mut hook: impl FnMut(&Behavior) -> Result<Vec<Action>, crate::error::RuntimeError>,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        for behavior in &self.behaviors {
            match hook(behavior) {
                Ok(mut returned) => actions.append(&mut returned),
                Err(fault) => {
                    error!(
                        block = %self.key,
                        block_type = %self.block_type,
                        behavior = behavior.kind(),
                        %fault,
                        "behavior fault; continuing"
                    );
                }
            }
        }
        actions
    }
}

impl std::fmt::Debug for RuntimeBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeBlock")
            .field("key", &self.key)
            .field("block_type", &self.block_type)
            .field("label", &self.label)
            .field("behaviors", &self.behaviors.len())
            .field("complete", &self.complete.get())
            .finish()
    }
}
