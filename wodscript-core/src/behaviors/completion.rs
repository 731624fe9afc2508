use crate::actions::Action;
use crate::behaviors::timer;
use crate::block::RuntimeBlock;
use crate::error::RuntimeError;
use crate::events::{names, Event};
use crate::memory::{memtags, MemoryRef, MemoryValue, RepTarget, SearchCriteria, Visibility};
use crate::runtime::ScriptRuntime;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::cell::Cell;

/// The closed set of completion predicates a block can carry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompletionRule {
    /// A user-originated `next` while the block is top of stack.
    OnUserNext,
    /// The block's own timer reported `timer:complete`.
    TimerComplete,
    /// The block's loop coordinator has exhausted its rounds.
    LoopComplete,
    /// An inherited or own rep target has been met; the user `next`
    /// records the whole target as completed.
    RepsMet { target: u32 },
    /// Complete as soon as the block mounts (Done block).
    Immediate,
}

/// Detects completion, latches it, and emits `block:complete` exactly once.
///
/// Re-entry is idempotent: the latch never re-emits, and an external
/// `block:complete` for this block simply folds into the same latch.
pub struct CompletionBehavior {
    pub rule: CompletionRule,
    pub check_on_push: bool,
    pub check_on_next: bool,
    done: Cell<bool>,
}

impl CompletionBehavior {
    pub fn new(rule: CompletionRule) -> Self {
        let (check_on_push, check_on_next) = match rule {
            CompletionRule::Immediate => (true, false),
            CompletionRule::LoopComplete => (true, true),
            _ => (false, false),
        };
        Self {
            rule,
            check_on_push,
            check_on_next,
            done: Cell::new(false),
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.get()
    }

    pub fn on_push(
        &self,
        rt: &mut ScriptRuntime,
        block: &RuntimeBlock,
        at: DateTime<Utc>,
    ) -> Result<Vec<Action>, RuntimeError> {
        if let CompletionRule::RepsMet { target } = self.rule {
            rt.memory_mut().allocate(
                memtags::METRIC_REPS,
                block.owner(),
                MemoryValue::Reps(RepTarget {
                    target,
                    completed: 0,
                }),
                Visibility::Private,
            );
        }
        if self.check_on_push && self.evaluate(rt, block) {
            return Ok(self.latch(block, at));
        }
        Ok(Vec::new())
    }

    pub fn on_next(
        &self,
        rt: &mut ScriptRuntime,
        block: &RuntimeBlock,
        at: DateTime<Utc>,
    ) -> Result<Vec<Action>, RuntimeError> {
        if self.check_on_next && self.evaluate(rt, block) {
            return Ok(self.latch(block, at));
        }
        Ok(Vec::new())
    }

    pub fn on_event(
        &self,
        rt: &mut ScriptRuntime,
        block: &RuntimeBlock,
        event: &Event,
    ) -> Result<Vec<Action>, RuntimeError> {
        let fired = match (&self.rule, event.name.as_str()) {
            // Idempotent fold of an externally injected completion.
            (_, names::BLOCK_COMPLETE) => event.block_id() == Some(block.key()),

            (CompletionRule::OnUserNext, names::NEXT) => rt.is_top(block.key()),

            (CompletionRule::RepsMet { target }, names::NEXT) => {
                if !rt.is_top(block.key()) {
                    false
                } else {
                    record_reps_completed(rt, block, *target);
                    self.evaluate(rt, block)
                }
            }

            (CompletionRule::TimerComplete, names::TIMER_COMPLETE) => {
                event.block_id() == Some(block.key())
            }

            // A loop re-evaluates whenever its own timer or interval
            // advances it outside the next() path.
            (CompletionRule::LoopComplete, names::TIMER_COMPLETE)
            | (CompletionRule::LoopComplete, names::INTERVAL_COMPLETE) => {
                event.block_id() == Some(block.key()) && self.evaluate(rt, block)
            }

            _ => false,
        };
        if fired {
            return Ok(self.latch(block, event.timestamp));
        }
        Ok(Vec::new())
    }

    fn evaluate(&self, rt: &ScriptRuntime, block: &RuntimeBlock) -> bool {
        match &self.rule {
            CompletionRule::Immediate => true,
            CompletionRule::OnUserNext => false,
            CompletionRule::TimerComplete => {
                !timer::is_running(rt, block) && !timer::spans(rt, block).is_empty()
            }
            CompletionRule::RepsMet { .. } => reps_state(rt, block)
                .map(|reps| reps.completed >= reps.target)
                .unwrap_or(false),
            CompletionRule::LoopComplete => {
                let Some(coordinator) = block.loop_coordinator() else {
                    return false;
                };
                if coordinator.child_groups.is_empty() {
                    return true;
                }
                let state = coordinator.state(rt, block);
                coordinator.rounds_exhausted(state.rounds)
            }
        }
    }

    /// First `true` wins; afterwards the latch absorbs every re-check.
    fn latch(&self, block: &RuntimeBlock, at: DateTime<Utc>) -> Vec<Action> {
        if self.done.get() {
            return Vec::new();
        }
        self.done.set(true);
        block.mark_complete();
        vec![Action::EmitEvent(Event::new(
            names::BLOCK_COMPLETE,
            at,
            json!({ "blockId": block.key().as_uuid() }),
        ))]
    }
}

fn reps_handle(rt: &ScriptRuntime, block: &RuntimeBlock) -> Option<MemoryRef> {
    rt.memory()
        .search(&SearchCriteria::of_type(memtags::METRIC_REPS).owned_by(block.owner()))
        .into_iter()
        .next()
}

fn reps_state(rt: &ScriptRuntime, block: &RuntimeBlock) -> Option<RepTarget> {
    reps_handle(rt, block)
        .and_then(|r| rt.memory().get(&r))
        .and_then(|v| v.as_reps())
}

fn record_reps_completed(rt: &mut ScriptRuntime, block: &RuntimeBlock, target: u32) {
    if let Some(handle) = reps_handle(rt, block) {
        rt.memory_mut().update(&handle, |value| {
            if let MemoryValue::Reps(reps) = value {
                reps.completed = target.max(reps.completed);
            }
        });
    }
}
