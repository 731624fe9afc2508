//! Pluggable lifecycle participants. A block carries an ordered list of
//! these; the block's lifecycle entry points invoke them in declaration
//! order and concatenate the returned action lists, so later behaviors
//! observe earlier behaviors' state.

pub mod completion;
pub mod history;
pub mod interval;
pub mod loops;
pub mod sound;
pub mod timer;

pub use completion::{CompletionBehavior, CompletionRule};
pub use history::HistoryBehavior;
pub use interval::IntervalRestartBehavior;
pub use loops::{LoopCoordinatorBehavior, LoopState};
pub use sound::{SoundBehavior, SoundCue};
pub use timer::{TimerBehavior, TimerRole};

use crate::actions::Action;
use crate::block::RuntimeBlock;
use crate::error::RuntimeError;
use crate::events::Event;
use crate::runtime::ScriptRuntime;
use chrono::{DateTime, Utc};

/// The closed set of behavior kinds, dispatched on the tag.
pub enum Behavior {
    Timer(TimerBehavior),
    Loop(LoopCoordinatorBehavior),
    Completion(CompletionBehavior),
    History(HistoryBehavior),
    Sound(SoundBehavior),
    IntervalRestart(IntervalRestartBehavior),
}

impl Behavior {
    pub fn kind(&self) -> &'static str {
        match self {
            Behavior::Timer(_) => "timer",
            Behavior::Loop(_) => "loop_coordinator",
            Behavior::Completion(_) => "completion",
            Behavior::History(_) => "history",
            Behavior::Sound(_) => "sound",
            Behavior::IntervalRestart(_) => "interval_restart",
        }
    }

    pub fn on_push(
        &self,
        rt: &mut ScriptRuntime,
        block: &RuntimeBlock,
        at: DateTime<Utc>,
    ) -> Result<Vec<Action>, RuntimeError> {
        match self {
            Behavior::Timer(b) => b.on_push(rt, block, at),
            Behavior::Loop(b) => b.on_push(rt, block, at),
            Behavior::Completion(b) => b.on_push(rt, block, at),
            Behavior::History(b) => b.on_push(rt, block, at),
            Behavior::Sound(b) => b.on_push(rt, block, at),
            Behavior::IntervalRestart(_) => Ok(Vec::new()),
        }
    }

    pub fn on_next(
        &self,
        rt: &mut ScriptRuntime,
        block: &RuntimeBlock,
        at: DateTime<Utc>,
    ) -> Result<Vec<Action>, RuntimeError> {
        match self {
            Behavior::Loop(b) => b.on_next(rt, block, at),
            Behavior::Completion(b) => b.on_next(rt, block, at),
            _ => Ok(Vec::new()),
        }
    }

    pub fn on_pop(
        &self,
        rt: &mut ScriptRuntime,
        block: &RuntimeBlock,
        at: DateTime<Utc>,
    ) -> Result<Vec<Action>, RuntimeError> {
        match self {
            Behavior::Timer(b) => b.on_pop(rt, block, at),
            Behavior::Loop(b) => b.on_pop(rt, block, at),
            Behavior::History(b) => b.on_pop(rt, block, at),
            _ => Ok(Vec::new()),
        }
    }

    pub fn on_event(
        &self,
        rt: &mut ScriptRuntime,
        block: &RuntimeBlock,
        event: &Event,
    ) -> Result<Vec<Action>, RuntimeError> {
        match self {
            Behavior::Timer(b) => b.on_event(rt, block, event),
            Behavior::Loop(b) => b.on_event(rt, block, event),
            Behavior::Completion(b) => b.on_event(rt, block, event),
            Behavior::Sound(b) => b.on_event(rt, block, event),
            Behavior::IntervalRestart(b) => b.on_event(rt, block, event),
            Behavior::History(_) => Ok(Vec::new()),
        }
    }

    pub fn on_dispose(&self, _rt: &mut ScriptRuntime, _block: &RuntimeBlock) {
        // No behavior holds resources outside block memory; dispose is a
        // hook point for collaborator-facing behaviors.
    }
}
