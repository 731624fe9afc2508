use crate::block::RuntimeBlock;
use crate::events::Event;
use crate::output::OutputRecord;
use crate::types::StatementId;
use chrono::{DateTime, Utc};
use std::rc::Rc;

/// A deferred side effect — the only legal mutator of runtime state.
///
/// Behaviors and event handlers return these; the driver's FIFO queue
/// executes them. The closed set keeps dispatch on a tag instead of a
/// dynamic callable.
#[derive(Clone)]
pub enum Action {
    /// JIT-compile the statement group and push the resulting block with
    /// the frozen start instant. A compilation miss is not an error.
    CompileAndPushChild {
        statement_ids: Vec<StatementId>,
        start_time: DateTime<Utc>,
    },
    /// Push an already-materialized block (Done block, tests).
    PushBlock {
        block: Rc<RuntimeBlock>,
        start_time: Option<DateTime<Utc>>,
    },
    /// Pop the top of the stack at the given instant.
    PopBlock {
        completed_at: Option<DateTime<Utc>>,
    },
    /// Dispatch an event through the bus and the live stack.
    EmitEvent(Event),
    /// Hand a cue to the sound player via a `sound:play` event.
    PlaySound {
        cue_id: String,
        sound: String,
        volume: f32,
    },
    /// Append a record to the result timeline and notify subscribers.
    EmitOutput(OutputRecord),
}

impl Action {
    /// Tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::CompileAndPushChild { .. } => "compile_and_push_child",
            Action::PushBlock { .. } => "push_block",
            Action::PopBlock { .. } => "pop_block",
            Action::EmitEvent(_) => "emit_event",
            Action::PlaySound { .. } => "play_sound",
            Action::EmitOutput(_) => "emit_output",
        }
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::CompileAndPushChild { statement_ids, .. } => f
                .debug_struct("CompileAndPushChild")
                .field("statement_ids", statement_ids)
                .finish(),
            Action::PushBlock { block, .. } => f
                .debug_struct("PushBlock")
                .field("key", &block.key())
                .field("block_type", &block.block_type())
                .finish(),
            Action::PopBlock { completed_at } => f
                .debug_struct("PopBlock")
                .field("completed_at", completed_at)
                .finish(),
            Action::EmitEvent(event) => f.debug_tuple("EmitEvent").field(&event.name).finish(),
            Action::PlaySound { cue_id, sound, .. } => f
                .debug_struct("PlaySound")
                .field("cue_id", cue_id)
                .field("sound", sound)
                .finish(),
            Action::EmitOutput(record) => {
                f.debug_tuple("EmitOutput").field(&record.label()).finish()
            }
        }
    }
}
