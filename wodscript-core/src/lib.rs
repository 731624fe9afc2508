//! Scripted workout execution runtime.
//!
//! Takes a parsed workout program — a tree of statements with typed
//! fragments — just-in-time compiles each statement group into a runtime
//! block with attached behaviors, and drives those blocks through a
//! push/mount/next/unmount/pop lifecycle that produces a timeline of
//! completed execution spans.
//!
//! Control flow is single-threaded and cooperative: every side effect is
//! an [`actions::Action`] run from the runtime's FIFO queue, and the
//! block stack is the only ownership structure. Parsing, rendering,
//! audio playback, and persistence are external collaborators speaking
//! through [`events::Event`]s and [`output::OutputRecord`]s.

pub mod actions;
pub mod behaviors;
pub mod block;
pub mod clock;
pub mod compiler;
pub mod error;
pub mod events;
pub mod memory;
pub mod output;
pub mod runtime;
pub mod stack;
pub mod types;

pub use actions::Action;
pub use block::RuntimeBlock;
pub use clock::{Clock, ManualClock, SnapshotClock, SystemClock};
pub use compiler::{JitCompiler, Strategy};
pub use error::RuntimeError;
pub use events::{Event, EventBus};
pub use memory::{Memory, MemoryRef, MemoryValue, Visibility};
pub use output::{ExecutionSpan, OutputRecord, SpanStatus};
pub use runtime::{RuntimeInspection, ScriptRuntime};
pub use types::{
    BlockKey, BlockType, Fragment, FragmentKind, LoopType, RoundScheme, Statement, StatementId,
    TimeSpan, TimerDirection,
};
