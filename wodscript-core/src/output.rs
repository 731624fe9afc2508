use crate::types::{BlockKey, BlockType, Fragment, StatementId, TimeSpan};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Execution spans ──────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Active,
    Completed,
}

/// Record of one block's execution interval. Allocated in the owning
/// block's context on mount (`Active`), finalized on pop (`Completed`),
/// immutable after emission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSpan {
    pub id: Uuid,
    pub block_id: BlockKey,
    pub parent_span_id: Option<Uuid>,
    pub block_type: BlockType,
    pub label: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SpanStatus,
    pub metrics: BTreeMap<String, serde_json::Value>,
    pub fragments: Vec<Fragment>,
    pub debug_metadata: Option<serde_json::Value>,
    /// Depth the block occupied when the span opened.
    pub stack_level: usize,
}

// ─── Output records ───────────────────────────────────────────

/// Label carried by the terminal completion record the Done block emits.
pub const END_WORKOUT: &str = "END_WORKOUT";

/// A record pushed to output subscribers. The ordered sequence of these
/// is the workout's result timeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "lowercase")]
pub enum OutputRecord {
    Completion {
        time_span: TimeSpan,
        source_block_key: BlockKey,
        source_statement_id: Option<StatementId>,
        /// Depth the block occupied at the moment of pop.
        stack_level: usize,
        fragments: Vec<Fragment>,
        label: String,
        block_type: BlockType,
        /// Finalized span metrics (rounds, reps, round spans).
        metrics: BTreeMap<String, serde_json::Value>,
    },
}

impl OutputRecord {
    pub fn label(&self) -> &str {
        match self {
            OutputRecord::Completion { label, .. } => label,
        }
    }

    pub fn block_type(&self) -> BlockType {
        match self {
            OutputRecord::Completion { block_type, .. } => *block_type,
        }
    }

    pub fn stack_level(&self) -> usize {
        match self {
            OutputRecord::Completion { stack_level, .. } => *stack_level,
        }
    }

    pub fn source_block_key(&self) -> BlockKey {
        match self {
            OutputRecord::Completion {
                source_block_key, ..
            } => *source_block_key,
        }
    }

    pub fn time_span(&self) -> TimeSpan {
        match self {
            OutputRecord::Completion { time_span, .. } => *time_span,
        }
    }

    pub fn metrics(&self) -> &BTreeMap<String, serde_json::Value> {
        match self {
            OutputRecord::Completion { metrics, .. } => metrics,
        }
    }
}
