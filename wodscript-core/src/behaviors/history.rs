use crate::actions::Action;
use crate::behaviors::loops;
use crate::block::RuntimeBlock;
use crate::error::RuntimeError;
use crate::memory::{memtags, MemoryRef, MemoryValue, SearchCriteria, Visibility};
use crate::output::{ExecutionSpan, SpanStatus};
use crate::runtime::ScriptRuntime;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Records the block's execution as a `span.execution` slot: allocated
/// active on mount with parent linkage to the span of the block beneath,
/// finalized (status, end time, metrics) on pop.
pub struct HistoryBehavior {
    /// Static metadata stamped onto the span at construction time.
    pub debug_metadata: Option<serde_json::Value>,
}

impl HistoryBehavior {
    pub fn new() -> Self {
        Self {
            debug_metadata: None,
        }
    }

    pub fn with_metadata(metadata: serde_json::Value) -> Self {
        Self {
            debug_metadata: Some(metadata),
        }
    }

    pub fn on_push(
        &self,
        rt: &mut ScriptRuntime,
        block: &RuntimeBlock,
        at: DateTime<Utc>,
    ) -> Result<Vec<Action>, RuntimeError> {
        let parent_span_id = rt
            .block_beneath(block.key())
            .and_then(|parent| span_of(rt, &parent))
            .map(|span| span.id);
        let span = ExecutionSpan {
            id: Uuid::now_v7(),
            block_id: block.key(),
            parent_span_id,
            block_type: block.block_type(),
            label: block.label().to_string(),
            start_time: at,
            end_time: None,
            status: SpanStatus::Active,
            metrics: BTreeMap::new(),
            fragments: block.fragments().to_vec(),
            debug_metadata: self.debug_metadata.clone(),
            stack_level: rt.stack_depth().saturating_sub(1),
        };
        rt.memory_mut().allocate(
            memtags::SPAN_EXECUTION,
            block.owner(),
            MemoryValue::Span(span),
            Visibility::Public,
        );
        Ok(Vec::new())
    }

    pub fn on_pop(
        &self,
        rt: &mut ScriptRuntime,
        block: &RuntimeBlock,
        at: DateTime<Utc>,
    ) -> Result<Vec<Action>, RuntimeError> {
        let metrics = collect_metrics(rt, block);
        if let Some(handle) = span_ref(rt, block) {
            rt.memory_mut().update(&handle, |value| {
                if let MemoryValue::Span(span) = value {
                    span.status = SpanStatus::Completed;
                    span.end_time = Some(at);
                    span.metrics = metrics;
                }
            });
        }
        Ok(Vec::new())
    }
}

impl Default for HistoryBehavior {
    fn default() -> Self {
        Self::new()
    }
}

fn span_ref(rt: &ScriptRuntime, block: &RuntimeBlock) -> Option<MemoryRef> {
    rt.memory()
        .search(&SearchCriteria::of_type(memtags::SPAN_EXECUTION).owned_by(block.owner()))
        .into_iter()
        .next()
}

/// The block's execution span, while its memory is live.
pub fn span_of(rt: &ScriptRuntime, block: &RuntimeBlock) -> Option<ExecutionSpan> {
    span_ref(rt, block)
        .and_then(|r| rt.memory().get(&r))
        .and_then(|v| match v {
            MemoryValue::Span(span) => Some(span),
            _ => None,
        })
}

/// Metrics worth keeping on the finalized span: completed rounds for a
/// coordinator, rep progress for a rep-target block.
fn collect_metrics(
    rt: &ScriptRuntime,
    block: &RuntimeBlock,
) -> BTreeMap<String, serde_json::Value> {
    let mut metrics = BTreeMap::new();
    if let Some(coordinator) = block.loop_coordinator() {
        let state = coordinator.state(rt, block);
        metrics.insert("rounds".to_string(), json!(state.rounds));
        let spans = loops::round_spans(rt, block);
        if !spans.is_empty() {
            metrics.insert("roundSpans".to_string(), json!(spans));
        }
    }
    if let Some(reps) = rt
        .memory()
        .search(&SearchCriteria::of_type(memtags::METRIC_REPS).owned_by(block.owner()))
        .into_iter()
        .next()
        .and_then(|r| rt.memory().get(&r))
        .and_then(|v| v.as_reps())
    {
        metrics.insert("reps".to_string(), json!(reps));
    }
    metrics
}
