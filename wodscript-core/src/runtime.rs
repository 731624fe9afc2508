use crate::actions::Action;
use crate::block::RuntimeBlock;
use crate::clock::{Clock, SystemClock};
use crate::compiler::{done_block, idle_block, root_block, JitCompiler};
use crate::error::RuntimeError;
use crate::events::{names, Event, EventBus, HandlerId};
use crate::memory::{memtags, Memory, MemoryRef, SearchCriteria, Visibility};
use crate::output::OutputRecord;
use crate::stack::{BlockStack, MAX_STACK_DEPTH};
use crate::types::{BlockKey, BlockType, OwnerId, Statement, StatementId, TimeSpan};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use tracing::{debug, error, warn};

/// Hard cap on one drain of the action queue; exceeding it means a cyclic
/// action graph and is treated as a bug.
pub const MAX_QUEUE_ITERATIONS: usize = 100;

pub type OutputListenerId = u64;

/// Snapshot of the live stack, for UIs and tests.
#[derive(Clone, Debug, Serialize)]
pub struct RuntimeInspection {
    pub depth: usize,
    pub blocks: Vec<BlockInspection>,
}

/// One stack entry in an inspection snapshot, bottom-up.
#[derive(Clone, Debug, Serialize)]
pub struct BlockInspection {
    pub key: BlockKey,
    pub block_type: BlockType,
    pub label: String,
    pub is_complete: bool,
}

/// The execution engine: owns the statement table, JIT, stack, memory,
/// event bus, action queue, and clock. Single-threaded and cooperative —
/// the action queue is the sole serialization point, and every mutation
/// funnels through driver methods or action execution.
pub struct ScriptRuntime {
    clock: Rc<dyn Clock>,
    statements: HashMap<StatementId, Statement>,
    roots: Vec<StatementId>,
    jit: JitCompiler,
    stack: BlockStack,
    memory: Memory,
    bus: EventBus,
    queue: VecDeque<Action>,
    draining: bool,
    outputs: Vec<(OutputListenerId, Box<dyn FnMut(&OutputRecord)>)>,
    next_output_listener: OutputListenerId,
    timeline: Vec<OutputRecord>,
    disposed: bool,
}

impl ScriptRuntime {
    /// Build a runtime over a parsed program: every statement the parser
    /// emitted plus the ordered top-level ids. The stack starts at an
    /// Idle block.
    pub fn new(
        statements: Vec<Statement>,
        roots: Vec<StatementId>,
        clock: Rc<dyn Clock>,
    ) -> Self {
        let statements: HashMap<StatementId, Statement> =
            statements.into_iter().map(|s| (s.id, s)).collect();
        let memory = Memory::new(clock.clone());
        let mut runtime = Self {
            clock,
            statements,
            roots,
            jit: JitCompiler::new(),
            stack: BlockStack::new(),
            memory,
            bus: EventBus::new(),
            queue: VecDeque::new(),
            draining: false,
            outputs: Vec::new(),
            next_output_listener: 0,
            timeline: Vec::new(),
            disposed: false,
        };
        if let Err(fault) = runtime.push_block(idle_block(), None) {
            error!(%fault, "failed to seed idle block");
        }
        runtime
    }

    pub fn with_system_clock(statements: Vec<Statement>, roots: Vec<StatementId>) -> Self {
        Self::new(statements, roots, Rc::new(SystemClock))
    }

    // ─── Facade ───────────────────────────────────────────────

    /// Compile and push the root block; the workout starts executing.
    pub fn start(&mut self) -> Result<(), RuntimeError> {
        if self.disposed {
            return Err(RuntimeError::Disposed);
        }
        if self.stack.depth() > 1 {
            return Err(RuntimeError::InvalidConfig(
                "workout already started".to_string(),
            ));
        }
        for id in &self.roots {
            if !self.statements.contains_key(id) {
                return Err(RuntimeError::UnknownStatement(*id));
            }
        }
        let root = root_block(&self.roots);
        self.queue_actions(vec![Action::PushBlock {
            block: root,
            start_time: None,
        }]);
        Ok(())
    }

    /// Inject an event: user `next`, external ticks, simulated
    /// `timer:complete`. Dispatches synchronously and drains the queue.
    pub fn handle(&mut self, event: Event) -> Result<(), RuntimeError> {
        if self.disposed {
            return Err(RuntimeError::Disposed);
        }
        debug!(event = %event.name, "handle");
        let actions = self.collect_handlers(&event);
        self.queue_actions(actions);
        Ok(())
    }

    /// O(1) statement lookup for behaviors compiling descendants.
    pub fn statement(&self, id: StatementId) -> Option<&Statement> {
        self.statements.get(&id)
    }

    /// Register an external handler on the bus under the runtime owner
    /// (sound players, UIs).
    pub fn register_handler(
        &mut self,
        event_name: &str,
        priority: i32,
        handler: impl Fn(&Event) -> Vec<Action> + 'static,
    ) -> HandlerId {
        self.bus.register(event_name, OwnerId::Runtime, priority, handler)
    }

    pub fn unregister_handler(&mut self, id: HandlerId) {
        self.bus.unregister(id);
    }

    pub fn subscribe_to_output(
        &mut self,
        listener: impl FnMut(&OutputRecord) + 'static,
    ) -> OutputListenerId {
        let id = self.next_output_listener;
        self.next_output_listener += 1;
        self.outputs.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe_output(&mut self, id: OutputListenerId) {
        self.outputs.retain(|(listener_id, _)| *listener_id != id);
    }

    /// The ordered sequence of emitted records — the workout's result
    /// timeline so far.
    pub fn timeline(&self) -> &[OutputRecord] {
        &self.timeline
    }

    pub fn inspect(&self) -> RuntimeInspection {
        RuntimeInspection {
            depth: self.stack.depth(),
            blocks: self
                .stack
                .iter()
                .map(|block| BlockInspection {
                    key: block.key(),
                    block_type: block.block_type(),
                    label: block.label().to_string(),
                    is_complete: block.is_complete(),
                })
                .collect(),
        }
    }

    /// Terminate the runtime: force-pop every block and release every
    /// resource. Idempotent.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        // Suppress queue drains while tearing down; each pop's follow-up
        // actions are dropped.
        self.draining = true;
        while self.stack.depth() > 0 {
            if let Err(fault) = self.pop_block(None) {
                error!(%fault, "pop during dispose failed");
                break;
            }
            self.queue.clear();
        }
        self.draining = false;
        self.memory.release_all();
        self.bus.clear();
        self.outputs.clear();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    // ─── State access for behaviors and strategies ────────────

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.depth()
    }

    pub fn top_block(&self) -> Option<Rc<RuntimeBlock>> {
        self.stack.top().cloned()
    }

    pub fn is_top(&self, key: BlockKey) -> bool {
        self.stack.top().map(|b| b.key() == key).unwrap_or(false)
    }

    pub fn block_beneath(&self, key: BlockKey) -> Option<Rc<RuntimeBlock>> {
        self.stack.beneath(key).cloned()
    }

    /// Inherited-visibility refs of the given type owned by live blocks,
    /// innermost-first. This is the ancestor walk parents use to hand
    /// context to children discovered at runtime.
    pub fn search_inherited(&self, type_tag: &str) -> Vec<MemoryRef> {
        let mut refs = Vec::new();
        for block in self.stack.top_down() {
            refs.extend(self.memory.search(
                &SearchCriteria::of_type(type_tag)
                    .owned_by(block.owner())
                    .visible_as(Visibility::Inherited),
            ));
        }
        refs
    }

    /// The innermost inherited rep target visible right now; what an
    /// Effort compile reads.
    pub fn inherited_reps_target(&self) -> Option<u32> {
        self.search_inherited(memtags::METRIC_REPS)
            .first()
            .and_then(|handle| self.memory.get(handle))
            .and_then(|value| value.as_reps())
            .map(|reps| reps.target)
    }

    // ─── Action queue ─────────────────────────────────────────

    /// Append actions; if the executor is idle, start draining.
    pub(crate) fn queue_actions(&mut self, actions: Vec<Action>) {
        self.queue.extend(actions);
        if !self.draining {
            self.drain();
        }
    }

    fn drain(&mut self) {
        self.draining = true;
        let mut iterations = 0usize;
        'outer: loop {
            while let Some(action) = self.queue.pop_front() {
                iterations += 1;
                if iterations > MAX_QUEUE_ITERATIONS {
                    error!(
                        limit = MAX_QUEUE_ITERATIONS,
                        "action queue iteration cap exceeded; abandoning drain"
                    );
                    self.queue.clear();
                    break 'outer;
                }
                debug!(action = action.kind(), "run action");
                if let Err(fault) = self.run_action(action) {
                    error!(%fault, "action failed; continuing with next action");
                }
            }
            if !self.sweep() && self.queue.is_empty() {
                break;
            }
        }
        self.draining = false;
    }

    fn run_action(&mut self, action: Action) -> Result<(), RuntimeError> {
        match action {
            Action::CompileAndPushChild {
                statement_ids,
                start_time,
            } => {
                match self.jit.compile(&statement_ids, self) {
                    Some(block) => self.push_block(block, Some(start_time))?,
                    // A compilation miss ends this branch; nothing to push.
                    None => debug!(ids = ?statement_ids, "no strategy matched"),
                }
                Ok(())
            }
            Action::PushBlock { block, start_time } => self.push_block(block, start_time),
            Action::PopBlock { completed_at } => self.pop_block(completed_at),
            Action::EmitEvent(event) => {
                let actions = self.collect_handlers(&event);
                self.queue.extend(actions);
                Ok(())
            }
            Action::PlaySound {
                cue_id,
                sound,
                volume,
            } => {
                if sound.is_empty() {
                    return Err(RuntimeError::InvalidConfig(format!(
                        "sound cue {cue_id} has no source"
                    )));
                }
                let event = Event::new(
                    names::SOUND_PLAY,
                    self.clock.now(),
                    json!({ "sound": sound, "volume": volume, "cueId": cue_id }),
                );
                let actions = self.collect_handlers(&event);
                self.queue.extend(actions);
                Ok(())
            }
            Action::EmitOutput(record) => {
                self.emit_output(record);
                Ok(())
            }
        }
    }

    /// Bus handlers first (priority then registration order), then every
    /// block on the stack top-down. Handlers return actions; nothing
    /// executes here.
    fn collect_handlers(&mut self, event: &Event) -> Vec<Action> {
        let mut actions = self.bus.dispatch(event);
        for block in self.stack.top_down() {
            actions.extend(block.handle_event(self, event));
        }
        actions
    }

    /// Post-drain sweep: pop every complete top-of-stack. Stops as soon
    /// as a pop queues follow-up actions so they drain before the next
    /// sweep wave — this is what cascades a leaf completion up the stack
    /// synchronously.
    fn sweep(&mut self) -> bool {
        let mut swept = false;
        while let Some(top) = self.stack.top() {
            if !top.is_complete() {
                break;
            }
            if let Err(fault) = self.pop_block(None) {
                error!(%fault, "sweep pop failed");
                break;
            }
            swept = true;
            if !self.queue.is_empty() {
                break;
            }
        }
        swept
    }

    // ─── Stack lifecycle (reachable only through actions) ─────

    pub(crate) fn push_block(
        &mut self,
        block: Rc<RuntimeBlock>,
        start_time: Option<DateTime<Utc>>,
    ) -> Result<(), RuntimeError> {
        if self.disposed {
            return Err(RuntimeError::Disposed);
        }
        if block.key().is_nil() {
            return Err(RuntimeError::MissingBlockKey);
        }
        if self.stack.is_full() {
            return Err(RuntimeError::StackOverflow {
                key: block.key(),
                limit: MAX_STACK_DEPTH,
            });
        }
        let at = start_time.unwrap_or_else(|| self.clock.now());
        block.stamp_start(at);
        self.memory.register_owner(block.owner());
        self.stack.push(block.clone());
        debug!(
            block = %block.key(),
            block_type = %block.block_type(),
            depth = self.stack.depth(),
            "pushed"
        );

        let mut actions = self.collect_handlers(&Event::new(
            names::STACK_PUSH,
            at,
            json!({ "blockId": block.key().as_uuid(), "depth": self.stack.depth() }),
        ));
        actions.extend(block.mount(self, at));
        self.queue_actions(actions);
        Ok(())
    }

    pub(crate) fn pop_block(
        &mut self,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), RuntimeError> {
        let Some(block) = self.stack.top().cloned() else {
            return Ok(());
        };
        let stack_level_before_pop = self.stack.depth() - 1;
        // The snapshot instant threaded through unmount, parent.next, and
        // any child push they produce.
        let at = completed_at.unwrap_or_else(|| self.clock.now());
        block.stamp_completed(at);

        let unmount_actions = block.unmount(self, at);
        let _ = self.stack.pop();
        debug!(
            block = %block.key(),
            block_type = %block.block_type(),
            depth = self.stack.depth(),
            "popped"
        );
        let pop_event_actions = self.collect_handlers(&Event::new(
            names::STACK_POP,
            at,
            json!({ "blockId": block.key().as_uuid(), "depth": self.stack.depth() }),
        ));
        self.queue.extend(pop_event_actions);

        // Unmount actions run inline, bypassing the queue: the child must
        // be fully torn down before its parent observes its absence.
        for action in unmount_actions {
            if let Err(fault) = self.run_action(action) {
                error!(%fault, "unmount action failed");
            }
        }

        // The finalized span's metrics, read before release makes the
        // block's memory unreachable.
        let metrics = crate::behaviors::history::span_of(self, &block)
            .map(|span| span.metrics)
            .unwrap_or_default();

        block.dispose(self);
        self.memory.release(block.owner());
        self.bus.unregister_by_owner(block.owner());

        if let Some(parent) = self.stack.top().cloned() {
            let next_actions = parent.next(self, at);
            self.queue.extend(next_actions);
        }

        self.emit_completion_record(&block, at, stack_level_before_pop, metrics);

        if block.block_type() == BlockType::Root && !self.disposed {
            self.queue.push_back(Action::PushBlock {
                block: done_block(),
                start_time: Some(at),
            });
        }

        if !self.draining {
            self.drain();
        }
        Ok(())
    }

    // ─── Output emission ──────────────────────────────────────

    fn emit_completion_record(
        &mut self,
        block: &RuntimeBlock,
        at: DateTime<Utc>,
        stack_level: usize,
        metrics: std::collections::BTreeMap<String, serde_json::Value>,
    ) {
        let timing = block.timing();
        let record = OutputRecord::Completion {
            time_span: TimeSpan {
                start: timing.start_time.unwrap_or(at),
                stop: Some(at),
            },
            source_block_key: block.key(),
            source_statement_id: block.source_ids().first().copied(),
            stack_level,
            fragments: block.fragments().to_vec(),
            label: block.label().to_string(),
            block_type: block.block_type(),
            metrics,
        };
        self.emit_output(record);
    }

    fn emit_output(&mut self, record: OutputRecord) {
        self.timeline.push(record.clone());
        for index in 0..self.outputs.len() {
            let (id, listener) = &mut self.outputs[index];
            let result = catch_unwind(AssertUnwindSafe(|| listener(&record)));
            if result.is_err() {
                warn!(listener = *id, "output listener panicked; continuing");
            }
        }
    }
}

impl Drop for ScriptRuntime {
    fn drop(&mut self) {
        if !self.disposed {
            self.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn make_runtime() -> (ScriptRuntime, ManualClock) {
        let clock = ManualClock::starting_at(Utc::now());
        let rt = ScriptRuntime::new(Vec::new(), Vec::new(), Rc::new(clock.clone()));
        (rt, clock)
    }

    fn make_plain_block(block_type: BlockType) -> Rc<RuntimeBlock> {
        Rc::new(RuntimeBlock::new(
            BlockKey::new(),
            vec![],
            block_type,
            "test",
            vec![],
            vec![],
        ))
    }

    fn nil_key_block() -> Rc<RuntimeBlock> {
        Rc::new(RuntimeBlock::new(
            BlockKey::nil(),
            vec![],
            BlockType::Group,
            "broken",
            vec![],
            vec![],
        ))
    }

    #[test]
    fn new_runtime_rests_on_idle() {
        let (rt, _clock) = make_runtime();
        let inspection = rt.inspect();
        assert_eq!(inspection.depth, 1);
        assert_eq!(inspection.blocks[0].block_type, BlockType::Idle);
    }

    #[test]
    fn push_with_nil_key_is_a_contract_violation() {
        let (mut rt, _clock) = make_runtime();
        let err = rt.push_block(nil_key_block(), None).unwrap_err();
        assert!(matches!(err, RuntimeError::MissingBlockKey));
        // Stack untouched.
        assert_eq!(rt.stack_depth(), 1);
    }

    #[test]
    fn push_beyond_depth_limit_is_rejected_without_mutation() {
        let (mut rt, _clock) = make_runtime();
        for _ in 0..(MAX_STACK_DEPTH - 1) {
            rt.push_block(make_plain_block(BlockType::Group), None)
                .unwrap();
        }
        assert_eq!(rt.stack_depth(), MAX_STACK_DEPTH);
        let err = rt
            .push_block(make_plain_block(BlockType::Group), None)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::StackOverflow { .. }));
        assert_eq!(rt.stack_depth(), MAX_STACK_DEPTH);
    }

    #[test]
    fn failed_push_action_does_not_stop_the_queue() {
        let (mut rt, _clock) = make_runtime();
        let seen = Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = seen.clone();
        rt.register_handler("probe", 0, move |e| {
            sink.borrow_mut().push(e.name.clone());
            vec![]
        });
        // A failing push followed by a probe event: the queue pops the
        // failing action, logs, and continues.
        rt.queue_actions(vec![
            Action::PushBlock {
                block: nil_key_block(),
                start_time: None,
            },
            Action::EmitEvent(Event::new("probe", rt.clock_now(), json!({}))),
        ]);
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(rt.stack_depth(), 1);
    }

    #[test]
    fn queue_iteration_cap_aborts_cyclic_graphs() {
        let (mut rt, _clock) = make_runtime();
        // A handler that re-emits its own event forever.
        rt.register_handler("loop", 0, |e| vec![Action::EmitEvent(e.clone())]);
        rt.handle(Event::new("loop", Utc::now(), json!({}))).unwrap();
        // The drain aborted; the runtime stays usable.
        assert_eq!(rt.stack_depth(), 1);
        rt.push_block(make_plain_block(BlockType::Group), None)
            .unwrap();
        assert_eq!(rt.stack_depth(), 2);
    }

    #[test]
    fn pop_emits_output_at_pre_pop_level() {
        let (mut rt, _clock) = make_runtime();
        rt.push_block(make_plain_block(BlockType::Group), None)
            .unwrap();
        rt.push_block(make_plain_block(BlockType::Effort), None)
            .unwrap();
        rt.pop_block(None).unwrap();
        assert_eq!(rt.timeline().len(), 1);
        assert_eq!(rt.timeline()[0].stack_level(), 2);
        assert_eq!(rt.timeline()[0].block_type(), BlockType::Effort);
    }

    #[test]
    fn timing_is_frozen_across_explicit_instants() {
        let (mut rt, clock) = make_runtime();
        let t0 = clock.now();
        let block = make_plain_block(BlockType::Effort);
        rt.push_block(block.clone(), Some(t0)).unwrap();
        clock.advance_ms(500);
        let t1 = clock.now();
        rt.pop_block(Some(t1)).unwrap();
        assert_eq!(block.timing().start_time, Some(t0));
        assert_eq!(block.timing().completed_at, Some(t1));
        assert_eq!(rt.timeline()[0].time_span().start, t0);
        assert_eq!(rt.timeline()[0].time_span().stop, Some(t1));
    }

    #[test]
    fn dispose_releases_everything_and_rejects_events() {
        let (mut rt, _clock) = make_runtime();
        rt.push_block(make_plain_block(BlockType::Group), None)
            .unwrap();
        rt.dispose();
        assert_eq!(rt.stack_depth(), 0);
        assert!(matches!(
            rt.handle(Event::next(Utc::now())),
            Err(RuntimeError::Disposed)
        ));
        // Idempotent.
        rt.dispose();
    }

    #[test]
    fn output_listener_panic_is_contained() {
        let (mut rt, _clock) = make_runtime();
        rt.subscribe_to_output(|_| panic!("listener bug"));
        let seen = Rc::new(std::cell::Cell::new(0usize));
        let sink = seen.clone();
        rt.subscribe_to_output(move |_| sink.set(sink.get() + 1));
        rt.push_block(make_plain_block(BlockType::Effort), None)
            .unwrap();
        rt.pop_block(None).unwrap();
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn unsubscribed_output_listener_stops_receiving() {
        let (mut rt, _clock) = make_runtime();
        let seen = Rc::new(std::cell::Cell::new(0usize));
        let sink = seen.clone();
        let id = rt.subscribe_to_output(move |_| sink.set(sink.get() + 1));
        rt.push_block(make_plain_block(BlockType::Effort), None)
            .unwrap();
        rt.pop_block(None).unwrap();
        rt.unsubscribe_output(id);
        rt.push_block(make_plain_block(BlockType::Effort), None)
            .unwrap();
        rt.pop_block(None).unwrap();
        assert_eq!(seen.get(), 1);
    }
}
