use crate::actions::Action;
use crate::behaviors::timer;
use crate::block::RuntimeBlock;
use crate::error::RuntimeError;
use crate::events::{names, Event};
use crate::memory::{
    memtags, MemoryRef, MemoryValue, RepTarget, RoundSpan, SearchCriteria, Visibility,
};
use crate::runtime::ScriptRuntime;
use crate::types::{DurationMs, LoopType, StatementId};
use chrono::{DateTime, Utc};
use serde_json::json;

/// Derived view of a coordinator's single integer index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopState {
    pub index: i64,
    pub position: usize,
    pub rounds: u32,
}

/// Drives a block's children: advances through child groups position by
/// position, counts rounds, and queues `CompileAndPushChild` for the next
/// group with the frozen lifecycle instant.
///
/// State is one integer `index` (initialized to −1) in block memory;
/// `position = index mod |child_groups|`, `rounds = index div |child_groups|`.
pub struct LoopCoordinatorBehavior {
    /// Ordered statement-id groups; each group is one position.
    pub child_groups: Vec<Vec<StatementId>>,
    pub loop_type: LoopType,
    /// Required for every loop type except `TimeBound` (unbounded).
    pub total_rounds: Option<u32>,
    /// Per-round rep counts; cycles by modulo when `total_rounds`
    /// exceeds its length. Non-empty iff `loop_type == RepScheme`.
    pub rep_scheme: Vec<u32>,
    /// Interval length; set iff `loop_type == Interval`.
    pub interval_ms: Option<DurationMs>,
}

impl LoopCoordinatorBehavior {
    pub fn fixed(child_groups: Vec<Vec<StatementId>>, total_rounds: u32) -> Self {
        Self {
            child_groups,
            loop_type: LoopType::Fixed,
            total_rounds: Some(total_rounds),
            rep_scheme: Vec::new(),
            interval_ms: None,
        }
    }

    pub fn rep_scheme(child_groups: Vec<Vec<StatementId>>, scheme: Vec<u32>) -> Self {
        let total = scheme.len() as u32;
        Self {
            child_groups,
            loop_type: LoopType::RepScheme,
            total_rounds: Some(total),
            rep_scheme: scheme,
            interval_ms: None,
        }
    }

    pub fn time_bound(child_groups: Vec<Vec<StatementId>>) -> Self {
        Self {
            child_groups,
            loop_type: LoopType::TimeBound,
            total_rounds: None,
            rep_scheme: Vec::new(),
            interval_ms: None,
        }
    }

    pub fn interval(
        child_groups: Vec<Vec<StatementId>>,
        total_rounds: u32,
        interval_ms: DurationMs,
    ) -> Self {
        Self {
            child_groups,
            loop_type: LoopType::Interval,
            total_rounds: Some(total_rounds),
            rep_scheme: Vec::new(),
            interval_ms: Some(interval_ms),
        }
    }

    /// Rep target for a round (0-based), cycling the scheme by modulo.
    pub fn reps_for_round(&self, round: u32) -> Option<u32> {
        if self.rep_scheme.is_empty() {
            return None;
        }
        Some(self.rep_scheme[round as usize % self.rep_scheme.len()])
    }

    /// Rounds-exhausted half of the completion predicate. `TimeBound`
    /// loops never exhaust; their timer completes the block.
    pub fn rounds_exhausted(&self, rounds: u32) -> bool {
        match self.loop_type {
            LoopType::TimeBound => false,
            _ => rounds >= self.total_rounds.unwrap_or(0),
        }
    }

    pub fn state(&self, rt: &ScriptRuntime, block: &RuntimeBlock) -> LoopState {
        let index = index_ref(rt, block)
            .and_then(|r| rt.memory().get(&r))
            .and_then(|v| v.as_int())
            .unwrap_or(-1);
        self.derive(index)
    }

    fn derive(&self, index: i64) -> LoopState {
        let groups = self.child_groups.len().max(1);
        let (position, rounds) = if index < 0 {
            (0, 0)
        } else {
            ((index as usize) % groups, (index as usize / groups) as u32)
        };
        LoopState {
            index,
            position,
            rounds,
        }
    }

    // ─── Lifecycle ────────────────────────────────────────────

    /// Mount allocates the coordinator's memory and immediately advances
    /// to the first position.
    pub fn on_push(
        &self,
        rt: &mut ScriptRuntime,
        block: &RuntimeBlock,
        at: DateTime<Utc>,
    ) -> Result<Vec<Action>, RuntimeError> {
        let memory = rt.memory_mut();
        memory.allocate(
            memtags::LOOP_INDEX,
            block.owner(),
            MemoryValue::Int(-1),
            Visibility::Private,
        );
        memory.allocate(
            memtags::ROUND_SPAN,
            block.owner(),
            MemoryValue::RoundSpans(Vec::new()),
            Visibility::Public,
        );
        if self.loop_type == LoopType::Interval {
            memory.allocate(
                memtags::INTERVAL_WAITING,
                block.owner(),
                MemoryValue::Bool(false),
                Visibility::Private,
            );
        }
        if self.loop_type == LoopType::RepScheme {
            memory.allocate(
                memtags::METRIC_REPS,
                block.owner(),
                MemoryValue::Reps(RepTarget {
                    target: self.reps_for_round(0).unwrap_or(0),
                    completed: 0,
                }),
                Visibility::Inherited,
            );
        }
        self.advance(rt, block, at)
    }

    pub fn on_next(
        &self,
        rt: &mut ScriptRuntime,
        block: &RuntimeBlock,
        at: DateTime<Utc>,
    ) -> Result<Vec<Action>, RuntimeError> {
        self.advance(rt, block, at)
    }

    pub fn on_pop(
        &self,
        rt: &mut ScriptRuntime,
        block: &RuntimeBlock,
        at: DateTime<Utc>,
    ) -> Result<Vec<Action>, RuntimeError> {
        close_open_round(rt, block, at);
        Ok(Vec::new())
    }

    pub fn on_event(
        &self,
        rt: &mut ScriptRuntime,
        block: &RuntimeBlock,
        event: &Event,
    ) -> Result<Vec<Action>, RuntimeError> {
        if event.name != names::TIMER_COMPLETE || event.block_id() != Some(block.key()) {
            return Ok(Vec::new());
        }
        if self.loop_type != LoopType::Interval || !take_waiting_flag(rt, block) {
            return Ok(Vec::new());
        }
        let state = self.state(rt, block);
        let mut actions = vec![Action::EmitEvent(Event::new(
            names::INTERVAL_COMPLETE,
            event.timestamp,
            json!({
                "blockId": block.key().as_uuid(),
                "round": state.rounds + 1,
            }),
        ))];
        actions.extend(self.advance(rt, block, event.timestamp)?);
        Ok(actions)
    }

    // ─── Advancement ──────────────────────────────────────────

    fn advance(
        &self,
        rt: &mut ScriptRuntime,
        block: &RuntimeBlock,
        at: DateTime<Utc>,
    ) -> Result<Vec<Action>, RuntimeError> {
        if self.child_groups.is_empty() {
            return Ok(Vec::new());
        }
        let groups = self.child_groups.len();
        let Some(index_handle) = index_ref(rt, block) else {
            return Ok(Vec::new());
        };
        let index = rt
            .memory()
            .get(&index_handle)
            .and_then(|v| v.as_int())
            .unwrap_or(-1);

        // An interval round may only start once the previous interval's
        // timer has finished; otherwise park until `timer:complete`.
        if self.loop_type == LoopType::Interval
            && !block.is_complete()
            && index >= 0
            && ((index + 1) as usize) % groups == 0
            && timer::is_running(rt, block)
        {
            set_waiting_flag(rt, block, true);
            return Ok(Vec::new());
        }

        // Increment first: the advance that discovers completion still
        // counts the round it closed.
        let index = index + 1;
        rt.memory_mut().set(&index_handle, MemoryValue::Int(index));
        let state = self.derive(index);

        if block.is_complete() || self.rounds_exhausted(state.rounds) {
            close_open_round(rt, block, at);
            return Ok(Vec::new());
        }

        let mut actions = Vec::new();
        if state.position == 0 {
            let target = self.reps_for_round(state.rounds);
            close_open_round(rt, block, at);
            open_round(rt, block, state.rounds + 1, target, at);
            if self.loop_type == LoopType::RepScheme {
                if let (Some(handle), Some(target)) = (reps_ref(rt, block), target) {
                    rt.memory_mut().set(
                        &handle,
                        MemoryValue::Reps(RepTarget {
                            target,
                            completed: 0,
                        }),
                    );
                }
            }
            actions.push(Action::EmitEvent(Event::new(
                names::ROUNDS_CHANGED,
                at,
                json!({
                    "blockId": block.key().as_uuid(),
                    "round": state.rounds + 1,
                    "targetReps": target,
                }),
            )));
        }

        actions.push(Action::CompileAndPushChild {
            statement_ids: self.child_groups[state.position].clone(),
            start_time: at,
        });
        Ok(actions)
    }
}

// ─── Coordinator memory helpers ───────────────────────────────

fn index_ref(rt: &ScriptRuntime, block: &RuntimeBlock) -> Option<MemoryRef> {
    rt.memory()
        .search(&SearchCriteria::of_type(memtags::LOOP_INDEX).owned_by(block.owner()))
        .into_iter()
        .next()
}

fn reps_ref(rt: &ScriptRuntime, block: &RuntimeBlock) -> Option<MemoryRef> {
    rt.memory()
        .search(&SearchCriteria::of_type(memtags::METRIC_REPS).owned_by(block.owner()))
        .into_iter()
        .next()
}

fn rounds_ref(rt: &ScriptRuntime, block: &RuntimeBlock) -> Option<MemoryRef> {
    rt.memory()
        .search(&SearchCriteria::of_type(memtags::ROUND_SPAN).owned_by(block.owner()))
        .into_iter()
        .next()
}

fn waiting_ref(rt: &ScriptRuntime, block: &RuntimeBlock) -> Option<MemoryRef> {
    rt.memory()
        .search(&SearchCriteria::of_type(memtags::INTERVAL_WAITING).owned_by(block.owner()))
        .into_iter()
        .next()
}

fn set_waiting_flag(rt: &mut ScriptRuntime, block: &RuntimeBlock, waiting: bool) {
    if let Some(handle) = waiting_ref(rt, block) {
        rt.memory_mut().set(&handle, MemoryValue::Bool(waiting));
    }
}

/// Clear the waiting flag, returning whether it was set.
fn take_waiting_flag(rt: &mut ScriptRuntime, block: &RuntimeBlock) -> bool {
    let Some(handle) = waiting_ref(rt, block) else {
        return false;
    };
    let was_waiting = rt
        .memory()
        .get(&handle)
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if was_waiting {
        rt.memory_mut().set(&handle, MemoryValue::Bool(false));
    }
    was_waiting
}

pub fn is_waiting_for_interval(rt: &ScriptRuntime, block: &RuntimeBlock) -> bool {
    waiting_ref(rt, block)
        .and_then(|r| rt.memory().get(&r))
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

pub fn round_spans(rt: &ScriptRuntime, block: &RuntimeBlock) -> Vec<RoundSpan> {
    rounds_ref(rt, block)
        .and_then(|r| rt.memory().get(&r))
        .and_then(|v| match v {
            MemoryValue::RoundSpans(spans) => Some(spans),
            _ => None,
        })
        .unwrap_or_default()
}

fn open_round(
    rt: &mut ScriptRuntime,
    block: &RuntimeBlock,
    round: u32,
    target_reps: Option<u32>,
    at: DateTime<Utc>,
) {
    if let Some(handle) = rounds_ref(rt, block) {
        rt.memory_mut().update(&handle, |value| {
            if let MemoryValue::RoundSpans(spans) = value {
                spans.push(RoundSpan {
                    round,
                    target_reps,
                    started_at: at,
                    ended_at: None,
                });
            }
        });
    }
}

fn close_open_round(rt: &mut ScriptRuntime, block: &RuntimeBlock, at: DateTime<Utc>) {
    if let Some(handle) = rounds_ref(rt, block) {
        rt.memory_mut().update(&handle, |value| {
            if let MemoryValue::RoundSpans(spans) = value {
                if let Some(open) = spans.iter_mut().rev().find(|s| s.ended_at.is_none()) {
                    open.ended_at = Some(at);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rep_scheme_cycles_by_modulo() {
        let mut coordinator =
            LoopCoordinatorBehavior::rep_scheme(vec![vec![1], vec![2]], vec![21, 15, 9]);
        coordinator.total_rounds = Some(5);
        assert_eq!(coordinator.reps_for_round(0), Some(21));
        assert_eq!(coordinator.reps_for_round(2), Some(9));
        assert_eq!(coordinator.reps_for_round(3), Some(21));
        assert_eq!(coordinator.reps_for_round(4), Some(15));
    }

    #[test]
    fn fixed_loop_exhausts_at_total_rounds() {
        let coordinator = LoopCoordinatorBehavior::fixed(vec![vec![1], vec![2]], 3);
        assert!(!coordinator.rounds_exhausted(2));
        assert!(coordinator.rounds_exhausted(3));
        assert!(coordinator.rounds_exhausted(4));
    }

    #[test]
    fn time_bound_loop_never_exhausts() {
        let coordinator = LoopCoordinatorBehavior::time_bound(vec![vec![1]]);
        assert!(!coordinator.rounds_exhausted(0));
        assert!(!coordinator.rounds_exhausted(10_000));
    }

    #[test]
    fn index_derivation_matches_position_and_rounds() {
        let coordinator = LoopCoordinatorBehavior::fixed(vec![vec![1], vec![2]], 3);
        // After n advances, index == n − 1.
        let derived = coordinator.derive(-1);
        assert_eq!((derived.position, derived.rounds), (0, 0));
        let derived = coordinator.derive(0);
        assert_eq!((derived.position, derived.rounds), (0, 0));
        let derived = coordinator.derive(1);
        assert_eq!((derived.position, derived.rounds), (1, 0));
        let derived = coordinator.derive(4);
        assert_eq!((derived.position, derived.rounds), (0, 2));
        let derived = coordinator.derive(5);
        assert_eq!((derived.position, derived.rounds), (1, 2));
    }

    #[test]
    fn reps_absent_outside_rep_schemes() {
        let coordinator = LoopCoordinatorBehavior::interval(vec![vec![1]], 10, 60_000);
        assert_eq!(coordinator.reps_for_round(0), None);
        assert_eq!(coordinator.loop_type, LoopType::Interval);
        assert_eq!(coordinator.interval_ms, Some(60_000));
    }

    // ── Runtime-backed coordination ───────────────────────────

    use crate::behaviors::{Behavior, TimerBehavior};
    use crate::clock::{Clock, ManualClock};
    use crate::types::{BlockKey, BlockType};
    use chrono::Utc;
    use std::rc::Rc;

    fn make_runtime() -> (ScriptRuntime, ManualClock) {
        let clock = ManualClock::starting_at(Utc::now());
        let rt = ScriptRuntime::new(Vec::new(), Vec::new(), Rc::new(clock.clone()));
        (rt, clock)
    }

    fn block_with(behaviors: Vec<Behavior>) -> Rc<RuntimeBlock> {
        Rc::new(RuntimeBlock::new(
            BlockKey::new(),
            vec![],
            BlockType::Rounds,
            "loop under test",
            vec![],
            behaviors,
        ))
    }

    fn child_ids(actions: &[Action]) -> Option<Vec<StatementId>> {
        actions.iter().find_map(|a| match a {
            Action::CompileAndPushChild { statement_ids, .. } => Some(statement_ids.clone()),
            _ => None,
        })
    }

    /// A FIXED loop with k groups and r rounds attempts exactly k·r child
    /// pushes; the next advance after that returns nothing.
    #[test]
    fn fixed_loop_attempts_exactly_k_times_r_pushes() {
        let (mut rt, clock) = make_runtime();
        let block = block_with(vec![Behavior::Loop(LoopCoordinatorBehavior::fixed(
            vec![vec![11], vec![12]],
            2,
        ))]);
        // Mount already advanced to the first group (the child compile
        // misses, which is fine here).
        rt.push_block(block.clone(), None).unwrap();
        let coordinator = block.loop_coordinator().unwrap();
        assert_eq!(coordinator.state(&rt, &block).index, 0);

        let mut pushed = vec![vec![11]];
        for _ in 0..3 {
            let actions = coordinator.on_next(&mut rt, &block, clock.now()).unwrap();
            pushed.push(child_ids(&actions).expect("expected a child push"));
        }
        assert_eq!(pushed, vec![vec![11], vec![12], vec![11], vec![12]]);

        // The (k·r + 1)-th advance yields no actions at all.
        let actions = coordinator.on_next(&mut rt, &block, clock.now()).unwrap();
        assert!(actions.is_empty());
        let state = coordinator.state(&rt, &block);
        assert_eq!(state.rounds, 2);
        assert!(coordinator.rounds_exhausted(state.rounds));

        // Both round spans were closed by the exhausting advance.
        let spans = round_spans(&rt, &block);
        assert_eq!(spans.len(), 2);
        assert!(spans.iter().all(|s| s.ended_at.is_some()));
    }

    /// Round boundaries publish the rep target into the inherited
    /// `metric.reps` slot, cycling the scheme.
    #[test]
    fn rep_scheme_publishes_inherited_targets() {
        let (mut rt, clock) = make_runtime();
        let block = block_with(vec![Behavior::Loop(LoopCoordinatorBehavior::rep_scheme(
            vec![vec![11]],
            vec![21, 15, 9],
        ))]);
        rt.push_block(block.clone(), None).unwrap();
        let coordinator = block.loop_coordinator().unwrap();

        assert_eq!(rt.inherited_reps_target(), Some(21));
        coordinator.on_next(&mut rt, &block, clock.now()).unwrap();
        assert_eq!(rt.inherited_reps_target(), Some(15));
        coordinator.on_next(&mut rt, &block, clock.now()).unwrap();
        assert_eq!(rt.inherited_reps_target(), Some(9));

        let spans = round_spans(&rt, &block);
        assert_eq!(
            spans.iter().map(|s| s.target_reps).collect::<Vec<_>>(),
            vec![Some(21), Some(15), Some(9)]
        );
    }

    /// An interval loop parks at the round boundary while its timer is
    /// still running, and resumes when `timer:complete` arrives.
    #[test]
    fn interval_loop_waits_for_its_timer() {
        let (mut rt, clock) = make_runtime();
        let block = block_with(vec![
            Behavior::Timer(TimerBehavior::countdown(60_000, "emom")),
            Behavior::Loop(LoopCoordinatorBehavior::interval(vec![vec![11]], 3, 60_000)),
        ]);
        rt.push_block(block.clone(), None).unwrap();
        let coordinator = block.loop_coordinator().unwrap();

        // The child finished at 0:20; the boundary gate parks the loop.
        clock.advance_ms(20_000);
        let actions = coordinator.on_next(&mut rt, &block, clock.now()).unwrap();
        assert!(actions.is_empty());
        assert!(is_waiting_for_interval(&rt, &block));
        assert_eq!(coordinator.state(&rt, &block).index, 0);

        // The interval elapses: the tick pipeline completes the timer,
        // which un-parks the loop and starts round 2.
        clock.advance_ms(40_000);
        rt.handle(Event::tick(clock.now())).unwrap();
        assert!(!is_waiting_for_interval(&rt, &block));
        let state = coordinator.state(&rt, &block);
        assert_eq!(state.index, 1);
        assert_eq!(state.rounds, 1);
    }
}
