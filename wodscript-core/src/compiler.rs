use crate::behaviors::{
    Behavior, CompletionBehavior, CompletionRule, HistoryBehavior, IntervalRestartBehavior,
    LoopCoordinatorBehavior, SoundBehavior, TimerBehavior,
};
use crate::block::RuntimeBlock;
use crate::output::END_WORKOUT;
use crate::runtime::ScriptRuntime;
use crate::types::{hints, BlockKey, BlockType, RoundScheme, Statement, StatementId, TimerDirection};
use std::rc::Rc;
use tracing::debug;

/// Compilation strategies in fixed precedence order, highest first. The
/// first whose `matches` returns true owns compilation of the group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    TimeBoundRounds,
    Interval,
    Timer,
    Rounds,
    Group,
    Effort,
}

/// Just-in-time compiler: walks the ordered strategy list and delegates
/// to the first match. No match is not an error — the caller treats it as
/// "nothing to push here".
pub struct JitCompiler {
    strategies: Vec<Strategy>,
}

impl JitCompiler {
    pub fn new() -> Self {
        Self {
            strategies: vec![
                Strategy::TimeBoundRounds,
                Strategy::Interval,
                Strategy::Timer,
                Strategy::Rounds,
                Strategy::Group,
                Strategy::Effort,
            ],
        }
    }

    pub fn strategies(&self) -> &[Strategy] {
        &self.strategies
    }

    /// Strategy that would own the group, if any. `matches` is pure.
    pub fn select(&self, statements: &[&Statement]) -> Option<Strategy> {
        self.strategies
            .iter()
            .copied()
            .find(|strategy| strategy.matches(statements))
    }

    pub fn compile(
        &self,
        statement_ids: &[StatementId],
        rt: &ScriptRuntime,
    ) -> Option<Rc<RuntimeBlock>> {
        let statements: Vec<&Statement> = statement_ids
            .iter()
            .filter_map(|id| rt.statement(*id))
            .collect();
        if statements.is_empty() {
            return None;
        }
        let strategy = self.select(&statements)?;
        debug!(?strategy, ids = ?statement_ids, "jit selected strategy");
        Some(strategy.compile(&statements, rt))
    }
}

impl Default for JitCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy {
    /// Pure match over the statement group. A multi-statement group is
    /// always a container; the `behavior.effort` hint short-circuits every
    /// strategy above Effort without reordering the list.
    pub fn matches(self, statements: &[&Statement]) -> bool {
        if statements.is_empty() {
            return false;
        }
        if statements.len() > 1 {
            return self == Strategy::Group;
        }
        let s = statements[0];
        let effort_override = s.has_hint(hints::EFFORT);
        match self {
            // The repeating-interval hint short-circuits here the same way
            // the effort hint does everywhere: an EMOM's rounds belong to
            // the interval strategy below.
            Strategy::TimeBoundRounds => {
                !effort_override
                    && !s.has_hint(hints::REPEATING_INTERVAL)
                    && s.timer().is_some_and(|(d, _)| d.is_some())
                    && (s.rounds().is_some()
                        || s.has_hint(hints::TIME_BOUND)
                        || s.has_action("amrap"))
            }
            Strategy::Interval => {
                !effort_override
                    && s.timer().is_some_and(|(d, _)| d.is_some())
                    && s.has_hint(hints::REPEATING_INTERVAL)
            }
            Strategy::Timer => {
                !effort_override && (s.timer().is_some() || s.has_hint(hints::TIMER))
            }
            Strategy::Rounds => {
                !effort_override
                    && s.timer().is_none()
                    && (s.rounds().is_some() || s.has_hint(hints::FIXED_ROUNDS))
            }
            Strategy::Group => {
                !effort_override && (!s.children.is_empty() || s.has_hint(hints::GROUP))
            }
            Strategy::Effort => true,
        }
    }

    /// Materialize the block and its behaviors. Reads inherited context
    /// from the live stack but allocates nothing and pushes no actions.
    pub fn compile(self, statements: &[&Statement], rt: &ScriptRuntime) -> Rc<RuntimeBlock> {
        match self {
            Strategy::TimeBoundRounds => compile_time_bound(statements[0]),
            Strategy::Interval => compile_interval(statements[0]),
            Strategy::Timer => compile_timer(statements[0]),
            Strategy::Rounds => compile_rounds(statements[0]),
            Strategy::Group => compile_group(statements),
            Strategy::Effort => compile_effort(statements[0], rt),
        }
    }
}

fn block_from(
    statements: &[&Statement],
    block_type: BlockType,
    label: String,
    behaviors: Vec<Behavior>,
) -> Rc<RuntimeBlock> {
    let source_ids = statements.iter().map(|s| s.id).collect();
    let fragments = statements
        .iter()
        .flat_map(|s| s.fragments.iter().cloned())
        .collect();
    Rc::new(RuntimeBlock::new(
        BlockKey::new(),
        source_ids,
        block_type,
        label,
        fragments,
        behaviors,
    ))
}

fn compile_time_bound(s: &Statement) -> Rc<RuntimeBlock> {
    let (duration, _) = s.timer().unwrap_or((None, TimerDirection::Down));
    let duration = duration.unwrap_or(0);
    let behaviors = vec![
        Behavior::Timer(TimerBehavior::countdown(duration, s.label())),
        Behavior::Loop(LoopCoordinatorBehavior::time_bound(s.children.clone())),
        Behavior::Sound(SoundBehavior::countdown_beeps(duration)),
        Behavior::Completion(CompletionBehavior::new(CompletionRule::TimerComplete)),
        Behavior::History(HistoryBehavior::new()),
    ];
    block_from(&[s], BlockType::TimeBoundRounds, s.label(), behaviors)
}

fn compile_interval(s: &Statement) -> Rc<RuntimeBlock> {
    let (duration, _) = s.timer().unwrap_or((None, TimerDirection::Down));
    let interval_ms = duration.unwrap_or(0);
    let total_rounds = s
        .rounds()
        .map(RoundScheme::total_rounds)
        .unwrap_or(1);
    let behaviors = vec![
        Behavior::Timer(TimerBehavior::countdown(interval_ms, s.label())),
        Behavior::Loop(LoopCoordinatorBehavior::interval(
            s.children.clone(),
            total_rounds,
            interval_ms,
        )),
        Behavior::IntervalRestart(IntervalRestartBehavior),
        Behavior::Sound(SoundBehavior::countdown_beeps(interval_ms)),
        Behavior::Completion(CompletionBehavior::new(CompletionRule::LoopComplete)),
        Behavior::History(HistoryBehavior::new()),
    ];
    block_from(&[s], BlockType::Interval, s.label(), behaviors)
}

fn compile_timer(s: &Statement) -> Rc<RuntimeBlock> {
    let (duration, direction) = s.timer().unwrap_or((None, TimerDirection::Up));
    let mut behaviors = vec![Behavior::Timer(TimerBehavior {
        direction,
        duration_ms: duration,
        label: s.label(),
        role: crate::behaviors::TimerRole::Primary,
    })];
    let has_children = !s.children.is_empty();
    if has_children {
        behaviors.push(Behavior::Loop(LoopCoordinatorBehavior::fixed(
            s.children.clone(),
            1,
        )));
    }
    if direction == TimerDirection::Down {
        if let Some(duration) = duration {
            behaviors.push(Behavior::Sound(SoundBehavior::countdown_beeps(duration)));
        }
    }
    let rule = match (direction, duration, has_children) {
        (TimerDirection::Down, Some(_), _) => CompletionRule::TimerComplete,
        (_, _, true) => CompletionRule::LoopComplete,
        _ => CompletionRule::OnUserNext,
    };
    behaviors.push(Behavior::Completion(CompletionBehavior::new(rule)));
    behaviors.push(Behavior::History(HistoryBehavior::new()));
    block_from(&[s], BlockType::Timer, s.label(), behaviors)
}

fn compile_rounds(s: &Statement) -> Rc<RuntimeBlock> {
    let coordinator = match s.rounds() {
        Some(RoundScheme::RepScheme(scheme)) => {
            LoopCoordinatorBehavior::rep_scheme(s.children.clone(), scheme.clone())
        }
        Some(RoundScheme::Fixed(n)) => LoopCoordinatorBehavior::fixed(s.children.clone(), *n),
        None => LoopCoordinatorBehavior::fixed(s.children.clone(), 1),
    };
    let behaviors = vec![
        Behavior::Loop(coordinator),
        Behavior::Completion(CompletionBehavior::new(CompletionRule::LoopComplete)),
        Behavior::History(HistoryBehavior::new()),
    ];
    block_from(&[s], BlockType::Rounds, s.label(), behaviors)
}

fn compile_group(statements: &[&Statement]) -> Rc<RuntimeBlock> {
    // A multi-statement group runs each statement once in order; a single
    // grouping statement delegates to its declared child groups.
    let child_groups: Vec<Vec<StatementId>> = if statements.len() > 1 {
        statements.iter().map(|s| vec![s.id]).collect()
    } else {
        statements[0].children.clone()
    };
    let label = if statements.len() == 1 {
        statements[0].label()
    } else {
        "group".to_string()
    };
    let behaviors = vec![
        Behavior::Loop(LoopCoordinatorBehavior::fixed(child_groups, 1)),
        Behavior::Completion(CompletionBehavior::new(CompletionRule::LoopComplete)),
        Behavior::History(HistoryBehavior::new()),
    ];
    block_from(statements, BlockType::Group, label, behaviors)
}

fn compile_effort(s: &Statement, rt: &ScriptRuntime) -> Rc<RuntimeBlock> {
    // An explicit reps fragment wins; otherwise the innermost inherited
    // rep target visible on the live stack at compile time.
    let target = s.reps().or_else(|| rt.inherited_reps_target());
    let rule = match target {
        Some(target) => CompletionRule::RepsMet { target },
        None => CompletionRule::OnUserNext,
    };
    let behaviors = vec![
        Behavior::Completion(CompletionBehavior::new(rule)),
        Behavior::History(HistoryBehavior::new()),
    ];
    block_from(&[s], BlockType::Effort, s.label(), behaviors)
}

// ─── Driver-owned blocks ──────────────────────────────────────

/// The stack's initial no-op state.
pub fn idle_block() -> Rc<RuntimeBlock> {
    Rc::new(RuntimeBlock::new(
        BlockKey::new(),
        vec![],
        BlockType::Idle,
        "idle",
        vec![],
        vec![],
    ))
}

/// The workout container over the top-level statements. Completes when
/// every child has popped.
pub fn root_block(roots: &[StatementId]) -> Rc<RuntimeBlock> {
    let child_groups = roots.iter().map(|id| vec![*id]).collect();
    Rc::new(RuntimeBlock::new(
        BlockKey::new(),
        roots.to_vec(),
        BlockType::Root,
        "root",
        vec![],
        vec![
            Behavior::Loop(LoopCoordinatorBehavior::fixed(child_groups, 1)),
            Behavior::Completion(CompletionBehavior::new(CompletionRule::LoopComplete)),
            Behavior::History(HistoryBehavior::new()),
        ],
    ))
}

/// Terminal marker. Mounts, immediately completes, and pops carrying the
/// `END_WORKOUT` completion record.
pub fn done_block() -> Rc<RuntimeBlock> {
    Rc::new(RuntimeBlock::new(
        BlockKey::new(),
        vec![],
        BlockType::Done,
        END_WORKOUT,
        vec![],
        vec![
            Behavior::Completion(CompletionBehavior::new(CompletionRule::Immediate)),
            Behavior::History(HistoryBehavior::new()),
        ],
    ))
}
