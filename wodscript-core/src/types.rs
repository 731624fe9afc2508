use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Unique identifier assigned to a statement by the parser.
pub type StatementId = u64;

/// Milliseconds, used for every duration the engine handles.
pub type DurationMs = i64;

// ─── Block identity ───────────────────────────────────────────

/// Opaque, globally unique identity of a runtime block. Assigned at compile
/// time; used as the owner of memory refs, the scope of event handlers, and
/// the source id of emitted spans.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockKey(Uuid);

impl BlockKey {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// The nil key — never produced by `new`. A block carrying it fails
    /// push validation; tests use it to exercise the contract check.
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for BlockKey {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BlockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owner of a memory ref or event registration: a live block, or the
/// runtime itself (the sentinel owner that is always live).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OwnerId {
    Runtime,
    Block(BlockKey),
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OwnerId::Runtime => write!(f, "runtime"),
            OwnerId::Block(key) => write!(f, "{key}"),
        }
    }
}

// ─── Fragments ────────────────────────────────────────────────

/// Direction a timer counts in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerDirection {
    #[default]
    Up,
    Down,
}

/// Round specification carried by a rounds fragment: either a fixed count
/// or a per-round rep scheme such as `[21, 15, 9]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundScheme {
    Fixed(u32),
    RepScheme(Vec<u32>),
}

impl RoundScheme {
    pub fn total_rounds(&self) -> u32 {
        match self {
            RoundScheme::Fixed(n) => *n,
            RoundScheme::RepScheme(reps) => reps.len() as u32,
        }
    }
}

/// A typed piece of a parsed statement. Immutable input to compilation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Fragment {
    Timer {
        duration_ms: Option<DurationMs>,
        direction: TimerDirection,
    },
    Reps {
        count: u32,
    },
    Rounds {
        scheme: RoundScheme,
    },
    Effort {
        label: String,
    },
    Action {
        name: String,
    },
    Distance {
        value: f64,
        unit: String,
    },
    Resistance {
        value: f64,
        unit: String,
    },
    Text {
        text: String,
    },
}

/// Fragment kind tag, for span typing and diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentKind {
    Timer,
    Reps,
    Rounds,
    Effort,
    Action,
    Distance,
    Resistance,
    Text,
}

impl Fragment {
    pub fn kind(&self) -> FragmentKind {
        match self {
            Fragment::Timer { .. } => FragmentKind::Timer,
            Fragment::Reps { .. } => FragmentKind::Reps,
            Fragment::Rounds { .. } => FragmentKind::Rounds,
            Fragment::Effort { .. } => FragmentKind::Effort,
            Fragment::Action { .. } => FragmentKind::Action,
            Fragment::Distance { .. } => FragmentKind::Distance,
            Fragment::Resistance { .. } => FragmentKind::Resistance,
            Fragment::Text { .. } => FragmentKind::Text,
        }
    }
}

impl std::fmt::Display for FragmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FragmentKind::Timer => "timer",
            FragmentKind::Reps => "reps",
            FragmentKind::Rounds => "rounds",
            FragmentKind::Effort => "effort",
            FragmentKind::Action => "action",
            FragmentKind::Distance => "distance",
            FragmentKind::Resistance => "resistance",
            FragmentKind::Text => "text",
        };
        write!(f, "{s}")
    }
}

// ─── Hint tags (stable; consumed by strategies) ───────────────

pub mod hints {
    pub const TIME_BOUND: &str = "behavior.time_bound";
    pub const FIXED_ROUNDS: &str = "behavior.fixed_rounds";
    pub const REPEATING_INTERVAL: &str = "behavior.repeating_interval";
    pub const EFFORT: &str = "behavior.effort";
    pub const GROUP: &str = "behavior.group";
    pub const TIMER: &str = "behavior.timer";
}

// ─── Statements ───────────────────────────────────────────────

/// A parsed workout statement: an ordered bag of fragments, ordered groups
/// of child statement ids, and dialect hints steering strategy selection.
/// Immutable; looked up by id in O(1) through the runtime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub id: StatementId,
    pub fragments: Vec<Fragment>,
    /// Ordered sequence of ordered child-id groups. Each group is one
    /// "position" a loop coordinator compiles as a child.
    pub children: Vec<Vec<StatementId>>,
    pub hints: BTreeSet<String>,
}

impl Statement {
    pub fn new(id: StatementId) -> Self {
        Self {
            id,
            fragments: Vec::new(),
            children: Vec::new(),
            hints: BTreeSet::new(),
        }
    }

    pub fn with_fragment(mut self, fragment: Fragment) -> Self {
        self.fragments.push(fragment);
        self
    }

    pub fn with_child_group(mut self, group: Vec<StatementId>) -> Self {
        self.children.push(group);
        self
    }

    pub fn with_hint(mut self, hint: &str) -> Self {
        self.hints.insert(hint.to_string());
        self
    }

    pub fn has_hint(&self, hint: &str) -> bool {
        self.hints.contains(hint)
    }

    /// First timer fragment, if any.
    pub fn timer(&self) -> Option<(Option<DurationMs>, TimerDirection)> {
        self.fragments.iter().find_map(|f| match f {
            Fragment::Timer {
                duration_ms,
                direction,
            } => Some((*duration_ms, *direction)),
            _ => None,
        })
    }

    /// First rounds fragment, if any.
    pub fn rounds(&self) -> Option<&RoundScheme> {
        self.fragments.iter().find_map(|f| match f {
            Fragment::Rounds { scheme } => Some(scheme),
            _ => None,
        })
    }

    /// First reps fragment, if any.
    pub fn reps(&self) -> Option<u32> {
        self.fragments.iter().find_map(|f| match f {
            Fragment::Reps { count } => Some(*count),
            _ => None,
        })
    }

    pub fn effort_label(&self) -> Option<&str> {
        self.fragments.iter().find_map(|f| match f {
            Fragment::Effort { label } => Some(label.as_str()),
            _ => None,
        })
    }

    pub fn has_action(&self, name: &str) -> bool {
        self.fragments
            .iter()
            .any(|f| matches!(f, Fragment::Action { name: n } if n == name))
    }

    /// Display label for blocks compiled from this statement.
    pub fn label(&self) -> String {
        if let Some(label) = self.effort_label() {
            return label.to_string();
        }
        if let Some(Fragment::Text { text }) = self
            .fragments
            .iter()
            .find(|f| matches!(f, Fragment::Text { .. }))
        {
            return text.clone();
        }
        if let Some(scheme) = self.rounds() {
            return match scheme {
                RoundScheme::Fixed(n) => format!("{n} rounds"),
                RoundScheme::RepScheme(reps) => reps
                    .iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>()
                    .join("-"),
            };
        }
        format!("statement {}", self.id)
    }
}

// ─── Block typing ─────────────────────────────────────────────

/// Tag describing what a runtime block is. Exists for logging, span typing,
/// and tests; every block is the same concrete type at runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Root,
    Idle,
    Done,
    Effort,
    Timer,
    Rounds,
    Interval,
    TimeBoundRounds,
    Group,
}

impl std::fmt::Display for BlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BlockType::Root => "root",
            BlockType::Idle => "idle",
            BlockType::Done => "done",
            BlockType::Effort => "effort",
            BlockType::Timer => "timer",
            BlockType::Rounds => "rounds",
            BlockType::Interval => "interval",
            BlockType::TimeBoundRounds => "time_bound_rounds",
            BlockType::Group => "group",
        };
        write!(f, "{s}")
    }
}

/// Loop coordination mode; governs the completion predicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopType {
    Fixed,
    RepScheme,
    TimeBound,
    Interval,
}

// ─── Time spans ───────────────────────────────────────────────

/// A start/stop interval. An open span has no stop yet.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeSpan {
    pub start: DateTime<Utc>,
    pub stop: Option<DateTime<Utc>>,
}

impl TimeSpan {
    pub fn open(start: DateTime<Utc>) -> Self {
        Self { start, stop: None }
    }

    pub fn is_open(&self) -> bool {
        self.stop.is_none()
    }

    /// Duration in ms, measuring an open span against `now`.
    pub fn duration_ms(&self, now: DateTime<Utc>) -> DurationMs {
        let end = self.stop.unwrap_or(now);
        (end - self.start).num_milliseconds().max(0)
    }
}

/// Start/completion instants the driver stamps on a block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTiming {
    pub start_time: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}
