use crate::actions::Action;
use crate::block::RuntimeBlock;
use crate::error::RuntimeError;
use crate::events::{names, Event};
use crate::memory::{memtags, MemoryRef, MemoryValue, SearchCriteria, Visibility};
use crate::runtime::ScriptRuntime;
use crate::types::{DurationMs, TimeSpan, TimerDirection};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Whether a timer is the authoritative workout clock or an auxiliary one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerRole {
    Primary,
    Secondary,
}

/// Tracks elapsed time for a block as an ordered sequence of spans in
/// `timer.spans`, plus a `timer.isRunning` flag.
///
/// Ticks arrive as external `tick` events; each one re-emits a
/// `timer:tick` with the computed elapsed/remaining, and a countdown that
/// reaches its duration closes the open span and emits `timer:complete`.
pub struct TimerBehavior {
    pub direction: TimerDirection,
    pub duration_ms: Option<DurationMs>,
    pub label: String,
    pub role: TimerRole,
}

impl TimerBehavior {
    pub fn countdown(duration_ms: DurationMs, label: impl Into<String>) -> Self {
        Self {
            direction: TimerDirection::Down,
            duration_ms: Some(duration_ms),
            label: label.into(),
            role: TimerRole::Primary,
        }
    }

    pub fn count_up(label: impl Into<String>) -> Self {
        Self {
            direction: TimerDirection::Up,
            duration_ms: None,
            label: label.into(),
            role: TimerRole::Primary,
        }
    }

    pub fn on_push(
        &self,
        rt: &mut ScriptRuntime,
        block: &RuntimeBlock,
        at: DateTime<Utc>,
    ) -> Result<Vec<Action>, RuntimeError> {
        rt.memory_mut().allocate(
            memtags::TIMER_SPANS,
            block.owner(),
            MemoryValue::TimerSpans(vec![TimeSpan::open(at)]),
            Visibility::Public,
        );
        rt.memory_mut().allocate(
            memtags::TIMER_IS_RUNNING,
            block.owner(),
            MemoryValue::Bool(true),
            Visibility::Public,
        );
        Ok(Vec::new())
    }

    pub fn on_event(
        &self,
        rt: &mut ScriptRuntime,
        block: &RuntimeBlock,
        event: &Event,
    ) -> Result<Vec<Action>, RuntimeError> {
        if event.name != names::TICK {
            return Ok(Vec::new());
        }
        if !is_running(rt, block) {
            return Ok(Vec::new());
        }
        let now = event.timestamp;
        let elapsed = elapsed_ms(rt, block, now);
        let remaining = self.duration_ms.map(|d| (d - elapsed).max(0));

        let mut actions = vec![Action::EmitEvent(Event::new(
            names::TIMER_TICK,
            now,
            json!({
                "blockId": block.key().as_uuid(),
                "elapsedMs": elapsed,
                "remainingMs": remaining,
                "direction": self.direction,
                "label": self.label,
                "role": self.role,
            }),
        ))];

        if self.direction == TimerDirection::Down {
            if let Some(duration) = self.duration_ms {
                if elapsed >= duration {
                    close_open_span(rt, block, now);
                    set_running(rt, block, false);
                    actions.push(Action::EmitEvent(Event::timer_complete(block.key(), now)));
                }
            }
        }
        Ok(actions)
    }

    pub fn on_pop(
        &self,
        rt: &mut ScriptRuntime,
        block: &RuntimeBlock,
        at: DateTime<Utc>,
    ) -> Result<Vec<Action>, RuntimeError> {
        close_open_span(rt, block, at);
        set_running(rt, block, false);
        Ok(Vec::new())
    }
}

// ─── Shared timer state helpers ───────────────────────────────
//
// Timer state lives in block memory, so sibling behaviors (loop
// coordinators, interval restarts) operate on it through these.

fn spans_ref(rt: &ScriptRuntime, block: &RuntimeBlock) -> Option<MemoryRef> {
    rt.memory()
        .search(&SearchCriteria::of_type(memtags::TIMER_SPANS).owned_by(block.owner()))
        .into_iter()
        .next()
}

fn running_ref(rt: &ScriptRuntime, block: &RuntimeBlock) -> Option<MemoryRef> {
    rt.memory()
        .search(&SearchCriteria::of_type(memtags::TIMER_IS_RUNNING).owned_by(block.owner()))
        .into_iter()
        .next()
}

pub fn is_running(rt: &ScriptRuntime, block: &RuntimeBlock) -> bool {
    running_ref(rt, block)
        .and_then(|r| rt.memory().get(&r))
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

fn set_running(rt: &mut ScriptRuntime, block: &RuntimeBlock, running: bool) {
    if let Some(handle) = running_ref(rt, block) {
        rt.memory_mut().set(&handle, MemoryValue::Bool(running));
    }
}

/// Elapsed in the current run: the latest span, measured to `now`. Each
/// `restart` opens a fresh span, so an interval timer counts from its own
/// round start rather than the block mount.
pub fn elapsed_ms(rt: &ScriptRuntime, block: &RuntimeBlock, now: DateTime<Utc>) -> DurationMs {
    let Some(handle) = spans_ref(rt, block) else {
        return 0;
    };
    match rt.memory().get(&handle) {
        Some(MemoryValue::TimerSpans(spans)) => spans
            .last()
            .map(|span| span.duration_ms(now))
            .unwrap_or(0),
        _ => 0,
    }
}

/// Total elapsed across every recorded span, the open one measured to `now`.
pub fn total_elapsed_ms(rt: &ScriptRuntime, block: &RuntimeBlock, now: DateTime<Utc>) -> DurationMs {
    let Some(handle) = spans_ref(rt, block) else {
        return 0;
    };
    match rt.memory().get(&handle) {
        Some(MemoryValue::TimerSpans(spans)) => {
            spans.iter().map(|span| span.duration_ms(now)).sum()
        }
        _ => 0,
    }
}

pub fn spans(rt: &ScriptRuntime, block: &RuntimeBlock) -> Vec<TimeSpan> {
    spans_ref(rt, block)
        .and_then(|r| rt.memory().get(&r))
        .and_then(|v| match v {
            MemoryValue::TimerSpans(spans) => Some(spans),
            _ => None,
        })
        .unwrap_or_default()
}

fn close_open_span(rt: &mut ScriptRuntime, block: &RuntimeBlock, at: DateTime<Utc>) {
    if let Some(handle) = spans_ref(rt, block) {
        rt.memory_mut().update(&handle, |value| {
            if let MemoryValue::TimerSpans(spans) = value {
                if let Some(open) = spans.iter_mut().rev().find(|s| s.is_open()) {
                    open.stop = Some(at);
                }
            }
        });
    }
}

/// Close the current span and open a fresh one at `now`. Used by interval
/// loops to turn a countdown into an EMOM.
pub fn restart(rt: &mut ScriptRuntime, block: &RuntimeBlock, now: DateTime<Utc>) {
    close_open_span(rt, block, now);
    if let Some(handle) = spans_ref(rt, block) {
        rt.memory_mut().update(&handle, |value| {
            if let MemoryValue::TimerSpans(spans) = value {
                spans.push(TimeSpan::open(now));
            }
        });
    }
    set_running(rt, block, true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behaviors::Behavior;
    use crate::clock::{Clock, ManualClock};
    use crate::types::{BlockKey, BlockType};
    use chrono::Utc;
    use std::rc::Rc;

    fn make_runtime() -> (ScriptRuntime, ManualClock) {
        let clock = ManualClock::starting_at(Utc::now());
        let rt = ScriptRuntime::new(Vec::new(), Vec::new(), Rc::new(clock.clone()));
        (rt, clock)
    }

    fn countdown_block(duration_ms: i64) -> Rc<RuntimeBlock> {
        Rc::new(RuntimeBlock::new(
            BlockKey::new(),
            vec![],
            BlockType::Timer,
            "countdown",
            vec![],
            vec![Behavior::Timer(TimerBehavior::countdown(
                duration_ms,
                "countdown",
            ))],
        ))
    }

    fn emitted_names(actions: &[Action]) -> Vec<String> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::EmitEvent(e) => Some(e.name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Mount opens the first span and raises the running flag.
    #[test]
    fn mount_opens_span_and_running_flag() {
        let (mut rt, _clock) = make_runtime();
        let block = countdown_block(10_000);
        rt.push_block(block.clone(), None).unwrap();

        assert!(is_running(&rt, &block));
        let spans = spans(&rt, &block);
        assert_eq!(spans.len(), 1);
        assert!(spans[0].is_open());
    }

    /// A tick mid-countdown re-emits `timer:tick` with computed elapsed
    /// and remaining, and does not complete.
    #[test]
    fn tick_reports_elapsed_and_remaining() {
        let (mut rt, clock) = make_runtime();
        let block = countdown_block(10_000);
        rt.push_block(block.clone(), None).unwrap();

        let at = clock.advance_ms(4_000);
        let timer = block.timer_behavior().unwrap();
        let actions = timer.on_event(&mut rt, &block, &Event::tick(at)).unwrap();

        assert_eq!(emitted_names(&actions), vec![names::TIMER_TICK]);
        let Action::EmitEvent(tick) = &actions[0] else {
            unreachable!()
        };
        assert_eq!(tick.int_field("elapsedMs"), Some(4_000));
        assert_eq!(tick.int_field("remainingMs"), Some(6_000));
        assert!(is_running(&rt, &block));
    }

    /// Reaching the duration closes the span, lowers the flag, and emits
    /// `timer:complete` for this block.
    #[test]
    fn countdown_completion() {
        let (mut rt, clock) = make_runtime();
        let block = countdown_block(10_000);
        rt.push_block(block.clone(), None).unwrap();

        let at = clock.advance_ms(10_000);
        let timer = block.timer_behavior().unwrap();
        let actions = timer.on_event(&mut rt, &block, &Event::tick(at)).unwrap();

        assert_eq!(
            emitted_names(&actions),
            vec![names::TIMER_TICK, names::TIMER_COMPLETE]
        );
        let Action::EmitEvent(complete) = &actions[1] else {
            unreachable!()
        };
        assert_eq!(complete.block_id(), Some(block.key()));
        assert!(!is_running(&rt, &block));
        assert!(spans(&rt, &block)[0].stop.is_some());

        // Once stopped, further ticks are ignored.
        let at = clock.advance_ms(1_000);
        let actions = timer.on_event(&mut rt, &block, &Event::tick(at)).unwrap();
        assert!(actions.is_empty());
    }

    /// An up-count timer never self-completes.
    #[test]
    fn up_timer_only_ticks() {
        let (mut rt, clock) = make_runtime();
        let block = Rc::new(RuntimeBlock::new(
            BlockKey::new(),
            vec![],
            BlockType::Timer,
            "stopwatch",
            vec![],
            vec![Behavior::Timer(TimerBehavior::count_up("stopwatch"))],
        ));
        rt.push_block(block.clone(), None).unwrap();

        let at = clock.advance_ms(3_600_000);
        let timer = block.timer_behavior().unwrap();
        let actions = timer.on_event(&mut rt, &block, &Event::tick(at)).unwrap();
        assert_eq!(emitted_names(&actions), vec![names::TIMER_TICK]);
        assert!(is_running(&rt, &block));
    }

    /// Restart closes the current span, opens a new one, and resets the
    /// per-run elapsed while keeping the full span history.
    #[test]
    fn restart_resets_current_run() {
        let (mut rt, clock) = make_runtime();
        let block = countdown_block(60_000);
        rt.push_block(block.clone(), None).unwrap();

        clock.advance_ms(60_000);
        let boundary = clock.now();
        restart(&mut rt, &block, boundary);

        let spans = spans(&rt, &block);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].stop, Some(boundary));
        assert!(spans[1].is_open());
        assert!(is_running(&rt, &block));

        let later = clock.advance_ms(15_000);
        assert_eq!(elapsed_ms(&rt, &block, later), 15_000);
        assert_eq!(total_elapsed_ms(&rt, &block, later), 75_000);
    }

    /// Pop closes whatever span is open.
    #[test]
    fn pop_closes_open_span() {
        let (mut rt, clock) = make_runtime();
        let block = countdown_block(10_000);
        rt.push_block(block.clone(), None).unwrap();
        let at = clock.advance_ms(2_500);
        rt.pop_block(Some(at)).unwrap();
        // Memory is released with the block; the behavior tolerates that.
        assert_eq!(elapsed_ms(&rt, &block, at), 0);
        assert!(!is_running(&rt, &block));
    }
}
