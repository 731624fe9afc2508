use crate::actions::Action;
use crate::block::RuntimeBlock;
use crate::error::RuntimeError;
use crate::events::{names, Event};
use crate::memory::{memtags, CueState, MemoryRef, MemoryValue, SearchCriteria, Visibility};
use crate::runtime::ScriptRuntime;
use crate::types::{DurationMs, TimerDirection};
use chrono::{DateTime, Utc};

/// One audio cue tied to a timer threshold.
#[derive(Clone, Debug, PartialEq)]
pub struct SoundCue {
    pub id: String,
    pub threshold_ms: DurationMs,
    pub sound: String,
    pub volume: f32,
}

/// Queues `PlaySound` actions as its block's timer crosses cue
/// thresholds. Trigger state lives in `sound.state` memory and is marked
/// before the action is queued, so a failing playback never retries.
pub struct SoundBehavior {
    pub direction: TimerDirection,
    pub duration_ms: Option<DurationMs>,
    pub cues: Vec<SoundCue>,
}

impl SoundBehavior {
    pub fn new(
        direction: TimerDirection,
        duration_ms: Option<DurationMs>,
        cues: Vec<SoundCue>,
    ) -> Self {
        Self {
            direction,
            duration_ms,
            cues,
        }
    }

    /// The standard 3-2-1 countdown beeps attached to countdown blocks.
    pub fn countdown_beeps(duration_ms: DurationMs) -> Self {
        let cues = [3_000, 2_000, 1_000]
            .into_iter()
            .map(|threshold_ms| SoundCue {
                id: format!("beep-{}", threshold_ms / 1_000),
                threshold_ms,
                sound: "beep".to_string(),
                volume: 1.0,
            })
            .collect();
        Self {
            direction: TimerDirection::Down,
            duration_ms: Some(duration_ms),
            cues,
        }
    }

    pub fn on_push(
        &self,
        rt: &mut ScriptRuntime,
        block: &RuntimeBlock,
        _at: DateTime<Utc>,
    ) -> Result<Vec<Action>, RuntimeError> {
        let states = self
            .cues
            .iter()
            .map(|cue| CueState {
                cue_id: cue.id.clone(),
                triggered: false,
            })
            .collect();
        rt.memory_mut().allocate(
            memtags::SOUND_STATE,
            block.owner(),
            MemoryValue::CueStates(states),
            Visibility::Private,
        );
        Ok(Vec::new())
    }

    pub fn on_event(
        &self,
        rt: &mut ScriptRuntime,
        block: &RuntimeBlock,
        event: &Event,
    ) -> Result<Vec<Action>, RuntimeError> {
        if event.name != names::TIMER_TICK || event.block_id() != Some(block.key()) {
            return Ok(Vec::new());
        }
        let elapsed = event.int_field("elapsedMs").unwrap_or(0);
        let remaining = event.int_field("remainingMs");

        let mut actions = Vec::new();
        for cue in &self.cues {
            if cue_triggered(rt, block, &cue.id) {
                continue;
            }
            let crossed = match self.direction {
                TimerDirection::Down => remaining.map(|r| r <= cue.threshold_ms).unwrap_or(false),
                TimerDirection::Up => elapsed >= cue.threshold_ms,
            };
            if crossed {
                mark_cue(rt, block, &cue.id, true);
                actions.push(Action::PlaySound {
                    cue_id: cue.id.clone(),
                    sound: cue.sound.clone(),
                    volume: cue.volume,
                });
            }
        }
        Ok(actions)
    }
}

fn state_ref(rt: &ScriptRuntime, block: &RuntimeBlock) -> Option<MemoryRef> {
    rt.memory()
        .search(&SearchCriteria::of_type(memtags::SOUND_STATE).owned_by(block.owner()))
        .into_iter()
        .next()
}

fn cue_triggered(rt: &ScriptRuntime, block: &RuntimeBlock, cue_id: &str) -> bool {
    state_ref(rt, block)
        .and_then(|r| rt.memory().get(&r))
        .map(|v| match v {
            MemoryValue::CueStates(states) => states
                .iter()
                .any(|state| state.cue_id == cue_id && state.triggered),
            _ => false,
        })
        .unwrap_or(false)
}

fn mark_cue(rt: &mut ScriptRuntime, block: &RuntimeBlock, cue_id: &str, triggered: bool) {
    if let Some(handle) = state_ref(rt, block) {
        rt.memory_mut().update(&handle, |value| {
            if let MemoryValue::CueStates(states) = value {
                if let Some(state) = states.iter_mut().find(|s| s.cue_id == cue_id) {
                    state.triggered = triggered;
                }
            }
        });
    }
}

/// Fully restore the pre-trigger state; a subsequent tick at the same
/// threshold triggers again exactly once. Used when a loop restarts the
/// block's timer.
pub fn reset_cues(rt: &mut ScriptRuntime, block: &RuntimeBlock) {
    if let Some(handle) = state_ref(rt, block) {
        rt.memory_mut().update(&handle, |value| {
            if let MemoryValue::CueStates(states) = value {
                for state in states.iter_mut() {
                    state.triggered = false;
                }
            }
        });
    }
}
