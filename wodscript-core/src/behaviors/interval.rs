use crate::actions::Action;
use crate::behaviors::{sound, timer};
use crate::block::RuntimeBlock;
use crate::error::RuntimeError;
use crate::events::{names, Event};
use crate::runtime::ScriptRuntime;

/// Watches its block's round counter and restarts the countdown timer at
/// every round boundary after the first, resetting sound cues with it.
/// This is the mechanism that turns a countdown timer into an EMOM.
pub struct IntervalRestartBehavior;

impl IntervalRestartBehavior {
    pub fn on_event(
        &self,
        rt: &mut ScriptRuntime,
        block: &RuntimeBlock,
        event: &Event,
    ) -> Result<Vec<Action>, RuntimeError> {
        if event.name != names::ROUNDS_CHANGED || event.block_id() != Some(block.key()) {
            return Ok(Vec::new());
        }
        // Round 1 is the mount-time start, not an advance.
        if event.int_field("round").unwrap_or(1) <= 1 {
            return Ok(Vec::new());
        }
        timer::restart(rt, block, event.timestamp);
        sound::reset_cues(rt, block);
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behaviors::{Behavior, LoopCoordinatorBehavior, TimerBehavior};
    use crate::block::RuntimeBlock;
    use crate::clock::ManualClock;
    use crate::events::names;
    use crate::runtime::ScriptRuntime;
    use crate::types::{BlockKey, BlockType};
    use chrono::Utc;
    use serde_json::json;
    use std::rc::Rc;

    fn make_interval_block() -> (ScriptRuntime, ManualClock, Rc<RuntimeBlock>) {
        let clock = ManualClock::starting_at(Utc::now());
        let mut rt = ScriptRuntime::new(Vec::new(), Vec::new(), Rc::new(clock.clone()));
        let block = Rc::new(RuntimeBlock::new(
            BlockKey::new(),
            vec![],
            BlockType::Interval,
            "emom",
            vec![],
            vec![
                Behavior::Timer(TimerBehavior::countdown(60_000, "emom")),
                Behavior::Loop(LoopCoordinatorBehavior::interval(vec![vec![9]], 5, 60_000)),
                Behavior::IntervalRestart(IntervalRestartBehavior),
            ],
        ));
        rt.push_block(block.clone(), None).unwrap();
        (rt, clock, block)
    }

    fn rounds_changed(block: &RuntimeBlock, at: chrono::DateTime<Utc>, round: u32) -> Event {
        Event::new(
            names::ROUNDS_CHANGED,
            at,
            json!({ "blockId": block.key().as_uuid(), "round": round }),
        )
    }

    /// The first round's `rounds:changed` is the mount-time start; the
    /// timer keeps its original span.
    #[test]
    fn first_round_does_not_restart() {
        let (mut rt, clock, block) = make_interval_block();
        let restart = IntervalRestartBehavior;
        let at = clock.advance_ms(1_000);
        restart
            .on_event(&mut rt, &block, &rounds_changed(&block, at, 1))
            .unwrap();
        assert_eq!(timer::spans(&rt, &block).len(), 1);
    }

    /// Later rounds close the running span and open a fresh one at the
    /// boundary instant.
    #[test]
    fn later_rounds_restart_the_timer() {
        let (mut rt, clock, block) = make_interval_block();
        let restart = IntervalRestartBehavior;
        let boundary = clock.advance_ms(60_000);
        restart
            .on_event(&mut rt, &block, &rounds_changed(&block, boundary, 2))
            .unwrap();

        let spans = timer::spans(&rt, &block);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].stop, Some(boundary));
        assert_eq!(spans[1].start, boundary);
        assert!(timer::is_running(&rt, &block));
        assert_eq!(timer::elapsed_ms(&rt, &block, boundary), 0);
    }

    /// Another block's round boundary is none of this block's business.
    #[test]
    fn foreign_rounds_are_ignored() {
        let (mut rt, clock, block) = make_interval_block();
        let restart = IntervalRestartBehavior;
        let at = clock.advance_ms(60_000);
        let foreign = Event::new(
            names::ROUNDS_CHANGED,
            at,
            json!({ "blockId": BlockKey::new().as_uuid(), "round": 2 }),
        );
        restart.on_event(&mut rt, &block, &foreign).unwrap();
        assert_eq!(timer::spans(&rt, &block).len(), 1);
    }
}
