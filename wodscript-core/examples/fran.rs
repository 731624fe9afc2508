//! Drive the classic 21-15-9 couplet through the runtime with simulated
//! user `next` events and print the resulting timeline.
//!
//! ```sh
//! cargo run --example fran
//! ```

use std::rc::Rc;

use wodscript_core::clock::{Clock, ManualClock};
use wodscript_core::events::Event;
use wodscript_core::{Fragment, RoundScheme, ScriptRuntime, Statement};

fn main() {
    let scheme = Statement::new(1)
        .with_fragment(Fragment::Rounds {
            scheme: RoundScheme::RepScheme(vec![21, 15, 9]),
        })
        .with_child_group(vec![2])
        .with_child_group(vec![3]);
    let thrusters = Statement::new(2).with_fragment(Fragment::Effort {
        label: "thrusters".into(),
    });
    let pullups = Statement::new(3).with_fragment(Fragment::Effort {
        label: "pullups".into(),
    });

    let clock = ManualClock::starting_at(chrono::Utc::now());
    let mut runtime = ScriptRuntime::new(
        vec![scheme, thrusters, pullups],
        vec![1],
        Rc::new(clock.clone()),
    );

    runtime.subscribe_to_output(|record| {
        let span = record.time_span();
        let duration = span
            .stop
            .map(|stop| (stop - span.start).num_milliseconds())
            .unwrap_or(0);
        println!(
            "{:>6}ms  level {}  {:<18} {}",
            duration,
            record.stack_level(),
            record.block_type().to_string(),
            record.label()
        );
    });

    runtime.start().expect("workout starts");

    // An athlete finishing each movement in 30 seconds flat.
    while runtime.inspect().depth > 1 {
        clock.advance_ms(30_000);
        runtime
            .handle(Event::next(clock.now()))
            .expect("runtime is live");
    }

    println!("---\n{} records emitted", runtime.timeline().len());
}
