//! Ping-pong example
//!
//! Two coroutines yield back and forth; the fair selection policy makes
//! them strictly alternate. The completion callback reports each exit.

use anyhow::Result;
use comux::{Coroutine, CoroutineMachine};

const TURNS: u32 = 5;

fn main() -> Result<()> {
    let machine = CoroutineMachine::new()?;

    machine.set_completion_callback(|co| {
        println!("[machine] {} finished (last tick {})", co.name(), co.last_tick());
    });

    for name in ["ping", "pong"] {
        Coroutine::builder()
            .name(name)
            .spawn(&machine, move |co| {
                for turn in 0..TURNS {
                    println!("[{}] turn {}", co.name(), turn);
                    co.yield_now()?;
                }
                Ok(())
            })?;
    }

    machine.run()?;
    println!("[machine] done after {} ticks", machine.tick_count());
    Ok(())
}
