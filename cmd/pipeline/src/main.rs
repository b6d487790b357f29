//! Producer/consumer example
//!
//! The producer coroutine yields squares through the call/yield_value
//! protocol; the consumer invokes it once per value. The producer is
//! constructed without autostart: the first call starts it.

use anyhow::Result;
use comux::{Coroutine, CoroutineMachine};

fn main() -> Result<()> {
    let machine = CoroutineMachine::new()?;

    let producer = Coroutine::builder()
        .name("producer")
        .autostart(false)
        .spawn(&machine, |co| {
            for i in 1..=10u64 {
                co.yield_value(i * i)?;
            }
            Ok(())
        })?;

    Coroutine::builder().name("consumer").spawn(&machine, move |co| {
        for _ in 0..10 {
            let square: u64 = co.call(&producer)?;
            println!("[consumer] got {}", square);
        }
        Ok(())
    })?;

    machine.run()?;
    Ok(())
}
