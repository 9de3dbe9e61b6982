use std::time::Duration;

use rayon::Yield;

/// Upper bounds on a single park. The park functions return early when woken.
const IDLE_PARK: Duration = Duration::from_micros(200);
const EXTERNAL_PARK: Duration = Duration::from_millis(20);

/// Blocks until `done` holds.
///
/// A worker thread keeps executing other ready jobs from its pool while it
/// waits, so a task blocked on a value still lets the pool make progress on
/// the work producing it. Threads outside any pool just park.
pub(crate) fn cooperate<D, P>(done: D, park: P)
where
    D: Fn() -> bool,
    P: Fn(Duration),
{
    while !done() {
        match rayon::yield_now() {
            Some(Yield::Executed) => {}
            Some(Yield::Idle) => park(IDLE_PARK),
            None => park(EXTERNAL_PARK),
        }
    }
}
