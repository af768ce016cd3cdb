//! The producer/consumer counter scenario: a static `count` refreshed by a
//! blocking `increment` molecule.

use std::thread;

use retort::{reaction, BlockingMolecule, ReactionSite, StaticMolecule};

use crate::support::pool;

#[test]
fn one_hundred_concurrent_increments_yield_every_value_once() {
    let pool = pool("counter", 4);
    let count = StaticMolecule::<u64>::new("count");
    let increment = BlockingMolecule::<(), u64>::new("increment");

    let state = count.clone();
    let requests = increment.clone();
    let site = ReactionSite::builder("counter", &pool)
        .with_static(&count, 0)
        .reaction(
            reaction("increment")
                .consume_blocking(&increment)
                .consume_static(&count)
                .body(move |scope| {
                    let (_, reply) = scope.take_blocking(&requests)?;
                    let current = scope.take_static(&state)?;
                    state.emit(current + 1)?;
                    reply.send(current + 1);
                    Ok(())
                }),
        )
        .activate()
        .expect("valid configuration");

    let callers: Vec<_> = (0..100)
        .map(|_| {
            let increment = increment.clone();
            thread::spawn(move || increment.call(()).expect("increment replied"))
        })
        .collect();

    let mut replies: Vec<u64> = callers
        .into_iter()
        .map(|caller| caller.join().expect("caller thread survived"))
        .collect();
    replies.sort_unstable();
    let expected: Vec<u64> = (1..=100).collect();
    assert_eq!(replies, expected, "replies form {{1..=100}} with no duplicates");

    assert_eq!(count.read().expect("count is committed"), 100);
    let metrics = site.metrics();
    assert_eq!(metrics.fired, 100);
    assert_eq!(metrics.replied, 100);
    assert_eq!(metrics.failed, 0);
    pool.shutdown();
}
