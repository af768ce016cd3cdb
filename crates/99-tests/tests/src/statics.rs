//! Static molecule invariants: exactly one pending value, volatile reads
//! never observe "no value", failed refreshes restore the previous value.

use std::thread;

use crossbeam_channel::unbounded;
use retort::{reaction, BlockingMolecule, Molecule, ReactionSite, StaticMolecule};

use crate::support::{await_error_report, pool, recv_exactly};

#[test]
fn refresh_reactions_keep_exactly_one_value() {
    let pool = pool("refresh", 4);
    let total = StaticMolecule::<u64>::new("total");
    let bump = Molecule::<u64>::new("bump");
    let (done_tx, done_rx) = unbounded();

    const EXPECTED: u64 = (1 + 50) * 50 / 2;

    let state = total.clone();
    let bumps = bump.clone();
    let site = ReactionSite::builder("adder", &pool)
        .with_static(&total, 0)
        .reaction(
            reaction("add")
                .consume(&bump)
                .consume_static(&total)
                .body(move |scope| {
                    let delta = scope.take(&bumps)?;
                    let current = scope.take_static(&state)?;
                    let next = current + delta;
                    state.emit(next)?;
                    if next == EXPECTED {
                        done_tx.send(next).unwrap();
                    }
                    Ok(())
                }),
        )
        .activate()
        .expect("valid configuration");

    for delta in 1..=50u64 {
        bump.emit(delta).unwrap();
    }
    assert_eq!(recv_exactly(&done_rx, 1)[0], EXPECTED);
    assert_eq!(total.read().unwrap(), EXPECTED);
    assert_eq!(
        site.pending(),
        vec![("total".to_string(), 1)],
        "exactly one static value pending, all bumps consumed"
    );
    pool.shutdown();
}

#[test]
fn volatile_read_never_observes_no_value() {
    let pool = pool("readers", 4);
    let count = StaticMolecule::<u64>::new("count");
    let tick = Molecule::<()>::new("tick");

    let state = count.clone();
    let _site = ReactionSite::builder("ticking", &pool)
        .with_static(&count, 0)
        .reaction(
            reaction("tick")
                .consume(&tick)
                .consume_static(&count)
                .body(move |scope| {
                    let current = scope.take_static(&state)?;
                    state.emit(current + 1)?;
                    Ok(())
                }),
        )
        .activate()
        .expect("valid configuration");

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let count = count.clone();
            thread::spawn(move || {
                let mut last = 0;
                for _ in 0..1000 {
                    let value = count.read().expect("read always observes a value");
                    assert!(value >= last, "committed values never go backwards");
                    last = value;
                }
            })
        })
        .collect();

    for _ in 0..200 {
        tick.emit(()).unwrap();
    }
    for reader in readers {
        reader.join().expect("reader thread survived");
    }
    pool.shutdown();
}

#[test]
fn failing_refresh_restores_the_previous_value() {
    let pool = pool("poisoned", 2);
    let count = StaticMolecule::<u64>::new("count");
    let poison = Molecule::<()>::new("poison");
    let get = BlockingMolecule::<(), u64>::new("get");

    let state_poison = count.clone();
    let state_get = count.clone();
    let gets = get.clone();
    let _site = ReactionSite::builder("poisoned", &pool)
        .with_static(&count, 7)
        .reaction(
            reaction("poison")
                .consume(&poison)
                .consume_static(&count)
                .body(move |scope| {
                    let _ = scope.take_static(&state_poison)?;
                    anyhow::bail!("poisoned refresh")
                }),
        )
        .reaction(
            reaction("get")
                .consume_blocking(&get)
                .consume_static(&count)
                .body(move |scope| {
                    let (_, reply) = scope.take_blocking(&gets)?;
                    let current = scope.take_static(&state_get)?;
                    state_get.emit(current)?;
                    reply.send(current);
                    Ok(())
                }),
        )
        .activate()
        .expect("valid configuration");

    assert_eq!(get.call(()).unwrap(), 7);

    poison.emit(()).unwrap();
    await_error_report(&pool, |r| r.message.contains("poisoned refresh"));

    // The failed refresh must have restored the value; both the matching
    // path and the volatile read still see it.
    assert_eq!(get.call(()).unwrap(), 7);
    assert_eq!(count.read().unwrap(), 7);
    pool.shutdown();
}

#[test]
fn forgetting_to_refresh_is_reported_and_restored() {
    let pool = pool("lazy", 2);
    let state = StaticMolecule::<u64>::new("state");
    let tick = Molecule::<()>::new("tick");

    let state_lazy = state.clone();
    let _site = ReactionSite::builder("lazy", &pool)
        .with_static(&state, 3)
        .reaction(
            reaction("lazy")
                .consume(&tick)
                .consume_static(&state)
                .body(move |scope| {
                    let _ = scope.take_static(&state_lazy)?;
                    // Completing without re-emitting is a discipline
                    // violation the runtime repairs and reports.
                    Ok(())
                }),
        )
        .activate()
        .expect("valid configuration");

    tick.emit(()).unwrap();
    let report = await_error_report(&pool, |r| r.message.contains("not re-emitted"));
    assert!(report.message.contains("state"));
    assert_eq!(state.read().unwrap(), 3);
    pool.shutdown();
}
