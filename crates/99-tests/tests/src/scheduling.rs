//! Scheduling behaviour: round-robin fairness, guarded matching, re-entrant
//! emission and cross-site flows.

use std::time::Duration;

use crossbeam_channel::unbounded;
use retort::{reaction, BlockingMolecule, BoundValues, Molecule, ReactionSite};

use crate::support::{assert_quiet, pool, recv_exactly};

#[test]
fn competing_reactions_both_make_progress() {
    let pool = pool("fair", 2);
    let fuel = Molecule::<u32>::new("fuel");
    let (tx, rx) = unbounded();

    let tx_left = tx.clone();
    let tx_right = tx;
    let fuel_left = fuel.clone();
    let fuel_right = fuel.clone();
    let _site = ReactionSite::builder("race", &pool)
        .reaction(reaction("left").consume(&fuel).body(move |scope| {
            let value = scope.take(&fuel_left)?;
            tx_left.send(("left", value)).unwrap();
            Ok(())
        }))
        .reaction(reaction("right").consume(&fuel).body(move |scope| {
            let value = scope.take(&fuel_right)?;
            tx_right.send(("right", value)).unwrap();
            Ok(())
        }))
        .activate()
        .expect("valid configuration");

    for value in 0..100 {
        fuel.emit(value).unwrap();
    }
    let results = recv_exactly(&rx, 100);

    let left = results.iter().filter(|(tag, _)| *tag == "left").count();
    let right = results.len() - left;
    assert!(
        left > 0 && right > 0,
        "neither competitor may starve: left={left}, right={right}"
    );

    let mut values: Vec<u32> = results.iter().map(|(_, value)| *value).collect();
    values.sort_unstable();
    assert_eq!(values, (0..100).collect::<Vec<_>>());
    pool.shutdown();
}

#[test]
fn guarded_reaction_waits_for_matching_values() {
    let pool = pool("consensus", 2);
    let propose = Molecule::<u32>::new("propose");
    let accept = Molecule::<u32>::new("accept");
    let (tx, rx) = unbounded();

    let proposals = propose.clone();
    let site = ReactionSite::builder("consensus", &pool)
        .reaction(
            reaction("agree")
                .consume(&propose)
                .consume(&accept)
                .guard(|values: &BoundValues<'_>| values.get::<u32>(0) == values.get::<u32>(1))
                .body(move |scope| {
                    let agreed = scope.take(&proposals)?;
                    tx.send(agreed).unwrap();
                    Ok(())
                }),
        )
        .activate()
        .expect("valid configuration");

    propose.emit(1).unwrap();
    propose.emit(2).unwrap();
    accept.emit(2).unwrap();

    assert_eq!(recv_exactly(&rx, 1), vec![2], "only the matching pair fires");
    assert_quiet(&rx, Duration::from_millis(100));
    assert_eq!(
        site.pending(),
        vec![("propose".to_string(), 1)],
        "the non-matching proposal stays pending"
    );
    pool.shutdown();
}

#[test]
fn bodies_re_emit_into_their_own_site() {
    let pool = pool("reentrant", 2);
    let countdown = Molecule::<u32>::new("countdown");
    let (tx, rx) = unbounded();

    let again = countdown.clone();
    let _site = ReactionSite::builder("countdown", &pool)
        .reaction(reaction("step").consume(&countdown).body(move |scope| {
            let n = scope.take(&again)?;
            tx.send(n).unwrap();
            if n > 0 {
                again.emit(n - 1)?;
            }
            Ok(())
        }))
        .activate()
        .expect("valid configuration");

    countdown.emit(5).unwrap();
    let steps = recv_exactly(&rx, 6);
    assert_eq!(steps, vec![5, 4, 3, 2, 1, 0]);
    pool.shutdown();
}

#[test]
fn reactions_emit_across_sites() {
    let pool = pool("pipeline", 2);
    let stage1 = Molecule::<u32>::new("stage1");
    let stage2 = Molecule::<u32>::new("stage2");
    let (tx, rx) = unbounded();

    let finished = stage2.clone();
    let _sink = ReactionSite::builder("sink", &pool)
        .reaction(reaction("collect").consume(&stage2).body(move |scope| {
            tx.send(scope.take(&finished)?).unwrap();
            Ok(())
        }))
        .activate()
        .expect("valid configuration");

    let incoming = stage1.clone();
    let forward = stage2.clone();
    let _source = ReactionSite::builder("source", &pool)
        .reaction(reaction("transform").consume(&stage1).body(move |scope| {
            let value = scope.take(&incoming)?;
            forward.emit(value + 100)?;
            Ok(())
        }))
        .activate()
        .expect("valid configuration");

    for value in 0..10 {
        stage1.emit(value).unwrap();
    }
    let mut results = recv_exactly(&rx, 10);
    results.sort_unstable();
    assert_eq!(results, (100..110).collect::<Vec<_>>());
    pool.shutdown();
}

#[test]
fn blocking_call_inside_a_body_borrows_pool_capacity() {
    // A single core worker: the outer body parks on the nested call, so the
    // inner reaction can only run if the pool grows a replacement worker.
    let pool = pool("nested", 1);
    let outer = BlockingMolecule::<u32, u32>::new("outer");
    let inner = BlockingMolecule::<u32, u32>::new("inner");

    let outer_requests = outer.clone();
    let nested = inner.clone();
    let _outer_site = ReactionSite::builder("outer", &pool)
        .reaction(
            reaction("outer")
                .consume_blocking(&outer)
                .body(move |scope| {
                    let (value, reply) = scope.take_blocking(&outer_requests)?;
                    let doubled = nested.call(value)?;
                    reply.send(doubled);
                    Ok(())
                }),
        )
        .activate()
        .expect("valid configuration");

    let inner_requests = inner.clone();
    let _inner_site = ReactionSite::builder("inner", &pool)
        .reaction(
            reaction("inner")
                .consume_blocking(&inner)
                .body(move |scope| {
                    let (value, reply) = scope.take_blocking(&inner_requests)?;
                    reply.send(value * 2);
                    Ok(())
                }),
        )
        .activate()
        .expect("valid configuration");

    assert_eq!(outer.call(8).expect("nested call completed"), 16);
    pool.shutdown();
}
