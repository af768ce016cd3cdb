//! Configuration-error surface: bind-once, malformed patterns and static
//! discipline, all reported synchronously at the offending call.

use std::time::Duration;

use crossbeam_channel::unbounded;
use retort::{
    reaction, BlockingMolecule, CallError, ConfigError, EmitError, Molecule, ReactionSite,
    StaticMolecule,
};

use crate::support::{assert_quiet, pool, recv_exactly};

#[test]
fn a_molecule_binds_to_at_most_one_site() {
    let pool = pool("bind", 1);
    let shared = Molecule::<u32>::new("shared");

    let _first = ReactionSite::builder("first", &pool)
        .reaction(reaction("sink").consume(&shared).body(|_| Ok(())))
        .activate()
        .expect("first binding succeeds");

    let second = ReactionSite::builder("second", &pool)
        .reaction(reaction("sink").consume(&shared).body(|_| Ok(())))
        .activate();
    match second {
        Err(ConfigError::AlreadyBound {
            molecule,
            bound_to,
            site,
        }) => {
            assert_eq!(molecule, "shared");
            assert_eq!(bound_to, "first");
            assert_eq!(site, "second");
        }
        other => panic!("expected AlreadyBound, got {other:?}"),
    }
    pool.shutdown();
}

#[test]
fn empty_patterns_are_rejected() {
    let pool = pool("empty", 1);
    let result = ReactionSite::builder("empty", &pool)
        .reaction(reaction("nothing").body(|_| Ok(())))
        .activate();
    assert!(matches!(result, Err(ConfigError::EmptyPattern { .. })));
    pool.shutdown();
}

#[test]
fn sites_require_at_least_one_reaction() {
    let pool = pool("bare", 1);
    let result = ReactionSite::builder("bare", &pool).activate();
    assert!(matches!(result, Err(ConfigError::NoReactions { .. })));
    pool.shutdown();
}

#[test]
fn emitting_an_unbound_molecule_fails() {
    let loose = Molecule::<u32>::new("loose");
    assert!(matches!(
        loose.emit(1),
        Err(EmitError::Unbound { molecule }) if molecule == "loose"
    ));

    let loose_call = BlockingMolecule::<u32, u32>::new("loose-call");
    assert!(matches!(
        loose_call.call(1),
        Err(CallError::Emit(EmitError::Unbound { .. }))
    ));
}

#[test]
fn static_molecules_cannot_be_emitted_outside_their_reaction() {
    let pool = pool("static-emit", 1);
    let state = StaticMolecule::<u32>::new("state");
    let tick = Molecule::<()>::new("tick");

    let refresh = state.clone();
    let _site = ReactionSite::builder("stateful", &pool)
        .with_static(&state, 0)
        .reaction(
            reaction("tick")
                .consume(&tick)
                .consume_static(&state)
                .body(move |scope| {
                    let current = scope.take_static(&refresh)?;
                    refresh.emit(current + 1)?;
                    Ok(())
                }),
        )
        .activate()
        .expect("valid configuration");

    assert!(matches!(
        state.emit(9),
        Err(EmitError::StaticOutsideReaction { .. })
    ));
    pool.shutdown();
}

#[test]
fn consumed_statics_must_be_seeded() {
    let pool = pool("unseeded", 1);
    let state = StaticMolecule::<u32>::new("state");
    let tick = Molecule::<()>::new("tick");

    let result = ReactionSite::builder("unseeded", &pool)
        .reaction(
            reaction("tick")
                .consume(&tick)
                .consume_static(&state)
                .body(|_| Ok(())),
        )
        .activate();
    assert!(matches!(
        result,
        Err(ConfigError::StaticNotSeeded { molecule, .. }) if molecule == "state"
    ));
    pool.shutdown();
}

#[test]
fn duplicate_static_seeds_are_rejected() {
    let pool = pool("dup", 1);
    let state = StaticMolecule::<u32>::new("state");
    let tick = Molecule::<()>::new("tick");

    let refresh = state.clone();
    let result = ReactionSite::builder("dup", &pool)
        .with_static(&state, 0)
        .with_static(&state, 1)
        .reaction(
            reaction("tick")
                .consume(&tick)
                .consume_static(&state)
                .body(move |scope| {
                    let current = scope.take_static(&refresh)?;
                    refresh.emit(current)?;
                    Ok(())
                }),
        )
        .activate();
    assert!(matches!(result, Err(ConfigError::DuplicateStatic { .. })));
    pool.shutdown();
}

#[test]
fn identical_types_never_cross_match() {
    let pool = pool("identity", 2);
    let left = Molecule::<u32>::new("left");
    let right = Molecule::<u32>::new("right");
    let (tx, rx) = unbounded();

    let tx_left = tx.clone();
    let tx_right = tx;
    let lefts = left.clone();
    let rights = right.clone();
    let _site = ReactionSite::builder("identity", &pool)
        .reaction(reaction("left").consume(&left).body(move |scope| {
            tx_left.send(("left", scope.take(&lefts)?)).unwrap();
            Ok(())
        }))
        .reaction(reaction("right").consume(&right).body(move |scope| {
            tx_right.send(("right", scope.take(&rights)?)).unwrap();
            Ok(())
        }))
        .activate()
        .expect("valid configuration");

    left.emit(5).unwrap();
    assert_eq!(recv_exactly(&rx, 1), vec![("left", 5)]);
    assert_quiet(&rx, Duration::from_millis(100));
    pool.shutdown();
}
