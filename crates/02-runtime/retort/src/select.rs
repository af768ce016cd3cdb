//! Matching and selection over the bag.
//!
//! [`try_select`] is a pure function from the current bag contents and one
//! compiled reaction to a selection of distinct pending values, one per
//! declared input slot. Keeping it free of locking and scheduling lets the
//! algorithm be tested directly.
//!
//! Candidates are tried in emission (FIFO) order per kind. A failing guard
//! does not conclude the reaction cannot fire: the search backtracks and
//! tries other pending values of the same kind, which is what guarded
//! patterns such as consensus-by-value-match rely on.

use std::any::Any;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::bag::Bag;
use crate::molecule::{EmissionId, MoleculeId};
use crate::reaction::{BoundValues, ReactionScope};

/// Per-input predicate over a candidate value.
pub(crate) type ValueFilter = Arc<dyn Fn(&dyn Any) -> bool + Send + Sync>;

/// Cross-input predicate over a full candidate tuple.
pub(crate) type TupleGuard = Arc<dyn Fn(&BoundValues<'_>) -> bool + Send + Sync>;

/// Reaction body closure, shared by all concurrently running instances.
pub(crate) type BodyFn =
    dyn Fn(&mut ReactionScope<'_>) -> anyhow::Result<()> + Send + Sync;

pub(crate) struct CompiledInput {
    pub(crate) molecule: MoleculeId,
    pub(crate) name: Arc<str>,
    pub(crate) is_static: bool,
    pub(crate) filter: Option<ValueFilter>,
}

pub(crate) struct CompiledReaction {
    pub(crate) label: Arc<str>,
    pub(crate) inputs: SmallVec<[CompiledInput; 4]>,
    pub(crate) guard: Option<TupleGuard>,
    pub(crate) body: Arc<BodyFn>,
}

pub(crate) type Selection = SmallVec<[EmissionId; 4]>;

/// Finds one selection of distinct pending values satisfying the reaction's
/// pattern, filters and guard, or `None` if the reaction cannot fire now.
pub(crate) fn try_select(bag: &Bag, reaction: &CompiledReaction) -> Option<Selection> {
    let mut chosen: Selection = SmallVec::new();
    let mut values: SmallVec<[&dyn Any; 4]> = SmallVec::new();
    if fill_slot(bag, reaction, 0, &mut chosen, &mut values) {
        Some(chosen)
    } else {
        None
    }
}

fn fill_slot<'b>(
    bag: &'b Bag,
    reaction: &CompiledReaction,
    slot: usize,
    chosen: &mut Selection,
    values: &mut SmallVec<[&'b dyn Any; 4]>,
) -> bool {
    if slot == reaction.inputs.len() {
        return match &reaction.guard {
            Some(guard) => guard(&BoundValues::new(values)),
            None => true,
        };
    }
    let input = &reaction.inputs[slot];
    let Some(queue) = bag.queue(input.molecule) else {
        return false;
    };
    for pending in queue {
        // Repeated inputs of one kind must bind distinct instances.
        if chosen.contains(&pending.emission) {
            continue;
        }
        if let Some(filter) = &input.filter {
            if !filter(pending.value.as_ref()) {
                continue;
            }
        }
        chosen.push(pending.emission);
        values.push(pending.value.as_ref());
        if fill_slot(bag, reaction, slot + 1, chosen, values) {
            return true;
        }
        chosen.pop();
        values.pop();
    }
    false
}
