//! Declaring reactions and the body-side view of consumed values.

use std::any::Any;
use std::sync::Arc;

use crate::error::ScopeError;
use crate::metrics::SiteMetrics;
use crate::molecule::{
    BlockingMolecule, EmissionId, Molecule, MoleculeCore, MoleculeId, StaticMolecule,
};
use crate::reply::{Reply, ReplyHandle, ReplySlot};
use crate::select::{BodyFn, TupleGuard, ValueFilter};
use crate::trace::TraceHook;

/// Starts declaring a reaction. The label is used in diagnostics and error
/// reports only.
pub fn reaction(label: &str) -> ReactionBuilder {
    ReactionBuilder {
        label: Arc::from(label),
        inputs: Vec::new(),
        guard: None,
    }
}

pub(crate) struct InputDecl {
    pub(crate) core: Arc<MoleculeCore>,
    pub(crate) filter: Option<ValueFilter>,
}

/// Builder for a [`Reaction`]: input pattern, optional guard, body.
pub struct ReactionBuilder {
    label: Arc<str>,
    inputs: Vec<InputDecl>,
    guard: Option<TupleGuard>,
}

impl ReactionBuilder {
    /// Adds a non-blocking input to the pattern. Consuming the same molecule
    /// twice requires two distinct pending values.
    pub fn consume<T: Send + 'static>(mut self, molecule: &Molecule<T>) -> Self {
        self.inputs.push(InputDecl {
            core: Arc::clone(molecule.core()),
            filter: None,
        });
        self
    }

    /// Adds a non-blocking input that only matches values satisfying
    /// `filter`. Filters must be pure: they run under the site lock while
    /// candidates are examined.
    pub fn consume_filtered<T: Send + 'static>(
        mut self,
        molecule: &Molecule<T>,
        filter: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.inputs.push(InputDecl {
            core: Arc::clone(molecule.core()),
            filter: Some(erase_filter(filter)),
        });
        self
    }

    /// Adds a blocking input. The body must take its [`Reply`] token and
    /// answer it (or let the token's drop fail the caller).
    pub fn consume_blocking<T: Send + 'static, R: Send + 'static>(
        mut self,
        molecule: &BlockingMolecule<T, R>,
    ) -> Self {
        self.inputs.push(InputDecl {
            core: Arc::clone(molecule.core()),
            filter: None,
        });
        self
    }

    /// Adds a blocking input filtered on the carried request value.
    pub fn consume_blocking_filtered<T: Send + 'static, R: Send + 'static>(
        mut self,
        molecule: &BlockingMolecule<T, R>,
        filter: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.inputs.push(InputDecl {
            core: Arc::clone(molecule.core()),
            filter: Some(erase_filter(filter)),
        });
        self
    }

    /// Adds a static input. The body must re-emit the molecule before it
    /// returns; the runtime restores the previous value (and reports the
    /// violation) if it does not.
    pub fn consume_static<T: Clone + Send + Sync + 'static>(
        mut self,
        molecule: &StaticMolecule<T>,
    ) -> Self {
        self.inputs.push(InputDecl {
            core: Arc::clone(molecule.core()),
            filter: None,
        });
        self
    }

    /// Sets a guard over the full candidate tuple, indexed in declaration
    /// order. Guards must be pure predicates; emitting from a guard
    /// deadlocks the site.
    pub fn guard(mut self, guard: impl Fn(&BoundValues<'_>) -> bool + Send + Sync + 'static) -> Self {
        self.guard = Some(Arc::new(guard));
        self
    }

    /// Attaches the body and finishes the declaration.
    ///
    /// The body runs on a pool worker, never on the emitting thread, and may
    /// emit further molecules, including back into the same site. Errors are
    /// isolated to the failing instance and reported through the pool's
    /// error channel.
    pub fn body(
        self,
        body: impl Fn(&mut ReactionScope<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Reaction {
        Reaction {
            label: self.label,
            inputs: self.inputs,
            guard: self.guard,
            body: Arc::new(body),
        }
    }
}

fn erase_filter<T: Send + 'static>(
    filter: impl Fn(&T) -> bool + Send + Sync + 'static,
) -> ValueFilter {
    Arc::new(move |value: &dyn Any| value.downcast_ref::<T>().is_some_and(|v| filter(v)))
}

/// A declared reaction, ready to be registered at a reaction site.
///
/// Reactions are registered once at site activation and are immutable
/// afterwards.
pub struct Reaction {
    pub(crate) label: Arc<str>,
    pub(crate) inputs: Vec<InputDecl>,
    pub(crate) guard: Option<TupleGuard>,
    pub(crate) body: Arc<BodyFn>,
}

impl Reaction {
    /// Diagnostic label given at declaration.
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Borrowed view of one candidate tuple, handed to a reaction guard.
pub struct BoundValues<'a> {
    slots: &'a [&'a dyn Any],
}

impl<'a> BoundValues<'a> {
    pub(crate) fn new(slots: &'a [&'a dyn Any]) -> Self {
        Self { slots }
    }

    /// Typed access to the value bound at input position `idx` (declaration
    /// order). Returns `None` on an out-of-range index or type mismatch.
    pub fn get<T: 'static>(&self, idx: usize) -> Option<&'a T> {
        self.slots.get(idx).and_then(|value| value.downcast_ref::<T>())
    }

    /// Number of bound input slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True for a zero-arity tuple (never produced by a valid pattern).
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// One consumed value owned by a fired reaction instance.
pub(crate) struct ConsumedSlot {
    pub(crate) molecule: MoleculeId,
    pub(crate) name: Arc<str>,
    pub(crate) is_static: bool,
    pub(crate) emission: EmissionId,
    pub(crate) value: Option<Box<dyn Any + Send>>,
    pub(crate) reply: Option<Arc<dyn ReplyHandle>>,
}

/// The body-side view of one fired reaction instance.
///
/// Hands the body ownership of the values its pattern consumed. Values are
/// taken by emitter handle; static values are cloned out so the runtime can
/// restore them if the body fails before re-emitting.
pub struct ReactionScope<'a> {
    pub(crate) site: Arc<str>,
    pub(crate) reaction: Arc<str>,
    pub(crate) hook: Arc<dyn TraceHook>,
    pub(crate) metrics: Arc<SiteMetrics>,
    pub(crate) consumed: &'a mut [ConsumedSlot],
}

impl ReactionScope<'_> {
    /// Takes the value consumed for `molecule`. With repeated inputs of one
    /// kind, successive calls return successive slots.
    pub fn take<T: Send + 'static>(&mut self, molecule: &Molecule<T>) -> Result<T, ScopeError> {
        let id = molecule.core().id;
        let slot = self.untaken_slot(id, molecule.name())?;
        take_typed::<T>(slot)
    }

    /// Takes the request value and the one-shot [`Reply`] token consumed for
    /// a blocking input.
    pub fn take_blocking<T: Send + 'static, R: Send + 'static>(
        &mut self,
        molecule: &BlockingMolecule<T, R>,
    ) -> Result<(T, Reply<R>), ScopeError> {
        let id = molecule.core().id;
        let site = Arc::clone(&self.site);
        let hook = Arc::clone(&self.hook);
        let metrics = Arc::clone(&self.metrics);
        let slot = self.untaken_slot(id, molecule.name())?;
        let name = Arc::clone(&slot.name);

        let handle = slot.reply.take().ok_or_else(|| ScopeError::ValueType {
            molecule: name.to_string(),
        })?;
        let typed = match handle.as_any_arc().downcast::<ReplySlot<R>>() {
            Ok(typed) => typed,
            Err(_) => {
                return Err(ScopeError::ValueType {
                    molecule: name.to_string(),
                })
            }
        };
        let value = take_typed::<T>(slot)?;
        Ok((value, Reply::new(typed, site, name, hook, metrics)))
    }

    /// Clones out the value consumed for a static input. The original stays
    /// with the instance until the molecule is re-emitted.
    pub fn take_static<T: Clone + Send + Sync + 'static>(
        &mut self,
        molecule: &StaticMolecule<T>,
    ) -> Result<T, ScopeError> {
        let id = molecule.core().id;
        let slot = self.untaken_slot(id, molecule.name())?;
        slot.value
            .as_ref()
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
            .ok_or_else(|| ScopeError::ValueType {
                molecule: molecule.name().to_string(),
            })
    }

    /// Site this instance fired on, for diagnostics.
    pub fn site(&self) -> &str {
        &self.site
    }

    /// Label of the running reaction, for diagnostics.
    pub fn reaction(&self) -> &str {
        &self.reaction
    }

    fn untaken_slot(
        &mut self,
        id: MoleculeId,
        name: &str,
    ) -> Result<&mut ConsumedSlot, ScopeError> {
        let reaction = Arc::clone(&self.reaction);
        self.consumed
            .iter_mut()
            .find(|slot| slot.molecule == id && slot.value.is_some())
            .ok_or_else(|| ScopeError::InputMismatch {
                reaction: reaction.to_string(),
                molecule: name.to_string(),
            })
    }
}

fn take_typed<T: Send + 'static>(slot: &mut ConsumedSlot) -> Result<T, ScopeError> {
    let value = slot.value.take().ok_or_else(|| ScopeError::ValueType {
        molecule: slot.name.to_string(),
    })?;
    match value.downcast::<T>() {
        Ok(boxed) => Ok(*boxed),
        Err(original) => {
            // Put the value back so static restoration still has it.
            slot.value = Some(original);
            Err(ScopeError::ValueType {
                molecule: slot.name.to_string(),
            })
        }
    }
}
