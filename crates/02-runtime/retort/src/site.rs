//! The reaction site: owner of a bag, a fixed reaction set and a pool handle.
//!
//! All bag mutation happens under one `parking_lot` mutex per site. The scan
//! runs on whichever thread emitted (insertion and selection are cheap);
//! selected instances are handed to the pool, so reaction bodies never run
//! on the emitting thread and re-entrant emission from a body cannot
//! deadlock the site lock.
//!
//! Fairness policy: when several reactions are satisfiable from one bag
//! state the scan rotates its starting reaction between rounds and commits
//! at most one instance per reaction per round, so a continuously
//! satisfiable reaction cannot be starved by a competitor. Within one
//! molecule kind candidates are tried oldest-first, but a guard may skip
//! past older values; no strict global FIFO is guaranteed.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{error, warn};
use parking_lot::Mutex;
use retort_pool::ThreadPool;
use smallvec::SmallVec;

use crate::bag::{Bag, Pending};
use crate::error::{ConfigError, ConfigResult, EmitError};
use crate::metrics::{SiteMetrics, SiteMetricsSnapshot};
use crate::molecule::{EmissionId, MoleculeCore, MoleculeId};
use crate::reaction::{ConsumedSlot, Reaction, ReactionScope};
use crate::reply::ReplyHandle;
use crate::select::{self, CompiledInput, CompiledReaction};
use crate::trace::{LogHook, TraceHook};

thread_local! {
    /// Static-molecule bookkeeping for the reaction instance running on this
    /// worker thread, if any.
    static REACTION_CTX: RefCell<Option<StaticCtx>> = const { RefCell::new(None) };
}

struct StaticCtx {
    /// Consumed static molecules and whether the body re-emitted them yet.
    entries: SmallVec<[(MoleculeId, bool); 2]>,
}

pub(crate) struct SiteInner {
    name: Arc<str>,
    pool: ThreadPool,
    reactions: Vec<CompiledReaction>,
    bag: Mutex<Bag>,
    rr_cursor: AtomicUsize,
    hook: Arc<dyn TraceHook>,
    metrics: Arc<SiteMetrics>,
    names: HashMap<MoleculeId, Arc<str>>,
}

struct FiredInstance {
    reaction_idx: usize,
    consumed: Vec<ConsumedSlot>,
}

/// Safety net around a dispatched instance: if the pool rejects or drops the
/// task, blocked callers are failed and consumed statics restored instead of
/// hanging forever.
struct DispatchGuard {
    site: Arc<SiteInner>,
    instance: Option<FiredInstance>,
}

impl DispatchGuard {
    fn run(mut self) {
        if let Some(instance) = self.instance.take() {
            run_instance(&self.site, instance);
        }
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            abandon_instance(&self.site, instance);
        }
    }
}

impl SiteInner {
    pub(crate) fn site_name(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    /// Withdraws a pending blocking value after its caller's deadline.
    /// Runs under the bag lock, so the value is either withdrawn here or
    /// already committed to an instance, never both.
    pub(crate) fn withdraw(&self, molecule: MoleculeId, emission: EmissionId) -> bool {
        self.bag.lock().remove(molecule, emission).is_some()
    }

    pub(crate) fn note_timeout(&self, molecule: &str) {
        self.metrics.record_timeout();
        self.hook.on_timeout(&self.name, molecule);
    }

    /// Scans reactions round-robin until no further instance can fire,
    /// removing selected values as it goes. Caller holds the bag lock.
    fn scan_locked(&self, bag: &mut Bag) -> Vec<FiredInstance> {
        let mut fired = Vec::new();
        let reaction_count = self.reactions.len();
        loop {
            let mut progressed = false;
            let start = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % reaction_count;
            for offset in 0..reaction_count {
                let idx = (start + offset) % reaction_count;
                if let Some(selection) = select::try_select(bag, &self.reactions[idx]) {
                    if let Some(consumed) = self.commit_selection(bag, idx, selection) {
                        fired.push(FiredInstance {
                            reaction_idx: idx,
                            consumed,
                        });
                        progressed = true;
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        fired
    }

    /// Removes a selection from the bag, turning it into consumed slots.
    fn commit_selection(
        &self,
        bag: &mut Bag,
        reaction_idx: usize,
        selection: select::Selection,
    ) -> Option<Vec<ConsumedSlot>> {
        let reaction = &self.reactions[reaction_idx];
        let mut consumed = Vec::with_capacity(selection.len());
        for (input, emission) in reaction.inputs.iter().zip(selection) {
            match bag.remove(input.molecule, emission) {
                Some(pending) => consumed.push(ConsumedSlot {
                    molecule: input.molecule,
                    name: Arc::clone(&input.name),
                    is_static: input.is_static,
                    emission: pending.emission,
                    value: Some(pending.value),
                    reply: pending.reply,
                }),
                None => {
                    // Selection and removal happen under one lock; a missing
                    // value is an internal invariant violation, not a race.
                    error!(
                        "site `{}`: selected value of `{}` missing from bag",
                        self.name, input.name
                    );
                    debug_assert!(false, "selected value missing from bag");
                    for slot in consumed.drain(..) {
                        if let Some(value) = slot.value {
                            bag.insert(
                                slot.molecule,
                                Pending {
                                    emission: slot.emission,
                                    value,
                                    reply: slot.reply,
                                },
                            );
                        }
                    }
                    return None;
                }
            }
        }
        Some(consumed)
    }

    fn display_name(&self, molecule: MoleculeId) -> String {
        match self.names.get(&molecule) {
            Some(name) => name.to_string(),
            None => molecule.to_string(),
        }
    }
}

/// Inserts a value and fires everything it enables. Shared by all emitter
/// kinds; `commit_static` publishes the volatile-read cache under the same
/// lock as the bag insertion.
pub(crate) fn emit(
    site: &Arc<SiteInner>,
    core: &MoleculeCore,
    value: Box<dyn Any + Send>,
    reply: Option<Arc<dyn ReplyHandle>>,
    commit_static: Option<&dyn Fn()>,
) -> Result<EmissionId, EmitError> {
    if core.is_static {
        note_static_refresh(core)?;
    }
    let emission = EmissionId::next();
    let fired = {
        let mut bag = site.bag.lock();
        bag.insert(
            core.id,
            Pending {
                emission,
                value,
                reply,
            },
        );
        if let Some(commit) = commit_static {
            commit();
        }
        site.scan_locked(&mut bag)
    };
    site.metrics.record_emit();
    site.hook.on_emit(&site.name, &core.name, core.blocking);
    dispatch(site, fired);
    Ok(emission)
}

/// Validates a static re-emission against the running reaction instance.
fn note_static_refresh(core: &MoleculeCore) -> Result<(), EmitError> {
    REACTION_CTX.with(|cell| {
        let mut ctx = cell.borrow_mut();
        let Some(ctx) = ctx.as_mut() else {
            return Err(EmitError::StaticOutsideReaction {
                molecule: core.name.to_string(),
            });
        };
        match ctx.entries.iter_mut().find(|(id, _)| *id == core.id) {
            None => Err(EmitError::StaticNotConsumed {
                molecule: core.name.to_string(),
            }),
            Some((_, refreshed)) if *refreshed => Err(EmitError::StaticAlreadyRefreshed {
                molecule: core.name.to_string(),
            }),
            Some((_, refreshed)) => {
                *refreshed = true;
                Ok(())
            }
        }
    })
}

fn dispatch(site: &Arc<SiteInner>, fired: Vec<FiredInstance>) {
    for instance in fired {
        let label = Arc::clone(&site.reactions[instance.reaction_idx].label);
        for slot in &instance.consumed {
            site.hook.on_consume(&site.name, &slot.name);
            if let Some(reply) = &slot.reply {
                reply.mark_matched();
            }
        }
        site.metrics.record_fire();
        site.hook.on_schedule(&site.name, &label);

        let guard = DispatchGuard {
            site: Arc::clone(site),
            instance: Some(instance),
        };
        if site.pool.spawn(move || guard.run()).is_err() {
            warn!(
                "site `{}`: pool closed, dropping instance of `{label}`",
                site.name
            );
        }
    }
}

/// Runs one fired instance on a pool worker.
fn run_instance(site: &Arc<SiteInner>, instance: FiredInstance) {
    let reaction = &site.reactions[instance.reaction_idx];
    let mut consumed = instance.consumed;

    let statics: SmallVec<[(MoleculeId, bool); 2]> = consumed
        .iter()
        .filter(|slot| slot.is_static)
        .map(|slot| (slot.molecule, false))
        .collect();
    REACTION_CTX.with(|cell| {
        *cell.borrow_mut() = Some(StaticCtx { entries: statics });
    });

    let body = Arc::clone(&reaction.body);
    let result = catch_unwind(AssertUnwindSafe(|| {
        let mut scope = ReactionScope {
            site: Arc::clone(&site.name),
            reaction: Arc::clone(&reaction.label),
            hook: Arc::clone(&site.hook),
            metrics: Arc::clone(&site.metrics),
            consumed: &mut consumed,
        };
        body(&mut scope)
    }));

    let ctx = REACTION_CTX.with(|cell| cell.borrow_mut().take());

    let failure = match result {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(format!("{err:#}")),
        Err(payload) => Some(retort_pool::panic_message(payload.as_ref())),
    };

    if let Some(message) = &failure {
        site.metrics.record_failure();
        site.hook
            .on_body_failure(&site.name, &reaction.label, message);
        site.pool.report(
            format!("site `{}` reaction `{}`", site.name, reaction.label),
            message.clone(),
        );
    }

    // Unblock callers whose reply token never left the scope. Tokens the
    // body did take are covered by the token's own drop.
    for slot in &mut consumed {
        if let Some(handle) = slot.reply.take() {
            let reason = match &failure {
                Some(message) => format!(
                    "reaction `{}` failed before replying: {message}",
                    reaction.label
                ),
                None => format!("reaction `{}` completed without replying", reaction.label),
            };
            let _ = handle.fail(reason);
        }
    }

    // Restore consumed statics the body did not refresh, keeping exactly
    // one value of each static kind in play.
    if let Some(ctx) = ctx {
        for (molecule, refreshed) in ctx.entries {
            if refreshed {
                continue;
            }
            let Some(slot) = consumed
                .iter_mut()
                .find(|slot| slot.molecule == molecule && slot.value.is_some())
            else {
                error!(
                    "site `{}`: static `{}` lost its restore value",
                    site.name,
                    site.display_name(molecule)
                );
                debug_assert!(false, "static restore value missing");
                continue;
            };
            if failure.is_none() {
                site.pool.report(
                    format!("site `{}` reaction `{}`", site.name, reaction.label),
                    format!(
                        "static molecule `{}` consumed but not re-emitted; restoring previous value",
                        slot.name
                    ),
                );
            }
            if let Some(value) = slot.value.take() {
                restore(site, molecule, value);
            }
        }
    }
}

/// Re-inserts a value (static restoration), firing anything it enables.
fn restore(site: &Arc<SiteInner>, molecule: MoleculeId, value: Box<dyn Any + Send>) {
    let fired = {
        let mut bag = site.bag.lock();
        bag.insert(molecule, Pending::plain(value));
        site.scan_locked(&mut bag)
    };
    dispatch(site, fired);
}

/// Last-resort cleanup when the pool drops an instance without running it:
/// fail blocking callers and put static values back (without rescanning —
/// the site has no executor left).
fn abandon_instance(site: &Arc<SiteInner>, instance: FiredInstance) {
    let label = Arc::clone(&site.reactions[instance.reaction_idx].label);
    let mut bag = site.bag.lock();
    for mut slot in instance.consumed {
        if let Some(handle) = slot.reply.take() {
            let _ = handle.fail(format!(
                "pool `{}` closed before reaction `{label}` could run",
                site.pool.name()
            ));
        }
        if slot.is_static {
            if let Some(value) = slot.value.take() {
                bag.insert(slot.molecule, Pending::plain(value));
            }
        }
    }
}

/// Seed value for a static molecule, prepared by the typed emitter.
pub struct StaticSeed {
    core: Arc<MoleculeCore>,
    value: Box<dyn Any + Send>,
    commit: Box<dyn FnOnce() + Send>,
}

impl StaticSeed {
    pub(crate) fn new(
        core: Arc<MoleculeCore>,
        value: Box<dyn Any + Send>,
        commit: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            core,
            value,
            commit,
        }
    }
}

/// Builder collecting reactions, static seeds and configuration for one
/// reaction site.
pub struct SiteBuilder {
    name: Arc<str>,
    pool: ThreadPool,
    reactions: Vec<Reaction>,
    seeds: Vec<StaticSeed>,
    hook: Arc<dyn TraceHook>,
}

impl SiteBuilder {
    /// Registers a reaction. Declaration order is the scan's tie-break
    /// order.
    pub fn reaction(mut self, reaction: Reaction) -> Self {
        self.reactions.push(reaction);
        self
    }

    /// Seeds a static molecule with its initial value, emitted at
    /// activation.
    pub fn with_static<T: Clone + Send + Sync + 'static>(
        mut self,
        molecule: &crate::molecule::StaticMolecule<T>,
        initial: T,
    ) -> Self {
        self.seeds.push(molecule.seed(initial));
        self
    }

    /// Replaces the default [`LogHook`] with a custom trace hook.
    pub fn trace(mut self, hook: impl TraceHook + 'static) -> Self {
        self.hook = Arc::new(hook);
        self
    }

    /// Binds every referenced molecule, seeds statics and runs the first
    /// scan. Configuration errors are fatal and reported here.
    pub fn activate(self) -> ConfigResult<ReactionSite> {
        let site_name = self.name;
        if self.reactions.is_empty() {
            return Err(ConfigError::NoReactions {
                site: site_name.to_string(),
            });
        }

        let mut names = HashMap::new();
        let mut cores: HashMap<MoleculeId, Arc<MoleculeCore>> = HashMap::new();
        let mut compiled = Vec::with_capacity(self.reactions.len());
        let mut static_inputs: HashSet<MoleculeId> = HashSet::new();

        for reaction in self.reactions {
            if reaction.inputs.is_empty() {
                return Err(ConfigError::EmptyPattern {
                    reaction: reaction.label.to_string(),
                    site: site_name.to_string(),
                });
            }
            let mut inputs = SmallVec::with_capacity(reaction.inputs.len());
            for decl in reaction.inputs {
                names.insert(decl.core.id, Arc::clone(&decl.core.name));
                if decl.core.is_static {
                    static_inputs.insert(decl.core.id);
                }
                inputs.push(CompiledInput {
                    molecule: decl.core.id,
                    name: Arc::clone(&decl.core.name),
                    is_static: decl.core.is_static,
                    filter: decl.filter,
                });
                cores.entry(decl.core.id).or_insert(decl.core);
            }
            compiled.push(CompiledReaction {
                label: reaction.label,
                inputs,
                guard: reaction.guard,
                body: reaction.body,
            });
        }

        let mut seeded: HashSet<MoleculeId> = HashSet::new();
        for seed in &self.seeds {
            if !seeded.insert(seed.core.id) {
                return Err(ConfigError::DuplicateStatic {
                    molecule: seed.core.name.to_string(),
                    site: site_name.to_string(),
                });
            }
            names.insert(seed.core.id, Arc::clone(&seed.core.name));
            cores.entry(seed.core.id).or_insert_with(|| Arc::clone(&seed.core));
        }
        for id in &static_inputs {
            if !seeded.contains(id) {
                return Err(ConfigError::StaticNotSeeded {
                    molecule: names
                        .get(id)
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| id.to_string()),
                    site: site_name.to_string(),
                });
            }
        }

        let inner = Arc::new(SiteInner {
            name: Arc::clone(&site_name),
            pool: self.pool,
            reactions: compiled,
            bag: Mutex::new(Bag::default()),
            rr_cursor: AtomicUsize::new(0),
            hook: self.hook,
            metrics: Arc::new(SiteMetrics::default()),
            names,
        });

        for core in cores.values() {
            core.bind(&inner).map_err(|bound_to| ConfigError::AlreadyBound {
                molecule: core.name.to_string(),
                bound_to: bound_to.to_string(),
                site: site_name.to_string(),
            })?;
        }

        let fired = {
            let mut bag = inner.bag.lock();
            for seed in self.seeds {
                bag.insert(
                    seed.core.id,
                    Pending {
                        emission: EmissionId::next(),
                        value: seed.value,
                        reply: None,
                    },
                );
                (seed.commit)();
            }
            inner.scan_locked(&mut bag)
        };
        dispatch(&inner, fired);

        Ok(ReactionSite { inner })
    }
}

/// Handle to an activated reaction site.
///
/// The site stays alive while this handle or any bound emitter exists;
/// dropping the handle alone does not tear the site down.
pub struct ReactionSite {
    inner: Arc<SiteInner>,
}

impl ReactionSite {
    /// Starts building a site running its reactions on `pool`.
    pub fn builder(name: &str, pool: &ThreadPool) -> SiteBuilder {
        SiteBuilder {
            name: Arc::from(name),
            pool: pool.clone(),
            reactions: Vec::new(),
            seeds: Vec::new(),
            hook: Arc::new(LogHook),
        }
    }

    /// Site name given at construction.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Snapshot of the site's counters.
    pub fn metrics(&self) -> SiteMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Per-molecule pending depths, sorted by molecule name. Diagnostic
    /// only; the answer can be stale as soon as the lock is released.
    pub fn pending(&self) -> Vec<(String, usize)> {
        let bag = self.inner.bag.lock();
        let mut depths: Vec<(String, usize)> = bag
            .depths()
            .map(|(id, depth)| (self.inner.display_name(id), depth))
            .collect();
        drop(bag);
        depths.sort();
        depths
    }
}

impl fmt::Debug for ReactionSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total: usize = self.inner.bag.lock().total();
        f.debug_struct("ReactionSite")
            .field("name", &self.inner.name)
            .field("reactions", &self.inner.reactions.len())
            .field("pending", &total)
            .finish()
    }
}
