//! Typed molecule emitters and their bind-once identity core.
//!
//! An emitter is a cheap clonable handle naming one molecule kind. Matching
//! is driven purely by [`MoleculeId`] identity, never by value type: two
//! molecules declared with identical types are still distinct kinds. Binding
//! to a reaction site happens once, at site activation, and is permanent;
//! every bound emitter keeps its site alive.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use arc_swap::ArcSwapOption;

use crate::error::{CallError, EmitError};
use crate::reply::{AbandonVerdict, ReplySlot, WaitVerdict};
use crate::site::{self, SiteInner, StaticSeed};

/// Process-unique identity of a molecule kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MoleculeId(u64);

impl MoleculeId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        MoleculeId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for MoleculeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Process-unique identity of a single emission, used for timeout withdrawal
/// and for asserting that no value is ever consumed twice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct EmissionId(u64);

impl EmissionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        EmissionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Type-erased shared state behind every emitter handle.
pub(crate) struct MoleculeCore {
    pub(crate) id: MoleculeId,
    pub(crate) name: Arc<str>,
    pub(crate) blocking: bool,
    pub(crate) is_static: bool,
    site: OnceLock<Arc<SiteInner>>,
}

impl MoleculeCore {
    fn new(name: &str, blocking: bool, is_static: bool) -> Arc<Self> {
        Arc::new(Self {
            id: MoleculeId::next(),
            name: Arc::from(name),
            blocking,
            is_static,
            site: OnceLock::new(),
        })
    }

    /// Binds this molecule to `site`, or reports the name of the site that
    /// already owns it. Binding twice to the same site is a no-op so one
    /// molecule may appear in several reactions of one site.
    pub(crate) fn bind(&self, site: &Arc<SiteInner>) -> Result<(), Arc<str>> {
        let current = self.site.get_or_init(|| Arc::clone(site));
        if Arc::ptr_eq(current, site) {
            Ok(())
        } else {
            Err(current.site_name())
        }
    }

    pub(crate) fn bound(&self) -> Result<&Arc<SiteInner>, EmitError> {
        self.site.get().ok_or_else(|| EmitError::Unbound {
            molecule: self.name.to_string(),
        })
    }
}

/// Emitter for a non-blocking molecule carrying values of type `T`.
///
/// `emit` inserts the value into the bound site's bag, runs the matching
/// scan, and returns immediately.
pub struct Molecule<T> {
    core: Arc<MoleculeCore>,
    _marker: PhantomData<fn(T)>,
}

impl<T: Send + 'static> Molecule<T> {
    /// Declares a new non-blocking molecule. The name is used only for
    /// diagnostics; identity is the handle itself.
    pub fn new(name: &str) -> Self {
        Self {
            core: MoleculeCore::new(name, false, false),
            _marker: PhantomData,
        }
    }

    /// Diagnostic name given at declaration.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Emits a value into the bound site. Fails if the molecule has not been
    /// bound by a site activation yet.
    pub fn emit(&self, value: T) -> Result<(), EmitError> {
        let site = self.core.bound()?;
        site::emit(site, &self.core, Box::new(value), None, None)?;
        Ok(())
    }

    pub(crate) fn core(&self) -> &Arc<MoleculeCore> {
        &self.core
    }
}

impl<T> Clone for Molecule<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Molecule<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Molecule(`{}`, {})", self.core.name, self.core.id)
    }
}

/// Emitter for a blocking molecule: emission behaves as a synchronous call
/// that parks the calling thread until some reaction replies with an `R`.
pub struct BlockingMolecule<T, R> {
    core: Arc<MoleculeCore>,
    _marker: PhantomData<fn(T) -> R>,
}

impl<T: Send + 'static, R: Send + 'static> BlockingMolecule<T, R> {
    /// Declares a new blocking molecule.
    pub fn new(name: &str) -> Self {
        Self {
            core: MoleculeCore::new(name, true, false),
            _marker: PhantomData,
        }
    }

    /// Diagnostic name given at declaration.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Emits `value` and parks until a reaction replies.
    pub fn call(&self, value: T) -> Result<R, CallError> {
        self.call_inner(value, None)
    }

    /// Emits `value` and parks for at most `timeout`.
    ///
    /// On expiry the pending value is withdrawn from the bag atomically with
    /// respect to the matching scan, so no reaction can consume a request
    /// whose caller has given up; a reply that raced ahead of the deadline
    /// still wins and is returned.
    pub fn call_timeout(&self, value: T, timeout: Duration) -> Result<R, CallError> {
        self.call_inner(value, Some(timeout))
    }

    fn call_inner(&self, value: T, timeout: Option<Duration>) -> Result<R, CallError> {
        let site = self.core.bound()?;
        let slot = Arc::new(ReplySlot::<R>::new());
        let handle = Arc::clone(&slot) as Arc<dyn crate::reply::ReplyHandle>;
        let emission = site::emit(site, &self.core, Box::new(value), Some(handle), None)?;

        // A pool worker parked here borrows replacement capacity so the
        // reaction that must reply can still be executed.
        let _blocking = retort_pool::blocking_section_if_worker();

        match slot.wait(timeout) {
            WaitVerdict::Replied(reply) => Ok(reply),
            WaitVerdict::Failed(reason) => Err(CallError::Failed {
                molecule: self.core.name.to_string(),
                reason,
            }),
            WaitVerdict::DeadlineExpired => {
                site.withdraw(self.core.id, emission);
                match slot.abandon() {
                    AbandonVerdict::Replied(reply) => Ok(reply),
                    AbandonVerdict::Failed(reason) => Err(CallError::Failed {
                        molecule: self.core.name.to_string(),
                        reason,
                    }),
                    AbandonVerdict::Abandoned => {
                        site.note_timeout(&self.core.name);
                        Err(CallError::Timeout {
                            molecule: self.core.name.to_string(),
                        })
                    }
                }
            }
        }
    }

    pub(crate) fn core(&self) -> &Arc<MoleculeCore> {
        &self.core
    }
}

impl<T, R> Clone for BlockingMolecule<T, R> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            _marker: PhantomData,
        }
    }
}

impl<T, R> fmt::Debug for BlockingMolecule<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockingMolecule(`{}`, {})", self.core.name, self.core.id)
    }
}

/// Emitter for a static molecule: a kind that always has exactly one pending
/// value for the lifetime of its site.
///
/// The initial value is seeded at activation via
/// [`SiteBuilder::with_static`](crate::SiteBuilder::with_static); afterwards
/// only a reaction that consumed the molecule may emit it again, and must do
/// so before its body returns. [`read`](Self::read) observes the most
/// recently committed value without consuming it or taking the site lock.
pub struct StaticMolecule<T> {
    core: Arc<MoleculeCore>,
    cache: Arc<ArcSwapOption<T>>,
}

impl<T: Clone + Send + Sync + 'static> StaticMolecule<T> {
    /// Declares a new static molecule.
    pub fn new(name: &str) -> Self {
        Self {
            core: MoleculeCore::new(name, false, true),
            cache: Arc::new(ArcSwapOption::empty()),
        }
    }

    /// Diagnostic name given at declaration.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Re-emits the refreshed value. Legal only from the body of a reaction
    /// instance that consumed this molecule, exactly once per instance.
    pub fn emit(&self, value: T) -> Result<(), EmitError> {
        let site = self.core.bound()?;
        let committed = Arc::new(value.clone());
        let cache = &self.cache;
        let commit: &dyn Fn() = &|| cache.store(Some(Arc::clone(&committed)));
        site::emit(site, &self.core, Box::new(value), None, Some(commit))?;
        Ok(())
    }

    /// Volatile read of the last committed value.
    ///
    /// Never blocks and never participates in matching; the result may be
    /// stale by the time it is acted on. Fails only before the owning site
    /// has been activated.
    pub fn read(&self) -> Result<T, EmitError> {
        match self.cache.load_full() {
            Some(value) => Ok((*value).clone()),
            None => Err(EmitError::Unbound {
                molecule: self.core.name.to_string(),
            }),
        }
    }

    pub(crate) fn core(&self) -> &Arc<MoleculeCore> {
        &self.core
    }

    pub(crate) fn seed(&self, initial: T) -> StaticSeed {
        let committed = Arc::new(initial.clone());
        let cache = Arc::clone(&self.cache);
        StaticSeed::new(
            Arc::clone(&self.core),
            Box::new(initial) as Box<dyn Any + Send>,
            Box::new(move || cache.store(Some(committed))),
        )
    }
}

impl<T> Clone for StaticMolecule<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            cache: Arc::clone(&self.cache),
        }
    }
}

impl<T> fmt::Debug for StaticMolecule<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StaticMolecule(`{}`, {})", self.core.name, self.core.id)
    }
}
