#![deny(missing_docs)]
//! A join-calculus concurrency runtime: declare concurrent data
//! ("molecules") and concurrent functions ("reactions"); reaction sites
//! detect when enough data is present to fire a reaction and execute it on
//! a worker pool.
//!
//! * [`Molecule`] — fire-and-forget data, emission returns immediately.
//! * [`BlockingMolecule`] — emission behaves as a synchronous call and
//!   parks the caller until a reaction replies (or a timeout expires).
//! * [`StaticMolecule`] — always has exactly one pending value, with a
//!   lock-free [`read`](StaticMolecule::read) of the last committed value.
//! * [`reaction`] declares a rule consuming a pattern of molecules;
//!   [`ReactionSite::builder`] binds molecules and reactions to a site
//!   backed by an explicit [`ThreadPool`].
//!
//! Within one site, value removal for concurrently firing instances is
//! mutually exclusive: no two instances ever consume the same pending
//! value. When several reactions are satisfiable at once the scan rotates
//! its starting reaction between rounds and commits one instance per
//! reaction per round; within a molecule kind candidates are tried
//! oldest-first (guards may skip past older values). No stronger ordering
//! is guaranteed.
//!
//! ```
//! use retort::{reaction, BlockingMolecule, PoolConfig, ReactionSite, StaticMolecule, ThreadPool};
//!
//! let pool = ThreadPool::new(PoolConfig::new("demo").threads(2));
//! let count = StaticMolecule::<u64>::new("count");
//! let increment = BlockingMolecule::<(), u64>::new("increment");
//!
//! let state = count.clone();
//! let requests = increment.clone();
//! let site = ReactionSite::builder("counter", &pool)
//!     .with_static(&count, 0)
//!     .reaction(
//!         reaction("increment")
//!             .consume_blocking(&increment)
//!             .consume_static(&count)
//!             .body(move |scope| {
//!                 let (_, reply) = scope.take_blocking(&requests)?;
//!                 let current = scope.take_static(&state)?;
//!                 state.emit(current + 1)?;
//!                 reply.send(current + 1);
//!                 Ok(())
//!             }),
//!     )
//!     .activate()
//!     .expect("valid configuration");
//!
//! assert_eq!(increment.call(()).unwrap(), 1);
//! assert_eq!(increment.call(()).unwrap(), 2);
//! assert_eq!(count.read().unwrap(), 2);
//! assert_eq!(site.metrics().fired, 2);
//! pool.shutdown();
//! ```

mod bag;
mod error;
mod metrics;
mod molecule;
mod reaction;
mod reply;
mod select;
mod site;
mod trace;

pub use error::{CallError, ConfigError, ConfigResult, EmitError, ScopeError};
pub use metrics::SiteMetricsSnapshot;
pub use molecule::{BlockingMolecule, Molecule, MoleculeId, StaticMolecule};
pub use reaction::{reaction, BoundValues, Reaction, ReactionBuilder, ReactionScope};
pub use reply::{Reply, ReplyOutcome};
pub use site::{ReactionSite, SiteBuilder, StaticSeed};
pub use trace::{LogHook, NopHook, TraceHook};

// The executor crate is part of the public surface: sites are constructed
// over an explicit pool handle.
pub use retort_pool::{PoolConfig, PoolError, ThreadPool};
