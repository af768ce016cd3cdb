use thiserror::Error;

/// Result alias for site activation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Fatal setup-time errors, surfaced synchronously at activation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A molecule referenced by this site is already an input of another site.
    #[error("molecule `{molecule}` is already bound to site `{bound_to}` and cannot join site `{site}`")]
    AlreadyBound {
        /// Molecule name.
        molecule: String,
        /// Site that owns the molecule.
        bound_to: String,
        /// Site that attempted the second binding.
        site: String,
    },

    /// A reaction was declared with no input molecules.
    #[error("reaction `{reaction}` on site `{site}` has an empty input pattern")]
    EmptyPattern {
        /// Reaction label.
        reaction: String,
        /// Site being activated.
        site: String,
    },

    /// A site was activated with no reactions at all.
    #[error("site `{site}` was activated with no reactions")]
    NoReactions {
        /// Site being activated.
        site: String,
    },

    /// The same static molecule was seeded twice.
    #[error("static molecule `{molecule}` seeded twice on site `{site}`")]
    DuplicateStatic {
        /// Molecule name.
        molecule: String,
        /// Site being activated.
        site: String,
    },

    /// A reaction consumes a static molecule that was never seeded, so the
    /// reaction could never fire.
    #[error("static molecule `{molecule}` is consumed on site `{site}` but has no seed value")]
    StaticNotSeeded {
        /// Molecule name.
        molecule: String,
        /// Site being activated.
        site: String,
    },
}

/// Errors surfaced synchronously at an emission call.
#[derive(Debug, Error)]
pub enum EmitError {
    /// The molecule has not been bound to a site yet.
    #[error("molecule `{molecule}` is not bound to any reaction site")]
    Unbound {
        /// Molecule name.
        molecule: String,
    },

    /// A static molecule was emitted outside any reaction body.
    #[error("static molecule `{molecule}` can only be emitted from a reaction that consumed it")]
    StaticOutsideReaction {
        /// Molecule name.
        molecule: String,
    },

    /// A static molecule was emitted from a reaction that did not consume it.
    #[error("static molecule `{molecule}` was not consumed by the running reaction")]
    StaticNotConsumed {
        /// Molecule name.
        molecule: String,
    },

    /// A static molecule was re-emitted more than once by one reaction instance.
    #[error("static molecule `{molecule}` was already refreshed by this reaction instance")]
    StaticAlreadyRefreshed {
        /// Molecule name.
        molecule: String,
    },

    /// The site's thread pool has shut down; the instance cannot be scheduled.
    #[error("thread pool `{pool}` backing site `{site}` is closed")]
    PoolClosed {
        /// Pool name.
        pool: String,
        /// Site name.
        site: String,
    },
}

/// Errors surfaced by a blocking emission.
#[derive(Debug, Error)]
pub enum CallError {
    /// The emission itself failed before any wait began.
    #[error(transparent)]
    Emit(#[from] EmitError),

    /// No reply arrived within the caller's deadline. The pending value was
    /// withdrawn from the bag; a later reply is not delivered.
    #[error("blocking call on `{molecule}` timed out")]
    Timeout {
        /// Molecule name.
        molecule: String,
    },

    /// The consuming reaction failed (or dropped the reply token) before
    /// replying.
    #[error("blocking call on `{molecule}` failed: {reason}")]
    Failed {
        /// Molecule name.
        molecule: String,
        /// Failure description from the reaction side.
        reason: String,
    },
}

/// Programming errors inside a reaction body's use of its scope.
#[derive(Debug, Error)]
pub enum ScopeError {
    /// The body asked for a molecule the pattern did not consume (or asked
    /// more times than the pattern provides).
    #[error("reaction `{reaction}` did not consume (or already took) molecule `{molecule}`")]
    InputMismatch {
        /// Reaction label.
        reaction: String,
        /// Requested molecule name.
        molecule: String,
    },

    /// A consumed value failed to downcast to the emitter's declared type.
    /// Molecule identities are process-unique, so this indicates runtime
    /// corruption rather than user error.
    #[error("value of molecule `{molecule}` has an unexpected type")]
    ValueType {
        /// Molecule name.
        molecule: String,
    },
}
