//! Opt-in tracing of runtime events.
//!
//! Instead of inspecting bound values at runtime, the site invokes a
//! [`TraceHook`] at well-defined points: emission, scheduling, consumption,
//! reply, timeout, and body failure. The default [`LogHook`] forwards to the
//! `log` crate; [`NopHook`] silences tracing entirely.

use log::{debug, trace};

use crate::reply::ReplyOutcome;

/// Observer for reaction-site events. All methods default to no-ops so hooks
/// implement only the points they care about.
///
/// Hooks run inline on the emitting or worker thread and must not emit
/// molecules or block.
pub trait TraceHook: Send + Sync {
    /// A value was inserted into the bag.
    fn on_emit(&self, site: &str, molecule: &str, blocking: bool) {
        let _ = (site, molecule, blocking);
    }

    /// A reaction instance was selected and handed to the pool.
    fn on_schedule(&self, site: &str, reaction: &str) {
        let _ = (site, reaction);
    }

    /// A pending value was removed from the bag for a selected instance.
    fn on_consume(&self, site: &str, molecule: &str) {
        let _ = (site, molecule);
    }

    /// A reply to a blocking emission was sent (or found its caller gone).
    fn on_reply(&self, site: &str, molecule: &str, outcome: ReplyOutcome) {
        let _ = (site, molecule, outcome);
    }

    /// A blocking caller withdrew its value after its deadline.
    fn on_timeout(&self, site: &str, molecule: &str) {
        let _ = (site, molecule);
    }

    /// A reaction body returned an error or panicked.
    fn on_body_failure(&self, site: &str, reaction: &str, message: &str) {
        let _ = (site, reaction, message);
    }
}

/// Default hook: forwards events to `log::debug!`/`log::trace!`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogHook;

impl TraceHook for LogHook {
    fn on_emit(&self, site: &str, molecule: &str, blocking: bool) {
        trace!("site `{site}`: emit `{molecule}` (blocking={blocking})");
    }

    fn on_schedule(&self, site: &str, reaction: &str) {
        debug!("site `{site}`: scheduling reaction `{reaction}`");
    }

    fn on_consume(&self, site: &str, molecule: &str) {
        trace!("site `{site}`: consumed `{molecule}`");
    }

    fn on_reply(&self, site: &str, molecule: &str, outcome: ReplyOutcome) {
        debug!("site `{site}`: reply on `{molecule}` ({outcome:?})");
    }

    fn on_timeout(&self, site: &str, molecule: &str) {
        debug!("site `{site}`: blocking call on `{molecule}` timed out");
    }

    fn on_body_failure(&self, site: &str, reaction: &str, message: &str) {
        debug!("site `{site}`: reaction `{reaction}` failed: {message}");
    }
}

/// Hook that discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NopHook;

impl TraceHook for NopHook {}
