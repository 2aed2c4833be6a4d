//! Scheduled callbacks run by the process task.
//!
//! Entries are kept in a hash map keyed by [`TimeoutId`]. The process task
//! sleeps until the earliest deadline, or until a new earlier entry wakes
//! it, then runs every expired entry with the core lock held.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::trace;

use crate::Engine;
use crate::identifiers::{ConnHandle, TimeoutId};

// ============================================================================
// Types
// ============================================================================

/// User timeout callback.
pub type TimeoutFn = Box<dyn FnOnce(&Engine) + Send>;

pub(crate) enum TimeoutAction {
    /// Periodic poll of a connection; reschedules itself.
    ConnPoll(ConnHandle),
    /// One-shot user callback.
    Callback(TimeoutFn),
}

impl fmt::Debug for TimeoutAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnPoll(handle) => f.debug_tuple("ConnPoll").field(handle).finish(),
            Self::Callback(_) => f.write_str("Callback"),
        }
    }
}

// ============================================================================
// Timeouts
// ============================================================================

#[derive(Debug, Default)]
pub(crate) struct Timeouts {
    entries: FxHashMap<TimeoutId, (Instant, TimeoutAction)>,
    /// Set when an insert moved the earliest deadline forward.
    earlier: bool,
}

impl Timeouts {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, delay: Duration, action: TimeoutAction) -> TimeoutId {
        let id = TimeoutId::generate();
        let at = Instant::now() + delay;
        if self.next_deadline().is_none_or(|next| at < next) {
            self.earlier = true;
        }
        trace!(%id, ?delay, ?action, "Timeout scheduled");
        self.entries.insert(id, (at, action));
        id
    }

    pub(crate) fn remove(&mut self, id: TimeoutId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|(at, _)| *at).min()
    }

    /// Removes and returns every entry due at `now`, earliest first.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<(TimeoutId, TimeoutAction)> {
        let mut due: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, (at, _))| *at <= now)
            .map(|(id, (at, _))| (*at, *id))
            .collect();
        due.sort_unstable();

        due.into_iter()
            .filter_map(|(_, id)| self.entries.remove(&id).map(|(_, action)| (id, action)))
            .collect()
    }

    /// Returns and clears the earlier-deadline flag.
    pub(crate) fn take_earlier(&mut self) -> bool {
        std::mem::take(&mut self.earlier)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
