//! Type-safe identifiers for engine entities.
//!
//! Newtype wrappers prevent mixing incompatible IDs at compile time.
//!
//! | Type | Identifies |
//! |------|------------|
//! | [`ConnHandle`] | One generation of a connection slot |
//! | [`ListenerId`] | A registered global event listener |
//! | [`TimeoutId`] | A scheduled callback on the process task |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// ConnHandle
// ============================================================================

/// Handle to one occupancy of a connection slot.
///
/// Captures the slot number together with the slot's validation id at the
/// time the handle was produced. Every operation compares the captured id
/// against the slot's current id, so a handle to a recycled slot is
/// rejected with [`Error::ConnectionClosed`](crate::Error::ConnectionClosed)
/// rather than acting on the new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle {
    num: usize,
    val_id: u16,
}

impl ConnHandle {
    #[inline]
    pub(crate) const fn new(num: usize, val_id: u16) -> Self {
        Self { num, val_id }
    }

    /// Returns the slot number (0..max_conns).
    #[inline]
    #[must_use]
    pub const fn num(&self) -> usize {
        self.num
    }

    /// Returns the validation id captured with this handle.
    #[inline]
    #[must_use]
    pub const fn val_id(&self) -> u16 {
        self.val_id
    }
}

impl fmt::Display for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}/{}", self.num, self.val_id)
    }
}

// ============================================================================
// Sequential IDs
// ============================================================================

macro_rules! sequential_id {
    ($(#[$meta:meta])* $name:ident, $counter:ident, $prefix:literal) => {
        static $counter: AtomicU64 = AtomicU64::new(1);

        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Generates the next unique id.
            #[inline]
            #[must_use]
            pub(crate) fn generate() -> Self {
                Self($counter.fetch_add(1, Ordering::Relaxed))
            }

            /// Returns the raw value.
            #[inline]
            #[must_use]
            pub const fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

sequential_id!(
    /// Identifies a registered global event listener.
    ListenerId,
    NEXT_LISTENER_ID,
    "listener"
);

sequential_id!(
    /// Identifies a scheduled timeout.
    TimeoutId,
    NEXT_TIMEOUT_ID,
    "timeout"
);

// ============================================================================
// Tests
// ============================================================================
