//! Link to the modem.
//!
//! The engine never opens a serial port itself. The application supplies
//! a [`Transport`] that writes bytes to the modem and feeds everything it
//! reads back through [`Engine::feed`](crate::Engine::feed).
//!
//! ```text
//! ┌──────────────┐   Transport::send    ┌─────────┐
//! │    Engine    │─────────────────────►│  Modem  │
//! │              │◄─────────────────────│ (UART)  │
//! └──────────────┘     Engine::feed     └─────────┘
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::io;

// ============================================================================
// Transport
// ============================================================================

/// Outbound half of the modem link.
///
/// Called only from engine context with the core lock held, one wire
/// command at a time.
pub trait Transport: Send + Sync {
    /// Writes `data` and returns how many bytes were accepted.
    ///
    /// An empty slice asks the transport to flush whatever it buffered.
    ///
    /// # Errors
    ///
    /// Any IO error aborts the command in flight.
    fn send(&self, data: &[u8]) -> io::Result<usize>;

    /// Drives the hardware reset line.
    ///
    /// Returns `false` if the transport has no reset line, in which case
    /// the engine falls back to a software reset.
    fn hw_reset(&self, asserted: bool) -> bool {
        let _ = asserted;
        false
    }
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn send(&self, data: &[u8]) -> io::Result<usize> {
        (**self).send(data)
    }

    fn hw_reset(&self, asserted: bool) -> bool {
        (**self).hw_reset(asserted)
    }
}
