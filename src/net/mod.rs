//! Connection table and packet buffers.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `conn` | Connection slots and the socket API on [`Engine`](crate::Engine) |
//! | `pbuf` | Reference-counted chained payload buffers |

// ============================================================================
// Submodules
// ============================================================================

mod conn;
mod pbuf;

// ============================================================================
// Re-exports
// ============================================================================

pub use conn::ConnType;
pub use pbuf::Pbuf;

pub(crate) use conn::Connection;
