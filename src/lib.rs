//! GSM Engine - Command execution engine for AT-command driven modems.
//!
//! This library turns asynchronous API calls into a strictly ordered
//! stream of AT commands and reconciles the modem's textual replies and
//! unsolicited notifications back into typed results and events.
//!
//! # Architecture
//!
//! The engine follows a producer/parser model:
//!
//! - **Producer task**: dequeues messages and emits one wire command at a time
//! - **Process task**: parses modem output and runs scheduled timeouts
//!
//! Key design principles:
//!
//! - Exactly one command is in flight; replies pair with requests 1:1 and FIFO
//! - Multi-step operations are driven by a sub-command state machine
//! - All shared state sits behind one re-entrant core lock
//! - Listeners run with the lock held and may call back into the engine
//!
//! # Quick Start
//!
//! ```ignore
//! use gsm_engine::{ConnType, Engine, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let engine = Engine::builder().transport(uart).build()?;
//!
//!     // Bytes read from the modem go back into the engine
//!     engine.feed(&received)?;
//!
//!     engine.network_attach("internet", "", "", true).await?;
//!     let conn = engine
//!         .conn_start(ConnType::Tcp, "example.com", 80, None, true)
//!         .await?
//!         .expect("blocking start returns a handle");
//!     engine.conn_send(conn, &b"GET / HTTP/1.0\r\n\r\n"[..], true).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`engine`] | [`Engine`] handle, builder, options and status |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Connection handles and registry ids |
//! | [`net`] | Connection types and packet buffers |
//! | [`pipeline`] | Messages and the worker tasks |
//! | [`protocol`] | AT commands, parser and events |
//! | [`transport`] | Link to the modem |

// ============================================================================
// Modules
// ============================================================================

/// Engine handle, configuration and status.
///
/// Use [`Engine::builder()`] to start an engine.
pub mod engine;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
///
/// Connection handles carry a validation id so stale handles are rejected.
pub mod identifiers;

/// Connection types and packet buffers.
pub mod net;

/// Messages and worker tasks.
pub mod pipeline;

/// AT command protocol.
///
/// Command formatting, reply parsing and event types.
pub mod protocol;

/// Link to the modem.
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// ============================================================================
// Re-exports
// ============================================================================

// Engine types
pub use engine::{
    CallInfo, DeviceInfo, Engine, EngineBuilder, EngineOptions, InputMode, NetworkInfo,
    OperatorInfo, RegStatus, SimState,
};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ConnHandle, ListenerId, TimeoutId};

// Network types
pub use net::{ConnType, Pbuf};

// Pipeline types
pub use pipeline::{Message, Operation};

// Protocol types
pub use protocol::{Cmd, Event, EventHandler};

// Transport types
pub use transport::Transport;
