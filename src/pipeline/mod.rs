//! Message pipeline.
//!
//! Every API call becomes a [`Message`] that travels through two tokio
//! tasks:
//!
//! ```text
//! caller ──submit──► producer mailbox ──► Producer task ──wire cmd──► Transport
//!                                              ▲
//!                                              │ oneshot (release)
//!                                              │
//! Engine::feed ──► process mailbox ──► Process task ──► parser ──► sub-command machine
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `message` | [`Message`] and per-operation parameters |
//! | `queue` | Submission to the producer mailbox |
//! | `producer` | Producer task (internal) |
//! | `process` | Process task (internal) |

// ============================================================================
// Submodules
// ============================================================================

mod message;
mod queue;

pub(crate) mod process;
pub(crate) mod producer;

// ============================================================================
// Re-exports
// ============================================================================

pub use message::{CompletionFn, ConnSend, ConnStart, ConnectResult, Message, Operation};
