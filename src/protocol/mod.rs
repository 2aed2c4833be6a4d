//! AT command protocol.
//!
//! # Command Flow
//!
//! | Stage | Module |
//! |-------|--------|
//! | Format the wire command of a message | `command` |
//! | Split modem output into lines | `line` |
//! | Classify lines and receive payload | `parser` |
//! | Pick the next wire command | `subcmd` |
//! | Report what happened | `event` |

// ============================================================================
// Submodules
// ============================================================================

/// Wire command identifiers and formatting.
pub mod command;

/// Engine events and listener types.
pub mod event;

pub(crate) mod line;
pub(crate) mod parser;
pub(crate) mod subcmd;

// ============================================================================
// Re-exports
// ============================================================================

pub use command::Cmd;
pub use event::{Event, EventHandler};

pub(crate) use command::initiate_cmd;
pub(crate) use event::Dispatch;
pub(crate) use parser::ParserState;
