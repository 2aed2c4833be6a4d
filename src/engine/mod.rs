//! Engine handle, configuration and shared state.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `core` | [`Engine`] handle, event dispatch and timeouts |
//! | `builder` | [`EngineBuilder`] for starting an engine |
//! | `options` | [`EngineOptions`] configuration |
//! | `device` | Reset, restore and device presence API |
//! | `network` | Packet data attach/detach API |
//! | `status` | Cached modem status types |
//! | `state` | Shared state behind the core lock (internal) |
//! | `lock` | Re-entrant core lock (internal) |
//! | `timeout` | Scheduled callbacks (internal) |

// ============================================================================
// Submodules
// ============================================================================

mod builder;
mod core;
mod device;
mod network;
mod status;

pub(crate) mod lock;
pub(crate) mod options;
pub(crate) mod state;
pub(crate) mod timeout;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::EngineBuilder;
pub use core::Engine;
pub use options::{EngineOptions, InputMode, MAX_CONNS_LIMIT};
pub use status::{CallInfo, DeviceInfo, NetworkInfo, OperatorInfo, RegStatus, SimState};
pub use timeout::TimeoutFn;

pub(crate) use core::{EngineInner, ProcessEvent};
