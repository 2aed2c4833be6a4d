//! Engine event types.
//!
//! Every notification the engine delivers to listeners is an owned
//! [`Event`] value. Connection events go to the connection's own listener
//! when one is installed and to the global listeners otherwise.
//!
//! # Event Kinds
//!
//! | Group | Events |
//! |-------|--------|
//! | Engine | `InitFinish`, `Reset`, `Restore`, `CmdTimeout`, `DevicePresent`, `DeviceIdentified` |
//! | Modem status | `SignalStrength`, `SimStateChanged`, `NetworkRegChanged`, `CallReady`, `SmsReady`, `CallChanged` |
//! | Network | `NetworkAttached`, `NetworkDetached`, `OperatorScan` |
//! | Connection | `ConnActive`, `ConnRecv`, `ConnSend`, `ConnError`, `ConnClose`, `ConnPoll` |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::Engine;
use crate::engine::{CallInfo, DeviceInfo, OperatorInfo, RegStatus, SimState};
use crate::identifiers::ConnHandle;
use crate::net::{ConnType, Pbuf};

use super::command::Cmd;

// ============================================================================
// EventHandler
// ============================================================================

/// Listener callback.
///
/// Invoked with the core lock held. Non-blocking engine calls are allowed
/// from inside; blocking calls fail with
/// [`Error::BlockingNotAllowed`](crate::Error::BlockingNotAllowed).
pub type EventHandler = Arc<dyn Fn(&Engine, &Event) + Send + Sync>;

// ============================================================================
// Event
// ============================================================================

/// A notification from the engine.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Event {
    /// Engine tasks started.
    InitFinish,

    /// Reset sequence finished.
    Reset {
        /// `true` if the final step succeeded.
        ok: bool,
    },

    /// Factory restore finished.
    Restore {
        /// `true` if every step succeeded.
        ok: bool,
    },

    /// A wire command got no terminal reply in time.
    CmdTimeout {
        /// Command that timed out.
        cmd: Cmd,
    },

    /// Device presence changed.
    DevicePresent {
        /// New presence state.
        present: bool,
    },

    /// Identification strings are known.
    DeviceIdentified {
        /// Reported identification.
        info: DeviceInfo,
    },

    /// Signal strength reported.
    SignalStrength {
        /// Strength in dBm, 0 when unknown.
        rssi: i16,
    },

    /// SIM state changed.
    SimStateChanged {
        /// New SIM state.
        state: SimState,
    },

    /// Network registration changed.
    NetworkRegChanged {
        /// New registration status.
        status: RegStatus,
    },

    /// Packet data attach finished successfully.
    NetworkAttached {
        /// Local IP address.
        ip: Option<Ipv4Addr>,
    },

    /// Packet data context went down.
    NetworkDetached,

    /// Operator scan finished.
    OperatorScan {
        /// Operators found.
        operators: Vec<OperatorInfo>,
        /// `true` if the scan succeeded.
        ok: bool,
    },

    /// Connection became active.
    ConnActive {
        /// New connection.
        conn: ConnHandle,
        /// `true` if the connection was opened by this side.
        client: bool,
    },

    /// Data received on a connection.
    ///
    /// The engine drops its reference after dispatch; a listener that keeps
    /// the buffer must take its own with [`Pbuf::reference`].
    ConnRecv {
        /// Receiving connection.
        conn: ConnHandle,
        /// Received data.
        pbuf: Pbuf,
    },

    /// Send operation finished.
    ConnSend {
        /// Sending connection.
        conn: ConnHandle,
        /// Bytes confirmed by the modem.
        sent: usize,
        /// `true` if every byte was sent.
        ok: bool,
    },

    /// Connection could not be opened.
    ConnError {
        /// Remote host.
        host: String,
        /// Remote port.
        port: u16,
        /// Requested type.
        conn_type: ConnType,
    },

    /// Connection closed.
    ConnClose {
        /// Closed connection. Its handle is stale from now on.
        conn: ConnHandle,
        /// `true` if the connection was opened by this side.
        client: bool,
        /// `true` if closed locally, `false` if closed by the remote side.
        forced: bool,
        /// `false` if a close request failed and the connection stays open.
        ok: bool,
    },

    /// Periodic poll of an active connection.
    ConnPoll {
        /// Polled connection.
        conn: ConnHandle,
    },

    /// Modem reported `Call Ready`.
    CallReady,

    /// Modem reported `SMS Ready`.
    SmsReady,

    /// Call list entry changed.
    CallChanged {
        /// Call state.
        call: CallInfo,
    },
}

impl Event {
    /// Returns the event name for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::InitFinish => "init_finish",
            Self::Reset { .. } => "reset",
            Self::Restore { .. } => "restore",
            Self::CmdTimeout { .. } => "cmd_timeout",
            Self::DevicePresent { .. } => "device_present",
            Self::DeviceIdentified { .. } => "device_identified",
            Self::SignalStrength { .. } => "signal_strength",
            Self::SimStateChanged { .. } => "sim_state_changed",
            Self::NetworkRegChanged { .. } => "network_reg_changed",
            Self::NetworkAttached { .. } => "network_attached",
            Self::NetworkDetached => "network_detached",
            Self::OperatorScan { .. } => "operator_scan",
            Self::ConnActive { .. } => "conn_active",
            Self::ConnRecv { .. } => "conn_recv",
            Self::ConnSend { .. } => "conn_send",
            Self::ConnError { .. } => "conn_error",
            Self::ConnClose { .. } => "conn_close",
            Self::ConnPoll { .. } => "conn_poll",
            Self::CallReady => "call_ready",
            Self::SmsReady => "sms_ready",
            Self::CallChanged { .. } => "call_changed",
        }
    }

    /// Returns the connection this event concerns, if any.
    #[must_use]
    pub fn conn(&self) -> Option<ConnHandle> {
        match self {
            Self::ConnActive { conn, .. }
            | Self::ConnRecv { conn, .. }
            | Self::ConnSend { conn, .. }
            | Self::ConnClose { conn, .. }
            | Self::ConnPoll { conn } => Some(*conn),
            _ => None,
        }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// An event waiting to be delivered once the state borrow is released.
pub(crate) struct Dispatch {
    pub(crate) event: Event,
    /// Connection listener captured when the event was raised.
    pub(crate) listener: Option<EventHandler>,
}

impl Dispatch {
    pub(crate) fn global(event: Event) -> Self {
        Self {
            event,
            listener: None,
        }
    }

    pub(crate) fn conn(event: Event, listener: Option<EventHandler>) -> Self {
        Self { event, listener }
    }
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field("event", &self.event.name())
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
