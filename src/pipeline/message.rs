//! The engine's unit of work.
//!
//! A [`Message`] represents one logical API call. It names the requested
//! [`Operation`] (the default command plus its parameters), tracks the wire
//! command currently in flight, and carries the completion plumbing used to
//! hand the outcome back to the caller.
//!
//! # Lifecycle
//!
//! 1. Built by an API function and handed to [`Engine::submit`](crate::Engine::submit)
//! 2. Queued on the producer mailbox
//! 3. Mutated in place while the sub-command machine steps through wire commands
//! 4. Returned to a blocking caller, or dropped after its callback for a
//!    non-blocking one

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::engine::{EngineOptions, OperatorInfo};
use crate::engine::state::{CoreState, Ctx};
use crate::error::Result;
use crate::identifiers::ConnHandle;
use crate::net::ConnType;
use crate::protocol::{Cmd, EventHandler, initiate_cmd};

// ============================================================================
// Types
// ============================================================================

/// Emits the wire command for `msg.cmd`.
///
/// Called once when the producer starts a message and again for every
/// step the sub-command machine continues into.
pub(crate) type InitiateFn = fn(&mut Message, &mut CoreState, &Ctx<'_>) -> Result<()>;

/// User completion callback, invoked once with the final result.
pub type CompletionFn = Box<dyn FnOnce(&Result<()>) + Send>;

// ============================================================================
// Operation
// ============================================================================

/// Logical operation requested by a message, with its parameters.
///
/// The sub-command machine matches on the active variant to decide which
/// wire command follows the current one.
#[derive(Debug)]
pub enum Operation {
    /// Restart the modem and run the identification sequence.
    Reset {
        /// Delay applied by the producer before touching the modem.
        delay: Duration,
        /// Set by the producer when the transport toggled a reset line.
        hw_reset: bool,
    },

    /// Restore factory defaults.
    Restore,

    /// Set phone functionality (`AT+CFUN`).
    SetFunc {
        /// `true` for full functionality, `false` for minimum.
        full: bool,
    },

    /// Bring up the packet data context and obtain an IP address.
    NetworkAttach {
        /// Access point name.
        apn: String,
        /// APN user name.
        user: String,
        /// APN password.
        pass: String,
    },

    /// Tear down the packet data context.
    NetworkDetach,

    /// Scan for available operators.
    OperatorScan {
        /// Operators reported by the modem.
        operators: Vec<OperatorInfo>,
    },

    /// Query signal quality.
    SignalQuality {
        /// Received signal strength in dBm, when known.
        rssi: Option<i16>,
    },

    /// Open a connection.
    ConnStart(ConnStart),

    /// Close a connection.
    ConnClose {
        /// Connection to close.
        conn: ConnHandle,
    },

    /// Send data on a connection.
    ConnSend(ConnSend),

    /// Refresh the connection table from the modem.
    ConnStatus,
}

/// Parameters and progress of a connection start.
pub struct ConnStart {
    /// Connection type.
    pub conn_type: ConnType,
    /// Remote host name or address.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Listener installed on the connection once active.
    pub listener: Option<EventHandler>,
    /// Slot reserved when the start command was emitted.
    pub num: Option<usize>,
    /// Connect result recorded by the parser.
    pub result: ConnectResult,
    /// Handle of the new connection, once active.
    pub handle: Option<ConnHandle>,
}

impl fmt::Debug for ConnStart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnStart")
            .field("conn_type", &self.conn_type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("num", &self.num)
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

/// Connect result reported by the modem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectResult {
    /// No result line seen yet.
    Pending,
    /// `n, CONNECT OK`.
    Connected,
    /// `n, CONNECT FAIL` or an error reply.
    Failed,
    /// `n, ALREADY CONNECT`.
    Already,
}

/// Parameters and progress of a send.
#[derive(Debug)]
pub struct ConnSend {
    /// Target connection.
    pub conn: ConnHandle,
    /// Payload to send.
    pub data: Bytes,
    /// Bytes confirmed by the modem so far.
    pub sent: usize,
    /// Size of the chunk currently in flight.
    pub chunk: usize,
    /// Remaining attempts for the current chunk.
    pub tries: u8,
    /// `true` while waiting for the `> ` prompt.
    pub wait_prompt: bool,
    /// Set by the parser when the modem answered `SEND FAIL`.
    pub send_failed: bool,
}

impl ConnSend {
    /// Creates send parameters for `data`.
    #[must_use]
    pub fn new(conn: ConnHandle, data: Bytes, tries: u8) -> Self {
        Self {
            conn,
            data,
            sent: 0,
            chunk: 0,
            tries,
            wait_prompt: false,
            send_failed: false,
        }
    }

    /// Returns the bytes still to be confirmed.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.sent
    }
}

impl Operation {
    /// Returns the first wire command of this operation.
    #[must_use]
    pub fn first_cmd(&self) -> Cmd {
        match self {
            Self::Reset { .. } => Cmd::Reset,
            Self::Restore => Cmd::Restore,
            Self::SetFunc { .. } => Cmd::CfunSet,
            Self::NetworkAttach { .. } => Cmd::CgactSet0,
            Self::NetworkDetach => Cmd::CgattSet0,
            Self::OperatorScan { .. } => Cmd::CopsScan,
            Self::SignalQuality { .. } => Cmd::Csq,
            Self::ConnStart(_) | Self::ConnStatus => Cmd::Cipstatus,
            Self::ConnClose { .. } => Cmd::Cipclose,
            Self::ConnSend(_) => Cmd::Cipsend,
        }
    }

    /// Returns a short name for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Reset { .. } => "reset",
            Self::Restore => "restore",
            Self::SetFunc { .. } => "set_func",
            Self::NetworkAttach { .. } => "network_attach",
            Self::NetworkDetach => "network_detach",
            Self::OperatorScan { .. } => "operator_scan",
            Self::SignalQuality { .. } => "signal_quality",
            Self::ConnStart(_) => "conn_start",
            Self::ConnClose { .. } => "conn_close",
            Self::ConnSend(_) => "conn_send",
            Self::ConnStatus => "conn_status",
        }
    }
}

// ============================================================================
// Message
// ============================================================================

/// One logical operation travelling through the engine.
pub struct Message {
    /// Requested operation and its parameters.
    pub(crate) op: Operation,
    /// Wire command currently in flight.
    pub(crate) cmd: Cmd,
    /// Number of wire commands completed so far.
    pub(crate) step: u8,
    /// Final result, written once the message completes.
    pub(crate) result: Result<()>,
    /// Failure recorded by the sub-command machine before completion.
    pub(crate) error: Option<crate::Error>,
    /// Upper bound on how long the producer waits for completion.
    pub(crate) block_time: Duration,
    /// `true` if a caller is waiting on `reply`.
    pub(crate) blocking: bool,
    /// Emits the wire command for `cmd`.
    pub(crate) initiate: InitiateFn,
    /// Optional user completion callback.
    pub(crate) on_done: Option<CompletionFn>,
    /// Completion channel of a blocking caller.
    pub(crate) reply: Option<oneshot::Sender<Box<Message>>>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("op", &self.op.name())
            .field("cmd", &self.cmd)
            .field("step", &self.step)
            .field("blocking", &self.blocking)
            .field("block_time", &self.block_time)
            .finish_non_exhaustive()
    }
}

impl Message {
    /// Creates a message for `op` with the given maximum block time.
    #[must_use]
    pub fn new(op: Operation, block_time: Duration) -> Self {
        Self {
            cmd: op.first_cmd(),
            op,
            step: 0,
            result: Ok(()),
            error: None,
            block_time,
            blocking: false,
            initiate: initiate_cmd,
            on_done: None,
            reply: None,
        }
    }

    /// Creates a message using the engine's default block time.
    #[must_use]
    pub fn with_defaults(op: Operation, options: &EngineOptions) -> Self {
        Self::new(op, options.default_block_time())
    }

    /// Sets a completion callback, invoked once with the final result.
    #[must_use]
    pub fn on_done(mut self, callback: impl FnOnce(&Result<()>) + Send + 'static) -> Self {
        self.on_done = Some(Box::new(callback));
        self
    }

    /// Returns the requested operation.
    #[inline]
    #[must_use]
    pub fn operation(&self) -> &Operation {
        &self.op
    }

    /// Returns the wire command currently (or last) in flight.
    #[inline]
    #[must_use]
    pub fn current_cmd(&self) -> Cmd {
        self.cmd
    }

    /// Returns the number of completed wire steps.
    #[inline]
    #[must_use]
    pub fn step(&self) -> u8 {
        self.step
    }

    /// Takes the final result out of the message.
    pub(crate) fn take_result(&mut self) -> Result<()> {
        std::mem::replace(&mut self.result, Ok(()))
    }

    /// Returns mutable connection start parameters, if this is a start.
    pub(crate) fn conn_start_mut(&mut self) -> Option<&mut ConnStart> {
        match &mut self.op {
            Operation::ConnStart(start) => Some(start),
            _ => None,
        }
    }

    /// Returns mutable send parameters, if this is a send.
    pub(crate) fn conn_send_mut(&mut self) -> Option<&mut ConnSend> {
        match &mut self.op {
            Operation::ConnSend(send) => Some(send),
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
