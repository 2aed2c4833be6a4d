//! Shared engine state guarded by the core lock.

// ============================================================================
// Imports
// ============================================================================

use std::io;

use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::identifiers::ConnHandle;
use crate::net::Connection;
use crate::pipeline::Message;
use crate::protocol::{Dispatch, Event, ParserState};
use crate::transport::Transport;

use super::options::EngineOptions;
use super::status::{DeviceInfo, NetworkInfo, SimState};
use super::timeout::Timeouts;

// ============================================================================
// Pending
// ============================================================================

/// Work left for the engine once the events raised so far are dispatched.
#[derive(Debug, Default)]
pub(crate) enum Pending {
    #[default]
    None,
    /// Emit the wire command now selected on the in-flight message.
    Emit,
    /// Hand the in-flight message back to the producer.
    Release,
}

impl Pending {
    pub(crate) fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

// ============================================================================
// CoreState
// ============================================================================

pub(crate) struct CoreState {
    /// Message whose wire command is in flight.
    pub(crate) msg: Option<Box<Message>>,
    /// Producer side of the in-flight handshake; taken exactly once.
    pub(crate) sync: Option<oneshot::Sender<Box<Message>>>,
    pub(crate) pending: Pending,
    pub(crate) parser: ParserState,
    pub(crate) conns: Vec<Connection>,
    pub(crate) device: DeviceInfo,
    pub(crate) sim: SimState,
    pub(crate) network: NetworkInfo,
    pub(crate) call_ready: bool,
    pub(crate) sms_ready: bool,
    pub(crate) timeouts: Timeouts,
    pub(crate) events: Vec<Dispatch>,
    pub(crate) max_data_len: usize,
}

impl CoreState {
    pub(crate) fn new(options: &EngineOptions) -> Self {
        Self {
            msg: None,
            sync: None,
            pending: Pending::None,
            parser: ParserState::new(),
            conns: (0..options.max_conns).map(Connection::new).collect(),
            device: DeviceInfo::default(),
            sim: SimState::default(),
            network: NetworkInfo::default(),
            call_ready: false,
            sms_ready: false,
            timeouts: Timeouts::new(),
            events: Vec::new(),
            max_data_len: options.conn_max_data_len,
        }
    }

    /// Queues a global event.
    pub(crate) fn push(&mut self, event: Event) {
        self.events.push(Dispatch::global(event));
    }

    /// Queues a connection event for the connection's listener.
    ///
    /// Falls back to the global listeners when the handle no longer matches
    /// its slot. Receive and poll events of a closing connection are dropped.
    pub(crate) fn push_conn(&mut self, event: Event) {
        let Some(handle) = event.conn() else {
            self.push(event);
            return;
        };
        let listener = match self.conns.get(handle.num()) {
            Some(conn) if conn.matches(handle) => {
                if conn.closing && matches!(event, Event::ConnRecv { .. } | Event::ConnPoll { .. }) {
                    return;
                }
                conn.listener.clone()
            }
            _ => None,
        };
        self.events.push(Dispatch::conn(event, listener));
    }

    /// Looks up an active connection by handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the slot is inactive or was
    /// reused since the handle was produced.
    pub(crate) fn conn(&mut self, handle: ConnHandle) -> Result<&mut Connection> {
        match self.conns.get_mut(handle.num()) {
            Some(conn) if conn.matches(handle) => Ok(conn),
            _ => Err(Error::ConnectionClosed),
        }
    }

    /// Closes slot `num` if active and queues the close event.
    pub(crate) fn conn_closed(&mut self, num: usize, forced: bool) {
        let Some(conn) = self.conns.get_mut(num) else {
            return;
        };
        if !conn.active {
            return;
        }
        let handle = conn.handle();
        let client = conn.client;
        let listener = conn.listener.clone();
        if let Some(id) = conn.poll_timeout.take() {
            self.timeouts.remove(id);
        }
        conn.reset();
        info!(%handle, forced, "Connection closed");
        self.events.push(Dispatch::conn(
            Event::ConnClose {
                conn: handle,
                client,
                forced,
                ok: true,
            },
            listener,
        ));
    }

    /// Force-closes every active connection.
    pub(crate) fn close_all(&mut self, forced: bool) {
        for num in 0..self.conns.len() {
            self.conn_closed(num, forced);
        }
    }

    /// Marks the packet data context down, closing every connection.
    pub(crate) fn network_detached(&mut self, forced: bool) {
        self.close_all(forced);
        if self.network.attached || self.network.ip.is_some() {
            debug!("Network detached");
            self.network.attached = false;
            self.network.ip = None;
            self.push(Event::NetworkDetached);
        }
    }

    /// Drops every cached modem and connection state.
    pub(crate) fn reset_everything(&mut self, forced: bool) {
        self.close_all(forced);
        self.parser.reset();
        self.device = DeviceInfo::default();
        self.sim = SimState::default();
        let was_attached = self.network.attached;
        self.network = NetworkInfo::default();
        if was_attached {
            self.push(Event::NetworkDetached);
        }
        self.call_ready = false;
        self.sms_ready = false;
    }
}

// ============================================================================
// Ctx
// ============================================================================

/// Collaborators available while the state is borrowed.
pub(crate) struct Ctx<'a> {
    pub(crate) transport: &'a dyn Transport,
    pub(crate) options: &'a EngineOptions,
}

impl Ctx<'_> {
    pub(crate) fn send_str(&self, line: &str) -> Result<()> {
        self.send_raw(line.as_bytes())
    }

    /// Writes all of `data`, then flushes with an empty write.
    pub(crate) fn send_raw(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            match self.transport.send(data)? {
                0 => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "transport accepted no bytes",
                    )));
                }
                n => data = &data[n.min(data.len())..],
            }
        }
        self.transport.send(&[])?;
        Ok(())
    }
}
