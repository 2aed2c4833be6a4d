//! Connection table and socket API.
//!
//! The modem exposes a fixed number of connection slots. Each slot carries
//! a validation id that advances whenever the slot is opened or closed, so
//! a [`ConnHandle`] captured before the slot was recycled no longer matches
//! and every operation on it fails with [`Error::ConnectionClosed`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Engine;
use crate::error::{Error, Result};
use crate::identifiers::{ConnHandle, TimeoutId};
use crate::pipeline::{ConnSend, ConnStart, ConnectResult, Message, Operation};
use crate::protocol::EventHandler;

// ============================================================================
// ConnType
// ============================================================================

/// Connection type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnType {
    /// TCP stream.
    #[default]
    Tcp,
    /// UDP datagrams.
    Udp,
    /// TCP with SSL enabled through `AT+CIPSSL`.
    Ssl,
}

impl ConnType {
    /// Protocol name used in `AT+CIPSTART`.
    #[inline]
    #[must_use]
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Tcp | Self::Ssl => "TCP",
            Self::Udp => "UDP",
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// One connection slot.
pub(crate) struct Connection {
    pub(crate) num: usize,
    pub(crate) val_id: u16,
    pub(crate) conn_type: ConnType,
    pub(crate) remote_host: String,
    pub(crate) remote_port: u16,
    pub(crate) active: bool,
    pub(crate) client: bool,
    /// Close requested; no further writes accepted.
    pub(crate) closing: bool,
    /// Bearer reported by `AT+CIPSTATUS`.
    pub(crate) bearer: Option<u8>,
    /// Pending bytes of [`Engine::conn_write`].
    pub(crate) write_buf: BytesMut,
    pub(crate) listener: Option<EventHandler>,
    pub(crate) total_recved: usize,
    pub(crate) poll_timeout: Option<TimeoutId>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("num", &self.num)
            .field("val_id", &self.val_id)
            .field("conn_type", &self.conn_type)
            .field("active", &self.active)
            .field("closing", &self.closing)
            .field("total_recved", &self.total_recved)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(num: usize) -> Self {
        Self {
            num,
            val_id: 0,
            conn_type: ConnType::Tcp,
            remote_host: String::new(),
            remote_port: 0,
            active: false,
            client: false,
            closing: false,
            bearer: None,
            write_buf: BytesMut::new(),
            listener: None,
            total_recved: 0,
            poll_timeout: None,
        }
    }

    #[inline]
    pub(crate) fn is_active(&self) -> bool {
        self.active
    }

    #[inline]
    pub(crate) fn handle(&self) -> ConnHandle {
        ConnHandle::new(self.num, self.val_id)
    }

    /// Returns `true` if `handle` refers to the current, active occupant.
    #[inline]
    pub(crate) fn matches(&self, handle: ConnHandle) -> bool {
        self.active && self.num == handle.num() && self.val_id == handle.val_id()
    }

    /// Populates the slot for a new connection and returns its handle.
    pub(crate) fn activate(
        &mut self,
        conn_type: ConnType,
        host: &str,
        port: u16,
        listener: Option<EventHandler>,
    ) -> ConnHandle {
        self.val_id = self.val_id.wrapping_add(1);
        self.conn_type = conn_type;
        self.remote_host = host.to_owned();
        self.remote_port = port;
        self.active = true;
        self.client = true;
        self.closing = false;
        self.write_buf.clear();
        self.listener = listener;
        self.total_recved = 0;
        self.handle()
    }

    /// Clears the slot after close. Outstanding handles become stale.
    pub(crate) fn reset(&mut self) {
        self.val_id = self.val_id.wrapping_add(1);
        self.active = false;
        self.client = false;
        self.closing = false;
        self.bearer = None;
        self.write_buf.clear();
        self.listener = None;
        self.poll_timeout = None;
    }

    #[cfg(test)]
    pub(crate) fn activate_for_test(&mut self) -> ConnHandle {
        self.activate(ConnType::Tcp, "test.local", 80, None)
    }
}

// ============================================================================
// Engine - Connection API
// ============================================================================

impl Engine {
    /// Opens a connection.
    ///
    /// The connection starts in the highest free slot. `listener` receives
    /// every event of the connection, including [`Event::ConnError`] if the
    /// start fails.
    ///
    /// Returns the new handle for a blocking call and `None` for a
    /// non-blocking one, whose outcome arrives as an event.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for an empty host or port 0
    /// - [`Error::NoIp`] if the network is not attached
    /// - [`Error::NoFreeConnection`] if every slot is in use
    /// - [`Error::ConnectFailed`] if the modem refuses the connection
    ///
    /// [`Event::ConnError`]: crate::Event::ConnError
    pub async fn conn_start(
        &self,
        conn_type: ConnType,
        host: impl Into<String>,
        port: u16,
        listener: Option<EventHandler>,
        blocking: bool,
    ) -> Result<Option<ConnHandle>> {
        let host = host.into();
        if host.is_empty() || port == 0 {
            return Err(Error::invalid_argument("host and port are required"));
        }

        let op = Operation::ConnStart(ConnStart {
            conn_type,
            host,
            port,
            listener,
            num: None,
            result: ConnectResult::Pending,
            handle: None,
        });
        let msg = Message::with_defaults(op, self.options());

        let done = self.submit(msg, blocking).await?;
        Ok(done.and_then(|mut msg| msg.conn_start_mut().and_then(|start| start.handle)))
    }

    /// Closes a connection.
    ///
    /// Bytes buffered by [`conn_write`](Self::conn_write) are sent first. A
    /// non-blocking close marks the connection closing at once, so later
    /// writes are rejected while the close is queued.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] for a closed or stale handle
    /// - [`Error::InProgress`] if a close is already queued
    /// - [`Error::Memory`] if a non-blocking close finds the mailbox full;
    ///   the connection stays open with its buffered bytes
    pub async fn conn_close(&self, conn: ConnHandle, blocking: bool) -> Result<()> {
        self.check_submit(blocking)?;

        let pending = self.with_state(|st, _| -> Result<Bytes> {
            let slot = st.conn(conn)?;
            if slot.closing {
                return Err(Error::InProgress);
            }
            if !blocking {
                slot.closing = true;
            }
            Ok(slot.write_buf.split().freeze())
        })?;

        if !pending.is_empty() {
            debug!(%conn, len = pending.len(), "Flushing write buffer before close");
            if let Err(err) = self.enqueue_send(conn, pending.clone()) {
                self.abandon_close(conn, blocking, pending);
                return Err(err);
            }
        }

        let msg = Message::with_defaults(Operation::ConnClose { conn }, self.options());
        match self.submit(msg, blocking).await {
            Ok(_) => Ok(()),
            Err(err) => {
                self.abandon_close(conn, blocking, Bytes::new());
                Err(err)
            }
        }
    }

    /// Reopens a connection whose close was not queued. `unsent` goes back
    /// to the front of the write buffer.
    fn abandon_close(&self, conn: ConnHandle, blocking: bool, unsent: Bytes) {
        self.with_state(|st, _| {
            let Ok(slot) = st.conn(conn) else {
                return;
            };
            if !blocking {
                slot.closing = false;
            }
            if !unsent.is_empty() {
                let mut buf = BytesMut::with_capacity(unsent.len() + slot.write_buf.len());
                buf.extend_from_slice(&unsent);
                buf.extend_from_slice(&slot.write_buf);
                slot.write_buf = buf;
            }
        });
    }

    /// Sends `data` on a connection.
    ///
    /// Data longer than the per-command limit is split into several sends.
    /// Returns the bytes confirmed by the modem for a blocking call and 0
    /// for a non-blocking one, whose outcome arrives as
    /// [`Event::ConnSend`](crate::Event::ConnSend).
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for empty data
    /// - [`Error::ConnectionClosed`] for a closed, closing or stale handle
    pub async fn conn_send(
        &self,
        conn: ConnHandle,
        data: impl Into<Bytes>,
        blocking: bool,
    ) -> Result<usize> {
        let data = data.into();
        if data.is_empty() {
            return Err(Error::invalid_argument("no data to send"));
        }
        self.check_writable(conn)?;

        let op = Operation::ConnSend(ConnSend::new(conn, data, self.options().max_send_retries));
        let msg = Message::with_defaults(op, self.options());
        let done = self.submit(msg, blocking).await?;
        Ok(done
            .and_then(|mut msg| msg.conn_send_mut().map(|send| send.sent))
            .unwrap_or(0))
    }

    /// Buffers `data` for a connection.
    ///
    /// Every time the buffer fills up to the per-command limit it is queued
    /// as a non-blocking send. With `flush` set, whatever remains is queued
    /// too. Returns the number of bytes accepted.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] for a closed, closing or stale handle
    /// - [`Error::Memory`] if the producer mailbox is full
    pub fn conn_write(&self, conn: ConnHandle, data: &[u8], flush: bool) -> Result<usize> {
        let chunks = self.with_state(|st, _| -> Result<Vec<Bytes>> {
            let max = st.max_data_len;
            let slot = st.conn(conn)?;
            if slot.closing {
                return Err(Error::ConnectionClosed);
            }

            let mut chunks = Vec::new();
            let mut rest = data;
            while !rest.is_empty() {
                let n = (max - slot.write_buf.len()).min(rest.len());
                slot.write_buf.extend_from_slice(&rest[..n]);
                rest = &rest[n..];
                if slot.write_buf.len() >= max {
                    chunks.push(slot.write_buf.split().freeze());
                }
            }
            if flush && !slot.write_buf.is_empty() {
                chunks.push(slot.write_buf.split().freeze());
            }
            Ok(chunks)
        })?;

        for chunk in chunks {
            self.enqueue_send(conn, chunk)?;
        }
        Ok(data.len())
    }

    /// Returns `true` if the handle refers to an active connection.
    #[must_use]
    pub fn conn_is_active(&self, conn: ConnHandle) -> bool {
        self.with_state(|st, _| st.conn(conn).is_ok())
    }

    /// Returns `true` if the connection is closed or the handle is stale.
    #[must_use]
    pub fn conn_is_closed(&self, conn: ConnHandle) -> bool {
        !self.conn_is_active(conn)
    }

    /// Returns `true` if a non-blocking close is queued for the connection.
    #[must_use]
    pub fn conn_is_closing(&self, conn: ConnHandle) -> bool {
        self.with_state(|st, _| st.conn(conn).is_ok_and(|slot| slot.closing))
    }

    /// Returns the total bytes delivered to the connection's listener.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] for a closed or stale handle.
    pub fn conn_total_recved(&self, conn: ConnHandle) -> Result<usize> {
        self.with_state(|st, _| st.conn(conn).map(|slot| slot.total_recved))
    }

    /// Replaces the connection's listener.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] for a closed or stale handle.
    pub fn conn_set_listener(&self, conn: ConnHandle, listener: Option<EventHandler>) -> Result<()> {
        self.with_state(|st, _| {
            st.conn(conn)?.listener = listener;
            Ok(())
        })
    }

    /// Returns the remote host and port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] for a closed or stale handle.
    pub fn conn_remote(&self, conn: ConnHandle) -> Result<(String, u16)> {
        self.with_state(|st, _| {
            st.conn(conn)
                .map(|slot| (slot.remote_host.clone(), slot.remote_port))
        })
    }

    /// Returns the connection type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] for a closed or stale handle.
    pub fn conn_type(&self, conn: ConnHandle) -> Result<ConnType> {
        self.with_state(|st, _| st.conn(conn).map(|slot| slot.conn_type))
    }

    /// Returns handles of every active connection.
    #[must_use]
    pub fn conn_handles(&self) -> Vec<ConnHandle> {
        self.with_state(|st, _| {
            st.conns
                .iter()
                .filter(|slot| slot.active)
                .map(|slot| slot.handle())
                .collect()
        })
    }

    /// Refreshes the connection table with `AT+CIPSTATUS`.
    ///
    /// Connections the modem reports as closed are closed locally.
    pub async fn conn_status(&self, blocking: bool) -> Result<()> {
        let msg = Message::with_defaults(Operation::ConnStatus, self.options());
        self.submit(msg, blocking).await.map(|_| ())
    }

    fn check_writable(&self, conn: ConnHandle) -> Result<()> {
        self.with_state(|st, _| {
            let slot = st.conn(conn)?;
            if slot.closing {
                return Err(Error::ConnectionClosed);
            }
            Ok(())
        })
    }

    fn enqueue_send(&self, conn: ConnHandle, data: Bytes) -> Result<()> {
        let op = Operation::ConnSend(ConnSend::new(conn, data, self.options().max_send_retries));
        let msg = Message::with_defaults(op, self.options());
        self.enqueue(msg).inspect_err(|err| {
            warn!(%conn, %err, "Failed to queue send");
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use crate::engine::EngineOptions;
    use crate::protocol::Event;
    use crate::testing::{attach, connect, record_events, test_engine};

    #[test]
    fn test_activate_advances_val_id() {
        let mut slot = Connection::new(3);
        let first = slot.activate_for_test();
        assert_eq!(first.num(), 3);
        assert!(slot.matches(first));

        slot.reset();
        assert!(!slot.matches(first));

        let second = slot.activate_for_test();
        assert_ne!(first, second);
        assert!(!slot.matches(first));
        assert!(slot.matches(second));
    }

    #[test]
    fn test_val_id_wraps() {
        let mut slot = Connection::new(0);
        slot.val_id = u16::MAX;
        let handle = slot.activate_for_test();
        assert_eq!(handle.val_id(), 0);
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(ConnType::Ssl.wire_name(), "TCP");
        assert_eq!(ConnType::Udp.wire_name(), "UDP");
    }

    #[tokio::test]
    async fn test_start_activates_highest_free_slot() {
        let (engine, modem) = test_engine(EngineOptions::new());
        attach(&engine, &modem).await;

        let active = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&active);
        engine.listener_register(move |_, event| {
            if let Event::ConnActive { conn, client } = event {
                sink.lock().push((*conn, *client));
            }
        });

        let handle = connect(&engine, &modem, &[]).await;

        assert_eq!(handle.num(), 5);
        assert_eq!(handle.val_id(), 1);
        assert_eq!(*active.lock(), vec![(handle, true)]);
        assert!(engine.conn_is_active(handle));
        assert_eq!(engine.conn_remote(handle).expect("remote"), ("example.com".to_string(), 80));
        assert_eq!(engine.conn_type(handle).expect("type"), ConnType::Tcp);
        assert_eq!(engine.conn_handles(), vec![handle]);

        let second = connect(&engine, &modem, &[5]).await;
        assert_eq!(second.num(), 4);
    }

    #[tokio::test]
    async fn test_start_without_network_fails_with_no_ip() {
        let (engine, modem) = test_engine(EngineOptions::new());
        let events = record_events(&engine);

        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.conn_start(ConnType::Tcp, "example.com", 80, None, true).await }
        });
        modem.expect("AT+CIPSTATUS\r\n").await;
        engine.feed(b"OK\r\n\r\nSTATE: IP INITIAL\r\n").expect("feed");

        let err = task.await.expect("join").expect_err("no ip");
        assert!(matches!(err, Error::NoIp));
        assert_eq!(*events.lock(), vec!["conn_error"]);
        assert!(modem.is_idle());
    }

    #[tokio::test]
    async fn test_connect_fail_reports_conn_error() {
        let (engine, modem) = test_engine(EngineOptions::new());
        attach(&engine, &modem).await;

        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let listener: EventHandler = Arc::new(move |_: &Engine, event: &Event| {
            if let Event::ConnError { host, port, .. } = event {
                sink.lock().push((host.clone(), *port));
            }
        });

        let task = tokio::spawn({
            let engine = engine.clone();
            async move {
                engine
                    .conn_start(ConnType::Tcp, "example.com", 80, Some(listener), true)
                    .await
            }
        });
        modem.expect("AT+CIPSTATUS\r\n").await;
        engine
            .feed(crate::testing::cipstatus_table(&[]).as_bytes())
            .expect("feed");
        modem.expect("AT+CIPSSL=0\r\n").await;
        engine.feed(b"OK\r\n").expect("feed");
        modem
            .expect("AT+CIPSTART=5,\"TCP\",\"example.com\",80\r\n")
            .await;
        engine.feed(b"OK\r\n\r\n5, CONNECT FAIL\r\n").expect("feed");
        modem.expect("AT+CIPSTATUS\r\n").await;
        engine
            .feed(crate::testing::cipstatus_table(&[]).as_bytes())
            .expect("feed");

        let err = task.await.expect("join").expect_err("connect fails");
        assert!(matches!(err, Error::ConnectFailed));
        assert_eq!(*errors.lock(), vec![("example.com".to_string(), 80)]);
        assert!(engine.conn_handles().is_empty());
    }

    #[tokio::test]
    async fn test_receive_delivers_one_event_per_buffer() {
        let (engine, modem) = test_engine(EngineOptions::new());
        attach(&engine, &modem).await;
        let handle = connect(&engine, &modem, &[]).await;

        let sizes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sizes);
        engine
            .conn_set_listener(
                handle,
                Some(Arc::new(move |_: &Engine, event: &Event| {
                    if let Event::ConnRecv { pbuf, .. } = event {
                        sink.lock().push(pbuf.len());
                    }
                })),
            )
            .expect("listener");

        let mut input = b"+RECEIVE,5,3000:\r\n".to_vec();
        input.extend((0..3000).map(|i| (i % 251) as u8));
        input.extend_from_slice(b"+CSQ: 20,0\r\n");
        engine.feed(&input).expect("feed");

        assert_eq!(*sizes.lock(), vec![1460, 1460, 80]);
        assert_eq!(engine.conn_total_recved(handle).expect("total"), 3000);
        assert_eq!(engine.rssi(), -73);
    }

    #[tokio::test]
    async fn test_send_splits_into_chunks() {
        let (engine, modem) = test_engine(EngineOptions::new());
        attach(&engine, &modem).await;
        let handle = connect(&engine, &modem, &[]).await;
        let events = record_events(&engine);

        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.conn_send(handle, vec![b'x'; 3000], true).await }
        });

        for chunk in [1460, 1460, 80] {
            modem.expect(format!("AT+CIPSEND=5,{chunk}\r\n")).await;
            engine.feed(b"\r\n> ").expect("feed");
            assert_eq!(modem.next_write().await.len(), chunk);
            engine.feed(b"\r\n5, SEND OK\r\n").expect("feed");
        }

        assert_eq!(task.await.expect("join").expect("send"), 3000);
        assert_eq!(*events.lock(), vec!["conn_send"]);
    }

    #[tokio::test]
    async fn test_send_fail_is_retried() {
        let (engine, modem) = test_engine(EngineOptions::new().with_max_send_retries(2));
        attach(&engine, &modem).await;
        let handle = connect(&engine, &modem, &[]).await;

        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.conn_send(handle, &b"ping"[..], true).await }
        });

        for reply in [&b"5, SEND FAIL\r\n"[..], &b"5, SEND FAIL\r\n"[..]] {
            modem.expect("AT+CIPSEND=5,4\r\n").await;
            engine.feed(b"\r\n> ").expect("feed");
            modem.expect("ping").await;
            engine.feed(reply).expect("feed");
        }

        let err = task.await.expect("join").expect_err("send fails");
        assert!(matches!(err, Error::Failed));
    }

    #[tokio::test]
    async fn test_close_twice_and_stale_handle() {
        let (engine, modem) = test_engine(EngineOptions::new());
        attach(&engine, &modem).await;
        let handle = connect(&engine, &modem, &[]).await;
        let events = record_events(&engine);

        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.conn_close(handle, true).await }
        });
        modem.expect("AT+CIPCLOSE=5\r\n").await;
        engine.feed(b"5, CLOSE OK\r\n").expect("feed");
        task.await.expect("join").expect("close");

        assert_eq!(*events.lock(), vec!["conn_close"]);
        assert!(engine.conn_is_closed(handle));
        for _ in 0..2 {
            let err = engine.conn_close(handle, true).await.expect_err("closed");
            assert!(matches!(err, Error::ConnectionClosed));
        }

        // The slot is reused; the old handle must not reach the new occupant.
        let reused = connect(&engine, &modem, &[]).await;
        assert_eq!(reused.num(), handle.num());
        assert_ne!(reused.val_id(), handle.val_id());

        let err = engine.conn_send(handle, &b"stale"[..], true).await.expect_err("stale");
        assert!(matches!(err, Error::ConnectionClosed));
        assert!(matches!(engine.conn_write(handle, b"stale", true), Err(Error::ConnectionClosed)));
        assert!(modem.is_idle());
        assert!(engine.conn_is_active(reused));
    }

    #[tokio::test]
    async fn test_nonblocking_close_rejects_writes() {
        let (engine, modem) = test_engine(EngineOptions::new());
        attach(&engine, &modem).await;
        let handle = connect(&engine, &modem, &[]).await;

        engine.conn_close(handle, false).await.expect("queued");
        assert!(engine.conn_is_closing(handle));
        assert!(matches!(engine.conn_write(handle, b"late", false), Err(Error::ConnectionClosed)));
        assert!(matches!(engine.conn_close(handle, false).await, Err(Error::InProgress)));

        modem.expect("AT+CIPCLOSE=5\r\n").await;
        engine.feed(b"5, CLOSE OK\r\n").expect("feed");
        assert!(engine.conn_is_closed(handle));
    }

    #[tokio::test]
    async fn test_write_buffers_until_full_or_flushed() {
        let (engine, modem) = test_engine(EngineOptions::new().with_conn_max_data_len(8));
        attach(&engine, &modem).await;
        let handle = connect(&engine, &modem, &[]).await;

        assert_eq!(engine.conn_write(handle, b"abcde", false).expect("write"), 5);
        assert!(modem.is_idle());
        assert_eq!(engine.conn_write(handle, b"fghij", false).expect("write"), 5);

        modem.expect("AT+CIPSEND=5,8\r\n").await;
        engine.feed(b"\r\n> ").expect("feed");
        modem.expect("abcdefgh").await;
        engine.feed(b"\r\n5, SEND OK\r\n").expect("feed");

        engine.conn_write(handle, b"", true).expect("flush");
        modem.expect("AT+CIPSEND=5,2\r\n").await;
        engine.feed(b"\r\n> ").expect("feed");
        modem.expect("ij").await;
        engine.feed(b"\r\n5, SEND OK\r\n").expect("feed");
    }

    #[tokio::test]
    async fn test_remote_close_and_poll_events() {
        let (engine, modem) = test_engine(
            EngineOptions::new().with_conn_poll_interval(Duration::from_millis(20)),
        );
        attach(&engine, &modem).await;
        let handle = connect(&engine, &modem, &[]).await;
        let events = record_events(&engine);

        tokio::time::sleep(Duration::from_millis(75)).await;
        engine.feed(b"\r\n5, CLOSED\r\n").expect("feed");
        let polls_at_close = events.lock().iter().filter(|name| **name == "conn_poll").count();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let names = events.lock().clone();
        assert!(polls_at_close >= 2, "expected repeated polls, got {names:?}");
        assert_eq!(names.iter().filter(|name| **name == "conn_poll").count(), polls_at_close);
        assert_eq!(names.last(), Some(&"conn_close"));
        assert!(engine.conn_is_closed(handle));
    }

    #[tokio::test]
    async fn test_network_loss_closes_connections() {
        let (engine, modem) = test_engine(EngineOptions::new());
        attach(&engine, &modem).await;
        let first = connect(&engine, &modem, &[]).await;
        let second = connect(&engine, &modem, &[5]).await;
        let events = record_events(&engine);

        engine.feed(b"+PDP: DEACT\r\n").expect("feed");

        assert!(engine.conn_is_closed(first));
        assert!(engine.conn_is_closed(second));
        assert!(!engine.is_attached());
        assert!(matches!(engine.local_ip(), Err(Error::NoIp)));
        assert_eq!(*events.lock(), vec!["conn_close", "conn_close", "network_detached"]);
    }

    #[tokio::test]
    async fn test_start_with_fewer_slots_than_modem() {
        let (engine, modem) = test_engine(EngineOptions::new().with_max_conns(2));
        attach(&engine, &modem).await;

        let first = connect(&engine, &modem, &[]).await;
        let second = connect(&engine, &modem, &[1]).await;

        assert_eq!((first.num(), second.num()), (1, 0));
        assert_eq!(engine.conn_handles().len(), 2);
    }

    #[tokio::test]
    async fn test_start_without_free_slot_fails_before_cipstart() {
        let (engine, modem) = test_engine(EngineOptions::new().with_max_conns(1));
        attach(&engine, &modem).await;
        let handle = connect(&engine, &modem, &[]).await;
        let events = record_events(&engine);

        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.conn_start(ConnType::Tcp, "example.org", 443, None, true).await }
        });
        modem.expect("AT+CIPSTATUS\r\n").await;
        engine
            .feed(crate::testing::cipstatus_table(&[0]).as_bytes())
            .expect("feed");
        modem.expect("AT+CIPSSL=0\r\n").await;
        engine.feed(b"OK\r\n").expect("feed");

        let err = task.await.expect("join").expect_err("no free slot");
        assert!(matches!(err, Error::NoFreeConnection));
        assert_eq!(*events.lock(), vec!["conn_error"]);
        assert!(modem.is_idle());
        assert_eq!(engine.conn_handles(), vec![handle]);
    }

    #[tokio::test]
    async fn test_start_write_failure_reports_conn_error() {
        let (engine, modem) = test_engine(EngineOptions::new());
        attach(&engine, &modem).await;
        let events = record_events(&engine);

        modem.set_failing(true);
        let err = engine
            .conn_start(ConnType::Tcp, "example.com", 80, None, true)
            .await
            .expect_err("link down");

        assert!(matches!(err, Error::Io(_)));
        assert_eq!(*events.lock(), vec!["conn_error"]);
    }

    #[tokio::test]
    async fn test_close_with_full_mailbox_keeps_connection_open() {
        let (engine, modem) = test_engine(EngineOptions::new().with_mailboxes(1, 8));
        attach(&engine, &modem).await;
        let handle = connect(&engine, &modem, &[]).await;

        engine.conn_write(handle, b"abc", false).expect("buffered");
        engine.signal_quality(false).await.expect("queued");

        let err = engine.conn_close(handle, false).await.expect_err("mailbox full");
        assert!(matches!(err, Error::Memory { .. }));
        assert!(!engine.conn_is_closing(handle));
        assert!(engine.conn_is_active(handle));

        modem.expect("AT+CSQ\r\n").await;
        engine.feed(b"OK\r\n").expect("feed");

        // The buffered bytes survive the failed close.
        engine.conn_write(handle, b"", true).expect("flush");
        modem.expect("AT+CIPSEND=5,3\r\n").await;
        engine.feed(b"\r\n> ").expect("feed");
        modem.expect("abc").await;
        engine.feed(b"\r\n5, SEND OK\r\n").expect("feed");

        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.conn_close(handle, true).await }
        });
        modem.expect("AT+CIPCLOSE=5\r\n").await;
        engine.feed(b"5, CLOSE OK\r\n").expect("feed");
        task.await.expect("join").expect("close");
        assert!(engine.conn_is_closed(handle));
    }
}
