//! Engine handle and event dispatch.
//!
//! The [`Engine`] is a cheap, cloneable handle to the shared engine state.
//! Two tokio tasks run behind it:
//!
//! - the producer task, which executes queued messages one at a time
//! - the process task, which parses buffered input and runs timeouts
//!
//! Every access to the shared state goes through the re-entrant core lock.
//! Events raised while the state is borrowed are collected and dispatched
//! after the borrow ends, still under the lock, so listeners may call back
//! into the engine.
//!
//! # Example
//!
//! ```ignore
//! use gsm_engine::{Engine, EngineOptions};
//!
//! let engine = Engine::builder()
//!     .transport(uart)
//!     .options(EngineOptions::new().with_reset_on_init(true))
//!     .listener(|_, event| println!("{}", event.name()))
//!     .build()?;
//!
//! engine.network_attach("internet", "", "", true).await?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{ListenerId, TimeoutId};
use crate::pipeline::Message;
use crate::protocol::{Dispatch, Event, EventHandler, parser, subcmd};
use crate::transport::Transport;

use super::builder::EngineBuilder;
use super::lock::{CoreGuard, CoreLock, held_by_current_thread};
use super::options::{EngineOptions, InputMode};
use super::state::{CoreState, Ctx, Pending};
use super::timeout::{TimeoutAction, TimeoutFn};

// ============================================================================
// Types
// ============================================================================

/// Work item of the process task.
#[derive(Debug)]
pub(crate) enum ProcessEvent {
    /// Raw bytes from the modem.
    Input(Bytes),
    /// Re-evaluate the earliest timeout deadline.
    Wakeup,
}

/// Shared state behind every [`Engine`] handle.
pub(crate) struct EngineInner {
    pub(crate) options: EngineOptions,
    pub(crate) core: CoreLock,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) producer_tx: mpsc::Sender<Box<Message>>,
    pub(crate) process_tx: mpsc::Sender<ProcessEvent>,
    pub(crate) listeners: RwLock<Vec<(ListenerId, EventHandler)>>,
    pub(crate) present: AtomicBool,
    pub(crate) running: AtomicBool,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
}

// ============================================================================
// Engine
// ============================================================================

/// Handle to a running modem engine.
///
/// Cloning is cheap; all clones share the same engine. The worker tasks
/// stop once the last handle is dropped or [`shutdown`](Self::shutdown) is
/// called.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("running", &self.is_running())
            .field("device_present", &self.is_device_present())
            .field("max_conns", &self.inner.options.max_conns)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Engine - Public API
// ============================================================================

impl Engine {
    /// Creates a configuration builder for the engine.
    #[inline]
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Returns the engine options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    /// Returns `true` until [`shutdown`](Self::shutdown) is called.
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Feeds bytes received from the modem.
    ///
    /// In [`InputMode::Buffered`] the bytes are queued for the process task.
    /// In [`InputMode::Direct`] they are parsed on the calling thread,
    /// unless that thread is already inside engine context, in which case
    /// they are queued as well.
    ///
    /// # Errors
    ///
    /// - [`Error::NotEnabled`] after shutdown
    /// - [`Error::Memory`] if the process mailbox is full
    pub fn feed(&self, data: &[u8]) -> Result<()> {
        if !self.is_running() {
            return Err(Error::not_enabled("engine"));
        }
        if data.is_empty() {
            return Ok(());
        }

        match self.inner.options.input_mode {
            InputMode::Direct if !held_by_current_thread() => {
                self.process_input(data);
                Ok(())
            }
            _ => self.queue_input(Bytes::copy_from_slice(data)),
        }
    }

    /// Registers a global event listener.
    pub fn listener_register(
        &self,
        handler: impl Fn(&Engine, &Event) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId::generate();
        let handler: EventHandler = Arc::new(handler);
        self.inner.listeners.write().push((id, handler));
        debug!(%id, "Listener registered");
        id
    }

    /// Removes a global event listener. Returns `false` if it was unknown.
    pub fn listener_unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Schedules `callback` to run on the process task after `delay`.
    ///
    /// The callback runs with the core lock held.
    pub fn timeout_add(
        &self,
        delay: Duration,
        callback: impl FnOnce(&Engine) + Send + 'static,
    ) -> TimeoutId {
        let callback: TimeoutFn = Box::new(callback);
        self.with_state(|st, _| st.timeouts.insert(delay, TimeoutAction::Callback(callback)))
    }

    /// Cancels a scheduled callback. Returns `false` if it already ran.
    pub fn timeout_remove(&self, id: TimeoutId) -> bool {
        self.with_state(|st, _| st.timeouts.remove(id))
    }

    /// Stops the worker tasks.
    ///
    /// Every connection is closed locally and the message in flight is
    /// dropped, so its blocking caller sees [`Error::ChannelClosed`].
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Engine shutting down");

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }

        self.with_state(|st, _| {
            st.msg = None;
            st.sync = None;
            st.pending = Pending::None;
            st.reset_everything(true);
        });
    }
}

// ============================================================================
// Engine - Internal
// ============================================================================

impl Engine {
    pub(crate) fn from_inner(inner: Arc<EngineInner>) -> Self {
        Self { inner }
    }

    fn ctx(&self) -> Ctx<'_> {
        Ctx {
            transport: self.inner.transport.as_ref(),
            options: &self.inner.options,
        }
    }

    /// Runs `f` on the locked state, then dispatches the events it raised.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut CoreState, &Ctx<'_>) -> R) -> R {
        let guard = self.inner.core.lock();
        let out = {
            let mut st = guard.state();
            f(&mut *st, &self.ctx())
        };
        self.drain(&guard);
        out
    }

    /// Parses `data` synchronously.
    pub(crate) fn process_input(&self, mut data: &[u8]) {
        let guard = self.inner.core.lock();
        trace!(len = data.len(), "Processing input");
        while !data.is_empty() {
            let consumed = {
                let mut st = guard.state();
                parser::step(&mut *st, &self.ctx(), data)
            };
            data = &data[consumed.clamp(1, data.len())..];
            self.drain(&guard);
        }
    }

    pub(crate) fn queue_input(&self, data: Bytes) -> Result<()> {
        match self.inner.process_tx.try_send(ProcessEvent::Input(data)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::memory("process mailbox full")),
            Err(TrySendError::Closed(_)) => Err(Error::not_enabled("engine")),
        }
    }

    /// Dispatches queued events and settles pending work until both are
    /// exhausted.
    fn drain(&self, guard: &CoreGuard<'_>) {
        loop {
            let (events, pending, earlier) = {
                let mut st = guard.state();
                (
                    std::mem::take(&mut st.events),
                    std::mem::take(&mut st.pending),
                    st.timeouts.take_earlier(),
                )
            };

            if earlier {
                let _ = self.inner.process_tx.try_send(ProcessEvent::Wakeup);
            }
            if events.is_empty() && pending.is_none() {
                break;
            }

            self.dispatch(events);
            self.settle(guard, pending);
        }
    }

    fn dispatch(&self, events: Vec<Dispatch>) {
        for Dispatch { event, listener } in events {
            trace!(event = event.name(), "Dispatching event");
            match listener {
                Some(handler) => handler(self, &event),
                None => {
                    let handlers: Vec<EventHandler> = self
                        .inner
                        .listeners
                        .read()
                        .iter()
                        .map(|(_, handler)| Arc::clone(handler))
                        .collect();
                    for handler in handlers {
                        handler(self, &event);
                    }
                }
            }
        }
    }

    fn settle(&self, guard: &CoreGuard<'_>, pending: Pending) {
        match pending {
            Pending::None => {}
            Pending::Emit => {
                let mut st = guard.state();
                let st = &mut *st;
                let Some(mut msg) = st.msg.take() else {
                    return;
                };
                if let Err(err) = (msg.initiate)(&mut *msg, st, &self.ctx()) {
                    warn!(cmd = ?msg.cmd, %err, "Failed to emit sub-command");
                    subcmd::emit_failed(&mut msg, st);
                    msg.result = Err(err);
                    st.pending = Pending::Release;
                }
                st.msg = Some(msg);
            }
            Pending::Release => {
                let mut st = guard.state();
                let (msg, sync) = (st.msg.take(), st.sync.take());
                match (msg, sync) {
                    (Some(msg), Some(sync)) => {
                        if let Err(msg) = sync.send(msg) {
                            debug!(cmd = ?msg.cmd, "Producer stopped waiting");
                        }
                    }
                    (Some(msg), None) => debug!(cmd = ?msg.cmd, "Released message without waiter"),
                    _ => {}
                }
            }
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let guard = self.inner.core.lock();
        let deadline = guard.state().timeouts.next_deadline();
        deadline
    }

    /// Runs every expired timeout.
    pub(crate) fn run_timeouts(&self) {
        let guard = self.inner.core.lock();
        let expired = guard.state().timeouts.take_expired(Instant::now());

        for (id, action) in expired {
            trace!(%id, ?action, "Timeout expired");
            match action {
                TimeoutAction::ConnPoll(handle) => {
                    let mut st = guard.state();
                    let interval = self.inner.options.conn_poll_interval();
                    if st.conn(handle).is_ok() {
                        let next = st.timeouts.insert(interval, TimeoutAction::ConnPoll(handle));
                        if let Ok(conn) = st.conn(handle) {
                            conn.poll_timeout = Some(next);
                        }
                        st.push_conn(Event::ConnPoll { conn: handle });
                    }
                }
                TimeoutAction::Callback(callback) => callback(self),
            }
            self.drain(&guard);
        }
    }
}

// ============================================================================
// Engine - Status
// ============================================================================

impl Engine {
    /// Returns the identification reported during the last reset.
    #[must_use]
    pub fn device_info(&self) -> super::DeviceInfo {
        self.with_state(|st, _| st.device.clone())
    }

    /// Returns the cached SIM state.
    #[must_use]
    pub fn sim_state(&self) -> super::SimState {
        self.with_state(|st, _| st.sim)
    }

    /// Returns a snapshot of the network state.
    #[must_use]
    pub fn network_info(&self) -> super::NetworkInfo {
        self.with_state(|st, _| st.network.clone())
    }

    /// Returns `true` once the modem reported `Call Ready`.
    #[must_use]
    pub fn is_call_ready(&self) -> bool {
        self.with_state(|st, _| st.call_ready)
    }

    /// Returns `true` once the modem reported `SMS Ready`.
    #[must_use]
    pub fn is_sms_ready(&self) -> bool {
        self.with_state(|st, _| st.sms_ready)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use futures_util::FutureExt;

    use crate::engine::SimState;
    use crate::protocol::Cmd;
    use crate::testing::{RecordingTransport, record_events, test_engine};

    #[tokio::test]
    async fn test_signal_quality_round_trip() {
        let (engine, modem) = test_engine(EngineOptions::new());
        let events = record_events(&engine);

        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.signal_quality(true).await }
        });

        modem.expect("AT+CSQ\r\n").await;
        engine.feed(b"\r\n+CSQ: 20,0\r\n\r\nOK\r\n").expect("feed");

        let rssi = task.await.expect("join").expect("csq");
        assert_eq!(rssi, Some(-73));
        assert_eq!(engine.network_info().rssi, -73);
        assert_eq!(*events.lock(), vec!["signal_strength"]);
    }

    #[tokio::test]
    async fn test_reset_identifies_before_registration() {
        let (engine, modem) = test_engine(EngineOptions::new());

        // Records each event with whether a newer write was already sent.
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let probe = modem.clone();
        engine.listener_register(move |_, event| sink.lock().push((event.name(), probe.is_idle())));

        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.reset(true).await }
        });

        let script: [(&str, &[u8]); 11] = [
            ("AT+CFUN=1,1\r\n", b"OK\r\n"),
            ("ATE0\r\n", b"ATE0\r\r\nOK\r\n"),
            ("AT+CFUN=1\r\n", b"OK\r\n"),
            ("AT+CMEE=1\r\n", b"OK\r\n"),
            ("AT+CGMI\r\n", b"SIMCOM_Ltd\r\n\r\nOK\r\n"),
            ("AT+CGMM\r\n", b"SIMCOM_SIM800L\r\n\r\nOK\r\n"),
            ("AT+CGSN\r\n", b"866262037355021\r\n\r\nOK\r\n"),
            ("AT+CGMR\r\n", b"Revision:1418B04SIM800L24\r\n\r\nOK\r\n"),
            ("AT+CREG=1\r\n", b"OK\r\n"),
            ("AT+CLCC=1\r\n", b"OK\r\n"),
            ("AT+CPIN?\r\n", b"+CPIN: READY\r\n\r\nOK\r\n"),
        ];
        for (command, reply) in script {
            modem.expect(command).await;
            engine.feed(reply).expect("feed");
        }

        task.await.expect("join").expect("reset");

        let seen = seen.lock().clone();
        let identified = seen
            .iter()
            .position(|(name, _)| *name == "device_identified")
            .expect("identified");
        assert!(seen[identified].1, "AT+CREG=1 went out before DeviceIdentified");
        assert_eq!(seen.last().map(|(name, _)| *name), Some("reset"));

        let info = engine.device_info();
        assert_eq!(info.manufacturer, "SIMCOM_Ltd");
        assert_eq!(info.model, "SIMCOM_SIM800L");
        assert_eq!(info.serial, "866262037355021");
        assert_eq!(info.revision, "1418B04SIM800L24");
        assert_eq!(engine.sim_state(), SimState::Ready);
    }

    #[tokio::test]
    async fn test_reset_uses_hardware_line() {
        let modem = RecordingTransport::with_reset_line();
        let engine = Engine::builder()
            .transport(modem.clone())
            .options(
                EngineOptions::new()
                    .with_input_mode(InputMode::Direct)
                    .with_reset_on_init(false),
            )
            .build()
            .expect("build");

        engine.reset(false).await.expect("queued");
        modem.expect("AT\r\n").await;
        assert_eq!(modem.reset_pulses(), vec![true, false]);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_first_reset_step_failure_aborts() {
        let (engine, modem) = test_engine(EngineOptions::new());
        let events = record_events(&engine);

        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.reset(true).await }
        });
        modem.expect("AT+CFUN=1,1\r\n").await;
        engine.feed(b"ERROR\r\n").expect("feed");

        let err = task.await.expect("join").expect_err("reset fails");
        assert!(matches!(err, Error::Failed));
        assert!(modem.is_idle());
        assert_eq!(*events.lock(), vec!["reset"]);
    }

    #[tokio::test]
    async fn test_listener_reenters_engine() {
        let (engine, modem) = test_engine(EngineOptions::new());
        let results = Arc::new(Mutex::new(Vec::new()));
        let fired = Arc::new(AtomicBool::new(false));

        {
            let results = Arc::clone(&results);
            let fired = Arc::clone(&fired);
            engine.listener_register(move |engine, event| {
                if !matches!(event, Event::SignalStrength { .. }) || fired.swap(true, Ordering::AcqRel) {
                    return;
                }
                // Nested lock acquisition.
                let rssi = engine.rssi();
                let blocking = engine.signal_quality(true).now_or_never();
                let queued = engine.signal_quality(false).now_or_never();
                results.lock().push((
                    rssi,
                    matches!(blocking, Some(Err(Error::BlockingNotAllowed))),
                    matches!(queued, Some(Ok(None))),
                ));
            });
        }

        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.signal_quality(true).await }
        });
        modem.expect("AT+CSQ\r\n").await;
        engine.feed(b"+CSQ: 31,0\r\nOK\r\n").expect("feed");
        task.await.expect("join").expect("csq");

        assert_eq!(*results.lock(), vec![(-51, true, true)]);

        // The non-blocking query queued from the listener runs next.
        modem.expect("AT+CSQ\r\n").await;
        engine.feed(b"+CSQ: 99,99\r\nOK\r\n").expect("feed");
    }

    #[tokio::test]
    async fn test_unregistered_listener_is_not_called() {
        let (engine, _modem) = test_engine(EngineOptions::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = engine.listener_register(move |_, _| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        engine.feed(b"Call Ready\r\n").expect("feed");
        assert!(engine.listener_unregister(id));
        assert!(!engine.listener_unregister(id));
        engine.feed(b"SMS Ready\r\n").expect("feed");

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(engine.is_call_ready());
        assert!(engine.is_sms_ready());
    }

    #[tokio::test]
    async fn test_buffered_input_is_parsed_by_process_task() {
        let modem = RecordingTransport::default();
        let engine = Engine::builder()
            .transport(modem.clone())
            .options(EngineOptions::new().with_reset_on_init(false))
            .build()
            .expect("build");

        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.signal_quality(true).await }
        });
        modem.expect("AT+CSQ\r\n").await;
        engine.feed(b"+CSQ: 10,").expect("feed");
        engine.feed(b"0\r\nOK\r\n").expect("feed");

        assert_eq!(task.await.expect("join").expect("csq"), Some(-93));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_callback_runs_once() {
        let (engine, _modem) = test_engine(EngineOptions::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        engine.timeout_add(Duration::from_millis(50), move |engine| {
            assert!(engine.is_running());
            counter.fetch_add(1, Ordering::Relaxed);
        });
        let cancelled = engine.timeout_add(Duration::from_millis(60), |_| panic!("cancelled"));
        assert!(engine.timeout_remove(cancelled));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(!engine.timeout_remove(cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_timeout_releases_engine() {
        let (engine, modem) = test_engine(
            EngineOptions::new().with_default_block_time(Duration::from_secs(1)),
        );
        let events = record_events(&engine);

        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.signal_quality(true).await }
        });
        modem.expect("AT+CSQ\r\n").await;

        let err = task.await.expect("join").expect_err("times out");
        assert!(matches!(
            err,
            Error::CommandTimeout {
                command: Cmd::Csq,
                ..
            }
        ));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*events.lock(), vec!["cmd_timeout"]);

        // A late reply finds nothing in flight.
        engine.feed(b"OK\r\n").expect("feed");

        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.signal_quality(true).await }
        });
        modem.expect("AT+CSQ\r\n").await;
        engine.feed(b"+CSQ: 15,0\r\nOK\r\n").expect("feed");
        assert_eq!(task.await.expect("join").expect("csq"), Some(-83));
    }

    #[tokio::test]
    async fn test_shutdown_stops_engine() {
        let (engine, _modem) = test_engine(EngineOptions::new());
        engine.shutdown();

        assert!(!engine.is_running());
        assert!(matches!(engine.feed(b"OK\r\n"), Err(Error::NotEnabled { .. })));
        let err = engine.signal_quality(true).await.expect_err("stopped");
        assert!(matches!(err, Error::NotEnabled { .. }));
    }
}
