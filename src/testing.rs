//! Scripted modem for engine tests.
//!
//! [`RecordingTransport`] records every non-empty write. Tests pull the
//! writes in order with [`RecordingTransport::expect`] and answer by
//! feeding modem output into the engine.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

use crate::engine::{Engine, EngineOptions, InputMode, MAX_CONNS_LIMIT};
use crate::identifiers::ConnHandle;
use crate::net::ConnType;
use crate::protocol::Event;
use crate::transport::Transport;

// ============================================================================
// RecordingTransport
// ============================================================================

#[derive(Clone, Default)]
pub(crate) struct RecordingTransport {
    writes: Arc<Mutex<VecDeque<Vec<u8>>>>,
    notify: Arc<Notify>,
    fail: Arc<AtomicBool>,
    hw_reset: Arc<Mutex<Vec<bool>>>,
    has_reset_line: bool,
}

impl RecordingTransport {
    /// Transport that reports a hardware reset line.
    pub(crate) fn with_reset_line() -> Self {
        Self {
            has_reset_line: true,
            ..Self::default()
        }
    }

    /// Makes every later write fail.
    pub(crate) fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::Release);
    }

    /// Returns the reset line levels driven so far.
    pub(crate) fn reset_pulses(&self) -> Vec<bool> {
        self.hw_reset.lock().clone()
    }

    /// Returns `true` if no write is waiting to be consumed.
    pub(crate) fn is_idle(&self) -> bool {
        self.writes.lock().is_empty()
    }

    /// Waits for the next write.
    pub(crate) async fn next_write(&self) -> Vec<u8> {
        let wait = async {
            loop {
                if let Some(write) = self.writes.lock().pop_front() {
                    return write;
                }
                self.notify.notified().await;
            }
        };
        timeout(Duration::from_secs(5), wait)
            .await
            .expect("modem write within 5s")
    }

    /// Waits for the next write and checks it.
    pub(crate) async fn expect(&self, expected: impl AsRef<[u8]>) {
        let write = self.next_write().await;
        assert_eq!(
            String::from_utf8_lossy(&write),
            String::from_utf8_lossy(expected.as_ref())
        );
    }
}

impl Transport for RecordingTransport {
    fn send(&self, data: &[u8]) -> io::Result<usize> {
        if self.fail.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down"));
        }
        if !data.is_empty() {
            self.writes.lock().push_back(data.to_vec());
            self.notify.notify_one();
        }
        Ok(data.len())
    }

    fn hw_reset(&self, asserted: bool) -> bool {
        if self.has_reset_line {
            self.hw_reset.lock().push(asserted);
        }
        self.has_reset_line
    }
}

// ============================================================================
// Engine Helpers
// ============================================================================

/// Initializes tracing once per test binary. Honors `RUST_LOG`.
pub(crate) fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gsm_engine=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

/// Starts an engine that parses input on the feeding thread and skips the
/// initial reset.
pub(crate) fn test_engine(options: EngineOptions) -> (Engine, RecordingTransport) {
    init_logging();
    let transport = RecordingTransport::default();
    let engine = Engine::builder()
        .transport(transport.clone())
        .options(
            options
                .with_input_mode(InputMode::Direct)
                .with_reset_on_init(false),
        )
        .build()
        .expect("engine builds");
    (engine, transport)
}

/// Records the names of every global event.
pub(crate) fn record_events(engine: &Engine) -> Arc<Mutex<Vec<&'static str>>> {
    let names = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&names);
    engine.listener_register(move |_, event: &Event| sink.lock().push(event.name()));
    names
}

/// Connection table printed by `AT+CIPSTATUS`, with `connected` slots up.
/// The modem lists every slot it has, not only the configured ones.
pub(crate) fn cipstatus_table(connected: &[usize]) -> String {
    let mut out = String::from("OK\r\n\r\nSTATE: IP PROCESSING\r\n\r\n");
    for num in 0..MAX_CONNS_LIMIT {
        if connected.contains(&num) {
            out.push_str(&format!(
                "C: {num},0,\"TCP\",\"93.184.216.34\",\"80\",\"CONNECTED\"\r\n"
            ));
        } else {
            out.push_str(&format!("C: {num},,\"\",\"\",\"\",\"INITIAL\"\r\n"));
        }
    }
    out
}

/// Runs the attach sequence against the scripted modem.
pub(crate) async fn attach(engine: &Engine, modem: &RecordingTransport) {
    let task = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.network_attach("internet", "", "", true).await })
    };

    for line in [
        "AT+CGACT=0\r\n",
        "AT+CGATT=1\r\n",
    ] {
        modem.expect(line).await;
        engine.feed(b"OK\r\n").expect("feed");
    }
    modem.expect("AT+CIPSHUT\r\n").await;
    engine.feed(b"SHUT OK\r\n").expect("feed");
    for line in [
        "AT+CIPMUX=1\r\n",
        "AT+CIPRXGET=0\r\n",
        "AT+CSTT=\"internet\",\"\",\"\"\r\n",
        "AT+CIICR\r\n",
    ] {
        modem.expect(line).await;
        engine.feed(b"OK\r\n").expect("feed");
    }
    modem.expect("AT+CIFSR\r\n").await;
    engine.feed(b"10.64.1.7\r\n").expect("feed");

    task.await.expect("join").expect("attach");
}

/// Opens a TCP connection against the scripted modem, which places it in
/// the highest free slot.
pub(crate) async fn connect(
    engine: &Engine,
    modem: &RecordingTransport,
    connected: &[usize],
) -> ConnHandle {
    let max_conns = engine.options().max_conns;
    let num = (0..max_conns)
        .rev()
        .find(|num| !connected.contains(num))
        .expect("free slot");

    let task = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .conn_start(ConnType::Tcp, "example.com", 80, None, true)
                .await
        })
    };

    modem.expect("AT+CIPSTATUS\r\n").await;
    engine
        .feed(cipstatus_table(connected).as_bytes())
        .expect("feed");
    modem.expect("AT+CIPSSL=0\r\n").await;
    engine.feed(b"OK\r\n").expect("feed");
    modem
        .expect(format!("AT+CIPSTART={num},\"TCP\",\"example.com\",80\r\n"))
        .await;
    engine.feed(b"OK\r\n").expect("feed");
    engine
        .feed(format!("\r\n{num}, CONNECT OK\r\n").as_bytes())
        .expect("feed");

    let mut now_connected = connected.to_vec();
    now_connected.push(num);
    modem.expect("AT+CIPSTATUS\r\n").await;
    engine
        .feed(cipstatus_table(&now_connected).as_bytes())
        .expect("feed");

    task.await
        .expect("join")
        .expect("connect")
        .expect("handle for blocking start")
}
