//! Builder pattern for engine configuration.
//!
//! Provides a fluent API for configuring and starting an [`Engine`].
//!
//! # Example
//!
//! ```ignore
//! use gsm_engine::{Engine, EngineOptions};
//!
//! let engine = Engine::builder()
//!     .transport(uart)
//!     .options(EngineOptions::new().with_max_conns(4))
//!     .build()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::info;

use crate::error::{Error, Result};
use crate::identifiers::ListenerId;
use crate::pipeline::{Message, Operation, process, producer};
use crate::protocol::{Event, EventHandler};
use crate::transport::Transport;

use super::core::{Engine, EngineInner};
use super::lock::CoreLock;
use super::options::EngineOptions;
use super::state::CoreState;

// ============================================================================
// EngineBuilder
// ============================================================================

/// Builder for configuring an [`Engine`] instance.
///
/// Use [`Engine::builder()`] to create a new builder.
#[derive(Default)]
pub struct EngineBuilder {
    /// Link to the modem.
    transport: Option<Arc<dyn Transport>>,
    /// Engine options.
    options: EngineOptions,
    /// Global listeners installed before the engine starts.
    listeners: Vec<EventHandler>,
}

impl fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("has_transport", &self.transport.is_some())
            .field("options", &self.options)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

// ============================================================================
// EngineBuilder Implementation
// ============================================================================

impl EngineBuilder {
    /// Creates a new builder with default options and no transport.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the link to the modem.
    #[inline]
    #[must_use]
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Sets a shared link to the modem.
    #[inline]
    #[must_use]
    pub fn transport_arc(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replaces the engine options.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Adds a global listener that sees every event, including the
    /// `InitFinish` event raised by [`build`](Self::build).
    #[must_use]
    pub fn listener(mut self, handler: impl Fn(&Engine, &Event) + Send + Sync + 'static) -> Self {
        self.listeners.push(Arc::new(handler));
        self
    }

    /// Starts the engine.
    ///
    /// Spawns the producer and process tasks on the current tokio runtime,
    /// raises `InitFinish`, and queues a reset when `reset_on_init` is set.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if no transport is set, the options are invalid,
    ///   or no tokio runtime is running
    pub fn build(self) -> Result<Engine> {
        let transport = self.transport.ok_or_else(|| {
            Error::config(
                "Transport is required. Use .transport() to set it.\n\
                 Example: Engine::builder().transport(uart)",
            )
        })?;
        self.options.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| Error::config("Engine must be built inside a tokio runtime"))?;

        let options = self.options;
        let (producer_tx, producer_rx) = mpsc::channel(options.producer_mailbox);
        let (process_tx, process_rx) = mpsc::channel(options.process_mailbox);
        let listeners = self
            .listeners
            .into_iter()
            .map(|handler| (ListenerId::generate(), handler))
            .collect();

        let inner = Arc::new(EngineInner {
            core: CoreLock::new(CoreState::new(&options)),
            options,
            transport,
            producer_tx,
            process_tx,
            listeners: RwLock::new(listeners),
            present: AtomicBool::new(true),
            running: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
        });

        let producer = runtime.spawn(producer::run(Arc::downgrade(&inner), producer_rx));
        let process = runtime.spawn(process::run(Arc::downgrade(&inner), process_rx));
        inner.tasks.lock().extend([producer, process]);

        let engine = Engine::from_inner(inner);
        let options = engine.options();
        info!(
            max_conns = options.max_conns,
            input_mode = ?options.input_mode,
            "Engine started"
        );

        engine.with_state(|st, _| st.push(Event::InitFinish));

        if options.reset_on_init {
            let op = Operation::Reset {
                delay: options.reset_delay(),
                hw_reset: false,
            };
            engine.enqueue(Message::with_defaults(op, options))?;
        }

        Ok(engine)
    }
}

// ============================================================================
// Tests
// ============================================================================
