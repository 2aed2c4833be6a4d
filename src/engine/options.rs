//! Engine configuration.
//!
//! [`EngineOptions`] holds every tunable of the engine. It can be built in
//! code with the `with_*` methods or loaded from JSON; fields missing from
//! the JSON take their defaults.
//!
//! # Example
//!
//! ```ignore
//! use gsm_engine::{EngineOptions, InputMode};
//!
//! let options = EngineOptions::new()
//!     .with_max_conns(6)
//!     .with_input_mode(InputMode::Direct)
//!     .with_reset_on_init(false);
//!
//! let from_json = EngineOptions::from_json(r#"{ "max_conns": 4 }"#)?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Connection slots the modem exposes with `AT+CIPMUX=1`.
///
/// `AT+CIPSTATUS` always lists every one of them, whatever `max_conns` is.
pub const MAX_CONNS_LIMIT: usize = 6;

// ============================================================================
// InputMode
// ============================================================================

/// How bytes passed to [`Engine::feed`](crate::Engine::feed) are processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// Bytes are queued on the process mailbox and parsed by the process task.
    #[default]
    Buffered,
    /// Bytes are parsed synchronously on the calling thread.
    Direct,
}

// ============================================================================
// EngineOptions
// ============================================================================

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Number of connection slots.
    pub max_conns: usize,

    /// Capacity of a single receive buffer segment.
    pub max_recv_pbuf: usize,

    /// Largest payload sent with one `AT+CIPSEND`, also the write buffer size.
    pub conn_max_data_len: usize,

    /// Producer mailbox capacity.
    pub producer_mailbox: usize,

    /// Process mailbox capacity.
    pub process_mailbox: usize,

    /// Input processing mode.
    pub input_mode: InputMode,

    /// Interval of the per-connection poll event in milliseconds.
    pub conn_poll_interval_ms: u64,

    /// Block time applied to messages that do not set their own.
    pub default_block_ms: u64,

    /// Queue a reset when the engine starts.
    pub reset_on_init: bool,

    /// Queue a reset when the device becomes present again.
    pub reset_on_device_present: bool,

    /// Delay before a reset touches the modem.
    pub reset_delay_ms: u64,

    /// Keep attaching when `AT+CGACT=0` fails.
    pub ignore_pdp_deactivate_result: bool,

    /// Attempts per chunk after `SEND FAIL`.
    pub max_send_retries: u8,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl EngineOptions {
    /// Creates options with default settings.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_conns: 6,
            max_recv_pbuf: 1460,
            conn_max_data_len: 1460,
            producer_mailbox: 16,
            process_mailbox: 64,
            input_mode: InputMode::Buffered,
            conn_poll_interval_ms: 500,
            default_block_ms: 60_000,
            reset_on_init: true,
            reset_on_device_present: true,
            reset_delay_ms: 0,
            ignore_pdp_deactivate_result: true,
            max_send_retries: 3,
        }
    }

    /// Parses options from JSON, filling missing fields with defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] on malformed input.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl EngineOptions {
    /// Sets the number of connection slots.
    #[inline]
    #[must_use]
    pub fn with_max_conns(mut self, max_conns: usize) -> Self {
        self.max_conns = max_conns;
        self
    }

    /// Sets the capacity of one receive buffer segment.
    #[inline]
    #[must_use]
    pub fn with_max_recv_pbuf(mut self, len: usize) -> Self {
        self.max_recv_pbuf = len;
        self
    }

    /// Sets the maximum payload per send command.
    #[inline]
    #[must_use]
    pub fn with_conn_max_data_len(mut self, len: usize) -> Self {
        self.conn_max_data_len = len;
        self
    }

    /// Sets both mailbox capacities.
    #[inline]
    #[must_use]
    pub fn with_mailboxes(mut self, producer: usize, process: usize) -> Self {
        self.producer_mailbox = producer;
        self.process_mailbox = process;
        self
    }

    /// Sets the input processing mode.
    #[inline]
    #[must_use]
    pub fn with_input_mode(mut self, mode: InputMode) -> Self {
        self.input_mode = mode;
        self
    }

    /// Sets the connection poll interval.
    #[inline]
    #[must_use]
    pub fn with_conn_poll_interval(mut self, interval: Duration) -> Self {
        self.conn_poll_interval_ms = duration_ms(interval);
        self
    }

    /// Sets the default message block time.
    #[inline]
    #[must_use]
    pub fn with_default_block_time(mut self, block_time: Duration) -> Self {
        self.default_block_ms = duration_ms(block_time);
        self
    }

    /// Enables or disables the reset queued at startup.
    #[inline]
    #[must_use]
    pub fn with_reset_on_init(mut self, enabled: bool) -> Self {
        self.reset_on_init = enabled;
        self
    }

    /// Enables or disables the reset queued when the device reappears.
    #[inline]
    #[must_use]
    pub fn with_reset_on_device_present(mut self, enabled: bool) -> Self {
        self.reset_on_device_present = enabled;
        self
    }

    /// Sets the delay applied before reset.
    #[inline]
    #[must_use]
    pub fn with_reset_delay(mut self, delay: Duration) -> Self {
        self.reset_delay_ms = duration_ms(delay);
        self
    }

    /// Sets whether a failing PDP deactivate aborts attach.
    #[inline]
    #[must_use]
    pub fn with_ignore_pdp_deactivate_result(mut self, ignore: bool) -> Self {
        self.ignore_pdp_deactivate_result = ignore;
        self
    }

    /// Sets the send retry budget.
    #[inline]
    #[must_use]
    pub fn with_max_send_retries(mut self, retries: u8) -> Self {
        self.max_send_retries = retries;
        self
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl EngineOptions {
    /// Returns the default message block time.
    #[inline]
    #[must_use]
    pub fn default_block_time(&self) -> Duration {
        Duration::from_millis(self.default_block_ms)
    }

    /// Returns the connection poll interval.
    #[inline]
    #[must_use]
    pub fn conn_poll_interval(&self) -> Duration {
        Duration::from_millis(self.conn_poll_interval_ms)
    }

    /// Returns the reset delay.
    #[inline]
    #[must_use]
    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_delay_ms)
    }

    /// Checks the options for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.max_conns == 0 || self.max_conns > MAX_CONNS_LIMIT {
            return Err(Error::config(format!(
                "max_conns must be in 1..={MAX_CONNS_LIMIT}, got {}",
                self.max_conns
            )));
        }
        if self.max_recv_pbuf == 0 {
            return Err(Error::config("max_recv_pbuf must be non-zero"));
        }
        if self.conn_max_data_len == 0 {
            return Err(Error::config("conn_max_data_len must be non-zero"));
        }
        if self.producer_mailbox == 0 || self.process_mailbox == 0 {
            return Err(Error::config("mailbox capacity must be non-zero"));
        }
        if self.conn_poll_interval_ms == 0 {
            return Err(Error::config("conn_poll_interval_ms must be non-zero"));
        }
        if self.max_send_retries == 0 {
            return Err(Error::config("max_send_retries must be at least 1"));
        }
        Ok(())
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Tests
// ============================================================================
