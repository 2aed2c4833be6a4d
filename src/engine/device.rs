//! Device control: reset, restore, functionality and presence.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::info;

use crate::error::Result;
use crate::pipeline::{Message, Operation};
use crate::protocol::Event;

use super::core::Engine;
use super::status::OperatorInfo;

// ============================================================================
// Engine - Device API
// ============================================================================

impl Engine {
    /// Restarts the modem and re-runs the identification sequence.
    ///
    /// Every connection is closed and all cached modem state is dropped
    /// before the restart command goes out.
    pub async fn reset(&self, blocking: bool) -> Result<()> {
        self.reset_with_delay(Duration::ZERO, blocking).await
    }

    /// Like [`reset`](Self::reset), but waits `delay` before touching the
    /// modem.
    pub async fn reset_with_delay(&self, delay: Duration, blocking: bool) -> Result<()> {
        let op = Operation::Reset {
            delay,
            hw_reset: false,
        };
        self.submit(Message::with_defaults(op, self.options()), blocking)
            .await
            .map(|_| ())
    }

    /// Restores factory defaults (`AT&F`).
    pub async fn restore(&self, blocking: bool) -> Result<()> {
        self.submit(Message::with_defaults(Operation::Restore, self.options()), blocking)
            .await
            .map(|_| ())
    }

    /// Sets full (`true`) or minimum (`false`) phone functionality.
    pub async fn set_func(&self, full: bool, blocking: bool) -> Result<()> {
        let msg = Message::with_defaults(Operation::SetFunc { full }, self.options());
        self.submit(msg, blocking).await.map(|_| ())
    }

    /// Queries signal quality.
    ///
    /// Returns the RSSI in dBm for a blocking call, `None` when the modem
    /// does not know it or the call is non-blocking.
    pub async fn signal_quality(&self, blocking: bool) -> Result<Option<i16>> {
        let msg = Message::with_defaults(Operation::SignalQuality { rssi: None }, self.options());
        let done = self.submit(msg, blocking).await?;
        Ok(done.and_then(|msg| match msg.op {
            Operation::SignalQuality { rssi } => rssi,
            _ => None,
        }))
    }

    /// Scans for available operators.
    ///
    /// The scan can take minutes on real hardware; give the message a
    /// generous block time through the engine options. A non-blocking scan
    /// reports its result with [`Event::OperatorScan`].
    pub async fn operator_scan(&self, blocking: bool) -> Result<Vec<OperatorInfo>> {
        let op = Operation::OperatorScan {
            operators: Vec::new(),
        };
        let done = self.submit(Message::with_defaults(op, self.options()), blocking).await?;
        Ok(done
            .map(|msg| match msg.op {
                Operation::OperatorScan { operators } => operators,
                _ => Vec::new(),
            })
            .unwrap_or_default())
    }

    /// Returns `false` once the device was marked absent.
    #[must_use]
    pub fn is_device_present(&self) -> bool {
        self.inner.present.load(Ordering::Acquire)
    }

    /// Marks the device present or absent.
    ///
    /// Going absent closes every connection and clears the network state
    /// locally, since no wire command can report it. Coming back queues a
    /// reset when `reset_on_device_present` is set.
    pub fn set_device_present(&self, present: bool) -> Result<()> {
        if self.inner.present.swap(present, Ordering::AcqRel) == present {
            return Ok(());
        }
        info!(present, "Device presence changed");

        self.with_state(|st, _| {
            if !present {
                st.network_detached(true);
            }
            st.push(Event::DevicePresent { present });
        });

        if present && self.options().reset_on_device_present {
            let op = Operation::Reset {
                delay: self.options().reset_delay(),
                hw_reset: false,
            };
            self.enqueue(Message::with_defaults(op, self.options()))?;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
