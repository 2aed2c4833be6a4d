//! Submission of messages to the producer mailbox.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::Ordering;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::Engine;
use crate::engine::lock::held_by_current_thread;
use crate::engine::options::duration_ms;
use crate::error::{Error, Result};

use super::message::{Message, Operation};

// ============================================================================
// Engine - Submission
// ============================================================================

impl Engine {
    /// Submits a message for execution.
    ///
    /// A blocking submission waits until the message completes and returns
    /// it with its final parameters. A non-blocking one returns `None` as
    /// soon as the message is queued; its outcome arrives through the
    /// message callback and the engine events.
    ///
    /// # Errors
    ///
    /// - [`Error::NotEnabled`] after shutdown
    /// - [`Error::DeviceNotPresent`] if the device is marked absent
    /// - [`Error::BlockingNotAllowed`] for a blocking call from a listener
    /// - [`Error::Memory`] if a non-blocking call finds the mailbox full
    /// - [`Error::CommandTimeout`] if no result arrives within the block time
    /// - any error the operation itself fails with
    pub async fn submit(&self, mut msg: Message, blocking: bool) -> Result<Option<Box<Message>>> {
        self.check_submit(blocking)?;

        if !blocking {
            self.enqueue(msg)?;
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        let block_time = msg.block_time;
        let timeout_err = match msg.op {
            Operation::ConnStart(_) => Error::ConnectTimeout,
            _ => Error::command_timeout(msg.cmd, duration_ms(block_time)),
        };
        msg.blocking = true;
        msg.reply = Some(tx);

        trace!(op = msg.op.name(), "Submitting blocking message");
        self.inner
            .producer_tx
            .send(Box::new(msg))
            .await
            .map_err(|_| Error::not_enabled("engine"))?;

        let mut done = match timeout(block_time, rx).await {
            Ok(Ok(done)) => done,
            Ok(Err(err)) => return Err(Error::ChannelClosed(err)),
            Err(_) => {
                debug!(%timeout_err, "Blocking submission timed out");
                return Err(timeout_err);
            }
        };

        done.take_result()?;
        Ok(Some(done))
    }

    /// Queues a non-blocking message without waiting.
    pub(crate) fn enqueue(&self, msg: Message) -> Result<()> {
        trace!(op = msg.op.name(), "Queueing message");
        match self.inner.producer_tx.try_send(Box::new(msg)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::memory("producer mailbox full")),
            Err(TrySendError::Closed(_)) => Err(Error::not_enabled("engine")),
        }
    }

    /// Checks whether a message may be submitted right now.
    pub(crate) fn check_submit(&self, blocking: bool) -> Result<()> {
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(Error::not_enabled("engine"));
        }
        if !self.inner.present.load(Ordering::Acquire) {
            return Err(Error::DeviceNotPresent);
        }
        if blocking && held_by_current_thread() {
            return Err(Error::BlockingNotAllowed);
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
