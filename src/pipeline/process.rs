//! Process task.
//!
//! Parses input queued by [`Engine::feed`] and runs expired timeouts. The
//! task sleeps until either new input arrives or the earliest timeout is
//! due; a newly scheduled earlier timeout wakes it through the mailbox.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Weak;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use crate::Engine;
use crate::engine::{EngineInner, ProcessEvent};

// ============================================================================
// Task
// ============================================================================

/// Runs until every engine handle is gone.
pub(crate) async fn run(inner: Weak<EngineInner>, mut rx: mpsc::Receiver<ProcessEvent>) {
    loop {
        let deadline = match inner.upgrade() {
            Some(inner) => Engine::from_inner(inner).next_deadline(),
            None => break,
        };

        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    debug!("Process mailbox closed");
                    break;
                };
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let engine = Engine::from_inner(inner);
                if let ProcessEvent::Input(data) = event {
                    engine.process_input(&data);
                }
                engine.run_timeouts();
            }

            () = sleep_until(deadline.unwrap_or_else(far_future)), if deadline.is_some() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                Engine::from_inner(inner).run_timeouts();
            }
        }
    }
    debug!("Process task terminated");
}

fn far_future() -> Instant {
    Instant::now() + std::time::Duration::from_secs(86_400)
}
