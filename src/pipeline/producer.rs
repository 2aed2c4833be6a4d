//! Producer task.
//!
//! Executes queued messages strictly one at a time. For every message the
//! task emits the first wire command under the core lock, parks the
//! message in the shared state together with a oneshot sender, then waits
//! (bounded by the message block time) until the parser hands it back.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tracing::{debug, trace, warn};

use crate::Engine;
use crate::engine::EngineInner;
use crate::engine::options::duration_ms;
use crate::error::{Error, Result};
use crate::protocol::{Event, subcmd};

use super::message::{Message, Operation};

// ============================================================================
// Constants
// ============================================================================

/// How long the hardware reset line stays asserted.
const HW_RESET_PULSE: Duration = Duration::from_millis(200);

// ============================================================================
// Task
// ============================================================================

/// Runs until every engine handle is gone.
pub(crate) async fn run(inner: Weak<EngineInner>, mut rx: mpsc::Receiver<Box<Message>>) {
    while let Some(msg) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        execute(&Engine::from_inner(inner), msg).await;
    }
    debug!("Producer task terminated");
}

async fn execute(engine: &Engine, mut msg: Box<Message>) {
    trace!(op = msg.op.name(), "Executing message");

    if !engine.is_device_present() {
        finish(engine, msg, Err(Error::DeviceNotPresent));
        return;
    }

    if let Operation::Reset { delay, hw_reset } = &mut msg.op {
        if !delay.is_zero() {
            sleep(*delay).await;
        }
        let transport = &engine.inner.transport;
        if transport.hw_reset(true) {
            sleep(HW_RESET_PULSE).await;
            transport.hw_reset(false);
            *hw_reset = true;
            debug!("Hardware reset pulse applied");
        }
        engine.with_state(|st, _| st.reset_everything(false));
    }

    let block_time = msg.block_time;
    let (tx, mut rx) = oneshot::channel();

    let started = engine.with_state(move |st, ctx| match (msg.initiate)(&mut *msg, st, ctx) {
        Ok(()) => {
            st.msg = Some(msg);
            st.sync = Some(tx);
            Ok(())
        }
        Err(err) => {
            subcmd::emit_failed(&mut msg, st);
            Err((msg, err))
        }
    });
    if let Err((msg, err)) = started {
        warn!(cmd = ?msg.cmd, %err, "Failed to start command");
        finish(engine, msg, Err(err));
        return;
    }

    match timeout(block_time, &mut rx).await {
        Ok(Ok(mut msg)) => {
            let result = msg.take_result();
            finish(engine, msg, result);
        }
        Ok(Err(_)) => debug!("In-flight message dropped"),
        Err(_) => on_timeout(engine, rx, block_time),
    }
}

/// Reclaims the in-flight message after its block time expired.
///
/// The parser may have released the message in the meantime; in that case
/// it is already waiting in `rx` and completes normally.
fn on_timeout(engine: &Engine, mut rx: oneshot::Receiver<Box<Message>>, block_time: Duration) {
    let reclaimed = engine.with_state(|st, _| {
        let msg = st.msg.take();
        st.sync = None;
        if let Some(msg) = &msg {
            st.push(Event::CmdTimeout { cmd: msg.cmd });
        }
        msg
    });

    let Some(msg) = reclaimed else {
        if let Ok(mut msg) = rx.try_recv() {
            let result = msg.take_result();
            finish(engine, msg, result);
        }
        return;
    };

    let err = match msg.op {
        Operation::ConnStart(_) => Error::ConnectTimeout,
        _ => Error::command_timeout(msg.cmd, duration_ms(block_time)),
    };
    warn!(op = msg.op.name(), %err, "Command timed out");
    finish(engine, msg, Err(err));
}

/// Reports the final result once: callback first, then the waiting caller.
fn finish(engine: &Engine, mut msg: Box<Message>, result: Result<()>) {
    if let Err(err) = &result {
        debug!(op = msg.op.name(), %err, "Message failed");
    }

    if let Some(on_done) = msg.on_done.take() {
        let _guard = engine.inner.core.lock();
        on_done(&result);
    }

    msg.result = result;
    if let Some(reply) = msg.reply.take()
        && reply.send(msg).is_err()
    {
        debug!("Caller stopped waiting");
    }
}
