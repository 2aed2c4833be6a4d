//! Sub-command state machine.
//!
//! After every terminal reply the machine decides whether the in-flight
//! message needs another wire command or is complete. Each operation has
//! its own branch listing the command that follows the current one and how
//! a failed step is treated.
//!
//! | Operation | Failed step handling |
//! |-----------|----------------------|
//! | Reset | First step aborts; later steps are skipped over |
//! | Restore | Any failure aborts |
//! | NetworkAttach | Any failure aborts, PDP deactivate optionally tolerated |
//! | NetworkDetach | Packet detach tolerated |
//! | ConnStart | Start failure recorded, final status check decides |
//! | ConnSend | `SEND FAIL` retried while attempts remain |

// ============================================================================
// Imports
// ============================================================================

use tracing::{debug, info, warn};

use crate::engine::EngineOptions;
use crate::engine::state::{CoreState, Ctx, Pending};
use crate::engine::timeout::TimeoutAction;
use crate::error::{Error, Result};
use crate::pipeline::{ConnectResult, Message, Operation};

use super::command::Cmd;
use super::event::{Dispatch, Event};

// ============================================================================
// Step
// ============================================================================

/// Outcome of one advance.
#[derive(Debug)]
pub(crate) enum Step {
    /// Emit the given command next.
    Continue(Cmd),
    /// The message is complete with this result.
    Done(Result<()>),
}

// ============================================================================
// Entry Point
// ============================================================================

/// Advances the in-flight message after a terminal reply.
///
/// On [`Step::Continue`] the next command is selected and marked for
/// emission; on [`Step::Done`] the result is stored and the message is
/// marked for release. Both happen after the events raised here are
/// dispatched.
pub(crate) fn process(st: &mut CoreState, ctx: &Ctx<'_>, ok: bool) {
    let Some(mut msg) = st.msg.take() else {
        return;
    };

    match advance(&mut msg, st, ctx.options, ok) {
        Step::Continue(next) => {
            debug!(from = ?msg.cmd, to = ?next, step = msg.step + 1, "Next sub-command");
            msg.cmd = next;
            msg.step = msg.step.saturating_add(1);
            msg.error = None;
            st.pending = Pending::Emit;
        }
        Step::Done(result) => {
            debug!(op = msg.op.name(), cmd = ?msg.cmd, ok = result.is_ok(), "Message complete");
            msg.result = result;
            st.pending = Pending::Release;
        }
    }

    st.msg = Some(msg);
}

pub(crate) fn advance(msg: &mut Message, st: &mut CoreState, options: &EngineOptions, ok: bool) -> Step {
    match msg.op {
        Operation::Reset { .. } => reset(msg, st, ok),
        Operation::Restore => restore(msg, st, ok),
        Operation::NetworkAttach { .. } => network_attach(msg, st, options, ok),
        Operation::NetworkDetach => network_detach(msg, st, ok),
        Operation::OperatorScan { .. } => operator_scan(msg, st, ok),
        Operation::ConnStart(_) => conn_start(msg, st, options, ok),
        Operation::ConnClose { .. } => conn_close(msg, st, ok),
        Operation::ConnSend(_) => conn_send(msg, st, options, ok),
        Operation::SetFunc { .. } | Operation::SignalQuality { .. } | Operation::ConnStatus => {
            Step::Done(outcome(msg, ok))
        }
    }
}

fn outcome(msg: &mut Message, ok: bool) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(msg.error.take().unwrap_or(Error::Failed))
    }
}

// ============================================================================
// Device Branches
// ============================================================================

fn reset(msg: &mut Message, st: &mut CoreState, ok: bool) -> Step {
    let next = match msg.cmd {
        Cmd::Reset if !ok => {
            st.push(Event::Reset { ok: false });
            return Step::Done(outcome(msg, ok));
        }
        Cmd::Reset => Cmd::Ate0,
        Cmd::Ate0 => Cmd::CfunSet,
        Cmd::CfunSet => Cmd::CmeeSet,
        Cmd::CmeeSet => Cmd::Cgmi,
        Cmd::Cgmi => Cmd::Cgmm,
        Cmd::Cgmm => Cmd::Cgsn,
        Cmd::Cgsn => Cmd::Cgmr,
        Cmd::Cgmr => {
            info!(
                manufacturer = %st.device.manufacturer,
                model = %st.device.model,
                "Device identified"
            );
            st.push(Event::DeviceIdentified {
                info: st.device.clone(),
            });
            Cmd::CregSet
        }
        Cmd::CregSet => Cmd::ClccSet,
        Cmd::ClccSet => Cmd::CpinGet,
        _ => {
            let result = outcome(msg, ok);
            st.push(Event::Reset {
                ok: result.is_ok(),
            });
            return Step::Done(result);
        }
    };

    if !ok {
        debug!(cmd = ?msg.cmd, "Reset step failed, continuing");
    }
    Step::Continue(next)
}

fn restore(msg: &mut Message, st: &mut CoreState, ok: bool) -> Step {
    if ok && msg.cmd == Cmd::Restore {
        return Step::Continue(Cmd::Ate0);
    }
    let result = outcome(msg, ok);
    st.push(Event::Restore {
        ok: result.is_ok(),
    });
    Step::Done(result)
}

fn operator_scan(msg: &mut Message, st: &mut CoreState, ok: bool) -> Step {
    let result = outcome(msg, ok);
    let operators = match &msg.op {
        Operation::OperatorScan { operators } => operators.clone(),
        _ => Vec::new(),
    };
    st.push(Event::OperatorScan {
        operators,
        ok: result.is_ok(),
    });
    Step::Done(result)
}

// ============================================================================
// Network Branches
// ============================================================================

fn network_attach(msg: &mut Message, st: &mut CoreState, options: &EngineOptions, ok: bool) -> Step {
    if !ok {
        if msg.cmd == Cmd::CgactSet0 && options.ignore_pdp_deactivate_result {
            debug!("Ignoring PDP deactivate result");
        } else {
            warn!(cmd = ?msg.cmd, "Network attach failed");
            return Step::Done(outcome(msg, ok));
        }
    }

    let next = match msg.cmd {
        Cmd::CgactSet0 => Cmd::CgattSet1,
        Cmd::CgattSet1 => Cmd::Cipshut,
        Cmd::Cipshut => {
            // Shutting the IP stack drops every modem-side connection.
            st.close_all(true);
            Cmd::CipmuxSet
        }
        Cmd::CipmuxSet => Cmd::CiprxgetSet,
        Cmd::CiprxgetSet => Cmd::CsttSet,
        Cmd::CsttSet => Cmd::Ciicr,
        Cmd::Ciicr => Cmd::Cifsr,
        _ => {
            st.network.attached = true;
            info!(ip = ?st.network.ip, "Network attached");
            st.push(Event::NetworkAttached { ip: st.network.ip });
            return Step::Done(Ok(()));
        }
    };
    Step::Continue(next)
}

fn network_detach(msg: &mut Message, st: &mut CoreState, ok: bool) -> Step {
    if msg.cmd == Cmd::CgattSet0 {
        return Step::Continue(Cmd::CgactSet0);
    }
    if ok {
        st.network_detached(true);
    }
    Step::Done(outcome(msg, ok))
}

// ============================================================================
// Connection Branches
// ============================================================================

fn conn_start(msg: &mut Message, st: &mut CoreState, options: &EngineOptions, ok: bool) -> Step {
    match msg.cmd {
        Cmd::Cipstatus if msg.step == 0 => {
            if !ok {
                let err = outcome(msg, ok).err().unwrap_or(Error::Failed);
                return fail_start(msg, st, err);
            }
            if !st.network.attached {
                return fail_start(msg, st, Error::NoIp);
            }
            Step::Continue(Cmd::Cipssl)
        }
        Cmd::Cipssl => {
            if !ok {
                let err = outcome(msg, ok).err().unwrap_or(Error::Failed);
                return fail_start(msg, st, err);
            }
            Step::Continue(Cmd::Cipstart)
        }
        Cmd::Cipstart => {
            if let Some(start) = msg.conn_start_mut()
                && !ok
                && start.result == ConnectResult::Pending
            {
                start.result = ConnectResult::Failed;
            }
            Step::Continue(Cmd::Cipstatus)
        }
        _ => {
            let interval = options.conn_poll_interval();
            let Some(start) = msg.conn_start_mut() else {
                return Step::Done(Err(Error::Failed));
            };
            let slot = start.num.filter(|&num| num < st.conns.len());
            let (ConnectResult::Connected, Some(num)) = (start.result, slot) else {
                warn!(host = %start.host, port = start.port, result = ?start.result, "Connect failed");
                return fail_start(msg, st, Error::ConnectFailed);
            };

            let handle = st.conns[num].activate(
                start.conn_type,
                &start.host,
                start.port,
                start.listener.clone(),
            );
            let poll = st.timeouts.insert(interval, TimeoutAction::ConnPoll(handle));
            st.conns[num].poll_timeout = Some(poll);
            start.handle = Some(handle);

            info!(%handle, host = %start.host, port = start.port, "Connection active");
            st.push_conn(Event::ConnActive {
                conn: handle,
                client: true,
            });
            Step::Done(Ok(()))
        }
    }
}

fn fail_start(msg: &mut Message, st: &mut CoreState, err: Error) -> Step {
    emit_failed(msg, st);
    Step::Done(Err(err))
}

/// Raises the failure event of a message whose next command could not be
/// written. Only a connection start has one, [`Event::ConnError`].
pub(crate) fn emit_failed(msg: &mut Message, st: &mut CoreState) {
    if let Some(start) = msg.conn_start_mut() {
        st.events.push(Dispatch::conn(
            Event::ConnError {
                host: start.host.clone(),
                port: start.port,
                conn_type: start.conn_type,
            },
            start.listener.clone(),
        ));
    }
}

fn conn_close(msg: &mut Message, st: &mut CoreState, ok: bool) -> Step {
    let result = outcome(msg, ok);
    if result.is_err()
        && let Operation::ConnClose { conn } = msg.op
        && let Ok(slot) = st.conn(conn)
    {
        slot.closing = false;
        let (client, listener) = (slot.client, slot.listener.clone());
        st.events.push(Dispatch::conn(
            Event::ConnClose {
                conn,
                client,
                forced: true,
                ok: false,
            },
            listener,
        ));
    }
    Step::Done(result)
}

fn conn_send(msg: &mut Message, st: &mut CoreState, options: &EngineOptions, ok: bool) -> Step {
    let Some(send) = msg.conn_send_mut() else {
        return Step::Done(outcome(msg, ok));
    };

    if ok {
        send.sent += send.chunk;
        send.tries = options.max_send_retries;
        if send.remaining() > 0 {
            return Step::Continue(Cmd::Cipsend);
        }
    } else if send.send_failed && send.tries > 1 {
        send.tries -= 1;
        warn!(num = send.conn.num(), tries_left = send.tries, "Send failed, retrying");
        return Step::Continue(Cmd::Cipsend);
    }

    let (conn, sent) = (send.conn, send.sent);
    let result = outcome(msg, ok);
    debug!(%conn, sent, ok = result.is_ok(), "Send complete");
    st.push_conn(Event::ConnSend {
        conn,
        sent,
        ok: result.is_ok(),
    });
    Step::Done(result)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use bytes::Bytes;

    use crate::pipeline::{ConnSend, ConnStart};

    fn options() -> EngineOptions {
        EngineOptions::default()
    }

    fn reset_msg() -> Message {
        Message::new(
            Operation::Reset {
                delay: Duration::ZERO,
                hw_reset: false,
            },
            Duration::from_secs(1),
        )
    }

    fn drive(msg: &mut Message, st: &mut CoreState, replies: &[bool]) -> Vec<Cmd> {
        let mut seen = vec![msg.cmd];
        for &ok in replies {
            match advance(msg, st, &options(), ok) {
                Step::Continue(next) => {
                    msg.cmd = next;
                    msg.step += 1;
                    seen.push(next);
                }
                Step::Done(result) => {
                    msg.result = result;
                    break;
                }
            }
        }
        seen
    }

    #[test]
    fn test_reset_sequence_identifies_before_registration() {
        let mut st = CoreState::new(&options());
        let mut msg = reset_msg();

        let cmds = drive(&mut msg, &mut st, &[true; 12]);
        assert_eq!(
            cmds,
            vec![
                Cmd::Reset,
                Cmd::Ate0,
                Cmd::CfunSet,
                Cmd::CmeeSet,
                Cmd::Cgmi,
                Cmd::Cgmm,
                Cmd::Cgsn,
                Cmd::Cgmr,
                Cmd::CregSet,
                Cmd::ClccSet,
                Cmd::CpinGet,
            ]
        );
        let names: Vec<_> = st.events.iter().map(|d| d.event.name()).collect();
        assert_eq!(names, vec!["device_identified", "reset"]);
        assert!(msg.result.is_ok());
    }

    #[test]
    fn test_reset_tolerates_echo_failure() {
        let mut st = CoreState::new(&options());
        let mut msg = reset_msg();

        let cmds = drive(&mut msg, &mut st, &[true, false, true]);
        assert_eq!(cmds, vec![Cmd::Reset, Cmd::Ate0, Cmd::CfunSet, Cmd::CmeeSet]);
    }

    #[test]
    fn test_reset_aborts_on_first_step() {
        let mut st = CoreState::new(&options());
        let mut msg = reset_msg();

        let cmds = drive(&mut msg, &mut st, &[false]);
        assert_eq!(cmds, vec![Cmd::Reset]);
        assert!(matches!(msg.result, Err(Error::Failed)));
        assert!(matches!(st.events[0].event, Event::Reset { ok: false }));
    }

    #[test]
    fn test_attach_tolerates_pdp_deactivate() {
        let mut st = CoreState::new(&options());
        let mut msg = Message::new(
            Operation::NetworkAttach {
                apn: "internet".into(),
                user: String::new(),
                pass: String::new(),
            },
            Duration::from_secs(1),
        );

        let cmds = drive(&mut msg, &mut st, &[false, true, false]);
        assert_eq!(cmds, vec![Cmd::CgactSet0, Cmd::CgattSet1, Cmd::Cipshut]);
        assert!(msg.result.is_err());
        assert!(!st.network.attached);
    }

    #[test]
    fn test_attach_strict_pdp_deactivate() {
        let mut st = CoreState::new(&options());
        let strict = options().with_ignore_pdp_deactivate_result(false);
        let mut msg = Message::new(
            Operation::NetworkAttach {
                apn: "internet".into(),
                user: String::new(),
                pass: String::new(),
            },
            Duration::from_secs(1),
        );

        let step = advance(&mut msg, &mut st, &strict, false);
        assert!(matches!(step, Step::Done(Err(Error::Failed))));
    }

    #[test]
    fn test_conn_start_failure_emits_error() {
        let mut st = CoreState::new(&options());
        st.network.attached = true;
        let mut msg = Message::new(
            Operation::ConnStart(ConnStart {
                conn_type: crate::net::ConnType::Tcp,
                host: "example.com".into(),
                port: 80,
                listener: None,
                num: Some(5),
                result: ConnectResult::Pending,
                handle: None,
            }),
            Duration::from_secs(1),
        );

        let cmds = drive(&mut msg, &mut st, &[true, true, false, true]);
        assert_eq!(
            cmds,
            vec![Cmd::Cipstatus, Cmd::Cipssl, Cmd::Cipstart, Cmd::Cipstatus]
        );
        assert!(matches!(msg.result, Err(Error::ConnectFailed)));
        assert!(matches!(st.events[0].event, Event::ConnError { port: 80, .. }));
        assert!(!st.conns[5].active);
    }

    #[test]
    fn test_conn_start_requires_attach() {
        let mut st = CoreState::new(&options());
        let mut msg = Message::new(
            Operation::ConnStart(ConnStart {
                conn_type: crate::net::ConnType::Udp,
                host: "10.0.0.1".into(),
                port: 53,
                listener: None,
                num: None,
                result: ConnectResult::Pending,
                handle: None,
            }),
            Duration::from_secs(1),
        );

        drive(&mut msg, &mut st, &[true]);
        assert!(matches!(msg.result, Err(Error::NoIp)));
    }

    #[test]
    fn test_conn_send_retries_then_gives_up() {
        let mut st = CoreState::new(&options());
        let handle = st.conns[0].activate_for_test();
        let mut msg = Message::new(
            Operation::ConnSend(ConnSend::new(handle, Bytes::from_static(b"abc"), 2)),
            Duration::from_secs(1),
        );
        if let Some(send) = msg.conn_send_mut() {
            send.chunk = 3;
            send.send_failed = true;
        }

        let cmds = drive(&mut msg, &mut st, &[false, false]);
        assert_eq!(cmds, vec![Cmd::Cipsend, Cmd::Cipsend]);
        assert!(msg.result.is_err());
        assert!(matches!(
            st.events[0].event,
            Event::ConnSend { sent: 0, ok: false, .. }
        ));
    }
}
