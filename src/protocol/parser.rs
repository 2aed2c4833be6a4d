//! Byte parser for modem output.
//!
//! [`step`] consumes input until one unit of work is complete: a full
//! line, the send prompt, or a slice of announced receive data. The engine
//! dispatches the events raised by that unit before feeding the rest, so
//! listeners always observe replies in wire order.
//!
//! # Line Classes
//!
//! | Line | Meaning |
//! |------|---------|
//! | `OK`, `SHUT OK`, `SEND OK` | Success of the command in flight |
//! | `ERROR`, `FAIL`, `+CME ERROR: n`, `+CMS ERROR: n` | Failure of the command in flight |
//! | `+TOKEN: ...` | Status report, solicited or not |
//! | `n, CONNECT OK` and friends | Multi-connection results |
//! | `C: ...`, `STATE: ...` | `AT+CIPSTATUS` table |
//! | `+RECEIVE,n,len:` | Announces `len` raw bytes for connection `n` |

// ============================================================================
// Imports
// ============================================================================

use std::net::Ipv4Addr;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, trace, warn};

use crate::engine::state::{CoreState, Ctx};
use crate::engine::{CallInfo, MAX_CONNS_LIMIT, OperatorInfo, RegStatus, SimState};
use crate::error::Error;
use crate::identifiers::ConnHandle;
use crate::net::Pbuf;
use crate::pipeline::{ConnectResult, Operation};

use super::command::Cmd;
use super::event::Event;
use super::line::LineBuffer;
use super::subcmd;

// ============================================================================
// Patterns
// ============================================================================

static CME_ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+CM[ES] ERROR: (\d+)").expect("cme regex is valid"));

static CONN_REPLY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+), (CONNECT OK|CONNECT FAIL|ALREADY CONNECT|SEND OK|SEND FAIL|CLOSE OK|CLOSED)\r\n$")
        .expect("connection reply regex is valid")
});

static CONN_STATUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^C: (\d+),(\d*),"([^"]*)","([^"]*)","([^"]*)","([^"]*)""#)
        .expect("connection status regex is valid")
});

static RECEIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+RECEIVE,(\d+),(\d+):").expect("receive regex is valid"));

static CREG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+CREG: (?:\d+,)?(\d+)").expect("creg regex is valid"));

static CSQ: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+CSQ: (\d+),(\d+)").expect("csq regex is valid"));

static CLCC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\+CLCC: (\d+),(\d),(\d),\d,\d(?:,"([^"]*)")?"#).expect("clcc regex is valid")
});

static COPS_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\((\d),"([^"]*)","([^"]*)","([^"]*)"[^)]*\)"#).expect("cops entry regex is valid")
});

static COPS_CURRENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\+COPS: \d+,\d+,"([^"]*)""#).expect("cops regex is valid"));

// ============================================================================
// ParserState
// ============================================================================

/// Receive cursor armed by `+RECEIVE`.
#[derive(Debug)]
struct RecvCursor {
    /// Target connection, `None` if the slot was inactive when announced.
    handle: Option<ConnHandle>,
    rem: usize,
    pbuf: Option<Pbuf>,
    offset: usize,
}

#[derive(Debug)]
pub(crate) struct ParserState {
    line: LineBuffer,
    prev1: u8,
    prev2: u8,
    recv: Option<RecvCursor>,
}

impl ParserState {
    pub(crate) fn new() -> Self {
        Self {
            line: LineBuffer::new(),
            prev1: 0,
            prev2: 0,
            recv: None,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.line.clear();
        self.prev1 = 0;
        self.prev2 = 0;
        if let Some(pbuf) = self.recv.take().and_then(|cursor| cursor.pbuf) {
            pbuf.free();
        }
    }

    /// Returns `true` while announced receive data is being consumed.
    #[cfg(test)]
    pub(crate) fn in_receive(&self) -> bool {
        self.recv.is_some()
    }
}

// ============================================================================
// Entry Point
// ============================================================================

/// Consumes bytes from `data` up to the end of one unit of work.
///
/// Returns the number of bytes consumed, at least one for non-empty input.
pub(crate) fn step(st: &mut CoreState, ctx: &Ctx<'_>, data: &[u8]) -> usize {
    if st.parser.recv.is_some() {
        return recv_bytes(st, ctx, data);
    }

    for (idx, &ch) in data.iter().enumerate() {
        let prompt = ch == b' ' && st.parser.prev1 == b'>' && st.parser.prev2 == b'\n';
        st.parser.prev2 = st.parser.prev1;
        st.parser.prev1 = ch;

        if prompt && handle_prompt(st, ctx) {
            return idx + 1;
        }

        if st.parser.line.push(ch) {
            let line = st.parser.line.take();
            handle_line(st, ctx, &line);
            return idx + 1;
        }
    }

    data.len()
}

// ============================================================================
// Receive Data
// ============================================================================

fn arm_receive(st: &mut CoreState, num: usize, len: usize) {
    if len == 0 {
        return;
    }
    let handle = st
        .conns
        .get(num)
        .filter(|conn| conn.active)
        .map(|conn| conn.handle());
    debug!(num, len, "Receive announced");
    st.parser.recv = Some(RecvCursor {
        handle,
        rem: len,
        pbuf: None,
        offset: 0,
    });
}

fn recv_bytes(st: &mut CoreState, ctx: &Ctx<'_>, data: &[u8]) -> usize {
    let Some(cursor) = st.parser.recv.as_mut() else {
        return 0;
    };

    let accept = cursor.handle.is_some_and(|handle| {
        st.conns
            .get(handle.num())
            .is_some_and(|conn| conn.matches(handle) && !conn.closing)
    });

    if !accept {
        let n = data.len().min(cursor.rem);
        cursor.rem -= n;
        if let Some(pbuf) = cursor.pbuf.take() {
            pbuf.free();
        }
        if cursor.rem == 0 {
            st.parser.recv = None;
        }
        trace!(len = n, "Discarding receive data");
        return n;
    }

    if cursor.pbuf.is_none() {
        cursor.pbuf = Some(Pbuf::new(cursor.rem.min(ctx.options.max_recv_pbuf)));
        cursor.offset = 0;
    }
    let Some(pbuf) = cursor.pbuf.as_ref() else {
        return 0;
    };

    let n = data.len().min(pbuf.len() - cursor.offset);
    if let Err(err) = pbuf.take(&data[..n], cursor.offset) {
        warn!(%err, "Receive buffer write failed");
    }
    cursor.offset += n;
    cursor.rem -= n;

    let delivered = if cursor.offset == pbuf.len() {
        cursor.pbuf.take()
    } else {
        None
    };
    let handle = cursor.handle;
    if cursor.rem == 0 {
        st.parser.recv = None;
    }

    if let (Some(pbuf), Some(handle)) = (delivered, handle) {
        if let Some(conn) = st.conns.get_mut(handle.num()) {
            conn.total_recved += pbuf.len();
        }
        debug!(%handle, len = pbuf.len(), "Data received");
        st.push_conn(Event::ConnRecv { conn: handle, pbuf });
    }

    n
}

// ============================================================================
// Send Prompt
// ============================================================================

fn handle_prompt(st: &mut CoreState, ctx: &Ctx<'_>) -> bool {
    let Some(msg) = st.msg.as_mut() else {
        return false;
    };
    if msg.cmd != Cmd::Cipsend {
        return false;
    }
    let Some(send) = msg.conn_send_mut() else {
        return false;
    };
    if !send.wait_prompt {
        return false;
    }

    send.wait_prompt = false;
    let chunk = send.data.slice(send.sent..send.sent + send.chunk);
    st.parser.line.clear();
    debug!(num = send.conn.num(), len = chunk.len(), "Sending payload");

    if let Err(err) = ctx.send_raw(&chunk) {
        warn!(%err, "Payload write failed");
        msg.error = Some(err);
        subcmd::process(st, ctx, false);
    }
    true
}

// ============================================================================
// Lines
// ============================================================================

fn handle_line(st: &mut CoreState, ctx: &Ctx<'_>, line: &str) {
    if line == "\r\n" {
        return;
    }
    trace!(line = %line.trim_end(), "AT <");

    let cmd = st.msg.as_ref().map_or(Cmd::Idle, |msg| msg.cmd);
    let mut is_ok = false;
    let mut is_error = false;

    match line {
        "OK\r\n" => is_ok = cmd != Cmd::Idle && !cmd.has_custom_terminator(),
        "SHUT OK\r\n" => is_ok = cmd == Cmd::Cipshut,
        "SEND OK\r\n" => is_ok = cmd == Cmd::Cipsend,
        "ERROR\r\n" | "FAIL\r\n" => is_error = cmd != Cmd::Idle,
        _ if line.starts_with("+CME ERROR") || line.starts_with("+CMS ERROR") => {
            is_error = cmd != Cmd::Idle;
            let code = CME_ERROR
                .captures(line)
                .and_then(|caps| caps[1].parse::<u16>().ok());
            if let (Some(code), Some(msg)) = (code, st.msg.as_mut()) {
                msg.error = Some(Error::modem(code));
            }
        }
        _ if line.starts_with('+') => handle_plus(st, cmd, line),
        _ if line.starts_with("C: ") => handle_conn_status(st, cmd, line, &mut is_ok),
        _ if line.starts_with("STATE: ") => handle_ip_state(st, cmd, line, &mut is_ok),
        _ if line.starts_with("AT") => trace!("Echo ignored"),
        _ => {
            if let Some(caps) = CONN_REPLY.captures(line) {
                let num = caps[1].parse().unwrap_or(usize::MAX);
                handle_conn_reply(st, cmd, num, &caps[2], &mut is_ok, &mut is_error);
            } else {
                handle_text(st, cmd, line, &mut is_ok);
            }
        }
    }

    if is_ok || is_error {
        subcmd::process(st, ctx, is_ok);
    }
}

fn handle_plus(st: &mut CoreState, cmd: Cmd, line: &str) {
    if line.starts_with("+CREG:") {
        let Some(code) = CREG.captures(line).and_then(|c| c[1].parse::<u8>().ok()) else {
            return;
        };
        let status = RegStatus::from_code(code);
        if st.network.reg != status {
            info!(?status, "Registration changed");
            st.network.reg = status;
            st.push(Event::NetworkRegChanged { status });
        }
    } else if let Some(text) = line.strip_prefix("+CPIN: ") {
        let state = SimState::parse(text);
        if st.sim != state {
            info!(?state, "SIM state changed");
            st.sim = state;
            st.push(Event::SimStateChanged { state });
        }
    } else if line.starts_with("+CSQ:") {
        let Some(raw) = CSQ.captures(line).and_then(|c| c[1].parse::<i16>().ok()) else {
            return;
        };
        let rssi = if raw == 99 { 0 } else { -113 + 2 * raw };
        st.network.rssi = rssi;
        if let Some(msg) = st.msg.as_mut()
            && let Operation::SignalQuality { rssi: out } = &mut msg.op
        {
            *out = Some(rssi);
        }
        st.push(Event::SignalStrength { rssi });
    } else if line.starts_with("+CLCC:") {
        let Some(caps) = CLCC.captures(line) else {
            return;
        };
        let call = CallInfo {
            index: caps[1].parse().unwrap_or_default(),
            incoming: &caps[2] == "1",
            state: caps[3].parse().unwrap_or_default(),
            number: caps.get(4).map(|m| m.as_str().to_owned()).unwrap_or_default(),
        };
        st.push(Event::CallChanged { call });
    } else if line.starts_with("+COPS:") {
        if cmd == Cmd::CopsScan {
            let found = COPS_ENTRY.captures_iter(line).map(|caps| OperatorInfo {
                status: caps[1].parse().unwrap_or_default(),
                long_name: caps[2].to_owned(),
                short_name: caps[3].to_owned(),
                numeric: caps[4].to_owned(),
            });
            if let Some(msg) = st.msg.as_mut()
                && let Operation::OperatorScan { operators } = &mut msg.op
            {
                operators.extend(found);
            }
        } else if let Some(caps) = COPS_CURRENT.captures(line) {
            st.network.operator = Some(caps[1].to_owned());
        }
    } else if line.starts_with("+PDP: DEACT") {
        warn!("PDP context deactivated by network");
        st.network_detached(false);
    } else if let Some(caps) = RECEIVE.captures(line) {
        let num = caps[1].parse().unwrap_or(usize::MAX);
        let len = caps[2].parse().unwrap_or_default();
        arm_receive(st, num, len);
    }
}

fn handle_conn_reply(
    st: &mut CoreState,
    cmd: Cmd,
    num: usize,
    text: &str,
    is_ok: &mut bool,
    is_error: &mut bool,
) {
    match text {
        "CONNECT OK" | "CONNECT FAIL" | "ALREADY CONNECT" if cmd == Cmd::Cipstart => {
            let Some(start) = st.msg.as_mut().and_then(|msg| msg.conn_start_mut()) else {
                return;
            };
            if start.num != Some(num) {
                return;
            }
            start.result = match text {
                "CONNECT OK" => ConnectResult::Connected,
                "ALREADY CONNECT" => ConnectResult::Already,
                _ => ConnectResult::Failed,
            };
            debug!(num, result = ?start.result, "Connect result");
            *is_ok = start.result == ConnectResult::Connected;
            *is_error = !*is_ok;
        }
        "SEND OK" | "SEND FAIL" if cmd == Cmd::Cipsend => {
            let Some(send) = st.msg.as_mut().and_then(|msg| msg.conn_send_mut()) else {
                return;
            };
            if send.conn.num() != num {
                return;
            }
            send.send_failed = text == "SEND FAIL";
            *is_ok = !send.send_failed;
            *is_error = send.send_failed;
        }
        "CLOSE OK" if cmd == Cmd::Cipclose => {
            let target = st.msg.as_ref().and_then(|msg| match msg.op {
                Operation::ConnClose { conn } => Some(conn.num()),
                _ => None,
            });
            if target == Some(num) {
                st.conn_closed(num, true);
                *is_ok = true;
            }
        }
        "CLOSED" => st.conn_closed(num, false),
        _ => trace!(num, text, "Unexpected connection reply"),
    }
}

fn handle_conn_status(st: &mut CoreState, cmd: Cmd, line: &str, is_ok: &mut bool) {
    let Some(caps) = CONN_STATUS.captures(line) else {
        return;
    };
    let Ok(num) = caps[1].parse::<usize>() else {
        return;
    };
    let state = &caps[6];

    if let Some(conn) = st.conns.get_mut(num) {
        conn.bearer = caps[2].parse().ok();
        let gone = matches!(state, "CLOSED" | "INITIAL" | "CLOSING" | "REMOTE CLOSING");
        if conn.active && gone {
            debug!(num, state, "Status reports connection gone");
            st.conn_closed(num, false);
        }
    }

    // Slots past `max_conns` are listed but not tracked.
    if cmd == Cmd::Cipstatus && num + 1 == MAX_CONNS_LIMIT {
        *is_ok = true;
    }
}

fn handle_ip_state(st: &mut CoreState, cmd: Cmd, line: &str, is_ok: &mut bool) {
    let state = line.trim_start_matches("STATE: ").trim_end();
    trace!(state, "IP state");
    if state == "PDP DEACT" {
        st.network_detached(false);
    }
    // Without an attached context the modem prints no connection table.
    if cmd == Cmd::Cipstatus && !st.network.attached {
        *is_ok = true;
    }
}

fn handle_text(st: &mut CoreState, cmd: Cmd, line: &str, is_ok: &mut bool) {
    let text = line.trim();
    match text {
        "Call Ready" => {
            st.call_ready = true;
            st.push(Event::CallReady);
        }
        "SMS Ready" => {
            st.sms_ready = true;
            st.push(Event::SmsReady);
        }
        "RDY" => info!("Modem ready"),
        _ if cmd.is_identification() => {
            let device = &mut st.device;
            match cmd {
                Cmd::Cgmi => device.manufacturer = text.to_owned(),
                Cmd::Cgmm => device.model = text.to_owned(),
                Cmd::Cgsn => device.serial = text.to_owned(),
                _ => device.revision = text.trim_start_matches("Revision:").to_owned(),
            }
        }
        _ if cmd == Cmd::Cifsr => {
            if let Ok(ip) = text.parse::<Ipv4Addr>() {
                debug!(%ip, "Local IP");
                st.network.ip = Some(ip);
                *is_ok = true;
            }
        }
        _ => trace!(line = text, "Unhandled line"),
    }
}

// ============================================================================
// Tests
// ============================================================================
