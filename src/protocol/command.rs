//! Wire command definitions and emission.
//!
//! [`Cmd`] names every AT command the engine issues. [`initiate_cmd`] is the
//! default processing function of a [`Message`]: it formats the command
//! currently selected on the message, using the operation parameters, and
//! writes it to the transport.
//!
//! # Command Families
//!
//! | Family | Commands |
//! |--------|----------|
//! | Basic | `AT`, `ATE0`/`ATE1`, `AT+CFUN`, `AT+CMEE`, `AT&F` |
//! | Identification | `AT+CGMI`, `AT+CGMM`, `AT+CGSN`, `AT+CGMR` |
//! | Status | `AT+CREG`, `AT+CLCC`, `AT+CPIN?`, `AT+CSQ`, `AT+COPS=?` |
//! | Packet data | `AT+CGACT`, `AT+CGATT`, `AT+CSTT`, `AT+CIICR`, `AT+CIFSR` |
//! | TCP/IP | `AT+CIPSHUT`, `AT+CIPMUX`, `AT+CIPRXGET`, `AT+CIPSTATUS`, `AT+CIPSSL`, `AT+CIPSTART`, `AT+CIPSEND`, `AT+CIPCLOSE` |

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::engine::state::{CoreState, Ctx};
use crate::error::{Error, Result};
use crate::net::ConnType;
use crate::pipeline::{Message, Operation};

// ============================================================================
// Cmd
// ============================================================================

/// A single wire command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cmd {
    /// No command in flight.
    Idle,
    /// Software reset (`AT+CFUN=1,1`), or plain `AT` after a hardware reset.
    Reset,
    /// Disable echo.
    Ate0,
    /// Set phone functionality.
    CfunSet,
    /// Enable numeric `+CME ERROR` reports.
    CmeeSet,
    /// Manufacturer identification.
    Cgmi,
    /// Model identification.
    Cgmm,
    /// Serial number (IMEI).
    Cgsn,
    /// Revision identification.
    Cgmr,
    /// Enable unsolicited registration reports.
    CregSet,
    /// Enable unsolicited call list reports.
    ClccSet,
    /// Query SIM state.
    CpinGet,
    /// Restore factory defaults.
    Restore,
    /// Deactivate the PDP context.
    CgactSet0,
    /// Detach from packet service.
    CgattSet0,
    /// Attach to packet service.
    CgattSet1,
    /// Shut down every IP session.
    Cipshut,
    /// Enable multi-connection mode.
    CipmuxSet,
    /// Select automatic receive mode.
    CiprxgetSet,
    /// Set APN, user and password.
    CsttSet,
    /// Bring up the wireless connection.
    Ciicr,
    /// Query the local IP address.
    Cifsr,
    /// Scan available operators.
    CopsScan,
    /// Query signal quality.
    Csq,
    /// Query connection status.
    Cipstatus,
    /// Select SSL for the next connection.
    Cipssl,
    /// Start a connection.
    Cipstart,
    /// Send data on a connection.
    Cipsend,
    /// Close a connection.
    Cipclose,
}

impl Cmd {
    /// Returns `true` if the modem answers this command without a plain
    /// `OK` terminator, so a bare `OK` must not finish it.
    #[inline]
    #[must_use]
    pub fn has_custom_terminator(&self) -> bool {
        matches!(
            self,
            Self::Cipstart | Self::Cipstatus | Self::Cipsend | Self::Cipclose | Self::Cipshut
        )
    }

    /// Returns `true` for the identification queries.
    #[inline]
    #[must_use]
    pub fn is_identification(&self) -> bool {
        matches!(self, Self::Cgmi | Self::Cgmm | Self::Cgsn | Self::Cgmr)
    }
}

// ============================================================================
// Emission
// ============================================================================

/// Formats and transmits the wire command selected on `msg`.
///
/// # Errors
///
/// - [`Error::NoFreeConnection`] if a start finds every slot in use
/// - [`Error::ConnectionClosed`] if a send or close targets a stale handle
/// - [`Error::Io`] if the transport rejects the write
pub(crate) fn initiate_cmd(msg: &mut Message, st: &mut CoreState, ctx: &Ctx<'_>) -> Result<()> {
    let line = format_cmd(msg, st)?;
    debug!(cmd = ?msg.cmd, step = msg.step, op = msg.op.name(), "Sending command");
    trace!(line = %line.trim_end(), "AT >");
    ctx.send_str(&line)
}

fn format_cmd(msg: &mut Message, st: &mut CoreState) -> Result<String> {
    let line = match msg.cmd {
        Cmd::Idle => return Err(Error::invalid_argument("no command selected")),
        Cmd::Reset => match msg.op {
            Operation::Reset { hw_reset: true, .. } => "AT\r\n".to_string(),
            _ => "AT+CFUN=1,1\r\n".to_string(),
        },
        Cmd::Ate0 => "ATE0\r\n".to_string(),
        Cmd::CfunSet => {
            let mode = match msg.op {
                Operation::SetFunc { full: false } => 0,
                _ => 1,
            };
            format!("AT+CFUN={mode}\r\n")
        }
        Cmd::CmeeSet => "AT+CMEE=1\r\n".to_string(),
        Cmd::Cgmi => "AT+CGMI\r\n".to_string(),
        Cmd::Cgmm => "AT+CGMM\r\n".to_string(),
        Cmd::Cgsn => "AT+CGSN\r\n".to_string(),
        Cmd::Cgmr => "AT+CGMR\r\n".to_string(),
        Cmd::CregSet => "AT+CREG=1\r\n".to_string(),
        Cmd::ClccSet => "AT+CLCC=1\r\n".to_string(),
        Cmd::CpinGet => "AT+CPIN?\r\n".to_string(),
        Cmd::Restore => "AT&F\r\n".to_string(),
        Cmd::CgactSet0 => "AT+CGACT=0\r\n".to_string(),
        Cmd::CgattSet0 => "AT+CGATT=0\r\n".to_string(),
        Cmd::CgattSet1 => "AT+CGATT=1\r\n".to_string(),
        Cmd::Cipshut => "AT+CIPSHUT\r\n".to_string(),
        Cmd::CipmuxSet => "AT+CIPMUX=1\r\n".to_string(),
        Cmd::CiprxgetSet => "AT+CIPRXGET=0\r\n".to_string(),
        Cmd::CsttSet => match &msg.op {
            Operation::NetworkAttach { apn, user, pass } => {
                format!("AT+CSTT=\"{apn}\",\"{user}\",\"{pass}\"\r\n")
            }
            _ => return Err(Error::invalid_argument("AT+CSTT outside network attach")),
        },
        Cmd::Ciicr => "AT+CIICR\r\n".to_string(),
        Cmd::Cifsr => "AT+CIFSR\r\n".to_string(),
        Cmd::CopsScan => "AT+COPS=?\r\n".to_string(),
        Cmd::Csq => "AT+CSQ\r\n".to_string(),
        Cmd::Cipstatus => "AT+CIPSTATUS\r\n".to_string(),
        Cmd::Cipssl => {
            let ssl = match &msg.op {
                Operation::ConnStart(start) => start.conn_type == ConnType::Ssl,
                _ => false,
            };
            format!("AT+CIPSSL={}\r\n", u8::from(ssl))
        }
        Cmd::Cipstart => {
            let Some(start) = msg.conn_start_mut() else {
                return Err(Error::invalid_argument("AT+CIPSTART outside connection start"));
            };
            // Slots are handed out from the back.
            let num = st
                .conns
                .iter()
                .rposition(|conn| !conn.is_active())
                .ok_or(Error::NoFreeConnection)?;
            start.num = Some(num);
            format!(
                "AT+CIPSTART={},\"{}\",\"{}\",{}\r\n",
                num,
                start.conn_type.wire_name(),
                start.host,
                start.port
            )
        }
        Cmd::Cipsend => {
            let max_len = st.max_data_len;
            let Some(send) = msg.conn_send_mut() else {
                return Err(Error::invalid_argument("AT+CIPSEND outside connection send"));
            };
            st.conn(send.conn)?;
            send.chunk = send.remaining().min(max_len);
            send.wait_prompt = true;
            send.send_failed = false;
            format!("AT+CIPSEND={},{}\r\n", send.conn.num(), send.chunk)
        }
        Cmd::Cipclose => {
            let Operation::ConnClose { conn } = msg.op else {
                return Err(Error::invalid_argument("AT+CIPCLOSE outside connection close"));
            };
            st.conn(conn)?;
            format!("AT+CIPCLOSE={}\r\n", conn.num())
        }
    };
    Ok(line)
}

// ============================================================================
// Tests
// ============================================================================
