//! Cached modem status types.
//!
//! The parser keeps these up to date from command replies and unsolicited
//! notifications; snapshots are exposed through [`Engine`](crate::Engine)
//! getters and carried by events.

// ============================================================================
// Imports
// ============================================================================

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

// ============================================================================
// DeviceInfo
// ============================================================================

/// Identification strings reported during reset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// `AT+CGMI` reply.
    pub manufacturer: String,
    /// `AT+CGMM` reply.
    pub model: String,
    /// `AT+CGSN` reply (IMEI).
    pub serial: String,
    /// `AT+CGMR` reply.
    pub revision: String,
}

// ============================================================================
// SimState
// ============================================================================

/// SIM card state from `+CPIN`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimState {
    /// Not reported yet.
    #[default]
    Unknown,
    /// SIM ready.
    Ready,
    /// SIM not inserted.
    NotInserted,
    /// SIM waiting for PIN.
    Pin,
    /// SIM waiting for PUK.
    Puk,
    /// SIM present but not ready.
    NotReady,
}

impl SimState {
    /// Parses the text after `+CPIN: `.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        match text.trim() {
            "READY" => Self::Ready,
            "NOT INSERTED" => Self::NotInserted,
            "SIM PIN" => Self::Pin,
            "SIM PUK" => Self::Puk,
            "NOT READY" => Self::NotReady,
            _ => Self::Unknown,
        }
    }
}

// ============================================================================
// RegStatus
// ============================================================================

/// Network registration status from `+CREG`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegStatus {
    /// Not registered, not searching.
    NotRegistered,
    /// Registered on the home network.
    Home,
    /// Searching for an operator.
    Searching,
    /// Registration denied.
    Denied,
    /// Not reported yet.
    #[default]
    Unknown,
    /// Registered while roaming.
    Roaming,
}

impl RegStatus {
    /// Maps the numeric `<stat>` field.
    #[must_use]
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::NotRegistered,
            1 => Self::Home,
            2 => Self::Searching,
            3 => Self::Denied,
            5 => Self::Roaming,
            _ => Self::Unknown,
        }
    }

    /// Returns `true` if registered on home or roaming network.
    #[inline]
    #[must_use]
    pub fn is_registered(&self) -> bool {
        matches!(self, Self::Home | Self::Roaming)
    }
}

// ============================================================================
// NetworkInfo
// ============================================================================

/// Packet data attachment state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// `true` once the attach sequence completed.
    pub attached: bool,
    /// Local IP address reported by `AT+CIFSR`.
    pub ip: Option<Ipv4Addr>,
    /// Registration status.
    pub reg: RegStatus,
    /// Last reported signal strength in dBm (0 when unknown).
    pub rssi: i16,
    /// Current operator name, when reported.
    pub operator: Option<String>,
}

// ============================================================================
// OperatorInfo
// ============================================================================

/// One entry of an operator scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorInfo {
    /// Availability (0 unknown, 1 available, 2 current, 3 forbidden).
    pub status: u8,
    /// Long alphanumeric name.
    pub long_name: String,
    /// Short alphanumeric name.
    pub short_name: String,
    /// Numeric MCC/MNC code.
    pub numeric: String,
}

// ============================================================================
// CallInfo
// ============================================================================

/// Call state reported by `+CLCC`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInfo {
    /// Call index.
    pub index: u8,
    /// `true` for a mobile-terminated call.
    pub incoming: bool,
    /// Call state (0 active .. 6 disconnect).
    pub state: u8,
    /// Remote number.
    pub number: String,
}

// ============================================================================
// Tests
// ============================================================================
