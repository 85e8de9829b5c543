use serde::{Deserialize, Serialize};
use std::fmt;

/// Battery condition reported in the voltage status nibble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryStatus {
    /// Battery is healthy
    Normal,
    /// Battery is weak
    Weak,
    /// Battery is very weak
    VeryWeak,
    /// Battery is being charged
    Charging,
    /// Any code the monitor firmware does not document
    Unknown(u8),
}

impl From<u8> for BatteryStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Normal,
            1 => Self::Weak,
            2 => Self::VeryWeak,
            4 => Self::Charging,
            other => Self::Unknown(other),
        }
    }
}

impl BatteryStatus {
    /// Whether the monitor reports the battery as charging
    #[must_use]
    pub const fn is_charging(self) -> bool {
        matches!(self, Self::Charging)
    }

    /// Whether the battery is weak or very weak
    #[must_use]
    pub const fn is_weak(self) -> bool {
        matches!(self, Self::Weak | Self::VeryWeak)
    }
}

impl fmt::Display for BatteryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Weak => write!(f, "weak"),
            Self::VeryWeak => write!(f, "very weak"),
            Self::Charging => write!(f, "charging"),
            Self::Unknown(_) => write!(f, "unknown"),
        }
    }
}

/// Result of a charge test
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChargeTestResult {
    /// Raw status code
    pub status: u32,
    /// Idle voltage (V)
    pub idle_volt: f64,
    /// Voltage under high load (V)
    pub high_volt: f64,
}

/// Result of a crank test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrankTestResult {
    /// Number of two-minute intervals since the test ran
    pub base_value: u32,
    /// Crank voltage (V)
    pub voltage: f64,
    /// Raw status code
    pub status: u32,
    /// Voltage samples taken during cranking (V)
    pub voltages: Vec<f64>,
    /// Estimated wall clock time of the test, in Unix milliseconds
    pub test_time_ms: i64,
}

/// Periodic voltage and charge report
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoltageStatus {
    /// Battery voltage (V)
    pub voltage: f64,
    /// Raw status nibble, see [`VoltageStatus::battery_status`]
    pub status: u32,
    /// Battery level (%)
    pub battery_power: u32,
    /// Device timer B, in seconds
    pub time_b: u32,
    /// Device timer C, in seconds
    pub time_c: u32,
}

impl VoltageStatus {
    /// Decoded battery condition
    #[must_use]
    pub fn battery_status(&self) -> BatteryStatus {
        BatteryStatus::from(u8::try_from(self.status).unwrap_or(u8::MAX))
    }
}

/// One stored reading from the history log
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Voltage (V)
    pub voltage: f64,
    /// Record type code
    pub record_type: u32,
    /// Timestamp in Unix milliseconds
    pub time_ms: i64,
}

/// Timers carried from the latest voltage status into crank test timing.
///
/// One instance lives per connection, inside the session's processing task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionState {
    /// `time_b` of the most recent voltage status
    pub last_time_b: u32,
    /// `time_c` of the most recent voltage status
    pub last_time_c: u32,
}

impl SessionState {
    /// Remember the timers of a freshly parsed voltage status
    pub fn record(&mut self, status: &VoltageStatus) {
        self.last_time_b = status.time_b;
        self.last_time_c = status.time_c;
    }
}

/// Lifecycle of a connection session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No transport is open
    Disconnected,
    /// Resolving or connecting the transport
    Connecting,
    /// Connected and receiving notifications
    Subscribed,
    /// Tearing the connection down
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Subscribed => write!(f, "Subscribed"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// How to locate the monitor to connect to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceTarget {
    /// Bluetooth address, e.g. `AA:BB:CC:DD:EE:FF`
    Address(String),
    /// Substring of the advertised local name
    Name(String),
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(address) => write!(f, "address {address}"),
            Self::Name(name) => write!(f, "name \"{name}\""),
        }
    }
}

/// Device information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Advertised local name
    pub name: Option<String>,
    /// Bluetooth address
    pub address: String,
    /// Signal strength (RSSI)
    pub rssi: Option<i16>,
}

/// Connection parameters
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    /// How long to scan when resolving a device, in milliseconds
    pub scan_timeout_ms: u64,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// How long to wait for a write acknowledgment, in milliseconds
    pub write_timeout_ms: u64,
    /// Upper bound on closing the transport, in milliseconds
    pub disconnect_timeout_ms: u64,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 5_000,
            connect_timeout_ms: 10_000,
            write_timeout_ms: 5_000,
            disconnect_timeout_ms: 3_000,
        }
    }
}
