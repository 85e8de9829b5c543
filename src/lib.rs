#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # bm2-ble
//!
//! A Rust client for BM2 battery monitors over Bluetooth Low Energy.
//!
//! The monitor pushes encrypted notifications on a GATT characteristic and
//! accepts encrypted commands on another. This crate handles the link, the
//! AES-128-CBC framing, and decoding of the payload layouts:
//!
//! - **Voltage status**: battery voltage, condition and charge level
//! - **Charge test** and **crank test** results
//! - **History**: batches of stored voltage readings
//!
//! Publishing the decoded values is left to the caller, who receives one
//! [`Message`] per parsed notification.
//!
//! ## Quick Start
//!
//! ```no_run
//! use bm2_ble::{Bm2Session, ConnectionParams, DeviceTarget, Message};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (session, mut messages) = Bm2Session::new(ConnectionParams::default());
//!     session
//!         .connect(&DeviceTarget::Address("AA:BB:CC:DD:EE:FF".to_string()))
//!         .await?;
//!
//!     while let Some(message) = messages.recv().await {
//!         if let Message::VoltageStatus(status) = message {
//!             println!("{:.2} V, {}%", status.voltage, status.battery_power);
//!         }
//!     }
//!
//!     session.disconnect().await?;
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy transport
pub mod ble;
/// AES-128-CBC frame codec
pub mod cipher;
/// Outbound command encoding
pub mod command;
/// Error types and handling
pub mod error;
/// Payload routing and parsing
pub mod protocol;
/// Connection session state machine
pub mod session;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use ble::{NotificationStream, Transport};
pub use command::Command;
pub use error::{Bm2Error, Result};
pub use protocol::{decode_history, parse_history, Message};
pub use session::Bm2Session;
pub use types::{
    BatteryStatus, ChargeTestResult, ConnectionParams, ConnectionState, CrankTestResult,
    DeviceInfo, DeviceTarget, HistoryRecord, SessionState, VoltageStatus,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// GATT service holding the BM2 characteristics
pub const BM2_SERVICE_UUID: &str = "0000fff0-0000-1000-8000-00805f9b34fb";

/// Characteristic the monitor sends encrypted notifications on
pub const BM2_NOTIFY_CHAR_UUID: &str = "0000fff4-0000-1000-8000-00805f9b34fb";

/// Characteristic encrypted commands are written to
pub const BM2_WRITE_CHAR_UUID: &str = "0000fff3-0000-1000-8000-00805f9b34fb";
