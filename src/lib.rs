//! LipoDoc Simulator Library
//!
//! This library simulates a fleet of LipoDoc lipemic analyzers that report
//! status and donation results to a device server over TCP:
//!
//! - **protocol**: Wire encoding of status and donation messages
//! - **generator**: Random barcodes, readings and checksums for simulated data
//! - **store**: Per-device FIFO of donation records awaiting delivery
//! - **transport**: One TCP connection per message, with optional acknowledgment
//! - **device**: Connection lifecycle and the periodic status loop
//! - **fleet**: Registry of devices keyed by serial number
//! - **config**: Environment-based configuration
//!
//! # Example
//!
//! ```no_run
//! use lipodoc_sim::config::Config;
//! use lipodoc_sim::fleet::Fleet;
//! use lipodoc_sim::protocol::FormatVariant;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Load configuration from environment
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     // Register the configured devices and start their status loops
//!     let fleet = Fleet::from_config(&config).expect("Failed to build fleet");
//!     fleet.connect_all().await;
//!
//!     // Create a donation result on the first device
//!     if let Some(device) = fleet.devices().first() {
//!         device
//!             .create_donation_data(Some(FormatVariant::AllBarcodes), true)
//!             .await
//!             .ok();
//!     }
//!
//!     fleet.disconnect_all().await;
//! }
//! ```

// Module declarations
pub mod config;
pub mod device;
pub mod fleet;
pub mod generator;
pub mod protocol;
pub mod store;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use config::{Config, ConfigError, DeviceTiming};
pub use device::{
    ConnectionState, Device, DeviceError, DeviceEvent, DeviceOptions, DeviceSummary,
    DonationOutcome,
};
pub use fleet::{BatchReport, Fleet, FleetError};
pub use generator::DataGenerator;
pub use protocol::{DeviceStatus, DonationMessage, FormatVariant, ProtocolError, StatusMessage};
pub use store::{DonationRecord, RecordStore, StoreError};
pub use transport::{Delivery, Endpoint, ReplyMode, TcpTransport, Transport, TransportError};
