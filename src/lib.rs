#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Pedalers 🚴
//!
//! A Rust library for driving Domyos exercise bikes over Bluetooth Low Energy.
//!
//! The bike's console speaks a small framed protocol on a serial-over-GATT
//! service: every frame starts with `0xF0` and ends with an additive
//! checksum, writes are limited to 20 bytes, and the console streams a
//! 26-byte telemetry frame that may arrive split in two notifications.
//! Two radio modules exist (ChangYow and Telink) with slightly different
//! handshakes and display encodings; the right one is picked from the
//! advertised name and address.
//!
//! The console goes back to sleep unless it hears from the app regularly, so
//! [`DomyosBike::run`] drives a fixed tick that always sends exactly one
//! command: a start/stop, a resistance change, a display refresh or a
//! keepalive. Intents from a [`BikeHandle`] are queued and picked up by the
//! next tick.
//!
//! ## Safety Warning
//!
//! ⚠️ **Important**: This library controls physical exercise equipment.
//! Resistance changes are applied while the rider is pedaling; make sure
//! targets coming from training software are sane before forwarding them.
//!
//! ## Quick Start
//!
//! ```no_run
//! use pedalers::{BikeConfig, BikeEvent, DomyosBike};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BikeConfig::from_file_or_default("pedalers.toml");
//!     let (bike, handle) = DomyosBike::discover(config).await?;
//!     let mut events = handle.subscribe();
//!     let session = tokio::spawn(bike.run());
//!
//!     while let Ok(event) = events.recv().await {
//!         if event == BikeEvent::Running {
//!             break;
//!         }
//!     }
//!
//!     // Hold 180 W
//!     handle.set_target_power(180)?;
//!
//!     handle.shutdown()?;
//!     session.await??;
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy transport
pub mod ble;
/// Session configuration
pub mod config;
/// Resistance requests and ERG control
pub mod control;
/// Session driver and caller handle
pub mod device;
/// Error types and handling
pub mod error;
/// Collaborator seams and ride metrics
pub mod metrics;
/// Power model
pub mod power;
/// Frame encoding, chunking and reassembly
pub mod protocol;
/// Tick scheduling of outbound commands
pub mod scheduler;
/// Connection state machine
pub mod state;
/// Telemetry decoding and tracking
pub mod telemetry;
/// Type definitions and data structures
pub mod types;

pub use ble::{BleTransport, Transport, TransportEvent};
pub use config::BikeConfig;
pub use device::{BikeCommand, BikeHandle, DomyosBike};
pub use error::{BikeError, Result};
pub use metrics::{HeartRateSource, Metric, MetricsSink, RideMetrics, VirtualDevice};
pub use types::{
    BikeEvent, ButtonEvent, ConnectionParams, ConnectionState, DeviceInfo, DeviceProfile,
    Dialect, TelemetrySample,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Serial-over-GATT service exposed by the console's radio module
pub const DOMYOS_SERVICE_UUID: &str = "49535343-fe7d-4ae5-8fa9-9fafd205e455";

/// Characteristic the app writes command frames to
pub const DOMYOS_WRITE_CHAR_UUID: &str = "49535343-8841-43f4-a8d4-ecbe34729bb3";

/// Characteristic the console sends telemetry and responses on
pub const DOMYOS_NOTIFY_CHAR_UUID: &str = "49535343-1e4d-4bd9-ba61-23c647249616";
