//! Bluetooth Module
//!
//! BLE control link to a Shell Racing Legends car.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                     │
//! │   (dedicated thread, single-threaded tokio runtime)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌─────────────┐  ┌──────────┐
//! │  Scanner  │  │   Session   │  │ Protocol │
//! │           │  │             │  │          │
//! │ - BLE     │  │ - Link      │  │ - UUIDs  │
//! │ discovery │  │ - Limiter   │  │ - Codec  │
//! │           │  │ - EventBus  │  │          │
//! └───────────┘  └─────────────┘  └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - GATT layout, payload encoding and telemetry decoding
//! - [`rate_limiter`] - write admission for the control characteristic
//! - [`event_bus`] - bounded session → UI event channel
//! - [`link`] - physical link traits and errors
//! - [`session`] - the connection state machine
//! - [`scanner`] - BLE device discovery
//! - [`service`] - runtime thread hosting sessions and scans

pub mod event_bus;
pub mod link;
pub mod protocol;
pub mod rate_limiter;
pub mod scanner;
pub mod service;
pub mod session;
#[cfg(windows)]
pub mod winrt;

pub use service::BluetoothService;

/// Link backend for the current platform.
#[cfg(windows)]
pub type PlatformConnector = winrt::WinRtConnector;
#[cfg(not(windows))]
pub type PlatformConnector = link::UnsupportedConnector;
