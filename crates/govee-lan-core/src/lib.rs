//! Asynchronous controller for LAN-attached smart lights.
//!
//! The controller binds a UDP endpoint, discovers devices by multicast
//! scan (or user-seeded unicast addresses), tracks each device's live
//! state from status reports, and executes commands with a retrying,
//! state-verified delivery protocol over the unreliable transport.
//!
//! ```no_run
//! use govee_lan_core::{Controller, ControllerConfig};
//!
//! # async fn run() -> Result<(), govee_lan_core::CoreError> {
//! let controller = Controller::new(ControllerConfig {
//!     discovery_enabled: true,
//!     ..ControllerConfig::default()
//! });
//! controller.start().await?;
//! // ... react to controller.events() / drive devices ...
//! controller.cleanup().await;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;

mod registry;

pub use command::{CommandKind, RETRY_PATTERN};
pub use config::ControllerConfig;
pub use controller::{Controller, ControllerEvent, DiscoveredCallback};
pub use device::{DeviceVersions, LightState, LocalDevice};
pub use error::CoreError;

// Protocol-level types that appear in this crate's public API.
pub use govee_lan_proto::capabilities::{LightCapabilities, LightFeatures};
pub use govee_lan_proto::message::{ColorMode, Rgb};
