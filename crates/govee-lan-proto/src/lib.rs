//! Wire codec and capability table for the Govee LAN protocol.
//!
//! Govee lights speak unauthenticated JSON over UDP with no delivery or
//! ordering guarantees. This crate owns the two pure pieces of that
//! protocol:
//!
//! - **[`message`]** -- encodes outbound [`Request`]s into the
//!   `{"msg":{"cmd":..,"data":..}}` envelope and decodes inbound
//!   datagrams into a [`Response`] (device announcement or status
//!   snapshot). Malformed or unknown input decodes to `None`, never an
//!   error -- the transport is lossy and hostile input is expected.
//!
//! - **[`capabilities`]** -- a static model-to-feature lookup. Unknown
//!   models degrade to a standard RGB profile with a logged warning.
//!
//! No I/O happens here; `govee-lan-core` owns the sockets.

pub mod capabilities;
pub mod message;

pub use capabilities::{LightCapabilities, LightFeatures, capabilities_for};
pub use message::{
    ColorMode, DeviceAnnouncement, DeviceStatus, Request, Response, Rgb, decode, encode,
};
