// ── Controller configuration ──

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Multicast group the lights listen on for scan broadcasts.
pub const BROADCAST_ADDRESS: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
/// Port devices receive scan broadcasts on.
pub const BROADCAST_PORT: u16 = 4001;
/// Port the controller listens on for responses.
pub const LISTENING_PORT: u16 = 4002;
/// Port devices receive unicast commands on.
pub const COMMAND_PORT: u16 = 4003;

/// How often to broadcast a scan for new devices.
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(60);
/// How long a device may go unseen before the eviction sweep removes it.
pub const EVICT_INTERVAL: Duration = Duration::from_secs(180);
/// How often to poll every registered device for its status.
pub const UPDATE_INTERVAL: Duration = Duration::from_secs(30);

/// Controller configuration. [`Default`] mirrors the protocol constants.
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)]
pub struct ControllerConfig {
    /// Scan broadcast target, normally the `239.255.255.250` multicast
    /// group. A unicast or broadcast address also works for networks
    /// where multicast is filtered.
    pub broadcast_address: IpAddr,
    pub broadcast_port: u16,
    pub listening_address: IpAddr,
    /// Listening port. `0` binds an ephemeral port, useful in tests.
    pub listening_port: u16,
    pub command_port: u16,
    pub discovery_enabled: bool,
    pub discovery_interval: Duration,
    pub evict_enabled: bool,
    pub evict_interval: Duration,
    pub update_enabled: bool,
    pub update_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            broadcast_address: IpAddr::V4(BROADCAST_ADDRESS),
            broadcast_port: BROADCAST_PORT,
            listening_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listening_port: LISTENING_PORT,
            command_port: COMMAND_PORT,
            discovery_enabled: false,
            discovery_interval: DISCOVERY_INTERVAL,
            evict_enabled: false,
            evict_interval: EVICT_INTERVAL,
            update_enabled: true,
            update_interval: UPDATE_INTERVAL,
        }
    }
}
