// ── Device model ──
//
// One `LocalDevice` per physical light, keyed by the stable device id
// from its announcement -- never by IP, which may migrate via DHCP.
// The registry exclusively owns device lifetime; a device holds only a
// weak back-reference to the controller for enqueueing commands, and
// that reference is cleared on eviction.

use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use govee_lan_proto::capabilities::LightCapabilities;
use govee_lan_proto::message::{ColorMode, DeviceStatus, Rgb};

use crate::controller::{Controller, ControllerInner};

/// Live state of a light, updated from inbound status snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightState {
    pub on: bool,
    /// 0–100.
    pub brightness: u8,
    pub rgb: Rgb,
    /// `None` until the device reports a positive kelvin value. The
    /// wire reports `0` when the light is not in temperature mode, and
    /// a zero report never clears a previously seen value.
    pub color_temperature_kelvin: Option<u32>,
}

impl Default for LightState {
    fn default() -> Self {
        Self {
            on: false,
            brightness: 100,
            rgb: Rgb::new(255, 255, 255),
            color_temperature_kelvin: None,
        }
    }
}

/// Firmware version strings reported in the device announcement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceVersions {
    pub ble_hardware: String,
    pub ble_software: String,
    pub wifi_hardware: String,
    pub wifi_software: String,
}

/// A light on the local network.
pub struct LocalDevice {
    device_id: String,
    model: String,
    capabilities: LightCapabilities,
    is_manual: bool,
    versions: DeviceVersions,
    ip: RwLock<IpAddr>,
    last_seen: RwLock<DateTime<Utc>>,
    /// Live state lives inside the watch channel so every mutation is
    /// also a subscriber notification.
    state: watch::Sender<LightState>,
    controller: RwLock<Option<Weak<ControllerInner>>>,
}

impl LocalDevice {
    pub(crate) fn new(
        controller: Weak<ControllerInner>,
        ip: IpAddr,
        device_id: String,
        model: String,
        capabilities: LightCapabilities,
        is_manual: bool,
        versions: DeviceVersions,
    ) -> Self {
        let (state, _) = watch::channel(LightState::default());
        Self {
            device_id,
            model,
            capabilities,
            is_manual,
            versions,
            ip: RwLock::new(ip),
            last_seen: RwLock::new(Utc::now()),
            state,
            controller: RwLock::new(Some(controller)),
        }
    }

    // ── Identity and capabilities ────────────────────────────────

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn capabilities(&self) -> &LightCapabilities {
        &self.capabilities
    }

    /// Whether this device was seeded from a user-supplied address
    /// rather than found by multicast discovery. Manual devices keep
    /// receiving unicast scans even when broadcast discovery is off.
    pub fn is_manual(&self) -> bool {
        self.is_manual
    }

    pub fn versions(&self) -> &DeviceVersions {
        &self.versions
    }

    // ── Mutable network identity ─────────────────────────────────

    pub fn ip(&self) -> IpAddr {
        *self.ip.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_ip(&self, ip: IpAddr) {
        *self.ip.write().unwrap_or_else(PoisonError::into_inner) = ip;
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        *self.last_seen.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refresh the liveness timestamp.
    pub(crate) fn touch(&self) {
        *self.last_seen.write().unwrap_or_else(PoisonError::into_inner) = Utc::now();
    }

    // ── Live state ───────────────────────────────────────────────

    /// Copy of the current live state.
    pub fn state(&self) -> LightState {
        *self.state.borrow()
    }

    /// Subscribe to live-state changes.
    pub fn subscribe(&self) -> watch::Receiver<LightState> {
        self.state.subscribe()
    }

    /// Apply an inbound status snapshot and refresh liveness.
    pub(crate) fn apply_status(&self, status: &DeviceStatus) {
        self.state.send_modify(|state| {
            state.on = status.on;
            state.brightness = status.brightness;
            state.rgb = status.color;
            if status.color_temperature_kelvin > 0 {
                state.color_temperature_kelvin = Some(status.color_temperature_kelvin);
            }
        });
        self.touch();
    }

    // ── Controller attachment ────────────────────────────────────

    fn controller(&self) -> Option<Controller> {
        self.controller
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()?
            .upgrade()
            .map(Controller::from_inner)
    }

    /// Sever the back-reference; command methods become no-ops.
    pub(crate) fn detach(&self) {
        *self
            .controller
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Whether the device is still attached to a live controller.
    pub fn is_attached(&self) -> bool {
        self.controller().is_some()
    }

    // ── Command convenience methods ──────────────────────────────
    //
    // Each forwards to the owning controller; a detached (evicted)
    // device silently does nothing.

    pub async fn turn_on(self: &Arc<Self>) {
        if let Some(controller) = self.controller() {
            controller.turn_on_off(self, true).await;
        }
    }

    pub async fn turn_off(self: &Arc<Self>) {
        if let Some(controller) = self.controller() {
            controller.turn_on_off(self, false).await;
        }
    }

    pub async fn set_brightness(self: &Arc<Self>, brightness: u8) {
        if let Some(controller) = self.controller() {
            controller.set_brightness(self, brightness).await;
        }
    }

    pub async fn set_rgb(self: &Arc<Self>, rgb: Rgb) {
        if let Some(controller) = self.controller() {
            controller.set_color(self, ColorMode::Rgb(rgb)).await;
        }
    }

    pub async fn set_temperature(self: &Arc<Self>, kelvin: u32) {
        if let Some(controller) = self.controller() {
            controller.set_color(self, ColorMode::Kelvin(kelvin)).await;
        }
    }

    pub async fn set_scene(self: &Arc<Self>, scene: &str) {
        if let Some(controller) = self.controller() {
            controller.set_scene(self, scene).await;
        }
    }

    pub async fn set_segment_rgb(self: &Arc<Self>, segment: usize, rgb: Rgb) {
        if let Some(controller) = self.controller() {
            controller.set_segment_color(self, segment, rgb).await;
        }
    }
}

impl fmt::Display for LocalDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LocalDevice({}, {}, {})",
            self.model,
            self.ip(),
            self.device_id
        )
    }
}

impl fmt::Debug for LocalDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalDevice")
            .field("device_id", &self.device_id)
            .field("model", &self.model)
            .field("ip", &self.ip())
            .field("is_manual", &self.is_manual)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use govee_lan_proto::capabilities;
    use pretty_assertions::assert_eq;

    fn test_device() -> LocalDevice {
        LocalDevice::new(
            Weak::new(),
            "10.0.0.1".parse().expect("valid ip"),
            "AA:BB:CC".to_owned(),
            "H6163".to_owned(),
            capabilities::capabilities_for("H6163"),
            false,
            DeviceVersions::default(),
        )
    }

    #[test]
    fn defaults_before_first_status() {
        let device = test_device();
        let state = device.state();
        assert!(!state.on);
        assert_eq!(state.brightness, 100);
        assert_eq!(state.rgb, Rgb::new(255, 255, 255));
        assert_eq!(state.color_temperature_kelvin, None);
    }

    #[test]
    fn apply_status_updates_state_and_liveness() {
        let device = test_device();
        let before = device.last_seen();

        device.apply_status(&DeviceStatus {
            on: true,
            brightness: 42,
            color: Rgb::new(1, 2, 3),
            color_temperature_kelvin: 0,
        });

        let state = device.state();
        assert!(state.on);
        assert_eq!(state.brightness, 42);
        assert_eq!(state.rgb, Rgb::new(1, 2, 3));
        assert!(device.last_seen() >= before);
    }

    #[test]
    fn zero_kelvin_does_not_clear_previous_value() {
        let device = test_device();
        device.apply_status(&DeviceStatus {
            on: true,
            brightness: 50,
            color: Rgb::default(),
            color_temperature_kelvin: 4000,
        });
        assert_eq!(device.state().color_temperature_kelvin, Some(4000));

        device.apply_status(&DeviceStatus {
            on: true,
            brightness: 50,
            color: Rgb::new(255, 0, 0),
            color_temperature_kelvin: 0,
        });
        assert_eq!(device.state().color_temperature_kelvin, Some(4000));
    }

    #[test]
    fn subscribers_see_status_updates() {
        let device = test_device();
        let mut rx = device.subscribe();

        device.apply_status(&DeviceStatus {
            on: true,
            brightness: 10,
            color: Rgb::default(),
            color_temperature_kelvin: 0,
        });

        assert!(rx.has_changed().expect("sender alive"));
        assert_eq!(rx.borrow_and_update().brightness, 10);
    }

    #[test]
    fn detached_device_reports_unattached() {
        let device = test_device();
        // Weak::new() never upgrades, so a fresh test device is already
        // unattached; detach must keep it that way.
        assert!(!device.is_attached());
        device.detach();
        assert!(!device.is_attached());
    }
}
