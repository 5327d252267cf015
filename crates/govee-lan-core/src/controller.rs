// ── Controller ──
//
// Owns the UDP endpoint, the device registry, the discovery/eviction
// lifecycle, and the retrying command engine. Inbound datagrams are
// dispatched concurrently; every wait (backoff sleep, verification
// wait) suspends only the owning retry task, never the receive path.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use govee_lan_proto::capabilities::{LightFeatures, capabilities_for};
use govee_lan_proto::message::{self, ColorMode, DeviceAnnouncement, DeviceStatus, Request, Rgb};

use crate::command::{
    COMMAND_STATUS_GAP, CommandKey, CommandKind, InFlight, KELVIN_TOLERANCE, RETRY_PATTERN,
    RGB_TOLERANCE, StateWaiter, VerifyState,
};
use crate::config::ControllerConfig;
use crate::device::{DeviceVersions, LightState, LocalDevice};
use crate::error::CoreError;
use crate::registry::DeviceRegistry;

const EVENT_CHANNEL_SIZE: usize = 64;

/// Admission/notification hook for discovered devices.
///
/// Called with `is_new = true` before a candidate is inserted, and with
/// `is_new = false` before an existing device's liveness is refreshed.
/// Returning `false` suppresses the insertion or refresh; the device
/// will be re-offered on its next announcement.
pub type DiscoveredCallback = Box<dyn Fn(&Arc<LocalDevice>, bool) -> bool + Send + Sync>;

/// Lifecycle notifications published on the controller event channel.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// A new device was admitted to the registry.
    Discovered(Arc<LocalDevice>),
    /// A device went unseen past the eviction interval and was removed.
    Evicted(Arc<LocalDevice>),
    /// A known device announced itself from a different address.
    IpChanged {
        device: Arc<LocalDevice>,
        old: IpAddr,
        new: IpAddr,
    },
}

// ── Controller ───────────────────────────────────────────────────

/// The main entry point for consumers.
///
/// Cheaply cloneable via `Arc<ControllerInner>`. [`start()`](Self::start)
/// binds the endpoint and spawns the receive loop and periodic timers;
/// [`cleanup()`](Self::cleanup) tears everything down.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

pub(crate) struct ControllerInner {
    config: ControllerConfig,
    registry: DeviceRegistry,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    /// Parent token for the controller lifetime; every spawned task
    /// holds a child of it.
    cancel: CancellationToken,
    /// Per-timer child tokens. `Some` means the timer is armed.
    discovery_timer: Mutex<Option<CancellationToken>>,
    update_timer: Mutex<Option<CancellationToken>>,
    evict_enabled: Mutex<bool>,
    discovery_interval: Mutex<Duration>,
    /// User-seeded addresses scanned by unicast until they announce.
    manual_queue: Mutex<HashSet<IpAddr>>,
    discovered_cb: Mutex<Option<DiscoveredCallback>>,
    event_tx: broadcast::Sender<ControllerEvent>,
    /// In-flight retry tasks, at most one per (device, command-kind).
    pending: DashMap<CommandKey, InFlight>,
    /// State-verification waiters, at most one per device.
    waiters: DashMap<String, StateWaiter>,
    next_task_id: AtomicU64,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    /// Create a controller from configuration. Does not bind anything --
    /// call [`start()`](Self::start).
    pub fn new(config: ControllerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            inner: Arc::new(ControllerInner {
                config,
                registry: DeviceRegistry::new(),
                socket: Mutex::new(None),
                cancel: CancellationToken::new(),
                discovery_timer: Mutex::new(None),
                update_timer: Mutex::new(None),
                evict_enabled: Mutex::new(false),
                discovery_interval: Mutex::new(Duration::ZERO),
                manual_queue: Mutex::new(HashSet::new()),
                discovered_cb: Mutex::new(None),
                event_tx,
                pending: DashMap::new(),
                waiters: DashMap::new(),
                next_task_id: AtomicU64::new(0),
                task_handles: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ControllerInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Bind the UDP endpoint and spawn the receive loop and timers.
    ///
    /// A bind failure with `AddrInUse` is retryable -- see
    /// [`CoreError::is_retryable`].
    pub async fn start(&self) -> Result<(), CoreError> {
        let config = &self.inner.config;
        let socket = bind_socket(config)?;
        let socket = UdpSocket::from_std(socket)?;

        // Multicast membership so scan responses sent to the group
        // reach us. Only meaningful when the scan target is a group.
        if let (IpAddr::V4(group), IpAddr::V4(interface)) =
            (config.broadcast_address, config.listening_address)
        {
            if group.is_multicast() {
                socket.join_multicast_v4(group, interface)?;
                socket.set_multicast_ttl_v4(2)?;
            }
        }

        let socket = Arc::new(socket);
        *lock(&self.inner.socket) = Some(Arc::clone(&socket));

        let inner = Arc::clone(&self.inner);
        let cancel = self.inner.cancel.child_token();
        let handle = tokio::spawn(recv_loop(inner, socket, cancel));
        lock(&self.inner.task_handles).push(handle);

        *lock(&self.inner.discovery_interval) = config.discovery_interval;
        *lock(&self.inner.evict_enabled) = config.evict_enabled;
        if config.discovery_enabled {
            self.set_discovery_enabled(true);
        }
        if config.update_enabled {
            self.set_update_enabled(true);
        }

        info!(addr = ?self.local_addr(), "controller started");
        Ok(())
    }

    /// Tear everything down: disable timers, cancel in-flight command
    /// tasks, leave the multicast group, close the socket, and clear
    /// the registry. Returns once all background work has stopped;
    /// callers that must not block indefinitely should wrap this in
    /// `tokio::time::timeout`.
    pub async fn cleanup(&self) {
        self.set_discovery_enabled(false);
        self.set_update_enabled(false);
        self.inner.cancel.cancel();

        // Cancel and join every in-flight retry task.
        let keys: Vec<CommandKey> = self.inner.pending.iter().map(|r| r.key().clone()).collect();
        for key in keys {
            if let Some((_, inflight)) = self.inner.pending.remove(&key) {
                inflight.cancel.cancel();
                let _ = inflight.handle.await;
            }
        }
        self.inner.waiters.clear();

        let handles: Vec<JoinHandle<()>> = lock(&self.inner.task_handles).drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        if let Some(socket) = lock(&self.inner.socket).take() {
            if let (IpAddr::V4(group), IpAddr::V4(interface)) = (
                self.inner.config.broadcast_address,
                self.inner.config.listening_address,
            ) {
                if group.is_multicast() {
                    if let Err(err) = socket.leave_multicast_v4(group, interface) {
                        debug!(error = %err, "failed to drop multicast membership");
                    }
                }
            }
        }

        for device in self.inner.registry.drain() {
            device.detach();
        }
        lock(&self.inner.manual_queue).clear();
        debug!("controller cleaned up");
    }

    /// Local address of the bound endpoint, if started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.socket)
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
    }

    // ── Discovery / update / eviction switches ───────────────────

    pub fn set_discovery_enabled(&self, enabled: bool) {
        let mut guard = lock(&self.inner.discovery_timer);
        if enabled {
            if guard.is_some() {
                return;
            }
            let token = self.inner.cancel.child_token();
            *guard = Some(token.clone());
            drop(guard);
            let inner = Arc::clone(&self.inner);
            let handle = tokio::spawn(discovery_timer(inner, token));
            lock(&self.inner.task_handles).push(handle);
        } else if let Some(token) = guard.take() {
            token.cancel();
        }
    }

    pub fn discovery_enabled(&self) -> bool {
        lock(&self.inner.discovery_timer).is_some()
    }

    pub fn set_discovery_interval(&self, interval: Duration) {
        *lock(&self.inner.discovery_interval) = interval;
    }

    pub fn discovery_interval(&self) -> Duration {
        *lock(&self.inner.discovery_interval)
    }

    pub fn set_update_enabled(&self, enabled: bool) {
        let mut guard = lock(&self.inner.update_timer);
        if enabled {
            if guard.is_some() {
                return;
            }
            let token = self.inner.cancel.child_token();
            *guard = Some(token.clone());
            drop(guard);
            let inner = Arc::clone(&self.inner);
            let handle = tokio::spawn(update_timer(inner, token));
            lock(&self.inner.task_handles).push(handle);
        } else if let Some(token) = guard.take() {
            token.cancel();
        }
    }

    pub fn update_enabled(&self) -> bool {
        lock(&self.inner.update_timer).is_some()
    }

    pub fn set_evict_enabled(&self, enabled: bool) {
        *lock(&self.inner.evict_enabled) = enabled;
    }

    pub fn evict_enabled(&self) -> bool {
        *lock(&self.inner.evict_enabled)
    }

    // ── Manual address seeding ───────────────────────────────────

    /// Seed an address to scan by unicast, for networks where
    /// multicast is blocked. Returns `false` if already queued. When
    /// the periodic discovery timer is disabled this fires one ad hoc
    /// scan round immediately.
    pub fn add_device_to_queue(&self, ip: IpAddr) -> bool {
        let added = lock(&self.inner.manual_queue).insert(ip);
        if added && !self.discovery_enabled() {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                inner.send_discovery_round().await;
            });
        }
        added
    }

    pub fn remove_device_from_queue(&self, ip: IpAddr) -> bool {
        lock(&self.inner.manual_queue).remove(&ip)
    }

    pub fn has_queued_devices(&self) -> bool {
        !lock(&self.inner.manual_queue).is_empty()
    }

    // ── Hooks and events ─────────────────────────────────────────

    /// Install the admission callback, returning the previous one.
    pub fn set_device_discovered_callback(
        &self,
        callback: Option<DiscoveredCallback>,
    ) -> Option<DiscoveredCallback> {
        std::mem::replace(&mut *lock(&self.inner.discovered_cb), callback)
    }

    /// Subscribe to lifecycle events (discovered / evicted / ip-changed).
    pub fn events(&self) -> broadcast::Receiver<ControllerEvent> {
        self.inner.event_tx.subscribe()
    }

    // ── Registry access ──────────────────────────────────────────

    /// Snapshot of all registered devices.
    pub fn devices(&self) -> Arc<Vec<Arc<LocalDevice>>> {
        self.inner.registry.snapshot()
    }

    /// Subscribe to registry membership changes.
    pub fn subscribe_devices(&self) -> tokio::sync::watch::Receiver<Arc<Vec<Arc<LocalDevice>>>> {
        self.inner.registry.subscribe()
    }

    pub fn has_devices(&self) -> bool {
        !self.inner.registry.is_empty()
    }

    pub fn device_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn device_by_id(&self, device_id: &str) -> Option<Arc<LocalDevice>> {
        self.inner.registry.get(device_id)
    }

    pub fn device_by_ip(&self, ip: IpAddr) -> Option<Arc<LocalDevice>> {
        self.inner.registry.by_ip(ip)
    }

    pub fn devices_by_model(&self, model: &str) -> Vec<Arc<LocalDevice>> {
        self.inner
            .registry
            .snapshot()
            .iter()
            .filter(|device| device.model() == model)
            .cloned()
            .collect()
    }

    /// Explicitly remove a device: cancels its in-flight commands,
    /// drops its verification waiter, and detaches it. No eviction
    /// event is published for explicit removal.
    pub fn remove_device(&self, device_id: &str) {
        self.inner.abort_device_commands(device_id);
        self.inner.waiters.remove(device_id);
        if let Some(device) = self.inner.registry.remove(device_id) {
            device.detach();
            debug!(%device, "device removed");
        }
    }

    // ── Commands ─────────────────────────────────────────────────
    //
    // Capability violations are logged warnings, never errors: the
    // command is dropped and the caller moves on. Power, brightness
    // and color carry a verification predicate; scene and segment run
    // the blind retry schedule.

    pub async fn turn_on_off(&self, device: &Arc<LocalDevice>, on: bool) {
        let verify: VerifyState = Arc::new(move |state: &LightState| state.on == on);
        self.inner
            .execute(device, Request::Turn { on }, CommandKind::Turn, Some(verify))
            .await;
    }

    pub async fn set_brightness(&self, device: &Arc<LocalDevice>, brightness: u8) {
        if !device
            .capabilities()
            .features
            .contains(LightFeatures::BRIGHTNESS)
        {
            warn!(%device, "brightness is not supported by this device");
            return;
        }
        let brightness = brightness.min(100);
        let verify: VerifyState =
            Arc::new(move |state: &LightState| state.brightness == brightness);
        self.inner
            .execute(
                device,
                Request::Brightness { value: brightness },
                CommandKind::Brightness,
                Some(verify),
            )
            .await;
    }

    pub async fn set_color(&self, device: &Arc<LocalDevice>, mode: ColorMode) {
        let features = device.capabilities().features;
        let verify: VerifyState = match mode {
            ColorMode::Rgb(target) => {
                if !features.contains(LightFeatures::COLOR_RGB) {
                    warn!(%device, "rgb color is not supported by this device");
                    return;
                }
                Arc::new(move |state: &LightState| rgb_within_tolerance(state.rgb, target))
            }
            ColorMode::Kelvin(kelvin) => {
                if !features.contains(LightFeatures::COLOR_KELVIN_TEMPERATURE) {
                    warn!(%device, "color temperature is not supported by this device");
                    return;
                }
                Arc::new(move |state: &LightState| {
                    state
                        .color_temperature_kelvin
                        .is_some_and(|current| current.abs_diff(kelvin) <= KELVIN_TOLERANCE)
                })
            }
        };
        self.inner
            .execute(device, Request::Color(mode), CommandKind::Color, Some(verify))
            .await;
    }

    pub async fn set_scene(&self, device: &Arc<LocalDevice>, scene: &str) {
        if !device.capabilities().features.contains(LightFeatures::SCENES) {
            warn!(%device, "scenes are not supported by this device");
            return;
        }
        let Some(code) = device.capabilities().scene_code(scene) else {
            warn!(%device, scene, "scene is not available for this device");
            return;
        };
        let payload = code.to_vec();
        // No observable resulting state: run the blind retry schedule.
        self.inner
            .execute(device, Request::PtReal { payload }, CommandKind::Scene, None)
            .await;
    }

    /// Set the color of one segment. `segment` is 1-based, matching
    /// how the strips label them.
    pub async fn set_segment_color(&self, device: &Arc<LocalDevice>, segment: usize, rgb: Rgb) {
        if !device
            .capabilities()
            .features
            .contains(LightFeatures::SEGMENT_CONTROL)
        {
            warn!(%device, "segment control is not supported by this device");
            return;
        }
        let segments = &device.capabilities().segments;
        let Some(code) = segment.checked_sub(1).and_then(|i| segments.get(i)) else {
            warn!(%device, segment, "segment index is not valid for this device");
            return;
        };
        let mut payload = code.clone();
        payload.extend_from_slice(&[rgb.r, rgb.g, rgb.b]);
        self.inner
            .execute(device, Request::PtReal { payload }, CommandKind::Segment, None)
            .await;
    }

    /// Request an ad hoc status report from one device, outside the
    /// periodic polling cadence.
    pub async fn request_status(&self, device: &Arc<LocalDevice>) {
        self.inner.send_status_request(device).await;
    }
}

// ── Inner implementation ─────────────────────────────────────────

impl ControllerInner {
    fn socket(&self) -> Option<Arc<UdpSocket>> {
        lock(&self.socket).as_ref().map(Arc::clone)
    }

    fn discovery_enabled(&self) -> bool {
        lock(&self.discovery_timer).is_some()
    }

    // ── Outbound ─────────────────────────────────────────────────

    async fn send_to(&self, payload: &[u8], target: SocketAddr) {
        let Some(socket) = self.socket() else {
            return;
        };
        if let Err(err) = socket.send_to(payload, target).await {
            debug!(error = %err, %target, "send failed");
        }
    }

    /// One scan round: multicast while broadcast discovery is enabled,
    /// plus unicasts to queued addresses and to every manual device.
    async fn send_discovery_round(&self) {
        let payload = Request::Scan.encode();
        let port = self.config.broadcast_port;

        if self.discovery_enabled() {
            self.send_to(&payload, SocketAddr::new(self.config.broadcast_address, port))
                .await;
        }

        let queued: Vec<IpAddr> = lock(&self.manual_queue).iter().copied().collect();
        for ip in queued {
            self.send_to(&payload, SocketAddr::new(ip, port)).await;
        }

        let manual: Vec<IpAddr> = self
            .registry
            .snapshot()
            .iter()
            .filter(|device| device.is_manual())
            .map(|device| device.ip())
            .collect();
        for ip in manual {
            self.send_to(&payload, SocketAddr::new(ip, port)).await;
        }
    }

    /// One status round: poll every registered device.
    async fn send_status_round(&self) {
        let devices = self.registry.snapshot();
        for device in devices.iter() {
            self.send_status_request(device).await;
        }
    }

    async fn send_status_request(&self, device: &Arc<LocalDevice>) {
        let target = SocketAddr::new(device.ip(), self.config.command_port);
        self.send_to(&Request::DevStatus.encode(), target).await;
    }

    async fn send_command(&self, device: &Arc<LocalDevice>, request: &Request) {
        let target = SocketAddr::new(device.ip(), self.config.command_port);
        self.send_to(&request.encode(), target).await;
    }

    // ── Inbound ──────────────────────────────────────────────────

    async fn handle_datagram(self: Arc<Self>, data: Vec<u8>, addr: SocketAddr) {
        match message::decode(&data) {
            Some(message::Response::Announcement(announcement)) => {
                debug!(%addr, device_id = %announcement.device_id, "announcement received");
                self.handle_announcement(announcement).await;
            }
            Some(message::Response::Status(status)) => {
                debug!(%addr, "status snapshot received");
                self.handle_status(&status, addr);
            }
            // Malformed or unknown input is logged by the codec.
            None => {}
        }
    }

    async fn handle_announcement(self: &Arc<Self>, announcement: DeviceAnnouncement) {
        let announced_ip: Option<IpAddr> = (announcement.ip != message::UNKNOWN_IP)
            .then(|| announcement.ip.parse().ok())
            .flatten();

        if let Some(device) = self.registry.get(&announcement.device_id) {
            // Known device: refresh its address and liveness.
            if let Some(new_ip) = announced_ip {
                let old_ip = device.ip();
                if old_ip != new_ip {
                    info!(%device, %old_ip, %new_ip, "device ip changed");
                    device.set_ip(new_ip);
                    let _ = self.event_tx.send(ControllerEvent::IpChanged {
                        device: Arc::clone(&device),
                        old: old_ip,
                        new: new_ip,
                    });
                }
            }
            if self.call_discovered(&device, false) {
                device.touch();
            }
        } else {
            let Some(ip) = announced_ip else {
                warn!(
                    device_id = %announcement.device_id,
                    "announcement for unknown device carries no usable ip, discarding"
                );
                return;
            };
            let is_manual = lock(&self.manual_queue).contains(&ip);
            let device = Arc::new(LocalDevice::new(
                Arc::downgrade(self),
                ip,
                announcement.device_id.clone(),
                announcement.model.clone(),
                capabilities_for(&announcement.model),
                is_manual,
                DeviceVersions {
                    ble_hardware: announcement.ble_hardware_version,
                    ble_software: announcement.ble_software_version,
                    wifi_hardware: announcement.wifi_hardware_version,
                    wifi_software: announcement.wifi_software_version,
                },
            ));

            if self.call_discovered(&device, true) {
                self.registry.insert(Arc::clone(&device));
                // The address graduates from the scan queue to an
                // is_manual registry entry, which keeps being scanned.
                if is_manual {
                    lock(&self.manual_queue).remove(&ip);
                }
                info!(%device, "device discovered");
                let _ = self.event_tx.send(ControllerEvent::Discovered(device));
            } else {
                debug!(%device, "device rejected by admission callback");
            }
        }

        if *lock(&self.evict_enabled) {
            self.evict();
        }
    }

    fn handle_status(&self, status: &DeviceStatus, addr: SocketAddr) {
        let Some(device) = self.registry.by_ip(addr.ip()) else {
            debug!(%addr, "status from unregistered address, ignoring");
            return;
        };
        device.apply_status(status);

        if let Some(waiter) = self.waiters.get(device.device_id()) {
            if (waiter.verify)(&device.state()) {
                debug!(%device, "device reached desired state");
                waiter.notify.notify_one();
            }
        }
    }

    fn call_discovered(&self, device: &Arc<LocalDevice>, is_new: bool) -> bool {
        match lock(&self.discovered_cb).as_ref() {
            Some(callback) => callback(device, is_new),
            None => true,
        }
    }

    // ── Eviction ─────────────────────────────────────────────────

    fn evict(&self) {
        let evict_interval = self.config.evict_interval;
        let stale: Vec<Arc<LocalDevice>> = self
            .registry
            .snapshot()
            .iter()
            .filter(|device| {
                chrono::Utc::now()
                    .signed_duration_since(device.last_seen())
                    .to_std()
                    .is_ok_and(|age| age >= evict_interval)
            })
            .cloned()
            .collect();

        for device in stale {
            if self.registry.remove(device.device_id()).is_none() {
                continue;
            }
            self.abort_device_commands(device.device_id());
            self.waiters.remove(device.device_id());
            device.detach();
            debug!(%device, "device evicted");
            let _ = self.event_tx.send(ControllerEvent::Evicted(device));
        }
    }

    /// Cancel every in-flight retry task for a device, without waiting
    /// for them to unwind.
    fn abort_device_commands(&self, device_id: &str) {
        let keys: Vec<CommandKey> = self
            .pending
            .iter()
            .filter(|r| r.key().0 == device_id)
            .map(|r| r.key().clone())
            .collect();
        for key in keys {
            if let Some((_, inflight)) = self.pending.remove(&key) {
                inflight.cancel.cancel();
            }
        }
    }

    // ── Command execution engine ─────────────────────────────────

    /// Start a command: cancel and await any prior task for the same
    /// (device, kind) key, then spawn the retry task.
    async fn execute(
        self: &Arc<Self>,
        device: &Arc<LocalDevice>,
        request: Request,
        kind: CommandKind,
        verify: Option<VerifyState>,
    ) {
        let key: CommandKey = (device.device_id().to_owned(), kind);

        if let Some((_, prior)) = self.pending.remove(&key) {
            prior.cancel.cancel();
            let _ = prior.handle.await;
            debug!(%device, command = %kind, "cancelled superseded command task");
        }

        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.cancel.child_token();

        let inner = Arc::clone(self);
        let task_device = Arc::clone(device);
        let task_cancel = cancel.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            inner
                .run_with_retries(&task_device, &request, kind, verify, &task_cancel)
                .await;
            // Only clean up our own map entry; a successor may have
            // replaced it already.
            inner
                .pending
                .remove_if(&task_key, |_, inflight| inflight.id == id);
        });

        self.pending.insert(key, InFlight { id, cancel, handle });
    }

    /// Immediate send, status nudge, then the backoff schedule racing a
    /// verification signal (when one applies) until verified, exhausted,
    /// or cancelled.
    async fn run_with_retries(
        self: &Arc<Self>,
        device: &Arc<LocalDevice>,
        request: &Request,
        kind: CommandKind,
        verify: Option<VerifyState>,
        cancel: &CancellationToken,
    ) {
        self.send_command(device, request).await;
        if !sleep_unless_cancelled(COMMAND_STATUS_GAP, cancel).await {
            return;
        }
        self.send_status_request(device).await;

        let Some(verify) = verify else {
            self.run_blind_retries(device, request, kind, cancel).await;
            return;
        };

        // Register the wake signal before entering the wait loop,
        // replacing any stale registration for this device.
        let notify = Arc::new(Notify::new());
        self.waiters.insert(
            device.device_id().to_owned(),
            StateWaiter {
                notify: Arc::clone(&notify),
                verify: Arc::clone(&verify),
            },
        );

        let verified = 'retry: {
            // A status snapshot may already have satisfied the
            // predicate before the waiter was registered.
            if verify(&device.state()) {
                break 'retry true;
            }

            for (attempt, delay) in RETRY_PATTERN[..RETRY_PATTERN.len() - 1].iter().enumerate() {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        debug!(%device, command = %kind, attempt, "cancelled during retry wait");
                        break 'retry false;
                    }
                    () = notify.notified() => break 'retry true,
                    () = sleep(*delay) => {}
                }

                self.send_command(device, request).await;
                if !sleep_unless_cancelled(COMMAND_STATUS_GAP, cancel).await {
                    break 'retry false;
                }
                self.send_status_request(device).await;
                debug!(%device, command = %kind, attempt = attempt + 1, "command resent");
            }
            false
        };

        // Drop our registration unless a successor already replaced it.
        self.waiters.remove_if(device.device_id(), |_, waiter| {
            Arc::ptr_eq(&waiter.notify, &notify)
        });

        if verified {
            debug!(%device, command = %kind, "desired state reached, stopping retries");
        } else if !cancel.is_cancelled() {
            // Not an error: periodic polling reconciles eventually.
            debug!(%device, command = %kind, "retry schedule exhausted without verification");
        }
    }

    /// Fixed number of blind resends for commands whose effect is not
    /// locally observable (scene / segment).
    async fn run_blind_retries(
        &self,
        device: &Arc<LocalDevice>,
        request: &Request,
        kind: CommandKind,
        cancel: &CancellationToken,
    ) {
        for (attempt, delay) in RETRY_PATTERN[..RETRY_PATTERN.len() - 1].iter().enumerate() {
            if !sleep_unless_cancelled(*delay, cancel).await {
                debug!(%device, command = %kind, attempt, "cancelled during retry wait");
                return;
            }
            self.send_command(device, request).await;
            self.send_status_request(device).await;
            debug!(%device, command = %kind, attempt = attempt + 1, "command resent");
        }
    }
}

// ── Background tasks ─────────────────────────────────────────────

async fn recv_loop(inner: Arc<ControllerInner>, socket: Arc<UdpSocket>, cancel: CancellationToken) {
    let mut buf = [0u8; 2048];
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, addr)) => {
                    debug!(len, %addr, "datagram received");
                    let data = buf[..len].to_vec();
                    // Each datagram dispatches independently; handling
                    // one never blocks receipt of the next.
                    tokio::spawn(Arc::clone(&inner).handle_datagram(data, addr));
                }
                Err(err) => {
                    warn!(error = %err, "receive failed");
                }
            }
        }
    }
    debug!("receive loop stopped");
}

async fn discovery_timer(inner: Arc<ControllerInner>, cancel: CancellationToken) {
    loop {
        inner.send_discovery_round().await;
        let interval = *lock(&inner.discovery_interval);
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = sleep(interval) => {}
        }
    }
    debug!("discovery timer stopped");
}

async fn update_timer(inner: Arc<ControllerInner>, cancel: CancellationToken) {
    let interval = inner.config.update_interval;
    loop {
        inner.send_status_round().await;
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = sleep(interval) => {}
        }
    }
    debug!("update timer stopped");
}

// ── Helpers ──────────────────────────────────────────────────────

/// Sleep, returning `false` if cancelled first.
async fn sleep_unless_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = sleep(duration) => true,
    }
}

fn rgb_within_tolerance(current: Rgb, target: Rgb) -> bool {
    current.r.abs_diff(target.r) <= RGB_TOLERANCE
        && current.g.abs_diff(target.g) <= RGB_TOLERANCE
        && current.b.abs_diff(target.b) <= RGB_TOLERANCE
}

/// Build the listening socket: `SO_REUSEADDR` + `SO_BROADCAST`, bound
/// to the configured address. Bind failure is the one error surfaced
/// as a distinct retryable condition.
fn bind_socket(config: &ControllerConfig) -> Result<std::net::UdpSocket, CoreError> {
    let domain = match config.listening_address {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;

    let bind_addr = SocketAddr::new(config.listening_address, config.listening_port);
    socket
        .bind(&bind_addr.into())
        .map_err(|source| CoreError::Bind {
            port: config.listening_port,
            source,
        })?;

    Ok(socket.into())
}

/// Poison-tolerant mutex lock. State behind these locks stays
/// consistent even if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rgb_tolerance_boundaries() {
        let target = Rgb::new(100, 100, 100);
        assert!(rgb_within_tolerance(Rgb::new(105, 95, 100), target));
        assert!(!rgb_within_tolerance(Rgb::new(106, 100, 100), target));
        assert!(!rgb_within_tolerance(Rgb::new(100, 94, 100), target));
    }

    #[test]
    fn retry_pattern_matches_tuned_values() {
        let millis: Vec<u128> = RETRY_PATTERN.iter().map(Duration::as_millis).collect();
        assert_eq!(
            millis,
            vec![200, 500, 1000, 2000, 3000, 4000, 5000, 7000, 10000]
        );
    }

    #[tokio::test]
    async fn bind_error_on_port_conflict_is_retryable() {
        let holder = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind holder");
        let port = holder.local_addr().expect("addr").port();

        let config = ControllerConfig {
            listening_address: "127.0.0.1".parse().expect("ip"),
            listening_port: port,
            broadcast_address: "127.0.0.1".parse().expect("ip"),
            update_enabled: false,
            ..ControllerConfig::default()
        };
        let controller = Controller::new(config);
        let err = controller.start().await.expect_err("port is taken");
        assert!(matches!(err, CoreError::Bind { .. }));
        assert!(err.is_retryable());
    }
}
