// ── Device registry ──
//
// Concurrent storage keyed by device id with a watch-published
// snapshot for reactive consumers. IP is deliberately not an index:
// a device may reappear at a new address while a stale entry still
// holds the old one, so identity resolution always goes through the
// announcement upsert path, and IP lookup (used only to attribute
// inbound status datagrams) is a linear scan over current addresses.

use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::device::LocalDevice;

pub(crate) struct DeviceRegistry {
    by_id: DashMap<String, Arc<LocalDevice>>,
    snapshot: watch::Sender<Arc<Vec<Arc<LocalDevice>>>>,
}

impl DeviceRegistry {
    pub(crate) fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            by_id: DashMap::new(),
            snapshot,
        }
    }

    /// Insert a new device. Returns `false` if the id already existed
    /// (the existing entry is kept -- announcements refresh in place).
    pub(crate) fn insert(&self, device: Arc<LocalDevice>) -> bool {
        let is_new = !self.by_id.contains_key(device.device_id());
        if is_new {
            self.by_id
                .insert(device.device_id().to_owned(), device);
            self.rebuild_snapshot();
        }
        is_new
    }

    /// Remove a device by id, returning it if it existed.
    pub(crate) fn remove(&self, device_id: &str) -> Option<Arc<LocalDevice>> {
        let removed = self.by_id.remove(device_id).map(|(_, device)| device);
        if removed.is_some() {
            self.rebuild_snapshot();
        }
        removed
    }

    pub(crate) fn get(&self, device_id: &str) -> Option<Arc<LocalDevice>> {
        self.by_id.get(device_id).map(|r| Arc::clone(r.value()))
    }

    /// Attribute an inbound datagram to a device by its current source
    /// address. Not an identity lookup.
    pub(crate) fn by_ip(&self, ip: IpAddr) -> Option<Arc<LocalDevice>> {
        self.by_id
            .iter()
            .find(|r| r.value().ip() == ip)
            .map(|r| Arc::clone(r.value()))
    }

    pub(crate) fn snapshot(&self) -> Arc<Vec<Arc<LocalDevice>>> {
        self.snapshot.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Arc<Vec<Arc<LocalDevice>>>> {
        self.snapshot.subscribe()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Remove every device, returning them so the controller can
    /// detach and cancel their in-flight work.
    pub(crate) fn drain(&self) -> Vec<Arc<LocalDevice>> {
        let ids: Vec<String> = self.by_id.iter().map(|r| r.key().clone()).collect();
        let drained = ids
            .iter()
            .filter_map(|id| self.by_id.remove(id).map(|(_, device)| device))
            .collect();
        self.rebuild_snapshot();
        drained
    }

    fn rebuild_snapshot(&self) {
        let devices: Vec<Arc<LocalDevice>> =
            self.by_id.iter().map(|r| Arc::clone(r.value())).collect();
        // `send_modify` updates unconditionally, even with zero receivers.
        self.snapshot.send_modify(|snap| *snap = Arc::new(devices));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceVersions;
    use govee_lan_proto::capabilities;
    use std::sync::Weak;

    fn device(id: &str, ip: &str) -> Arc<LocalDevice> {
        Arc::new(LocalDevice::new(
            Weak::new(),
            ip.parse().expect("valid ip"),
            id.to_owned(),
            "H6160".to_owned(),
            capabilities::capabilities_for("H6160"),
            false,
            DeviceVersions::default(),
        ))
    }

    #[test]
    fn insert_is_new_only_once() {
        let registry = DeviceRegistry::new();
        assert!(registry.insert(device("A", "10.0.0.1")));
        assert!(!registry.insert(device("A", "10.0.0.2")));
        assert_eq!(registry.len(), 1);
        // original entry kept
        assert_eq!(
            registry.get("A").expect("present").ip(),
            "10.0.0.1".parse::<IpAddr>().expect("valid ip")
        );
    }

    #[test]
    fn lookup_by_ip_follows_ip_migration() {
        let registry = DeviceRegistry::new();
        let dev = device("A", "10.0.0.1");
        registry.insert(Arc::clone(&dev));

        assert!(registry.by_ip("10.0.0.1".parse().expect("ip")).is_some());
        dev.set_ip("10.0.0.9".parse().expect("ip"));
        assert!(registry.by_ip("10.0.0.1".parse().expect("ip")).is_none());
        assert!(registry.by_ip("10.0.0.9".parse().expect("ip")).is_some());
    }

    #[test]
    fn snapshot_tracks_membership() {
        let registry = DeviceRegistry::new();
        let mut rx = registry.subscribe();
        assert!(registry.snapshot().is_empty());

        registry.insert(device("A", "10.0.0.1"));
        registry.insert(device("B", "10.0.0.2"));
        assert!(rx.has_changed().expect("sender alive"));
        assert_eq!(rx.borrow_and_update().len(), 2);

        registry.remove("A");
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn drain_empties_registry() {
        let registry = DeviceRegistry::new();
        registry.insert(device("A", "10.0.0.1"));
        registry.insert(device("B", "10.0.0.2"));

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
        assert!(registry.snapshot().is_empty());
    }
}
