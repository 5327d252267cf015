// ── Command execution support types ──
//
// The retry protocol: send once, nudge the device for a status report,
// then resend on a fixed backoff schedule until either the observed
// state verifies the command took effect or the schedule is exhausted.
// Scene/segment commands have no observable resulting state, so they
// run the same schedule blind -- the pattern length is what bounds
// network chatter either way.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::device::LightState;

/// Backoff schedule between resends. Empirically tuned against real
/// hardware; the final entry is a cap that is never slept (the loop
/// performs one fewer resend than there are entries).
pub const RETRY_PATTERN: [Duration; 9] = [
    Duration::from_millis(200),
    Duration::from_millis(500),
    Duration::from_millis(1000),
    Duration::from_millis(2000),
    Duration::from_millis(3000),
    Duration::from_millis(4000),
    Duration::from_millis(5000),
    Duration::from_millis(7000),
    Duration::from_millis(10000),
];

/// Pause between a command send and the follow-up status request, to
/// keep the two datagrams from colliding at the device.
pub(crate) const COMMAND_STATUS_GAP: Duration = Duration::from_millis(100);

/// Per-channel slack when verifying an RGB command took effect.
pub(crate) const RGB_TOLERANCE: u8 = 5;
/// Kelvin slack when verifying a temperature command took effect.
pub(crate) const KELVIN_TOLERANCE: u32 = 100;

/// Command kinds for in-flight exclusivity: at most one retry task may
/// run per (device, kind) pair, so a rapid sequence of user actions
/// only ever races the most recent intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum CommandKind {
    Turn,
    Brightness,
    Color,
    Scene,
    Segment,
}

/// Key for the in-flight command map.
pub(crate) type CommandKey = (String, CommandKind);

/// A spawned retry task. The id disambiguates map cleanup when a task
/// finishes around the same time a successor replaces it.
pub(crate) struct InFlight {
    pub(crate) id: u64,
    pub(crate) cancel: CancellationToken,
    pub(crate) handle: JoinHandle<()>,
}

/// Predicate over a device's live state that ends a retry sequence early.
pub(crate) type VerifyState = Arc<dyn Fn(&LightState) -> bool + Send + Sync>;

/// Registered wake signal + predicate, at most one per device. Inbound
/// status handling re-evaluates the predicate and fires the signal.
pub(crate) struct StateWaiter {
    pub(crate) notify: Arc<Notify>,
    pub(crate) verify: VerifyState,
}
