//! Command dispatch: each invocation runs a short-lived controller
//! session -- bind, scan, act on the target light, tear down.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout, timeout_at};
use tracing::debug;

use govee_lan_core::{ColorMode, Controller, LocalDevice};

use crate::cli::{self, Command, GlobalOpts};
use crate::config::Config;
use crate::error::CliError;
use crate::output;

/// Grace period for a verified command to land before reporting state.
const SETTLE: Duration = Duration::from_millis(1200);

pub async fn dispatch(command: Command, global: &GlobalOpts, config: &Config) -> Result<(), CliError> {
    match command {
        Command::Config => show_config(config),

        Command::Discover => discover(global, config).await,

        Command::Status(arg) => {
            let (session, device) = connect(global, config, &arg.device).await?;
            refresh_status(&session.controller, &device).await;
            output::print_state(&device, global.output);
            session.finish().await;
            Ok(())
        }

        Command::On(arg) => {
            let (session, device) = connect(global, config, &arg.device).await?;
            session.controller.turn_on_off(&device, true).await;
            session.report(&device, global).await;
            Ok(())
        }

        Command::Off(arg) => {
            let (session, device) = connect(global, config, &arg.device).await?;
            session.controller.turn_on_off(&device, false).await;
            session.report(&device, global).await;
            Ok(())
        }

        Command::Brightness { device: arg, value } => {
            if value > 100 {
                return Err(CliError::Validation {
                    field: "brightness".into(),
                    reason: format!("{value} is out of range (0-100)"),
                });
            }
            let (session, device) = connect(global, config, &arg.device).await?;
            session.controller.set_brightness(&device, value).await;
            session.report(&device, global).await;
            Ok(())
        }

        Command::Color { device: arg, color } => {
            let rgb = cli::parse_color(&color).ok_or_else(|| CliError::Validation {
                field: "color".into(),
                reason: format!("'{color}' is not RRGGBB, #RRGGBB, or r,g,b"),
            })?;
            let (session, device) = connect(global, config, &arg.device).await?;
            session.controller.set_color(&device, ColorMode::Rgb(rgb)).await;
            session.report(&device, global).await;
            Ok(())
        }

        Command::Temperature { device: arg, kelvin } => {
            let (session, device) = connect(global, config, &arg.device).await?;
            session
                .controller
                .set_color(&device, ColorMode::Kelvin(kelvin))
                .await;
            session.report(&device, global).await;
            Ok(())
        }

        Command::Scene { device: arg, name } => {
            let (session, device) = connect(global, config, &arg.device).await?;
            session.controller.set_scene(&device, &name).await;
            output::note(&format!("scene '{name}' sent to {device}"));
            session.finish().await;
            Ok(())
        }

        Command::Segment {
            device: arg,
            index,
            color,
        } => {
            let rgb = cli::parse_color(&color).ok_or_else(|| CliError::Validation {
                field: "color".into(),
                reason: format!("'{color}' is not RRGGBB, #RRGGBB, or r,g,b"),
            })?;
            if index == 0 {
                return Err(CliError::Validation {
                    field: "segment".into(),
                    reason: "segment numbering starts at 1".into(),
                });
            }
            let (session, device) = connect(global, config, &arg.device).await?;
            session.controller.set_segment_color(&device, index, rgb).await;
            output::note(&format!("segment {index} color sent to {device}"));
            session.finish().await;
            Ok(())
        }
    }
}

// ── Session plumbing ─────────────────────────────────────────────

struct Session {
    controller: Controller,
    wait: Duration,
}

impl Session {
    /// Seed manual addresses, bind, and let the startup scan round go
    /// out. Addresses are queued before `start()` so the immediate
    /// round covers them.
    async fn start(
        global: &GlobalOpts,
        config: &Config,
        extra: Option<IpAddr>,
    ) -> Result<Self, CliError> {
        let controller = Controller::new(config.controller_config());
        for ip in global
            .ips
            .iter()
            .chain(config.discovery.manual_addresses.iter())
            .chain(extra.iter())
        {
            controller.add_device_to_queue(*ip);
        }
        controller.start().await?;
        Ok(Self {
            controller,
            wait: config.wait(global),
        })
    }

    /// Block until a light matching `target` (device id or address)
    /// appears in the registry, or the scan window closes.
    async fn wait_for_device(&self, target: &str) -> Result<Arc<LocalDevice>, CliError> {
        let target_ip: Option<IpAddr> = target.parse().ok();
        let mut rx = self.controller.subscribe_devices();
        let deadline = tokio::time::Instant::now() + self.wait;

        loop {
            let found = rx.borrow_and_update().iter().find(|device| {
                target_ip.is_some_and(|ip| device.ip() == ip)
                    || device.device_id().eq_ignore_ascii_case(target)
            }).cloned();
            if let Some(device) = found {
                debug!(%device, "target device resolved");
                return Ok(device);
            }
            if timeout_at(deadline, rx.changed()).await.is_err() {
                return Err(CliError::DeviceNotFound {
                    identifier: target.to_owned(),
                    wait_secs: self.wait.as_secs(),
                });
            }
        }
    }

    /// Give the verified-command engine a moment, then print the
    /// light's resulting state and shut down.
    async fn report(self, device: &Arc<LocalDevice>, global: &GlobalOpts) {
        sleep(SETTLE).await;
        output::print_state(device, global.output);
        self.finish().await;
    }

    async fn finish(self) {
        if timeout(Duration::from_secs(2), self.controller.cleanup())
            .await
            .is_err()
        {
            debug!("cleanup did not finish before shutdown deadline");
        }
    }
}

/// Resolve the device argument (alias, id, or address) and wait for
/// the matching light to answer a scan.
async fn connect(
    global: &GlobalOpts,
    config: &Config,
    identifier: &str,
) -> Result<(Session, Arc<LocalDevice>), CliError> {
    let target = config
        .resolve_alias(identifier)
        .unwrap_or(identifier)
        .to_owned();
    let target_ip: Option<IpAddr> = target.parse().ok();

    let session = Session::start(global, config, target_ip).await?;
    match session.wait_for_device(&target).await {
        Ok(device) => Ok((session, device)),
        Err(err) => {
            session.finish().await;
            Err(err)
        }
    }
}

/// Nudge the device for a fresh status report and wait briefly for it.
async fn refresh_status(controller: &Controller, device: &Arc<LocalDevice>) {
    let mut rx = device.subscribe();
    controller.request_status(device).await;
    if timeout(Duration::from_secs(2), rx.changed()).await.is_err() {
        debug!(%device, "no status reply, showing last known state");
    }
}

async fn discover(global: &GlobalOpts, config: &Config) -> Result<(), CliError> {
    let session = Session::start(global, config, None).await?;
    sleep(session.wait).await;

    let devices = session.controller.devices();
    if devices.is_empty() {
        let wait_secs = session.wait.as_secs();
        session.finish().await;
        return Err(CliError::NoDevices { wait_secs });
    }

    // Pull a status snapshot from each light so the listing can show
    // live state, not just identity.
    for device in devices.iter() {
        session.controller.request_status(device).await;
    }
    sleep(Duration::from_millis(500)).await;

    output::print_devices(&devices, global.output);
    session.finish().await;
    Ok(())
}

fn show_config(config: &Config) -> Result<(), CliError> {
    output::note(&format!("config file: {}", crate::config::config_path().display()));
    let rendered = toml::to_string_pretty(config).map_err(|err| CliError::Validation {
        field: "config".into(),
        reason: err.to_string(),
    })?;
    println!("{rendered}");
    Ok(())
}
