//! Rendering for discovered devices and light state, table or JSON.

use std::sync::Arc;

use owo_colors::OwoColorize;
use serde_json::json;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use govee_lan_core::{LightState, LocalDevice};

use crate::cli::OutputFormat;

#[derive(Tabled)]
struct DeviceRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "MODEL")]
    model: String,
    #[tabled(rename = "IP")]
    ip: String,
    #[tabled(rename = "SOURCE")]
    source: String,
    #[tabled(rename = "POWER")]
    power: String,
    #[tabled(rename = "BRIGHTNESS")]
    brightness: String,
}

pub fn print_devices(devices: &[Arc<LocalDevice>], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let entries: Vec<_> = devices.iter().map(device_json).collect();
            println!("{}", serde_json::Value::Array(entries));
        }
        OutputFormat::Table => {
            let rows: Vec<DeviceRow> = devices
                .iter()
                .map(|device| {
                    let state = device.state();
                    DeviceRow {
                        id: device.device_id().to_owned(),
                        model: device.model().to_owned(),
                        ip: device.ip().to_string(),
                        source: if device.is_manual() { "manual" } else { "multicast" }.into(),
                        power: power_label(&state),
                        brightness: format!("{}%", state.brightness),
                    }
                })
                .collect();
            println!("{}", Table::new(rows).with(Style::rounded()));
        }
    }
}

pub fn print_state(device: &Arc<LocalDevice>, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", device_json(device)),
        OutputFormat::Table => {
            let state = device.state();
            println!("{} ({}) at {}", device.device_id().bold(), device.model(), device.ip());
            println!("  power       {}", power_label(&state));
            println!("  brightness  {}%", state.brightness);
            println!(
                "  color       #{:02x}{:02x}{:02x} {}",
                state.rgb.r,
                state.rgb.g,
                state.rgb.b,
                "  ".on_truecolor(state.rgb.r, state.rgb.g, state.rgb.b)
            );
            match state.color_temperature_kelvin {
                Some(kelvin) => println!("  temperature {kelvin}K"),
                None => println!("  temperature -"),
            }
        }
    }
}

pub fn note(message: &str) {
    println!("{message}");
}

fn power_label(state: &LightState) -> String {
    if state.on {
        format!("{}", "on".green())
    } else {
        format!("{}", "off".dimmed())
    }
}

fn device_json(device: &Arc<LocalDevice>) -> serde_json::Value {
    let state = device.state();
    json!({
        "device_id": device.device_id(),
        "model": device.model(),
        "ip": device.ip().to_string(),
        "manual": device.is_manual(),
        "last_seen": device.last_seen().to_rfc3339(),
        "state": {
            "on": state.on,
            "brightness": state.brightness,
            "rgb": [state.rgb.r, state.rgb.g, state.rgb.b],
            "color_temperature_kelvin": state.color_temperature_kelvin,
        },
    })
}
