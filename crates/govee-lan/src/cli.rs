//! Argument definitions for the `govee` binary.

use std::net::IpAddr;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use govee_lan_core::Rgb;

#[derive(Debug, Parser)]
#[command(
    name = "govee",
    version,
    about = "Control Govee lights over the local network",
    propagate_version = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[arg(long, global = true, value_enum, default_value = "table")]
    pub output: OutputFormat,

    /// Seconds to wait for devices to answer a scan
    #[arg(long, global = true, value_name = "SECONDS")]
    pub wait: Option<u64>,

    /// Scan this address directly instead of relying on multicast.
    /// Repeatable; useful on networks that filter multicast.
    #[arg(long = "ip", global = true, value_name = "ADDR")]
    pub ips: Vec<IpAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Scan the network and list every light that answers
    Discover,

    /// Show the live state of a light
    Status(DeviceArg),

    /// Turn a light on
    On(DeviceArg),

    /// Turn a light off
    Off(DeviceArg),

    /// Set brightness
    Brightness {
        #[command(flatten)]
        device: DeviceArg,

        /// Brightness percentage, 0-100
        value: u8,
    },

    /// Set RGB color
    Color {
        #[command(flatten)]
        device: DeviceArg,

        /// Color as "RRGGBB", "#RRGGBB", or "r,g,b"
        color: String,
    },

    /// Set white color temperature
    Temperature {
        #[command(flatten)]
        device: DeviceArg,

        /// Temperature in kelvin (e.g. 2700-6500)
        kelvin: u32,
    },

    /// Activate a named scene
    Scene {
        #[command(flatten)]
        device: DeviceArg,

        /// Scene name (e.g. sunrise, nightlight)
        name: String,
    },

    /// Set the color of one segment of a multi-zone strip
    Segment {
        #[command(flatten)]
        device: DeviceArg,

        /// Segment number, starting at 1
        index: usize,

        /// Color as "RRGGBB", "#RRGGBB", or "r,g,b"
        color: String,
    },

    /// Print the merged configuration and its file location
    Config,
}

#[derive(Debug, Args)]
pub struct DeviceArg {
    /// Device id, configured alias, or IP address
    #[arg(value_name = "DEVICE")]
    pub device: String,
}

/// Parse a user-supplied color: `RRGGBB`, `#RRGGBB`, or `r,g,b`.
pub fn parse_color(input: &str) -> Option<Rgb> {
    let trimmed = input.trim();

    if let Some((r, rest)) = trimmed.split_once(',') {
        let (g, b) = rest.split_once(',')?;
        return Some(Rgb::new(
            r.trim().parse().ok()?,
            g.trim().parse().ok()?,
            b.trim().parse().ok()?,
        ));
    }

    let hex = trimmed.strip_prefix('#').unwrap_or(trimmed);
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    Some(Rgb::new(
        u8::from_str_radix(&hex[0..2], 16).ok()?,
        u8::from_str_radix(&hex[2..4], 16).ok()?,
        u8::from_str_radix(&hex[4..6], 16).ok()?,
    ))
}
