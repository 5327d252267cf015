//! CLI error types with miette diagnostics.

use miette::Diagnostic;
use thiserror::Error;

use govee_lan_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const NOT_FOUND: i32 = 4;
    pub const CONNECTION: i32 = 7;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    #[error("Could not start the LAN controller")]
    #[diagnostic(
        code(govee::endpoint),
        help(
            "Another process may be holding the listening port.\n\
             Check `listening_port` in your config, or wait and retry."
        )
    )]
    Endpoint(#[source] CoreError),

    #[error("No light matching '{identifier}' answered within {wait_secs}s")]
    #[diagnostic(
        code(govee::device_not_found),
        help(
            "Run: govee discover to list reachable lights.\n\
             On networks that filter multicast, pass --ip <ADDR> or add\n\
             the address to `discovery.manual_addresses` in your config."
        )
    )]
    DeviceNotFound { identifier: String, wait_secs: u64 },

    #[error("No lights answered the scan within {wait_secs}s")]
    #[diagnostic(
        code(govee::no_devices),
        help(
            "Make sure LAN control is enabled for each light in the Govee app.\n\
             On networks that filter multicast, pass --ip <ADDR>."
        )
    )]
    NoDevices { wait_secs: u64 },

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(govee::validation))]
    Validation { field: String, reason: String },

    #[error(transparent)]
    #[diagnostic(code(govee::config))]
    Config(Box<figment::Error>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for CliError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        Self::Endpoint(err)
    }
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Endpoint(_) => exit_code::CONNECTION,
            Self::DeviceNotFound { .. } | Self::NoDevices { .. } => exit_code::NOT_FOUND,
            Self::Validation { .. } => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}
