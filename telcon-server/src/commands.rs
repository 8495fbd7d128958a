//! Demo application commands.
//!
//! Stands in for the real device command set: every command is logged, and
//! `print_mac` reports the configured station MAC. With the console running
//! the output shows up on the Telnet client.

use tracing::{info, warn};

use telcon_core::CommandHandler;

/// Reports the station MAC address.
pub const PRINT_MAC: &str = "print_mac";

#[derive(Debug, Clone)]
pub struct DeviceCommands {
    mac: String,
}

impl DeviceCommands {
    pub fn new(mac: impl Into<String>) -> Self {
        Self { mac: mac.into() }
    }
}

impl CommandHandler for DeviceCommands {
    fn handle(&self, command: &str) {
        info!("executing command {command} ...");

        match command {
            PRINT_MAC => info!("MAC address: {}", self.mac),
            other => warn!("unknown command: {other}"),
        }
    }
}
