//! Remote device discovery.
//!
//! Devices come from `kdeconnect-cli -l`, whose output looks like:
//!
//! ```text
//! - Phone: abcd1234 (paired and reachable)
//! - Tablet: ef567890 (paired)
//! 2 devices found
//! ```
//!
//! The registry keeps the latest listing and decides which device an upload
//! targets when the user has not picked one explicitly.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::DeviceListingConfig;
use crate::error::{DeviceError, Result};
use crate::process::Invocation;

static DEVICE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^-\s+(.+?):\s+([A-Za-z0-9_]+)\s+\((.+)\)").expect("valid regex")
});

/// A device reported by the listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    /// Stable device id.
    pub id: String,
    /// User-assigned device name.
    pub name: String,
    /// Whether the device can be reached right now.
    pub reachable: bool,
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.id)?;
        if !self.reachable {
            write!(f, " [offline]")?;
        }
        Ok(())
    }
}

/// Parse one listing line.
pub fn parse_device_line(line: &str) -> Result<Device> {
    let caps = DEVICE_LINE
        .captures(line)
        .ok_or_else(|| DeviceError::ParseFailure(line.to_string()))?;
    let field = |i: usize| caps.get(i).map_or("", |m| m.as_str()).trim();
    Ok(Device {
        name: field(1).to_string(),
        id: field(2).to_string(),
        reachable: field(3).contains("reachable"),
    })
}

/// Parse a full listing, skipping lines that are not device records.
pub fn parse_device_list(output: &str) -> Vec<Device> {
    output
        .lines()
        .filter_map(|line| match parse_device_line(line) {
            Ok(device) => Some(device),
            Err(e) => {
                if !line.trim().is_empty() {
                    debug!("{}", e);
                }
                None
            }
        })
        .collect()
}

/// Invocation that lists devices.
pub fn scan_invocation(listing: &DeviceListingConfig, limit: Duration) -> Invocation {
    Invocation::system(listing.program.clone())
        .args(listing.args.iter().cloned())
        .captured()
        .with_timeout(limit)
}

/// Latest device listing plus the selection policy.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
    configured_default: Option<String>,
    session_choice: Option<String>,
    selected: Option<String>,
}

impl DeviceRegistry {
    /// Create an empty registry preferring `configured_default`.
    pub fn new(configured_default: Option<String>) -> Self {
        Self {
            configured_default: configured_default.filter(|id| !id.is_empty()),
            ..Self::default()
        }
    }

    /// Devices from the latest listing.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Id of the device uploads will target.
    pub fn selected_id(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// The device uploads will target.
    pub fn selected(&self) -> Option<&Device> {
        let id = self.selected.as_deref()?;
        self.devices.iter().find(|d| d.id == id)
    }

    /// Whether any listed device is reachable.
    pub fn any_reachable(&self) -> bool {
        self.devices.iter().any(|d| d.reachable)
    }

    /// Record the user's choice for this session.
    pub fn select(&mut self, id: &str) -> Result<&Device> {
        let device = self
            .devices
            .iter()
            .find(|d| d.id == id)
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))?;
        info!("Selected device {}", device);
        self.session_choice = Some(id.to_string());
        self.selected = Some(id.to_string());
        Ok(device)
    }

    /// Replace the listing with parsed `output` and reapply the selection policy.
    pub fn apply_listing(&mut self, output: &str) -> &[Device] {
        self.devices = parse_device_list(output);
        self.reselect();
        info!(
            "Found {} device(s), {} reachable, selected {:?}",
            self.devices.len(),
            self.devices.iter().filter(|d| d.reachable).count(),
            self.selected
        );
        &self.devices
    }

    /// Clear the listing after a failed scan.
    ///
    /// The user's session choice is kept so it is restored once the device
    /// shows up again.
    pub fn apply_failure(&mut self, reason: &str) {
        warn!("Device listing failed: {}", reason);
        self.devices.clear();
        self.selected = None;
    }

    /// Session choice, then previous selection, then configured default,
    /// then first reachable device.
    fn reselect(&mut self) {
        let listed = |id: &Option<String>| {
            id.as_ref()
                .filter(|id| self.devices.iter().any(|d| &d.id == *id))
                .cloned()
        };

        self.selected = listed(&self.session_choice)
            .or_else(|| listed(&self.selected))
            .or_else(|| listed(&self.configured_default))
            .or_else(|| {
                self.devices
                    .iter()
                    .find(|d| d.reachable)
                    .map(|d| d.id.clone())
            });
    }
}
