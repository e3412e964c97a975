//! Device listing.

use musiclib_mobile_core::Device;
use serde::Serialize;
use tracing::info;

use super::{CommandError, Context};

#[derive(Debug, Serialize)]
struct DeviceListing<'a> {
    devices: &'a [Device],
    selected: Option<&'a str>,
}

/// `devices`: scan, optionally remember a default, and list.
pub async fn list(ctx: &mut Context, set_default: Option<String>) -> Result<(), CommandError> {
    ctx.session.sync().scan_devices()?;
    ctx.settle().await?;
    ctx.check_failure()?;

    if let Some(id) = set_default {
        ctx.session.sync().select_device(&id)?;
        ctx.config.set_default_device(Some(id.clone()))?;
        info!("Default device set to {}", id);
    }

    let registry = ctx.session.sync().devices();
    let listing = DeviceListing {
        devices: registry.devices(),
        selected: registry.selected_id(),
    };
    ctx.reporter.result(&listing, || render(&listing));
    Ok(())
}

fn render(listing: &DeviceListing<'_>) -> String {
    if listing.devices.is_empty() {
        return "No devices found".to_string();
    }
    listing
        .devices
        .iter()
        .map(|d| {
            let marker = if listing.selected == Some(d.id.as_str()) {
                '*'
            } else {
                ' '
            };
            format!("{marker} {d}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}
