//! Modem discovery.
//!
//! Walks the sysfs USB device tree, resolves each candidate's ids, kernel
//! driver and serial endpoints, applies the user's filter and binds a
//! configuration profile. The sysfs root is injectable so tests can run
//! against a synthetic tree.

use crate::error::{Error, Result};
use crate::profile::{Profile, ProfileRegistry};
use serde_json::json;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Optional constraints on discovery. All set fields must match.
#[derive(Debug, Default, Clone)]
pub struct FilterSpec {
    pub vendor: Option<u16>,
    pub device: Option<u16>,
    pub device_id: Option<String>,
    /// Bind this profile by name instead of autodetecting one.
    pub profile_name: Option<String>,
    /// Reject candidates without a matching profile.
    pub require_profile: bool,
}

/// A selected modem with its bound profile and resolved endpoints.
#[derive(Debug, Clone)]
pub struct ModemHandle {
    pub vendor: u16,
    pub device: u16,
    pub driver: String,
    /// Topology id as listed in sysfs, e.g. `1-1.2`.
    pub device_id: String,
    /// All serial endpoints the device exposes, in stable order.
    pub ttys: Vec<String>,
    pub ctl_tty: String,
    pub dat_tty: String,
    pub profile: Profile,
}

#[derive(Debug)]
struct UsbDevice {
    device_id: String,
    vendor: u16,
    device: u16,
    driver: String,
    ttys: Vec<String>,
}

impl UsbDevice {
    fn passes(&self, filter: &FilterSpec) -> bool {
        filter.vendor.map_or(true, |v| v == self.vendor)
            && filter.device.map_or(true, |d| d == self.device)
            && filter
                .device_id
                .as_deref()
                .map_or(true, |id| id == self.device_id)
    }
}

/// Enumerate USB devices that expose at least one serial endpoint.
fn enumerate(sysfs: &Path) -> Result<Vec<UsbDevice>> {
    let root = sysfs.join("bus/usb/devices");
    let entries = fs::read_dir(&root).map_err(|err| {
        Error::NoModem(format!("cannot enumerate usb devices at {root:?}: {err}"))
    })?;

    let mut names: Vec<String> = entries
        .filter_map(|e| Some(e.ok()?.file_name().to_string_lossy().into_owned()))
        // Entries with a colon are interfaces, not devices.
        .filter(|name| !name.contains(':'))
        .collect();
    names.sort();

    let mut devices = Vec::new();
    for name in names {
        let dir = root.join(&name);
        let Some(vendor) = read_hex_id(&dir.join("idVendor")) else {
            continue;
        };
        let Some(device) = read_hex_id(&dir.join("idProduct")) else {
            continue;
        };
        let (driver, ttys) = scan_interfaces(&dir, &name);
        if ttys.is_empty() {
            // Hubs and storage devices land here.
            continue;
        }
        debug!("found usb device {name} ({vendor:04x}:{device:04x}, driver {driver})");
        devices.push(UsbDevice {
            device_id: name,
            vendor,
            device,
            driver,
            ttys,
        });
    }
    Ok(devices)
}

fn read_hex_id(path: &Path) -> Option<u16> {
    let raw = fs::read_to_string(path).ok()?;
    u16::from_str_radix(raw.trim(), 16).ok()
}

/// Inspect the device's interface directories for the bound driver and the
/// serial character devices they expose.
fn scan_interfaces(dev_dir: &Path, device_id: &str) -> (String, Vec<String>) {
    let mut driver = String::new();
    let mut ttys = Vec::new();
    let prefix = format!("{device_id}:");

    let Ok(entries) = fs::read_dir(dev_dir) else {
        return (driver, ttys);
    };
    let mut interfaces: Vec<_> = entries
        .filter_map(|e| Some(e.ok()?.file_name().to_string_lossy().into_owned()))
        .filter(|name| name.starts_with(&prefix))
        .collect();
    interfaces.sort();

    for interface in interfaces {
        let dir = dev_dir.join(&interface);
        if driver.is_empty() {
            if let Ok(target) = fs::read_link(dir.join("driver")) {
                if let Some(name) = target.file_name() {
                    driver = name.to_string_lossy().into_owned();
                }
            }
        }
        collect_ttys(&dir, &mut ttys);
    }
    ttys.sort();
    (driver, ttys)
}

fn collect_ttys(interface: &Path, ttys: &mut Vec<String>) {
    let Ok(entries) = fs::read_dir(interface) else {
        return;
    };
    for name in entries.filter_map(|e| Some(e.ok()?.file_name().to_string_lossy().into_owned())) {
        if name == "tty" {
            // Newer kernels nest the tty device one level down.
            collect_ttys(&interface.join(name), ttys);
        } else if name.starts_with("tty") {
            ttys.push(name);
        }
    }
}

fn bind_profile<'a>(
    registry: &'a ProfileRegistry,
    candidate: &UsbDevice,
    filter: &FilterSpec,
) -> Result<Option<&'a Profile>> {
    if let Some(name) = &filter.profile_name {
        let profile = registry
            .by_name(name)
            .ok_or_else(|| Error::InvalidArg(format!("no such profile: {name}")))?;
        return Ok(Some(profile));
    }
    Ok(registry.find(candidate.vendor, candidate.device, &candidate.driver))
}

fn into_handle(candidate: UsbDevice, profile: &Profile) -> Result<ModemHandle> {
    let resolve = |idx: usize| {
        candidate.ttys.get(idx).cloned().ok_or_else(|| {
            Error::NoModem(format!(
                "profile {} expects at least {} serial endpoints, device {} has {}",
                profile.name,
                idx + 1,
                candidate.device_id,
                candidate.ttys.len()
            ))
        })
    };
    let ctl_tty = resolve(profile.ctl_idx)?;
    let dat_tty = resolve(profile.dat_idx)?;
    Ok(ModemHandle {
        vendor: candidate.vendor,
        device: candidate.device,
        driver: candidate.driver,
        device_id: candidate.device_id,
        ttys: candidate.ttys,
        ctl_tty,
        dat_tty,
        profile: profile.clone(),
    })
}

/// Select the first enumerated modem passing the filter and bind its profile.
pub fn find_modem(
    sysfs: &Path,
    registry: &ProfileRegistry,
    filter: &FilterSpec,
) -> Result<ModemHandle> {
    for candidate in enumerate(sysfs)? {
        if !candidate.passes(filter) {
            continue;
        }
        // A modem is only selectable with a profile; the ctl/dat endpoints
        // cannot be resolved without one.
        if let Some(profile) = bind_profile(registry, &candidate, filter)? {
            return into_handle(candidate, profile);
        }
    }
    Err(Error::NoModem("no usable modem found".into()))
}

/// Listing output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFormat {
    Json,
    Id,
}

/// Render the devices passing the filter for `--list-devices`.
pub fn device_listing(
    sysfs: &Path,
    registry: &ProfileRegistry,
    filter: &FilterSpec,
    format: ListFormat,
) -> Result<String> {
    let mut matched = Vec::new();
    for candidate in enumerate(sysfs)? {
        if !candidate.passes(filter) {
            continue;
        }
        let profile = bind_profile(registry, &candidate, filter)?;
        if profile.is_none() && filter.require_profile {
            continue;
        }
        matched.push((candidate, profile.cloned()));
    }

    match format {
        ListFormat::Id => Ok(matched
            .iter()
            .map(|(device, _)| device.device_id.as_str())
            .collect::<Vec<_>>()
            .join("\n")),
        ListFormat::Json => {
            let devices: Vec<_> = matched
                .iter()
                .map(|(device, profile)| {
                    json!({
                        "id": device.device_id,
                        "vendor": format!("{:04x}", device.vendor),
                        "product": format!("{:04x}", device.device),
                        "driver": device.driver,
                        "ttys": device.ttys,
                        "profile": profile.as_ref().map(|p| p.name.clone()),
                    })
                })
                .collect();
            serde_json::to_string_pretty(&devices)
                .map_err(|err| Error::Internal(format!("cannot render device list: {err}")))
        }
    }
}

/// Render the registry for `--list-profiles`.
pub fn profile_listing(registry: &ProfileRegistry, format: ListFormat) -> Result<String> {
    match format {
        ListFormat::Id => Ok(registry
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join("\n")),
        ListFormat::Json => {
            let profiles: Vec<_> = registry.iter().map(Profile::to_json).collect();
            serde_json::to_string_pretty(&profiles)
                .map_err(|err| Error::Internal(format!("cannot render profile list: {err}")))
        }
    }
}
