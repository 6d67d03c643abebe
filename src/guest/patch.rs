//! The attribute-patch pass applied to a guest's configuration text.
//!
//! Pure text in, text out: no host access happens here.

use std::sync::LazyLock;

use regex::Regex;

use super::spec::{DiskSlot, GuestSpec, MAX_NETWORK_ADAPTERS, MAX_VIRTUAL_DISKS};
use crate::vmx::{self, ConfigDocument, FamilyPatcher, ReplaceFamily};

static DISK_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^scsi([0-9]+):([0-9]+)\.").expect("invalid disk key regex")
});

const GUESTINFO_PREFIX: &str = "guestinfo.";

/// Lines of an attachable disk slot; the boot disk and controller are excluded.
pub fn is_disk_key(key: &str) -> bool {
    DISK_KEY_RE.captures(key).is_some_and(|caps| {
        match (caps[1].parse::<u8>(), caps[2].parse::<u8>()) {
            (Ok(bus), Ok(unit)) => DiskSlot { bus, unit }.is_attachable(),
            _ => false,
        }
    })
}

fn adapter_prefix(index: usize) -> String {
    format!("ethernet{index}.")
}

fn is_any_adapter_key(key: &str) -> bool {
    (0..MAX_NETWORK_ADAPTERS).any(|i| key.starts_with(&adapter_prefix(i)))
}

fn is_guestinfo_key(key: &str) -> bool {
    key.starts_with(GUESTINFO_PREFIX)
}

/// Apply `spec` with the default delete-then-write family strategy.
pub fn patch_config(text: &str, spec: &GuestSpec, first_provisioning: bool) -> String {
    patch_config_with(text, spec, first_provisioning, &ReplaceFamily)
}

/// Apply `spec` to `text`.
///
/// `first_provisioning` wipes every adapter before the desired ones are
/// written, since cloned and imported guests bring their own.
///
/// Notes are only ever set: empty `notes` leave an existing `annotation`
/// line untouched, so notes cannot be cleared through this pass.
pub fn patch_config_with(
    text: &str,
    spec: &GuestSpec,
    first_provisioning: bool,
    patcher: &dyn FamilyPatcher,
) -> String {
    let mut text = text.to_string();

    if let Some(memsize) = spec.memsize {
        text = vmx::set_value(&text, "memSize", &memsize.to_string());
    }
    if let Some(numvcpus) = spec.numvcpus {
        text = vmx::set_value(&text, "numvcpus", &numvcpus.to_string());
    }
    if let Some(virthwver) = spec.virthwver {
        text = vmx::set_value(&text, "virtualHW.version", &virthwver.to_string());
    }
    if let Some(guestos) = spec.guestos.as_deref().filter(|os| !os.is_empty()) {
        text = vmx::set_value(&text, "guestOS", guestos);
    }
    if !spec.notes.is_empty() {
        text = vmx::set_value(&text, "annotation", &vmx::escape_value(&spec.notes));
    }

    text = patch_disks(&text, spec, patcher);
    text = patch_adapters(&text, spec, first_provisioning);

    if !spec.guestinfo.is_empty() {
        text = merge_guestinfo(&text, spec, patcher);
    }
    text
}

fn patch_disks(text: &str, spec: &GuestSpec, patcher: &dyn FamilyPatcher) -> String {
    let entries: Vec<(String, String)> = spec
        .virtual_disks
        .iter()
        .take(MAX_VIRTUAL_DISKS)
        .flat_map(|disk| {
            let prefix = disk.slot.key_prefix();
            [
                (format!("{prefix}deviceType"), "scsi-hardDisk".to_string()),
                (format!("{prefix}fileName"), disk.disk_id.clone()),
                (format!("{prefix}present"), "true".to_string()),
            ]
        })
        .collect();
    patcher.replace_family(text, &is_disk_key, &entries)
}

fn patch_adapters(text: &str, spec: &GuestSpec, first_provisioning: bool) -> String {
    let mut text = if first_provisioning {
        tracing::debug!("removing inherited network adapters");
        vmx::remove_family(text, &is_any_adapter_key)
    } else {
        text.to_string()
    };
    let default_type = spec.default_nic_type();

    for index in 0..MAX_NETWORK_ADAPTERS {
        let prefix = adapter_prefix(index);
        let in_slot = |key: &str| key.starts_with(&prefix);
        let desired = spec
            .network_adapters
            .get(index)
            .filter(|a| !a.network.is_empty());
        let exists = vmx::has_family_member(&text, &in_slot);

        match (desired, exists) {
            (None, true) => {
                tracing::debug!(index, "removing network adapter");
                text = vmx::remove_family(&text, &in_slot);
            }
            (Some(adapter), true) => {
                // the MAC address line is left as it is
                let nic_type = if adapter.nic_type.is_empty() {
                    default_type
                } else {
                    adapter.nic_type.as_str()
                };
                text = vmx::set_value(&text, &format!("{prefix}networkName"), &adapter.network);
                text = vmx::set_value(&text, &format!("{prefix}virtualDev"), nic_type);
            }
            (Some(adapter), false) => {
                tracing::debug!(index, network = %adapter.network, "adding network adapter");
                let nic_type = if adapter.nic_type.is_empty() {
                    default_type
                } else {
                    adapter.nic_type.as_str()
                };
                let mut lines = vec![vmx::format_line(&format!("{prefix}networkName"), &adapter.network)];
                if !adapter.mac_address.is_empty() {
                    lines.push(vmx::format_line(&format!("{prefix}addressType"), "static"));
                    lines.push(vmx::format_line(&format!("{prefix}address"), &adapter.mac_address));
                }
                lines.push(vmx::format_line(&format!("{prefix}virtualDev"), nic_type));
                lines.push(vmx::format_line(&format!("{prefix}present"), "TRUE"));
                for line in lines {
                    text.push_str(&line);
                    text.push('\n');
                }
            }
            (None, false) => {}
        }
    }
    text
}

/// Merge the desired guest information into the existing keys and write
/// the whole family back sorted.
fn merge_guestinfo(text: &str, spec: &GuestSpec, patcher: &dyn FamilyPatcher) -> String {
    let mut merged = ConfigDocument::default();
    for (key, value) in ConfigDocument::parse(text).iter() {
        if is_guestinfo_key(key) {
            merged.insert(key, value);
        }
    }
    for (key, value) in &spec.guestinfo {
        merged.insert(format!("{GUESTINFO_PREFIX}{key}"), value.as_str());
    }
    let entries: Vec<(String, String)> = merged
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    patcher.replace_family(text, &is_guestinfo_key, &entries)
}
