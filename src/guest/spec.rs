use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::disk::DiskType;
use crate::error::VmxError;
use crate::power::DesiredPower;

pub const MAX_NETWORK_ADAPTERS: usize = 10;
pub const MAX_VIRTUAL_DISKS: usize = 59;

pub const DEFAULT_NUMVCPUS: u32 = 1;
pub const DEFAULT_MEMSIZE: u32 = 512;
pub const DEFAULT_VIRTHWVER: u32 = 8;
pub const DEFAULT_GUESTOS: &str = "centos-64";
pub const DEFAULT_BOOT_DISK_SIZE: u64 = 16;
pub const DEFAULT_NIC_TYPE: &str = "e1000";

pub const NIC_TYPES: &[&str] = &[
    "vlance", "flexible", "e1000", "e1000e", "vmxnet", "vmxnet2", "vmxnet3",
];

/// Guest OS identifiers accepted by the host.
pub const GUEST_OS_TYPES: &[&str] = &[
    "amazonlinux2-64", "asianux3", "asianux3-64", "asianux4", "asianux4-64", "asianux5-64",
    "asianux7-64", "centos", "centos-64", "centos6", "centos6-64", "centos7-64", "centos8-64",
    "coreos-64", "darwin", "darwin-64", "darwin10", "darwin10-64", "darwin11", "darwin11-64",
    "darwin12-64", "darwin13-64", "darwin14-64", "darwin15-64", "darwin16-64", "debian4",
    "debian4-64", "debian5", "debian5-64", "debian6", "debian6-64", "debian7", "debian7-64",
    "debian8", "debian8-64", "debian9", "debian9-64", "debian10", "debian10-64", "dos",
    "ecomstation", "ecomstation2", "fedora", "fedora-64", "freebsd", "freebsd-64", "freebsd11",
    "freebsd11-64", "freebsd12", "freebsd12-64", "genericlinux", "mandrake", "mandriva",
    "mandriva-64", "netware4", "netware5", "netware6", "nld9", "oes", "openserver5",
    "openserver6", "opensuse", "opensuse-64", "oraclelinux", "oraclelinux-64", "oraclelinux6",
    "oraclelinux6-64", "oraclelinux7-64", "oraclelinux8-64", "os2", "other", "other-64",
    "other24xlinux", "other24xlinux-64", "other26xlinux", "other26xlinux-64", "other3xlinux",
    "other3xlinux-64", "other4xlinux", "other4xlinux-64", "otherlinux", "otherlinux-64",
    "redhat", "rhel2", "rhel3", "rhel3-64", "rhel4", "rhel4-64", "rhel5", "rhel5-64", "rhel6",
    "rhel6-64", "rhel7", "rhel7-64", "rhel8-64", "sjds", "sles", "sles-64", "sles10",
    "sles10-64", "sles11", "sles11-64", "sles12", "sles12-64", "sles15-64", "solaris10",
    "solaris10-64", "solaris11-64", "solaris6", "solaris7", "solaris8", "solaris9", "suse",
    "suse-64", "turbolinux", "turbolinux-64", "ubuntu", "ubuntu-64", "unixware7", "vmkernel",
    "vmkernel5", "vmkernel6", "vmkernel65", "vmwarephoton-64", "win2000advserv", "win2000pro",
    "win2000serv", "win31", "win95", "win98", "windows7", "windows7-64", "windows7server-64",
    "windows8", "windows8-64", "windows8server-64", "windows9", "windows9-64",
    "windows9server-64", "windowshyperv", "winlonghorn", "winlonghorn-64", "winmillennium",
    "winnetbusiness", "winnetdatacenter", "winnetdatacenter-64", "winnetenterprise",
    "winnetenterprise-64", "winnetstandard", "winnetstandard-64", "winnetweb", "winnt",
    "winvista", "winvista-64", "winxphome", "winxppro", "winxppro-64",
];

/// Where a new guest comes from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GuestSource {
    /// Built from a minimal template.
    #[default]
    Blank,
    /// Another guest on the same host, by its path under the host root.
    Clone(String),
    /// A local or remote OVF/OVA.
    Import(String),
}

/// One adapter slot. A slot with an empty network is absent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkAdapterSpec {
    pub network: String,
    /// Empty lets the host generate one.
    pub mac_address: String,
    /// Empty inherits slot 0's type, or [`DEFAULT_NIC_TYPE`].
    pub nic_type: String,
}

/// SCSI `bus:unit` address of an attached disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiskSlot {
    pub bus: u8,
    pub unit: u8,
}

impl DiskSlot {
    /// The address reserved for the boot disk.
    pub const BOOT: DiskSlot = DiskSlot { bus: 0, unit: 0 };

    /// Whether a disk may be attached here: buses 0-3, units 0-15, never
    /// the boot address, never unit 7 (the controller itself).
    pub fn is_attachable(&self) -> bool {
        self.bus <= 3 && self.unit <= 15 && *self != Self::BOOT && self.unit != 7
    }

    /// Key prefix of this slot's lines, e.g. `scsi0:1.`.
    pub fn key_prefix(&self) -> String {
        format!("scsi{}:{}.", self.bus, self.unit)
    }
}

impl fmt::Display for DiskSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bus, self.unit)
    }
}

impl FromStr for DiskSlot {
    type Err = VmxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            VmxError::validation(
                "virtual disk slot",
                format!("'{s}' must be <0-3>:<0-15>, not 0:0 and not unit 7"),
            )
        };
        let (bus, unit) = s.split_once(':').ok_or_else(invalid)?;
        let slot = DiskSlot {
            bus: bus.trim().parse().map_err(|_| invalid())?,
            unit: unit.trim().parse().map_err(|_| invalid())?,
        };
        if slot.is_attachable() {
            Ok(slot)
        } else {
            Err(invalid())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskAttachment {
    /// Absolute path of the disk descriptor.
    pub disk_id: String,
    pub slot: DiskSlot,
}

/// Everything a guest should look like after apply.
///
/// `None` numeric fields leave the live value alone on update and fall back
/// to the template defaults on a blank build.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GuestSpec {
    pub name: String,
    pub disk_store: String,
    pub resource_pool: String,
    pub source: GuestSource,
    pub boot_disk_type: DiskType,
    pub boot_disk_size: Option<u64>,
    pub memsize: Option<u32>,
    pub numvcpus: Option<u32>,
    pub virthwver: Option<u32>,
    pub guestos: Option<String>,
    pub notes: String,
    pub guestinfo: BTreeMap<String, String>,
    pub network_adapters: Vec<NetworkAdapterSpec>,
    pub virtual_disks: Vec<DiskAttachment>,
    pub power: DesiredPower,
    pub startup_timeout: u32,
    pub shutdown_timeout: u32,
}

impl GuestSpec {
    /// Drop adapters and disks beyond what the host supports.
    pub fn truncate_to_limits(&mut self) {
        if self.network_adapters.len() > MAX_NETWORK_ADAPTERS {
            tracing::warn!(
                count = self.network_adapters.len(),
                max = MAX_NETWORK_ADAPTERS,
                "ignoring extra network interfaces"
            );
            self.network_adapters.truncate(MAX_NETWORK_ADAPTERS);
        }
        if self.virtual_disks.len() > MAX_VIRTUAL_DISKS {
            tracing::warn!(
                count = self.virtual_disks.len(),
                max = MAX_VIRTUAL_DISKS,
                "ignoring extra virtual disks"
            );
            self.virtual_disks.truncate(MAX_VIRTUAL_DISKS);
        }
    }

    /// Type used for adapters that don't name one.
    pub fn default_nic_type(&self) -> &str {
        self.network_adapters
            .first()
            .map(|a| a.nic_type.as_str())
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_NIC_TYPE)
    }

    /// Checks that need no host access.
    pub fn validate(&self) -> Result<(), VmxError> {
        if self.name.is_empty() {
            return Err(VmxError::validation("guest name", "must not be empty"));
        }
        if self.disk_store.is_empty() {
            return Err(VmxError::validation("disk store", "must not be empty"));
        }
        if let Some(size) = self.boot_disk_size {
            if !(1..=62000).contains(&size) {
                return Err(VmxError::validation(
                    "boot disk size",
                    format!("{size} must be between 1 and 62000"),
                ));
            }
        }
        if let Some(os) = &self.guestos {
            if !os.is_empty() && !GUEST_OS_TYPES.contains(&os.as_str()) {
                return Err(VmxError::validation(
                    "guestos",
                    format!("'{os}' is not a known guest OS identifier"),
                ));
            }
        }
        for adapter in &self.network_adapters {
            if !adapter.nic_type.is_empty() && !NIC_TYPES.contains(&adapter.nic_type.as_str()) {
                return Err(VmxError::validation(
                    "nic type",
                    format!("'{}' must be one of {}", adapter.nic_type, NIC_TYPES.join(", ")),
                ));
            }
        }
        let mut slots = HashSet::new();
        for disk in &self.virtual_disks {
            if disk.disk_id.is_empty() {
                return Err(VmxError::validation("virtual disk id", "must not be empty"));
            }
            if !disk.slot.is_attachable() {
                return Err(VmxError::validation(
                    "virtual disk slot",
                    format!("{} is reserved", disk.slot),
                ));
            }
            if !slots.insert(disk.slot) {
                return Err(VmxError::validation(
                    "virtual disk slot",
                    format!("{} is used more than once", disk.slot),
                ));
            }
        }
        if !(1..=600).contains(&self.startup_timeout) {
            return Err(VmxError::validation(
                "startup timeout",
                format!("{} must be between 1 and 600", self.startup_timeout),
            ));
        }
        if self.shutdown_timeout > 600 {
            return Err(VmxError::validation(
                "shutdown timeout",
                format!("{} must be between 0 and 600", self.shutdown_timeout),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn sample_spec() -> GuestSpec {
    GuestSpec {
        name: "web01".into(),
        disk_store: "ds1".into(),
        resource_pool: "/".into(),
        startup_timeout: 60,
        shutdown_timeout: 20,
        ..GuestSpec::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_parsing_rejects_reserved_addresses() {
        assert_eq!("1:3".parse::<DiskSlot>().unwrap(), DiskSlot { bus: 1, unit: 3 });
        for bad in ["0:0", "0:7", "4:1", "0:16", "x:1", "01"] {
            assert!(bad.parse::<DiskSlot>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn unknown_guestos_is_rejected() {
        let spec = GuestSpec {
            guestos: Some("templeos".into()),
            ..sample_spec()
        };
        let err = spec.validate().unwrap_err();
        assert!(matches!(err, VmxError::Validation { ref field, .. } if field == "guestos"));
    }

    #[test]
    fn bad_nic_type_names_the_field() {
        let spec = GuestSpec {
            network_adapters: vec![NetworkAdapterSpec {
                network: "VM Network".into(),
                nic_type: "rtl8139".into(),
                ..Default::default()
            }],
            ..sample_spec()
        };
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("nic type"));
    }

    #[test]
    fn timeouts_are_bounded() {
        let spec = GuestSpec {
            startup_timeout: 0,
            ..sample_spec()
        };
        assert!(spec.validate().is_err());
        let spec = GuestSpec {
            shutdown_timeout: 601,
            ..sample_spec()
        };
        assert!(spec.validate().is_err());
        let spec = GuestSpec {
            shutdown_timeout: 0,
            ..sample_spec()
        };
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn boot_disk_size_is_bounded() {
        let spec = GuestSpec {
            boot_disk_size: Some(62001),
            ..sample_spec()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn duplicate_slots_are_rejected() {
        let disk = DiskAttachment {
            disk_id: "/vmfs/volumes/ds1/d/a.vmdk".into(),
            slot: DiskSlot { bus: 0, unit: 1 },
        };
        let spec = GuestSpec {
            virtual_disks: vec![disk.clone(), disk],
            ..sample_spec()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn extra_entries_are_truncated() {
        let mut spec = GuestSpec {
            network_adapters: vec![NetworkAdapterSpec::default(); 12],
            ..sample_spec()
        };
        spec.truncate_to_limits();
        assert_eq!(spec.network_adapters.len(), MAX_NETWORK_ADAPTERS);
    }

    #[test]
    fn default_nic_type_follows_slot_zero() {
        let mut spec = sample_spec();
        assert_eq!(spec.default_nic_type(), DEFAULT_NIC_TYPE);
        spec.network_adapters.push(NetworkAdapterSpec {
            network: "VM Network".into(),
            nic_type: "vmxnet3".into(),
            ..Default::default()
        });
        assert_eq!(spec.default_nic_type(), "vmxnet3");
    }
}
