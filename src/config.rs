use std::collections::BTreeMap;
use std::path::Path;

use facet::Facet;

use crate::disk::DiskType;
use crate::error::VmxError;
use crate::guest::spec::{DiskAttachment, GuestSource, GuestSpec, NetworkAdapterSpec};
use crate::identity::ROOT_POOL_ID;
use crate::pool::{self, Allocation, PoolSpec, Shares};
use crate::power::DesiredPower;
use crate::transport::RemoteEndpoint;

#[derive(Debug, Clone, Facet)]
pub struct Config {
    pub host: HostConfig,
    pub guest: Option<GuestConfig>,
    #[facet(default)]
    pub disks: BTreeMap<String, DiskConfig>,
    #[facet(default)]
    pub pools: BTreeMap<String, PoolConfig>,
}

#[derive(Debug, Clone, Facet)]
pub struct HostConfig {
    pub hostname: String,
    #[facet(default = 22)]
    pub port: u16,
    #[facet(default = "root")]
    pub username: String,
    #[facet(default)]
    pub password: String,
    /// Environment variable holding the password, used when `password` is empty.
    #[facet(default)]
    pub password_env: String,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct NetworkInterfaceConfig {
    pub virtual_network: String,
    #[facet(default)]
    pub mac_address: String,
    #[facet(default)]
    pub nic_type: String,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct VirtualDiskConfig {
    pub virtual_disk_id: String,
    pub slot: String,
}

#[derive(Debug, Clone, Facet)]
pub struct GuestConfig {
    pub name: String,
    pub disk_store: String,
    #[facet(default = "/")]
    pub resource_pool: String,
    #[facet(default)]
    pub clone_from_vm: String,
    #[facet(default)]
    pub ovf_source: String,
    #[facet(default)]
    pub boot_disk_type: String,
    pub boot_disk_size: Option<u64>,
    pub memsize: Option<u32>,
    pub numvcpus: Option<u32>,
    pub virthwver: Option<u32>,
    pub guestos: Option<String>,
    #[facet(default)]
    pub notes: String,
    #[facet(default)]
    pub power: String,
    #[facet(default = 60)]
    pub startup_timeout: u32,
    #[facet(default = 20)]
    pub shutdown_timeout: u32,
    #[facet(default)]
    pub network_interfaces: Vec<NetworkInterfaceConfig>,
    #[facet(default)]
    pub virtual_disks: Vec<VirtualDiskConfig>,
    #[facet(default)]
    pub guestinfo: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct DiskConfig {
    pub disk_store: String,
    pub dir: String,
    /// Generated when empty.
    #[facet(default)]
    pub name: String,
    #[facet(default = 1)]
    pub size: u64,
    #[facet(default)]
    #[facet(rename = "type")]
    pub disk_type: String,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            disk_store: String::new(),
            dir: String::new(),
            name: String::new(),
            size: 1,
            disk_type: String::new(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct PoolConfig {
    #[facet(default)]
    pub cpu_min: u64,
    #[facet(default = "true")]
    pub cpu_min_expandable: String,
    #[facet(default)]
    pub cpu_max: u64,
    #[facet(default = "normal")]
    pub cpu_shares: String,
    #[facet(default)]
    pub mem_min: u64,
    #[facet(default = "true")]
    pub mem_min_expandable: String,
    #[facet(default)]
    pub mem_max: u64,
    #[facet(default = "normal")]
    pub mem_shares: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cpu_min: 0,
            cpu_min_expandable: "true".into(),
            cpu_max: 0,
            cpu_shares: "normal".into(),
            mem_min: 0,
            mem_min_expandable: "true".into(),
            mem_max: 0,
            mem_shares: "normal".into(),
        }
    }
}

impl HostConfig {
    /// Connection details, with the password taken from the environment when
    /// `password_env` is set and `password` is not.
    pub fn endpoint(&self) -> Result<RemoteEndpoint, VmxError> {
        self.endpoint_with(|name| std::env::var(name).ok())
    }

    fn endpoint_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<RemoteEndpoint, VmxError> {
        let secret = if !self.password.is_empty() {
            self.password.clone()
        } else if !self.password_env.is_empty() {
            lookup(&self.password_env).unwrap_or_default()
        } else {
            String::new()
        };
        if secret.is_empty() {
            return Err(VmxError::validation(
                "host password",
                "set password, or password_env to a non-empty environment variable",
            ));
        }
        Ok(RemoteEndpoint::new(
            &self.hostname,
            self.port,
            &self.username,
            &secret,
        ))
    }
}

impl GuestConfig {
    pub fn source(&self) -> Result<GuestSource, VmxError> {
        match (self.clone_from_vm.as_str(), self.ovf_source.as_str()) {
            ("", "") => Ok(GuestSource::Blank),
            (clone, "") => Ok(GuestSource::Clone(clone.to_string())),
            ("", ovf) => Ok(GuestSource::Import(ovf.to_string())),
            _ => Err(VmxError::validation(
                "guest source",
                "clone_from_vm and ovf_source are mutually exclusive",
            )),
        }
    }

    /// The typed spec, not yet checked against host limits.
    pub fn to_spec(&self) -> Result<GuestSpec, VmxError> {
        let resource_pool = if self.resource_pool == ROOT_POOL_ID || self.resource_pool.is_empty() {
            "/".to_string()
        } else {
            self.resource_pool.clone()
        };
        let virtual_disks = self
            .virtual_disks
            .iter()
            .map(|d| {
                Ok(DiskAttachment {
                    disk_id: d.virtual_disk_id.clone(),
                    slot: d.slot.parse()?,
                })
            })
            .collect::<Result<Vec<_>, VmxError>>()?;

        Ok(GuestSpec {
            name: self.name.clone(),
            disk_store: self.disk_store.clone(),
            resource_pool,
            source: self.source()?,
            boot_disk_type: self.boot_disk_type.parse::<DiskType>()?,
            boot_disk_size: self.boot_disk_size,
            memsize: self.memsize,
            numvcpus: self.numvcpus,
            virthwver: self.virthwver,
            guestos: self.guestos.clone(),
            notes: self.notes.clone(),
            guestinfo: self.guestinfo.clone(),
            network_adapters: self
                .network_interfaces
                .iter()
                .map(|n| NetworkAdapterSpec {
                    network: n.virtual_network.clone(),
                    mac_address: n.mac_address.clone(),
                    nic_type: n.nic_type.clone(),
                })
                .collect(),
            virtual_disks,
            power: self.power.parse::<DesiredPower>()?,
            startup_timeout: self.startup_timeout,
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}

impl DiskConfig {
    pub fn disk_type(&self) -> Result<DiskType, VmxError> {
        self.disk_type.parse()
    }
}

fn parse_expandable(field: &str, value: &str) -> Result<bool, VmxError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(VmxError::validation(
            field,
            format!("'{other}' must be true or false"),
        )),
    }
}

impl PoolConfig {
    pub fn to_spec(&self, name: &str) -> Result<PoolSpec, VmxError> {
        pool::validate_name(name)?;
        Ok(PoolSpec {
            name: name.to_string(),
            cpu: Allocation {
                min: self.cpu_min,
                min_expandable: parse_expandable("cpu_min_expandable", &self.cpu_min_expandable)?,
                max: self.cpu_max,
                shares: Shares::parse(&self.cpu_shares),
            },
            mem: Allocation {
                min: self.mem_min,
                min_expandable: parse_expandable("mem_min_expandable", &self.mem_min_expandable)?,
                max: self.mem_max,
                shares: Shares::parse(&self.mem_shares),
            },
        })
    }
}

fn validate_config(config: &Config) -> Result<(), VmxError> {
    if config.host.hostname.is_empty() {
        return Err(VmxError::validation("host hostname", "must not be empty"));
    }
    if config.host.port == 0 {
        return Err(VmxError::validation("host port", "must not be 0"));
    }

    if let Some(guest) = &config.guest {
        guest.to_spec()?.validate()?;
    }

    for (name, disk) in &config.disks {
        if disk.disk_store.is_empty() || disk.dir.is_empty() {
            return Err(VmxError::validation(
                "virtual disk",
                format!("'{name}' needs disk_store and dir"),
            ));
        }
        if !(1..=62000).contains(&disk.size) {
            return Err(VmxError::validation(
                "virtual disk size",
                format!("'{name}' size {} must be between 1 and 62000", disk.size),
            ));
        }
        disk.disk_type()?;
    }

    for (name, pool) in &config.pools {
        pool.to_spec(name)?;
    }
    Ok(())
}

pub fn load_config(path: &Path) -> Result<Config, VmxError> {
    let contents = std::fs::read_to_string(path).map_err(|source| VmxError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    let config: Config = facet_toml::from_str(&contents).map_err(|e| VmxError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    validate_config(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[host]
hostname = "esxi.lab"
password = "secret"

[guest]
name = "web01"
disk_store = "datastore1"
resource_pool = "ha-root-pool"
boot_disk_type = "zeroedthick"
boot_disk_size = 40
memsize = 2048
power = "off"

[[guest.network_interfaces]]
virtual_network = "VM Network"
nic_type = "vmxnet3"

[[guest.network_interfaces]]
virtual_network = "Storage"
mac_address = "00:50:56:00:00:01"

[[guest.virtual_disks]]
virtual_disk_id = "/vmfs/volumes/datastore1/data/disk1.vmdk"
slot = "0:1"

[guest.guestinfo]
"metadata.encoding" = "base64"

[disks.data1]
disk_store = "datastore1"
dir = "data"
size = 10

[pools."teamA/dev"]
cpu_min = 500
mem_shares = "high"
"#;

    fn minimal_host() -> HostConfig {
        HostConfig {
            hostname: "esxi.lab".into(),
            port: 22,
            username: "root".into(),
            password: String::new(),
            password_env: String::new(),
        }
    }

    fn parse(toml: &str) -> Config {
        facet_toml::from_str(toml).unwrap()
    }

    #[test]
    fn parses_full_config() {
        let config = parse(FULL);
        validate_config(&config).unwrap();
        assert_eq!(config.host.port, 22);
        assert_eq!(config.host.username, "root");

        let guest = config.guest.as_ref().unwrap();
        assert_eq!(guest.startup_timeout, 60);
        assert_eq!(guest.shutdown_timeout, 20);
        assert_eq!(guest.network_interfaces.len(), 2);

        assert_eq!(config.disks["data1"].size, 10);
        assert!(config.disks["data1"].name.is_empty());
        assert_eq!(config.pools["teamA/dev"].cpu_min, 500);
        assert_eq!(config.pools["teamA/dev"].cpu_min_expandable, "true");
    }

    #[test]
    fn guest_converts_to_spec() {
        let spec = parse(FULL).guest.unwrap().to_spec().unwrap();
        assert_eq!(spec.resource_pool, "/");
        assert_eq!(spec.boot_disk_type, DiskType::ZeroedThick);
        assert_eq!(spec.boot_disk_size, Some(40));
        assert_eq!(spec.memsize, Some(2048));
        assert_eq!(spec.numvcpus, None);
        assert_eq!(spec.power, DesiredPower::Off);
        assert_eq!(spec.source, GuestSource::Blank);
        assert_eq!(spec.virtual_disks[0].slot.to_string(), "0:1");
        assert_eq!(spec.guestinfo["metadata.encoding"], "base64");
        assert_eq!(spec.network_adapters[1].mac_address, "00:50:56:00:00:01");
    }

    #[test]
    fn pool_converts_to_spec() {
        let spec = parse(FULL).pools["teamA/dev"].to_spec("teamA/dev").unwrap();
        assert_eq!(spec.cpu.min, 500);
        assert!(spec.cpu.min_expandable);
        assert_eq!(spec.mem.shares, Shares::High);
    }

    #[test]
    fn both_sources_are_rejected() {
        let mut guest = parse(FULL).guest.unwrap();
        guest.clone_from_vm = "tmpl/centos".into();
        guest.ovf_source = "/images/centos.ova".into();
        let err = guest.to_spec().unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn bad_slot_is_a_validation_error() {
        let mut config = parse(FULL);
        config.guest.as_mut().unwrap().virtual_disks[0].slot = "0:7".into();
        assert!(matches!(
            validate_config(&config),
            Err(VmxError::Validation { .. })
        ));
    }

    #[test]
    fn oversized_disk_is_rejected() {
        let mut config = parse(FULL);
        config.disks.get_mut("data1").unwrap().size = 70000;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn pool_with_leading_slash_is_rejected() {
        let mut config = parse(FULL);
        let pool = config.pools.remove("teamA/dev").unwrap();
        config.pools.insert("/teamA/dev".into(), pool);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn bad_expandable_flag_is_rejected() {
        let pool = PoolConfig {
            mem_min_expandable: "yes".into(),
            ..PoolConfig::default()
        };
        let err = pool.to_spec("dev").unwrap_err();
        assert!(err.to_string().contains("mem_min_expandable"));
    }

    #[test]
    fn password_comes_from_environment_lookup() {
        let host = HostConfig {
            password_env: "ESXI_PASSWORD".into(),
            ..minimal_host()
        };
        let endpoint = host
            .endpoint_with(|name| (name == "ESXI_PASSWORD").then(|| "from-env".to_string()))
            .unwrap();
        assert_eq!(endpoint.secret(), "from-env");
    }

    #[test]
    fn empty_secret_is_rejected() {
        let err = minimal_host().endpoint_with(|_| None).unwrap_err();
        assert!(err.to_string().contains("host password"));

        let host = HostConfig {
            password_env: "ESXI_PASSWORD".into(),
            ..minimal_host()
        };
        assert!(host.endpoint_with(|_| Some(String::new())).is_err());
    }

    #[test]
    fn host_only_config_is_valid() {
        let config = parse("[host]\nhostname = \"esxi.lab\"\npassword = \"x\"\n");
        validate_config(&config).unwrap();
        assert!(config.guest.is_none());
        assert!(config.disks.is_empty());
    }

    #[test]
    fn missing_file_is_a_load_error() {
        let err = load_config(Path::new("/nonexistent/vmxctl.toml")).unwrap_err();
        assert!(matches!(err, VmxError::ConfigLoad { .. }));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmxctl.toml");
        std::fs::write(&path, "[host\nhostname = ").unwrap();
        assert!(matches!(
            load_config(&path),
            Err(VmxError::ConfigParse { .. })
        ));
    }
}
