//! Guest lifecycle: create, update, delete and read-back of one guest.
//!
//! Every mutation of the configuration text goes through the same
//! read → patch → upload → reload sequence.

pub mod create;
pub mod ovftool;
pub mod patch;
pub mod spec;

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::Instrument;

use crate::disk::{self, DiskType, VOLUMES_ROOT};
use crate::error::VmxError;
use crate::host::Host;
use crate::identity;
use crate::power::{self, DesiredPower, GUEST_NOT_FOUND, PowerState};
use crate::transport::Transport;
use crate::vmx::{self, ConfigDocument};
use self::spec::{DiskAttachment, DiskSlot, GuestSource, GuestSpec, MAX_NETWORK_ADAPTERS, NetworkAdapterSpec};

const DESTROY_SETTLE: Duration = Duration::from_secs(5);
const IP_POLL: Duration = Duration::from_secs(3);
/// Uptime in seconds after which the fallback address lookup is tried.
const FALLBACK_IP_UPTIME: u64 = 120;

const IPV4_PATTERN: &str =
    "((1?[0-9][0-9]?|2[0-4][0-9]|25[0-5]).){3}(1?[0-9][0-9]?|2[0-4][0-9]|25[0-5])";

static DATASTORE_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\[([^\]]+)\]\s*([^"]+)"#).expect("invalid datastore path regex")
});
static DISK_FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^scsi([0-3]):([0-9]{1,2})\.fileName$").expect("invalid disk file regex")
});
static ADAPTER_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ethernet([0-9])\.(.+)$").expect("invalid adapter key regex")
});

/// Turn `[store] dir/file` into `/vmfs/volumes/store/dir/file`.
pub fn datastore_path_to_absolute(text: &str) -> Option<String> {
    let caps = DATASTORE_PATH_RE.captures(text)?;
    Some(format!(
        "{VOLUMES_ROOT}/{}/{}",
        &caps[1],
        caps[2].trim_end()
    ))
}

/// The configuration text of a guest and where it lives on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmxFile {
    pub path: String,
    pub text: String,
}

/// A guest as read back from the host.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GuestState {
    pub vmid: String,
    pub name: String,
    pub disk_store: String,
    pub resource_pool: String,
    pub memsize: Option<u32>,
    pub numvcpus: Option<u32>,
    pub virthwver: Option<u32>,
    pub guestos: String,
    pub notes: String,
    /// Indexed by adapter slot; absent slots are empty entries.
    pub network_adapters: Vec<NetworkAdapterSpec>,
    /// Attached disks other than the boot disk, ordered by slot.
    pub virtual_disks: Vec<DiskAttachment>,
    pub guestinfo: BTreeMap<String, String>,
    pub power: Option<PowerState>,
    pub ip_address: Option<String>,
    pub boot_disk_size: Option<u64>,
    pub boot_disk_type: Option<DiskType>,
}

/// What `apply` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub vmid: String,
    pub created: bool,
}

/// Write `text` to a local scratch file and copy it to `remote_path`.
/// The scratch file is removed when this returns.
pub(crate) async fn upload_text<T: Transport>(
    host: &Host<T>,
    text: &str,
    remote_path: &str,
) -> Result<(), VmxError> {
    let io_err = |source| VmxError::Io {
        context: "writing local scratch file".into(),
        source,
    };
    let mut scratch = tempfile::NamedTempFile::new().map_err(io_err)?;
    scratch.write_all(text.as_bytes()).map_err(io_err)?;
    scratch.flush().map_err(io_err)?;
    host.copy_file(scratch.path(), remote_path).await
}

pub async fn vmx_path<T: Transport>(host: &Host<T>, vmid: &str) -> Result<Option<String>, VmxError> {
    let output = host
        .run(
            &format!("vim-cmd vmsvc/get.config {vmid} | grep vmPathName"),
            "get dst_vmx",
        )
        .await?;
    if output.output.contains(GUEST_NOT_FOUND) {
        return Ok(None);
    }
    Ok(output
        .found("get dst_vmx")?
        .as_deref()
        .and_then(datastore_path_to_absolute))
}

/// The guest's configuration text, `None` once the guest is gone.
pub async fn read_vmx<T: Transport>(host: &Host<T>, vmid: &str) -> Result<Option<VmxFile>, VmxError> {
    let Some(path) = vmx_path(host, vmid).await? else {
        return Ok(None);
    };
    let output = host
        .run(&format!("cat \"{path}\""), "read guest_name.vmx file")
        .await?;
    if output.output.contains(GUEST_NOT_FOUND) {
        return Ok(None);
    }
    let text = output.into_result("read guest_name.vmx file")?;
    Ok(Some(VmxFile { path, text }))
}

/// Upload new configuration text and have the host re-read it.
pub async fn write_vmx<T: Transport>(
    host: &Host<T>,
    vmid: &str,
    path: &str,
    text: &str,
) -> Result<(), VmxError> {
    upload_text(host, text, path).await?;
    host.run_ok(&format!("vim-cmd vmsvc/reload {vmid}"), "vmsvc/reload")
        .await?;
    Ok(())
}

/// Absolute path of the disk at the boot address.
pub async fn boot_disk_path<T: Transport>(host: &Host<T>, vmid: &str) -> Result<Option<String>, VmxError> {
    let output = host
        .run(
            &format!(
                "vim-cmd vmsvc/device.getdevices {vmid} | grep -A10 'key = 2000'|grep -m 1 fileName"
            ),
            "get boot disk",
        )
        .await?;
    Ok(output
        .found("get boot disk")?
        .as_deref()
        .and_then(datastore_path_to_absolute))
}

async fn grow_boot_disk<T: Transport>(host: &Host<T>, vmid: &str, size_gb: u64) -> Result<(), VmxError> {
    match boot_disk_path(host, vmid).await? {
        Some(path) => {
            disk::grow_disk(host, &path, size_gb).await?;
        }
        None => tracing::warn!(vmid, "guest has no boot disk to grow"),
    }
    Ok(())
}

/// Run the attribute-patch pass against the live configuration text.
pub async fn patch_guest<T: Transport>(
    host: &Host<T>,
    vmid: &str,
    spec: &GuestSpec,
    first_provisioning: bool,
) -> Result<(), VmxError> {
    let Some(file) = read_vmx(host, vmid).await? else {
        tracing::warn!(vmid, "guest disappeared before its configuration could be patched");
        return Ok(());
    };
    let patched = patch::patch_config(&file.text, spec, first_provisioning);
    write_vmx(host, vmid, &file.path, &patched).await?;
    tracing::info!(vmid, "updated guest configuration");
    Ok(())
}

/// Normalize, truncate and validate a caller's spec before any remote call.
fn prepare(spec: &GuestSpec) -> Result<GuestSpec, VmxError> {
    let mut spec = spec.clone();
    if spec.resource_pool.is_empty() || spec.resource_pool == identity::ROOT_POOL_ID {
        spec.resource_pool = "/".into();
    }
    spec.truncate_to_limits();
    spec.validate()?;
    Ok(spec)
}

/// Create the guest, or take over an existing one with the same name.
///
/// Errors after the guest is registered come back as [`VmxError::Partial`]
/// carrying its identifier.
pub async fn create<T: Transport>(host: &Host<T>, spec: &GuestSpec) -> Result<String, VmxError> {
    let spec = prepare(spec)?;
    disk::validate_disk_store(host, &spec.disk_store).await?;

    if let Some(vmid) = identity::guest_id_by_name(host, &spec.name).await? {
        tracing::info!(%vmid, name = %spec.name, "guest already exists");
        power::power_off(host, &vmid, spec.shutdown_timeout).await?;
    } else if spec.source == GuestSource::Blank {
        create::build_blank(host, &spec).await?;
    } else {
        ovftool::import_guest(host.endpoint(), &spec, &spec.resource_pool)
            .instrument(host.span().clone())
            .await?;
    }

    let vmid = identity::guest_id_by_name(host, &spec.name)
        .await?
        .ok_or_else(|| VmxError::GuestNotFound {
            name: spec.name.clone(),
        })?;

    let finish = async {
        if let Some(size) = spec.boot_disk_size {
            grow_boot_disk(host, &vmid, size).await?;
        }
        patch_guest(host, &vmid, &spec, true).await?;
        if spec.power == DesiredPower::On {
            power::power_on(host, &vmid).await?;
        }
        Ok::<_, VmxError>(())
    };
    finish.await.map_err(|e| VmxError::Partial {
        vmid: vmid.clone(),
        source: Box::new(e),
    })?;

    tracing::info!(%vmid, name = %spec.name, "guest created");
    Ok(vmid)
}

/// Bring an existing guest in line with `spec`.
pub async fn update<T: Transport>(host: &Host<T>, vmid: &str, spec: &GuestSpec) -> Result<(), VmxError> {
    let spec = prepare(spec)?;

    power::power_off(host, vmid, spec.shutdown_timeout).await?;
    patch_guest(host, vmid, &spec, false).await?;
    if let Some(size) = spec.boot_disk_size {
        grow_boot_disk(host, vmid, size).await?;
    }
    if spec.power == DesiredPower::On {
        power::power_on(host, vmid).await?;
    }
    Ok(())
}

/// Update the guest named by `spec` if it exists, create it otherwise.
pub async fn apply<T: Transport>(host: &Host<T>, spec: &GuestSpec) -> Result<Applied, VmxError> {
    match identity::guest_id_by_name(host, &spec.name).await? {
        Some(vmid) => {
            update(host, &vmid, spec).await?;
            Ok(Applied { vmid, created: false })
        }
        None => {
            let vmid = create(host, spec).await?;
            Ok(Applied { vmid, created: true })
        }
    }
}

/// Detach every disk but the boot disk so destroying the guest leaves them.
async fn detach_disks<T: Transport>(host: &Host<T>, vmid: &str) -> Result<(), VmxError> {
    let Some(file) = read_vmx(host, vmid).await? else {
        return Ok(());
    };
    let stripped = vmx::remove_family(&file.text, &patch::is_disk_key);
    write_vmx(host, vmid, &file.path, &stripped).await
}

/// Power off and destroy a guest, keeping disks it does not own.
pub async fn delete<T: Transport>(host: &Host<T>, vmid: &str, shutdown_timeout: u32) -> Result<(), VmxError> {
    power::power_off(host, vmid, shutdown_timeout).await?;

    if let Err(e) = detach_disks(host, vmid).await {
        tracing::warn!(vmid, "failed to detach disks before destroy: {e}");
    }

    tokio::time::sleep(DESTROY_SETTLE).await;
    let output = host
        .run(&format!("vim-cmd vmsvc/destroy {vmid}"), "vmsvc/destroy")
        .await?;
    if output.success() {
        tracing::info!(vmid, "guest destroyed");
        return Ok(());
    }
    if identity::validate_guest_id(host, vmid).await?.is_none() {
        tracing::info!(vmid, "guest was already removed");
        return Ok(());
    }
    output.into_result("vmsvc/destroy").map(|_| ())
}

/// Accept an externally supplied identifier if the host knows it.
pub async fn adopt<T: Transport>(host: &Host<T>, vmid: &str) -> Result<String, VmxError> {
    identity::validate_guest_id(host, vmid)
        .await?
        .ok_or_else(|| VmxError::GuestNotFound {
            name: vmid.to_string(),
        })
}

fn quoted_value(line: &str) -> Option<&str> {
    let start = line.find('"')?;
    let end = line.rfind('"')?;
    (end > start).then(|| &line[start + 1..end])
}

/// Guest name and disk store from `vmsvc/get.summary` output.
fn parse_summary(text: &str) -> (String, String) {
    let mut name = String::new();
    let mut disk_store = String::new();
    for line in text.lines().map(str::trim) {
        if line.starts_with("name = ") {
            name = quoted_value(line).unwrap_or_default().to_string();
        } else if line.starts_with("vmPathName = ") {
            if let Some(caps) = DATASTORE_PATH_RE.captures(line) {
                disk_store = caps[1].to_string();
            }
        }
    }
    (name, disk_store)
}

#[derive(Default)]
struct AdapterLines {
    network: String,
    generated: bool,
    generated_address: String,
    address: String,
    nic_type: String,
}

/// Fill the configuration-text part of `state`.
fn read_settings(text: &str, state: &mut GuestState) {
    let doc = ConfigDocument::parse(text);

    state.memsize = doc.get("memSize").and_then(|v| v.parse().ok());
    state.numvcpus = doc
        .strip_prefix("numa.autosize.vcpu.")
        .last()
        .or_else(|| doc.get("numvcpus").map(|v| ("", v)))
        .and_then(|(_, v)| v.parse().ok());
    state.virthwver = doc.get("virtualHW.version").and_then(|v| v.parse().ok());
    state.guestos = doc.get("guestOS").unwrap_or_default().to_string();
    state.notes = vmx::unescape_value(doc.get("annotation").unwrap_or_default());
    state.guestinfo = doc
        .strip_prefix("guestinfo.")
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    let mut adapters: Vec<AdapterLines> = (0..MAX_NETWORK_ADAPTERS).map(|_| AdapterLines::default()).collect();
    let mut disks = Vec::new();
    for (key, value) in doc.iter() {
        if let Some(caps) = DISK_FILE_RE.captures(key) {
            let (Ok(bus), Ok(unit)) = (caps[1].parse::<u8>(), caps[2].parse::<u8>()) else {
                continue;
            };
            let slot = DiskSlot { bus, unit };
            if slot != DiskSlot::BOOT {
                disks.push(DiskAttachment {
                    disk_id: value.to_string(),
                    slot,
                });
            }
        } else if let Some(caps) = ADAPTER_KEY_RE.captures(key) {
            let Ok(index) = caps[1].parse::<usize>() else {
                continue;
            };
            let lines = &mut adapters[index];
            match &caps[2] {
                "networkName" => lines.network = value.to_string(),
                "addressType" => lines.generated = value == "generated",
                "generatedAddress" => lines.generated_address = value.to_string(),
                "address" => lines.address = value.to_string(),
                "virtualDev" => lines.nic_type = value.to_string(),
                _ => {}
            }
        }
    }
    disks.sort_by_key(|d| (d.slot.bus, d.slot.unit));
    state.virtual_disks = disks;

    let used = adapters
        .iter()
        .rposition(|a| !a.network.is_empty())
        .map_or(0, |last| last + 1);
    state.network_adapters = adapters
        .into_iter()
        .take(used)
        .map(|a| NetworkAdapterSpec {
            mac_address: if a.generated {
                a.generated_address
            } else {
                a.address
            },
            network: a.network,
            nic_type: a.nic_type,
        })
        .collect();
}

/// Read the guest back, `None` if the host no longer knows it.
///
/// A running guest's address is polled for up to `startup_timeout` seconds.
pub async fn read<T: Transport>(
    host: &Host<T>,
    vmid: &str,
    startup_timeout: u32,
) -> Result<Option<GuestState>, VmxError> {
    let summary = host
        .run(&format!("vim-cmd vmsvc/get.summary {vmid}"), "get guest summary")
        .await?;
    if summary.output.contains(GUEST_NOT_FOUND) {
        return Ok(None);
    }
    let (name, disk_store) = parse_summary(&summary.into_result("get guest summary")?);

    let resource_pool = match identity::pool_of_guest(host, vmid).await? {
        Some(pool_id) => identity::pool_name_by_id(host, &pool_id).await?,
        None => None,
    }
    .unwrap_or_else(|| "/".to_string());

    let mut state = GuestState {
        vmid: vmid.to_string(),
        name,
        disk_store,
        resource_pool,
        ..GuestState::default()
    };
    if let Some(file) = read_vmx(host, vmid).await? {
        read_settings(&file.text, &mut state);
    }

    let power = power::power_state(host, vmid).await?;
    state.power = Some(power);

    if let Some(path) = boot_disk_path(host, vmid).await? {
        if let Some(info) = disk::disk_info(host, &path).await? {
            state.boot_disk_size = Some(info.size_gb);
            state.boot_disk_type = info.disk_type;
        }
    }

    if power == PowerState::On {
        state.ip_address = poll_ip_address(host, vmid, startup_timeout).await?;
    }
    Ok(Some(state))
}

/// Address reported by VMware tools, `None` unless the guest is running.
pub async fn ip_address<T: Transport>(
    host: &Host<T>,
    vmid: &str,
    startup_timeout: u32,
) -> Result<Option<String>, VmxError> {
    if power::power_state(host, vmid).await? != PowerState::On {
        return Ok(None);
    }
    poll_ip_address(host, vmid, startup_timeout).await
}

async fn guest_uptime<T: Transport>(host: &Host<T>, vmid: &str) -> Result<Option<u64>, VmxError> {
    let output = host
        .run(
            &format!(
                "vim-cmd vmsvc/get.summary {vmid} 2>/dev/null | grep 'uptimeSeconds ='|sed 's/^.*= //g'|sed s/,//g"
            ),
            "get uptime",
        )
        .await?;
    if !output.success() {
        return Ok(None);
    }
    Ok(Some(output.output.parse().unwrap_or(0)))
}

fn first_line(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

async fn poll_ip_address<T: Transport>(
    host: &Host<T>,
    vmid: &str,
    startup_timeout: u32,
) -> Result<Option<String>, VmxError> {
    let primary = format!(
        "vim-cmd vmsvc/get.guest {vmid} 2>/dev/null |grep -A 5 'deviceConfigId = 4000' |tail -1|grep -oE '{IPV4_PATTERN}'"
    );
    let timeout = u64::from(startup_timeout);
    // uptime may never be reported, so wall time bounds the loop too
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout);

    let mut uptime = 0;
    while uptime < timeout && tokio::time::Instant::now() < deadline {
        let output = host.run(&primary, "get ip_address method 1").await?;
        if let Some(ip) = first_line(&output.output).filter(|_| output.success()) {
            return Ok(Some(ip));
        }
        tokio::time::sleep(IP_POLL).await;
        match guest_uptime(host, vmid).await? {
            Some(seconds) => uptime = seconds,
            None => return Ok(None),
        }
    }

    if guest_uptime(host, vmid).await?.unwrap_or(0) > FALLBACK_IP_UPTIME {
        let fallback = format!(
            "vim-cmd vmsvc/get.guest {vmid} 2>/dev/null | grep -m 1 '^   ipAddress = ' | grep -oE '{IPV4_PATTERN}'"
        );
        let output = host.run(&fallback, "get ip_address method 2").await?;
        if output.success() {
            return Ok(first_line(&output.output));
        }
    }
    tracing::debug!(vmid, "no address reported by the guest");
    Ok(None)
}
