//! Virtual disks addressed by their absolute descriptor path.

use std::fmt;
use std::str::FromStr;

use rand_core::{OsRng, RngCore};

use crate::error::VmxError;
use crate::host::Host;
use crate::transport::{Transport, shell_quote};

pub const VOLUMES_ROOT: &str = "/vmfs/volumes";

/// Provisioning type of a virtual disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiskType {
    #[default]
    Thin,
    ZeroedThick,
    EagerZeroedThick,
}

impl DiskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskType::Thin => "thin",
            DiskType::ZeroedThick => "zeroedthick",
            DiskType::EagerZeroedThick => "eagerzeroedthick",
        }
    }

    /// Disk mode name the import tool expects.
    pub fn import_mode(&self) -> &'static str {
        match self {
            DiskType::ZeroedThick => "thick",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for DiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiskType {
    type Err = VmxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "thin" => Ok(DiskType::Thin),
            "zeroedthick" => Ok(DiskType::ZeroedThick),
            "eagerzeroedthick" => Ok(DiskType::EagerZeroedThick),
            other => Err(VmxError::validation(
                "disk type",
                format!("'{other}' must be thin, zeroedthick or eagerzeroedthick"),
            )),
        }
    }
}

/// What the host reports about an existing disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInfo {
    pub disk_store: String,
    pub dir: String,
    pub name: String,
    pub size_gb: u64,
    /// `None` when no detection pattern matched.
    pub disk_type: Option<DiskType>,
}

/// `vdisk_` followed by ten uppercase hex digits.
pub fn random_disk_name() -> String {
    format!("vdisk_{:010X}.vmdk", OsRng.next_u64() & 0xFF_FFFF_FFFF)
}

pub fn disk_path(disk_store: &str, dir: &str, name: &str) -> String {
    format!("{VOLUMES_ROOT}/{disk_store}/{dir}/{name}")
}

/// Split `/vmfs/volumes/<store>/<dir>/<name>` into its three parts.
pub fn split_disk_path(path: &str) -> Result<(&str, &str, &str), VmxError> {
    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() < 6 {
        return Err(VmxError::validation(
            "virtual disk id",
            format!("'{path}' is not of the form {VOLUMES_ROOT}/<store>/<dir>/<name>"),
        ));
    }
    Ok((segments[3], segments[4], segments[5]))
}

/// Name of the backing data file next to a descriptor.
fn flat_file_name(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}-flat.{ext}"),
        None => format!("{name}-flat"),
    }
}

async fn list_disk_stores<T: Transport>(host: &Host<T>) -> Result<Vec<String>, VmxError> {
    let output = host
        .run_ok(
            "esxcli storage filesystem list | grep '/vmfs/volumes/.*[VMFS|NFS]' | awk '{print $2}'",
            "get list of disk stores",
        )
        .await?;
    Ok(output.lines().map(|l| l.trim().to_string()).collect())
}

/// Fail unless the store is mounted, rescanning filesystems once first.
pub async fn validate_disk_store<T: Transport>(host: &Host<T>, store: &str) -> Result<(), VmxError> {
    let stores = list_disk_stores(host).await?;
    if stores.iter().any(|s| s == store) {
        return Ok(());
    }

    tracing::debug!(store, "disk store not listed, rescanning");
    if let Err(e) = host
        .run_ok("esxcli storage filesystem rescan", "refresh filesystems")
        .await
    {
        tracing::warn!("filesystem rescan failed: {e}");
    }

    let stores = list_disk_stores(host).await?;
    if stores.iter().any(|s| s == store) {
        Ok(())
    } else {
        Err(VmxError::DiskStoreMissing {
            store: store.to_string(),
            available: stores.join(", "),
        })
    }
}

/// Create a disk, or adopt one that already exists at the same path.
pub async fn create_disk<T: Transport>(
    host: &Host<T>,
    disk_store: &str,
    dir: &str,
    name: &str,
    size_gb: u64,
    disk_type: DiskType,
) -> Result<String, VmxError> {
    validate_disk_store(host, disk_store).await?;

    let dir_path = format!("{VOLUMES_ROOT}/{disk_store}/{dir}");
    host.run(
        &format!("mkdir -p {}", shell_quote(&dir_path)),
        "create virtual disk dir",
    )
    .await?;
    host.run_ok(
        &format!("ls -d {}", shell_quote(&dir_path)),
        "validate dir exists",
    )
    .await?;

    let path = disk_path(disk_store, dir, name);
    if host
        .run(&format!("ls -l {}", shell_quote(&path)), "check if disk exists")
        .await?
        .success()
    {
        tracing::info!(path, "virtual disk already exists");
        return Ok(path);
    }

    host.run_ok(
        &format!(
            "/bin/vmkfstools -c {size_gb}G -d {disk_type} {}",
            shell_quote(&path)
        ),
        "create virtual disk",
    )
    .await?;
    tracing::info!(path, size_gb, %disk_type, "created virtual disk");
    Ok(path)
}

/// Size and type of a disk, `None` if nothing exists at the path.
///
/// Type detection is only reliable while the owning guest is powered off.
pub async fn disk_info<T: Transport>(host: &Host<T>, path: &str) -> Result<Option<DiskInfo>, VmxError> {
    let (disk_store, dir, name) = split_disk_path(path)?;

    let exists = host
        .run(&format!("test -s {}", shell_quote(path)), "test if virtual disk exists")
        .await?;
    if !exists.success() {
        return Ok(None);
    }

    let flat = format!("{VOLUMES_ROOT}/{disk_store}/{dir}/{}", flat_file_name(name));
    let bytes = host
        .run_ok(
            &format!("ls -l {} | awk '{{print $5}}'", shell_quote(&flat)),
            "get size",
        )
        .await?;
    // An unknown size must not reach the shrink guard as 0.
    let size_gb = bytes
        .parse::<u64>()
        .map_err(|_| VmxError::CommandFailed {
            description: "get size".into(),
            status: 0,
            output: bytes.clone(),
        })?
        / (1024 * 1024 * 1024);

    let mut detected = Vec::with_capacity(3);
    for (pattern, disk_type) in [
        ("NOMP -- :", DiskType::Thin),
        ("VMFS Z- LVID:", DiskType::ZeroedThick),
        ("VMFS -- LVID:", DiskType::EagerZeroedThick),
    ] {
        let command = format!(
            "vmkfstools -t0 {} |grep -q '{pattern}' && echo true",
            shell_quote(path)
        );
        let output = host.run(&command, "get disk type").await?;
        if output.output == "true" {
            detected.push(disk_type);
        }
    }

    Ok(Some(DiskInfo {
        disk_store: disk_store.to_string(),
        dir: dir.to_string(),
        name: name.to_string(),
        size_gb,
        disk_type: detected.first().copied(),
    }))
}

/// Grow to `size_gb` if the disk is currently smaller; returns whether it grew.
pub async fn grow_disk<T: Transport>(host: &Host<T>, path: &str, size_gb: u64) -> Result<bool, VmxError> {
    let info = disk_info(host, path)
        .await?
        .ok_or_else(|| VmxError::DiskNotFound {
            path: path.to_string(),
        })?;
    tracing::debug!(path, current = info.size_gb, desired = size_gb, "checking disk size");

    if info.size_gb >= size_gb {
        return Ok(false);
    }
    host.run_ok(
        &format!("/bin/vmkfstools -X {size_gb}G {}", shell_quote(path)),
        "grow disk",
    )
    .await?;
    tracing::info!(path, from = info.size_gb, to = size_gb, "grew virtual disk");
    Ok(true)
}

/// Resize request from the caller: shrinking is rejected before anything changes.
pub async fn update_disk<T: Transport>(host: &Host<T>, path: &str, size_gb: u64) -> Result<bool, VmxError> {
    let info = disk_info(host, path)
        .await?
        .ok_or_else(|| VmxError::DiskNotFound {
            path: path.to_string(),
        })?;
    if info.size_gb > size_gb {
        return Err(VmxError::ShrinkRejected {
            path: path.to_string(),
            current: info.size_gb,
            desired: size_gb,
        });
    }
    grow_disk(host, path, size_gb).await
}

/// Destroy a disk and remove its directory if that leaves it empty.
pub async fn delete_disk<T: Transport>(host: &Host<T>, path: &str) -> Result<(), VmxError> {
    let (disk_store, dir, _) = split_disk_path(path)?;

    let destroy = host
        .run(
            &format!("/bin/vmkfstools -U {}", shell_quote(path)),
            "destroy virtual disk",
        )
        .await?;
    match destroy.status {
        0 => tracing::info!(path, "destroyed virtual disk"),
        255 => tracing::info!(path, "virtual disk already deleted"),
        _ => {
            destroy.into_result("destroy virtual disk")?;
        }
    }

    let dir_path = format!("{VOLUMES_ROOT}/{disk_store}/{dir}");
    let listing = host
        .run(
            &format!("ls -al {} |wc -l", shell_quote(&format!("{dir_path}/"))),
            "check if storage dir is empty",
        )
        .await?;
    // `.` and `..` plus the total line
    if listing.output == "3" {
        if let Err(e) = host
            .run_ok(&format!("rmdir {}", shell_quote(&dir_path)), "rmdir empty storage dir")
            .await
        {
            tracing::warn!(dir = %dir_path, "unable to remove empty dir: {e}");
        }
    }
    Ok(())
}
