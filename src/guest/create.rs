//! Blank guest build: directory, minimal template, boot disk, registration.

use super::spec::{
    DEFAULT_BOOT_DISK_SIZE, DEFAULT_GUESTOS, DEFAULT_MEMSIZE, DEFAULT_NUMVCPUS, DEFAULT_VIRTHWVER,
    GuestSpec,
};
use super::upload_text;
use crate::disk::VOLUMES_ROOT;
use crate::error::VmxError;
use crate::host::Host;
use crate::identity;
use crate::transport::{Transport, shell_quote};
use crate::vmx;

/// Configuration text of a fresh guest before the patch pass runs.
pub fn blank_template(spec: &GuestSpec) -> String {
    let name = spec.name.as_str();
    let head = [
        ("config.version", "8".to_string()),
        (
            "virtualHW.version",
            spec.virthwver.unwrap_or(DEFAULT_VIRTHWVER).to_string(),
        ),
        ("displayName", name.to_string()),
        (
            "numvcpus",
            spec.numvcpus.unwrap_or(DEFAULT_NUMVCPUS).to_string(),
        ),
        ("memSize", spec.memsize.unwrap_or(DEFAULT_MEMSIZE).to_string()),
        (
            "guestOS",
            spec.guestos
                .as_deref()
                .filter(|os| !os.is_empty())
                .unwrap_or(DEFAULT_GUESTOS)
                .to_string(),
        ),
        ("annotation", vmx::escape_value(&spec.notes)),
        ("floppy0.present", "FALSE".into()),
        ("scsi0.present", "TRUE".into()),
        ("scsi0.sharedBus", "none".into()),
        ("scsi0.virtualDev", "lsilogic".into()),
        ("pciBridge0.present", "TRUE".into()),
    ];
    let bridges: Vec<(String, String)> = (4..=7)
        .flat_map(|n| {
            [
                (format!("pciBridge{n}.present"), "TRUE".to_string()),
                (format!("pciBridge{n}.virtualDev"), "pcieRootPort".to_string()),
                (format!("pciBridge{n}.functions"), "8".to_string()),
            ]
        })
        .collect();
    let boot_file = format!("{name}.vmdk");
    let tail = [
        ("scsi0:0.present", "TRUE".to_string()),
        ("scsi0:0.fileName", boot_file),
        ("scsi0:0.deviceType", "scsi-hardDisk".to_string()),
        ("ide1:0.present", "TRUE".to_string()),
        ("ide1:0.fileName", String::new()),
        ("ide1:0.deviceType", "cdrom-image".to_string()),
    ];

    let mut text = String::new();
    let mut push = |key: &str, value: &str| {
        text.push_str(&vmx::format_line(key, value));
        text.push('\n');
    };
    for (key, value) in &head {
        push(key, value);
    }
    for (key, value) in &bridges {
        push(key, value);
    }
    for (key, value) in &tail {
        push(key, value);
    }
    text
}

/// Build and register a guest from the template.
///
/// Once the guest directory exists any failure removes it again before the
/// error is returned.
pub async fn build_blank<T: Transport>(host: &Host<T>, spec: &GuestSpec) -> Result<(), VmxError> {
    let dir = format!("{VOLUMES_ROOT}/{}/{}", spec.disk_store, spec.name);

    let existing = host
        .run(&format!("ls -d {}", shell_quote(&dir)), "check if guest path already exists")
        .await?;
    if existing.success() {
        return Err(VmxError::GuestPathExists { path: dir });
    }
    host.run_ok(&format!("mkdir {}", shell_quote(&dir)), "create guest path")
        .await?;

    if let Err(e) = populate(host, spec, &dir).await {
        tracing::warn!(%dir, "removing guest path after failed build");
        if let Err(cleanup) = host
            .run_ok(
                &format!("rm -fr {}", shell_quote(&dir)),
                "cleanup guest path because of failed events",
            )
            .await
        {
            tracing::warn!("cleanup of {dir} failed: {cleanup}");
        }
        return Err(e);
    }
    Ok(())
}

async fn populate<T: Transport>(host: &Host<T>, spec: &GuestSpec, dir: &str) -> Result<(), VmxError> {
    let vmx_file = format!("{dir}/{}.vmx", spec.name);
    upload_text(host, &blank_template(spec), &vmx_file).await?;

    let size = spec.boot_disk_size.unwrap_or(DEFAULT_BOOT_DISK_SIZE);
    let boot_disk = format!("{dir}/{}.vmdk", spec.name);
    host.run_ok(
        &format!(
            "vmkfstools -c {size}G -d {} {}",
            spec.boot_disk_type,
            shell_quote(&boot_disk)
        ),
        "vmkfstools (make boot disk)",
    )
    .await?;

    let pool_id = identity::pool_id_by_name(host, &spec.resource_pool)
        .await?
        .ok_or_else(|| VmxError::PoolNotFound {
            name: spec.resource_pool.clone(),
        })?;
    host.run_ok(
        &format!(
            "vim-cmd solo/registervm {} {} {pool_id}",
            shell_quote(&vmx_file),
            shell_quote(&spec.name)
        ),
        "solo/registervm",
    )
    .await?;
    tracing::info!(name = %spec.name, %pool_id, "registered guest");
    Ok(())
}
