//! Guest creation through the external `ovftool` import tool, run locally.

use std::path::Path;

use super::spec::{GuestSource, GuestSpec};
use crate::error::VmxError;
use crate::transport::RemoteEndpoint;

/// Location `ovftool` reads the guest from, `None` for a blank build.
pub fn source_path(endpoint: &RemoteEndpoint, source: &GuestSource) -> Option<String> {
    match source {
        GuestSource::Blank => None,
        GuestSource::Clone(path) => Some(vi_url(endpoint, endpoint.secret(), path)),
        GuestSource::Import(path) => Some(path.clone()),
    }
}

fn vi_url(endpoint: &RemoteEndpoint, secret: &str, path: &str) -> String {
    format!(
        "vi://{}:{}@{}/{}",
        endpoint.username,
        urlencoding::encode(secret),
        endpoint.host,
        path
    )
}

/// Full `ovftool` command line for importing `source` under `pool_name`.
pub fn import_command(
    endpoint: &RemoteEndpoint,
    spec: &GuestSpec,
    source: &str,
    pool_name: &str,
) -> String {
    build_command(endpoint, endpoint.secret(), spec, source, pool_name)
}

fn build_command(
    endpoint: &RemoteEndpoint,
    secret: &str,
    spec: &GuestSpec,
    source: &str,
    pool_name: &str,
) -> String {
    let destination = vi_url(endpoint, secret, pool_name);
    let network = spec
        .network_adapters
        .first()
        .map(|a| a.network.as_str())
        .filter(|n| !n.is_empty());
    let network_flag = match network {
        Some(net) if source.ends_with(".ova") || source.ends_with(".ovf") => {
            format!(" --network='{net}'")
        }
        _ => String::new(),
    };
    format!(
        "ovftool --acceptAllEulas --noSSLVerify --X:useMacNaming=false -dm={} --name='{}' --overwrite -ds='{}'{network_flag} '{source}' '{destination}'",
        spec.boot_disk_type.import_mode(),
        spec.name,
        spec.disk_store,
    )
}

/// Import `spec` from its source, returning once the tool exits successfully.
pub async fn import_guest(
    endpoint: &RemoteEndpoint,
    spec: &GuestSpec,
    pool_name: &str,
) -> Result<(), VmxError> {
    let Some(source) = source_path(endpoint, &spec.source) else {
        return Err(VmxError::Import {
            message: "no clone or OVF source given".into(),
        });
    };
    if is_local(&source) && !Path::new(&source).exists() {
        return Err(VmxError::Import {
            message: format!("file not found: {source}"),
        });
    }

    let command = import_command(endpoint, spec, &source, pool_name);
    let printable = build_command(endpoint, "********", spec, &redacted(endpoint, &source), pool_name);
    tracing::info!(command = %printable, "running ovftool");

    let output = run_shell(&command).await?;
    tracing::debug!(output = %output.stdout, "ovftool finished");
    if output.success {
        Ok(())
    } else {
        Err(VmxError::Import {
            message: format!("{}\n{}", output.stdout.trim(), output.stderr.trim()),
        })
    }
}

/// Anything without a `scheme://` prefix is a file on this machine.
fn is_local(source: &str) -> bool {
    match source.split_once("://") {
        Some((scheme, _)) => {
            scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+')
        }
        None => true,
    }
}

fn redacted(endpoint: &RemoteEndpoint, source: &str) -> String {
    source.replace(
        &urlencoding::encode(endpoint.secret()).into_owned(),
        "********",
    )
}

struct ShellOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

#[cfg(not(windows))]
async fn run_shell(command: &str) -> Result<ShellOutput, VmxError> {
    let output = tokio::process::Command::new("/bin/bash")
        .arg("-c")
        .arg(command)
        .output()
        .await
        .map_err(|e| VmxError::Io {
            context: "running ovftool".into(),
            source: e,
        })?;
    Ok(ShellOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(windows)]
async fn run_shell(command: &str) -> Result<ShellOutput, VmxError> {
    let batch = crate::paths::import_batch_path();
    let io_err = |context: String| move |e: std::io::Error| VmxError::Io { context, source: e };
    if let Some(dir) = batch.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(io_err(format!("creating {}", dir.display())))?;
    }
    // cmd.exe only understands double quotes
    tokio::fs::write(&batch, command.replace('\'', "\""))
        .await
        .map_err(io_err(format!("writing {}", batch.display())))?;

    let output = tokio::process::Command::new("cmd.exe")
        .arg("/c")
        .arg(&batch)
        .output()
        .await
        .map_err(io_err("running ovftool".into()))?;
    Ok(ShellOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskType;
    use crate::guest::spec::{NetworkAdapterSpec, sample_spec};

    fn endpoint() -> RemoteEndpoint {
        RemoteEndpoint::new("esxi.test", 22, "root", "p@ss word")
    }

    #[test]
    fn clone_source_embeds_encoded_credentials() {
        let src = source_path(&endpoint(), &GuestSource::Clone("tmpl/centos".into())).unwrap();
        assert_eq!(src, "vi://root:p%40ss%20word@esxi.test/tmpl/centos");
        assert_eq!(source_path(&endpoint(), &GuestSource::Blank), None);
    }

    #[test]
    fn ova_source_gets_network_mapping() {
        let spec = GuestSpec {
            network_adapters: vec![NetworkAdapterSpec {
                network: "VM Network".into(),
                ..Default::default()
            }],
            boot_disk_type: DiskType::ZeroedThick,
            ..sample_spec()
        };
        let cmd = import_command(&endpoint(), &spec, "/images/centos.ova", "teamA/dev");
        assert_eq!(
            cmd,
            "ovftool --acceptAllEulas --noSSLVerify --X:useMacNaming=false -dm=thick \
             --name='web01' --overwrite -ds='ds1' --network='VM Network' \
             '/images/centos.ova' 'vi://root:p%40ss%20word@esxi.test/teamA/dev'"
        );
    }

    #[test]
    fn clone_source_gets_no_network_mapping() {
        let spec = GuestSpec {
            network_adapters: vec![NetworkAdapterSpec {
                network: "VM Network".into(),
                ..Default::default()
            }],
            ..sample_spec()
        };
        let cmd = import_command(&endpoint(), &spec, "vi://root:x@esxi.test/tmpl", "/");
        assert!(!cmd.contains("--network"));
        assert!(cmd.contains("-dm=thin"));
    }

    #[test]
    fn redaction_hides_encoded_secret() {
        let src = "vi://root:p%40ss%20word@esxi.test/tmpl";
        assert_eq!(redacted(&endpoint(), src), "vi://root:********@esxi.test/tmpl");
    }

    #[test]
    fn only_scheme_less_sources_are_checked_locally() {
        assert!(is_local("/images/centos.ova"));
        assert!(is_local("C:\\images\\centos.ova"));
        assert!(!is_local("vi://root:x@esxi.test/tmpl"));
        assert!(!is_local("https://images.lab/centos.ova"));
        assert!(!is_local("http://images.lab/centos.ovf"));
    }

    #[tokio::test]
    async fn missing_local_source_fails_before_running() {
        let spec = GuestSpec {
            source: GuestSource::Import("/nonexistent/centos.ova".into()),
            ..sample_spec()
        };
        let err = import_guest(&endpoint(), &spec, "/").await.unwrap_err();
        assert!(err.to_string().contains("file not found"));
    }
}
