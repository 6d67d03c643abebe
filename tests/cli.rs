use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::io::Write;

fn vmxctl() -> assert_cmd::Command {
    cargo_bin_cmd!("vmxctl").into()
}

fn write_config(dir: &tempfile::TempDir, contents: &str) -> std::path::PathBuf {
    let config_path = dir.path().join("vmxctl.toml");
    let mut f = std::fs::File::create(&config_path).unwrap();
    write!(f, "{contents}").unwrap();
    config_path
}

const HOST: &str = r#"
[host]
hostname = "esxi.invalid"
password = "secret"
"#;

#[test]
fn help_works() {
    vmxctl()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("ESXi hosts over SSH"));
}

#[test]
fn guest_help_lists_subcommands() {
    vmxctl()
        .args(["guest", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("apply"))
        .stdout(predicate::str::contains("adopt"));
}

#[test]
fn missing_config_shows_error() {
    vmxctl()
        .args(["--config", "/nonexistent/vmxctl.toml", "check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn malformed_config_shows_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(&dir, "[host\nhostname =");

    vmxctl()
        .args(["--config", config_path.to_str().unwrap(), "check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to parse config"));
}

#[test]
fn validation_rejects_oversized_boot_disk() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(
        &dir,
        &format!(
            r#"{HOST}
[guest]
name = "web01"
disk_store = "datastore1"
boot_disk_size = 70000
"#
        ),
    );

    vmxctl()
        .args(["--config", config_path.to_str().unwrap(), "guest", "apply"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("boot disk size"));
}

#[test]
fn validation_rejects_conflicting_sources() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(
        &dir,
        &format!(
            r#"{HOST}
[guest]
name = "web01"
disk_store = "datastore1"
clone_from_vm = "tmpl/centos"
ovf_source = "/images/centos.ova"
"#
        ),
    );

    vmxctl()
        .args(["--config", config_path.to_str().unwrap(), "guest", "show"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("mutually exclusive"));
}

#[test]
fn empty_password_is_rejected_before_connecting() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(&dir, "[host]\nhostname = \"esxi.invalid\"\n");

    vmxctl()
        .args(["--config", config_path.to_str().unwrap(), "check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("host password"));
}

#[test]
fn guest_command_needs_guest_section() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(&dir, HOST);

    vmxctl()
        .args(["--config", config_path.to_str().unwrap(), "guest", "apply"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no [guest] section"));
}

#[test]
fn unknown_disk_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(&dir, HOST);

    vmxctl()
        .args(["--config", config_path.to_str().unwrap(), "disk", "show", "data9"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no [disks.data9] section"));
}

#[test]
fn root_pool_cannot_be_managed() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(
        &dir,
        &format!(
            r#"{HOST}
[pools."/"]
cpu_min = 100
"#
        ),
    );

    vmxctl()
        .args(["--config", config_path.to_str().unwrap(), "pool", "apply", "/"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("root pool"));
}
