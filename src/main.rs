use std::collections::BTreeMap;
use std::io::IsTerminal;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use vmxctl::cli::{Cli, Command, DiskCommand, GuestCommand, OutputFormat, PoolCommand, PowerAction};
use vmxctl::config::{self, Config, DiskConfig, GuestConfig, PoolConfig};
use vmxctl::disk;
use vmxctl::error::VmxError;
use vmxctl::guest::{self, GuestState};
use vmxctl::host::Host;
use vmxctl::identity;
use vmxctl::pool::{self, PoolInfo};
use vmxctl::power;
use vmxctl::progress::{OutputMode, StepProgress};
use vmxctl::transport::SshTransport;

type SshHost = Host<SshTransport>;

#[tokio::main(flavor = "current_thread")]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    let mode = resolve_output_mode(cli.output, cli.verbose);

    // Spinners own the terminal in Normal mode; log lines would break their redraws.
    let default_filter = match (cli.verbose, mode) {
        (true, _) => "vmxctl=debug",
        (false, OutputMode::Normal) => "off",
        (false, _) => "vmxctl=warn",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let config = config::load_config(&cli.config)?;
    let output = cli.output;

    match cli.command {
        Command::Check => {
            let host = connect(&config)?;
            let version = host.run_ok("vmware --version", "check credentials").await?;
            match output {
                OutputFormat::Json => print_json(&CheckJson {
                    host: host.endpoint().host.clone(),
                    version,
                }),
                OutputFormat::Text => println!("{}: {version}", host.endpoint().host),
            }
        }
        Command::Guest { action } => {
            let guest_config = guest_config(&config)?;
            let host = connect(&config)?;
            run_guest(&host, guest_config, action, output, mode).await?;
        }
        Command::Disk { action } => {
            let name = match &action {
                DiskCommand::Apply { name } | DiskCommand::Show { name } | DiskCommand::Destroy { name } => name,
            };
            let disk_config = disk_config(&config, name)?;
            let host = connect(&config)?;
            run_disk(&host, disk_config, action, output).await?;
        }
        Command::Pool { action } => {
            let host = connect(&config)?;
            run_pool(&host, &config, action, output).await?;
        }
    }

    Ok(())
}

fn connect(config: &Config) -> Result<SshHost, VmxError> {
    Ok(Host::new(SshTransport::new(config.host.endpoint()?)))
}

fn guest_config(config: &Config) -> Result<&GuestConfig, VmxError> {
    config
        .guest
        .as_ref()
        .ok_or_else(|| VmxError::Validation {
            field: "guest".into(),
            message: "no [guest] section in config".into(),
        })
}

fn disk_config<'a>(config: &'a Config, name: &str) -> Result<&'a DiskConfig, VmxError> {
    config.disks.get(name).ok_or_else(|| VmxError::Validation {
        field: "virtual disk".into(),
        message: format!("no [disks.{name}] section in config"),
    })
}

fn pool_config<'a>(config: &'a Config, path: &str) -> Result<&'a PoolConfig, VmxError> {
    config.pools.get(path).ok_or_else(|| VmxError::Validation {
        field: "resource pool".into(),
        message: format!("no [pools.\"{path}\"] section in config"),
    })
}

async fn guest_id(host: &SshHost, name: &str) -> Result<String, VmxError> {
    identity::guest_id_by_name(host, name)
        .await?
        .ok_or_else(|| VmxError::GuestNotFound {
            name: name.to_string(),
        })
}

async fn run_guest(
    host: &SshHost,
    guest_config: &GuestConfig,
    action: GuestCommand,
    output: OutputFormat,
    mode: OutputMode,
) -> Result<(), VmxError> {
    let spec = guest_config.to_spec()?;
    match action {
        GuestCommand::Apply => {
            let mut progress = StepProgress::new(2, mode);
            let applied = progress
                .run(&format!("Applying guest '{}'", spec.name), |step| async move {
                    let applied = guest::apply(host, &spec).await?;
                    step.set_done_label(format!(
                        "Guest '{}' {} (vmid {})",
                        spec.name,
                        if applied.created { "created" } else { "updated" },
                        applied.vmid
                    ));
                    Ok::<_, VmxError>(applied)
                })
                .await?;
            let state = progress
                .run("Reading guest back", |_| {
                    guest::read(host, &applied.vmid, guest_config.startup_timeout)
                })
                .await?
                .ok_or_else(|| VmxError::GuestNotFound {
                    name: applied.vmid.clone(),
                })?;
            if let Some(ip) = &state.ip_address {
                progress.info(&format!("IP: {ip}"));
            }
            if output == OutputFormat::Json {
                print_json(&GuestJson::from(&state));
            }
        }
        GuestCommand::Show { vmid } => {
            let vmid = match vmid {
                Some(vmid) => vmid,
                None => guest_id(host, &spec.name).await?,
            };
            let state = guest::read(host, &vmid, guest_config.startup_timeout)
                .await?
                .ok_or_else(|| VmxError::GuestNotFound { name: vmid.clone() })?;
            match output {
                OutputFormat::Json => print_json(&GuestJson::from(&state)),
                OutputFormat::Text => print_guest(&state),
            }
        }
        GuestCommand::Destroy => {
            let mut progress = StepProgress::new(1, mode);
            let Some(vmid) = identity::guest_id_by_name(host, &spec.name).await? else {
                progress.skip(&format!("Guest '{}' does not exist", spec.name));
                return Ok(());
            };
            progress
                .run(&format!("Destroying guest '{}'", spec.name), |_| {
                    guest::delete(host, &vmid, spec.shutdown_timeout)
                })
                .await?;
        }
        GuestCommand::Power { action } => {
            let vmid = guest_id(host, &spec.name).await?;
            match action {
                PowerAction::On => power::power_on(host, &vmid).await?,
                PowerAction::Off => power::power_off(host, &vmid, spec.shutdown_timeout).await?,
                PowerAction::State => {}
            }
            let state = power::power_state(host, &vmid).await?;
            match output {
                OutputFormat::Json => print_json(&PowerJson {
                    vmid,
                    power: state.to_string(),
                }),
                OutputFormat::Text => println!("{}: {state}", spec.name),
            }
        }
        GuestCommand::Adopt { vmid } => {
            let vmid = guest::adopt(host, &vmid).await?;
            match output {
                OutputFormat::Json => print_json(&AdoptJson { vmid }),
                OutputFormat::Text => println!("Guest {vmid} exists"),
            }
        }
    }
    Ok(())
}

async fn run_disk(
    host: &SshHost,
    disk_config: &DiskConfig,
    action: DiskCommand,
    output: OutputFormat,
) -> Result<(), VmxError> {
    let path = |name: &str| disk::disk_path(&disk_config.disk_store, &disk_config.dir, name);
    match action {
        DiskCommand::Apply { .. } => {
            let name = if disk_config.name.is_empty() {
                disk::random_disk_name()
            } else {
                disk_config.name.clone()
            };
            let existing = disk::disk_info(host, &path(&name)).await?;
            let path = match existing {
                Some(_) => {
                    let path = path(&name);
                    disk::update_disk(host, &path, disk_config.size).await?;
                    path
                }
                None => {
                    disk::create_disk(
                        host,
                        &disk_config.disk_store,
                        &disk_config.dir,
                        &name,
                        disk_config.size,
                        disk_config.disk_type()?,
                    )
                    .await?
                }
            };
            report_disk(host, &path, output).await?;
        }
        DiskCommand::Show { name } => {
            report_disk(host, &path(&require_disk_name(disk_config, &name)?), output).await?;
        }
        DiskCommand::Destroy { name } => {
            let path = path(&require_disk_name(disk_config, &name)?);
            disk::delete_disk(host, &path).await?;
            if output == OutputFormat::Text {
                println!("Destroyed {path}");
            }
        }
    }
    Ok(())
}

fn require_disk_name(disk_config: &DiskConfig, key: &str) -> Result<String, VmxError> {
    if disk_config.name.is_empty() {
        return Err(VmxError::Validation {
            field: "virtual disk name".into(),
            message: format!("[disks.{key}] has a generated name; set name to address it"),
        });
    }
    Ok(disk_config.name.clone())
}

async fn report_disk(host: &SshHost, path: &str, output: OutputFormat) -> Result<(), VmxError> {
    let info = disk::disk_info(host, path)
        .await?
        .ok_or_else(|| VmxError::DiskNotFound {
            path: path.to_string(),
        })?;
    let disk_type = info
        .disk_type
        .map(|t| t.to_string())
        .unwrap_or_else(|| "unknown".into());
    match output {
        OutputFormat::Json => print_json(&DiskJson {
            path: path.to_string(),
            disk_store: info.disk_store,
            dir: info.dir,
            name: info.name,
            size_gb: info.size_gb,
            disk_type,
        }),
        OutputFormat::Text => println!("{path}: {}G {disk_type}", info.size_gb),
    }
    Ok(())
}

async fn run_pool(
    host: &SshHost,
    config: &Config,
    action: PoolCommand,
    output: OutputFormat,
) -> Result<(), VmxError> {
    match action {
        PoolCommand::Apply { path } => {
            let spec = pool_config(config, &path)?.to_spec(&path)?;
            let id = match identity::pool_id_by_name(host, &spec.name).await? {
                Some(id) => {
                    pool::update_pool(host, &id, &spec).await?;
                    id
                }
                None => pool::create_pool(host, &spec).await?,
            };
            report_pool(host, &id, output).await?;
        }
        PoolCommand::Show { path } => {
            let id = pool_id(host, &path).await?;
            report_pool(host, &id, output).await?;
        }
        PoolCommand::Destroy { path } => {
            let id = pool_id(host, &path).await?;
            pool::delete_pool(host, &id).await?;
            if output == OutputFormat::Text {
                println!("Destroyed resource pool '{path}' ({id})");
            }
        }
        PoolCommand::Resolve { path } => {
            let id = pool_id(host, &path).await?;
            let name = identity::pool_name_by_id(host, &id)
                .await?
                .ok_or_else(|| VmxError::PoolNotFound { name: id.clone() })?;
            match output {
                OutputFormat::Json => print_json(&ResolveJson { id, name }),
                OutputFormat::Text => println!("{path} -> {id} -> {name}"),
            }
        }
    }
    Ok(())
}

async fn pool_id(host: &SshHost, path: &str) -> Result<String, VmxError> {
    identity::pool_id_by_name(host, path)
        .await?
        .ok_or_else(|| VmxError::PoolNotFound {
            name: path.to_string(),
        })
}

async fn report_pool(host: &SshHost, id: &str, output: OutputFormat) -> Result<(), VmxError> {
    let info = pool::read_pool(host, id)
        .await?
        .ok_or_else(|| VmxError::PoolNotFound {
            name: id.to_string(),
        })?;
    match output {
        OutputFormat::Json => print_json(&PoolJson::from(&info)),
        OutputFormat::Text => {
            println!("Resource pool '{}' ({})", info.name, info.id);
            for (label, alloc) in [("cpu", &info.cpu), ("mem", &info.mem)] {
                println!(
                    "  {label}: min {} (expandable {}), max {}, shares {}",
                    alloc.min, alloc.min_expandable, alloc.max, alloc.shares
                );
            }
        }
    }
    Ok(())
}

fn print_guest(state: &GuestState) {
    let opt = |v: Option<u32>| v.map(|n| n.to_string()).unwrap_or_else(|| "-".into());
    println!("Guest '{}' (vmid {})", state.name, state.vmid);
    println!("  disk store:    {}", state.disk_store);
    println!("  resource pool: {}", state.resource_pool);
    println!(
        "  power:         {}",
        state.power.map(|p| p.to_string()).unwrap_or_else(|| "-".into())
    );
    println!("  memsize:       {}", opt(state.memsize));
    println!("  numvcpus:      {}", opt(state.numvcpus));
    println!("  virthwver:     {}", opt(state.virthwver));
    println!("  guestos:       {}", state.guestos);
    if let Some(size) = state.boot_disk_size {
        let disk_type = state.boot_disk_type.map(|t| t.to_string()).unwrap_or_default();
        println!("  boot disk:     {size}G {disk_type}");
    }
    if let Some(ip) = &state.ip_address {
        println!("  ip address:    {ip}");
    }
    if !state.notes.is_empty() {
        println!("  notes:         {}", state.notes);
    }
    for (slot, nic) in state.network_adapters.iter().enumerate() {
        if !nic.network.is_empty() {
            println!(
                "  ethernet{slot}:     {} {} {}",
                nic.network, nic.nic_type, nic.mac_address
            );
        }
    }
    for disk in &state.virtual_disks {
        println!("  scsi{}:      {}", disk.slot, disk.disk_id);
    }
    for (key, value) in &state.guestinfo {
        println!("  guestinfo.{key} = {value}");
    }
}

fn print_json<'a, T: facet::Facet<'a>>(value: &T) {
    println!(
        "{}",
        facet_json::to_string(value).expect("JSON serialization")
    );
}

// ── JSON output structs ─────────────────────────────────────────────

#[derive(facet::Facet)]
struct CheckJson {
    host: String,
    version: String,
}

#[derive(facet::Facet)]
struct AdoptJson {
    vmid: String,
}

#[derive(facet::Facet)]
struct PowerJson {
    vmid: String,
    power: String,
}

#[derive(facet::Facet)]
struct NicJson {
    slot: u32,
    virtual_network: String,
    mac_address: String,
    nic_type: String,
}

#[derive(facet::Facet)]
struct AttachedDiskJson {
    virtual_disk_id: String,
    slot: String,
}

#[derive(facet::Facet)]
struct GuestJson {
    vmid: String,
    name: String,
    disk_store: String,
    resource_pool: String,
    memsize: Option<u32>,
    numvcpus: Option<u32>,
    virthwver: Option<u32>,
    guestos: String,
    notes: String,
    power: Option<String>,
    ip_address: Option<String>,
    boot_disk_size: Option<u64>,
    boot_disk_type: Option<String>,
    network_interfaces: Vec<NicJson>,
    virtual_disks: Vec<AttachedDiskJson>,
    guestinfo: BTreeMap<String, String>,
}

impl From<&GuestState> for GuestJson {
    fn from(state: &GuestState) -> Self {
        Self {
            vmid: state.vmid.clone(),
            name: state.name.clone(),
            disk_store: state.disk_store.clone(),
            resource_pool: state.resource_pool.clone(),
            memsize: state.memsize,
            numvcpus: state.numvcpus,
            virthwver: state.virthwver,
            guestos: state.guestos.clone(),
            notes: state.notes.clone(),
            power: state.power.map(|p| p.to_string()),
            ip_address: state.ip_address.clone(),
            boot_disk_size: state.boot_disk_size,
            boot_disk_type: state.boot_disk_type.map(|t| t.to_string()),
            network_interfaces: state
                .network_adapters
                .iter()
                .enumerate()
                .filter(|(_, nic)| !nic.network.is_empty())
                .map(|(slot, nic)| NicJson {
                    slot: slot as u32,
                    virtual_network: nic.network.clone(),
                    mac_address: nic.mac_address.clone(),
                    nic_type: nic.nic_type.clone(),
                })
                .collect(),
            virtual_disks: state
                .virtual_disks
                .iter()
                .map(|d| AttachedDiskJson {
                    virtual_disk_id: d.disk_id.clone(),
                    slot: d.slot.to_string(),
                })
                .collect(),
            guestinfo: state.guestinfo.clone(),
        }
    }
}

#[derive(facet::Facet)]
struct DiskJson {
    path: String,
    disk_store: String,
    dir: String,
    name: String,
    size_gb: u64,
    disk_type: String,
}

#[derive(facet::Facet)]
struct AllocationJson {
    min: u64,
    min_expandable: bool,
    max: u64,
    shares: String,
}

#[derive(facet::Facet)]
struct PoolJson {
    id: String,
    name: String,
    cpu: AllocationJson,
    mem: AllocationJson,
}

impl From<&PoolInfo> for PoolJson {
    fn from(info: &PoolInfo) -> Self {
        let alloc = |a: &pool::Allocation| AllocationJson {
            min: a.min,
            min_expandable: a.min_expandable,
            max: a.max,
            shares: a.shares.to_string(),
        };
        Self {
            id: info.id.clone(),
            name: info.name.clone(),
            cpu: alloc(&info.cpu),
            mem: alloc(&info.mem),
        }
    }
}

#[derive(facet::Facet)]
struct ResolveJson {
    id: String,
    name: String,
}

/// Map `--output`/`--verbose` and terminal detection to the step renderer.
fn resolve_output_mode(format: OutputFormat, verbose: bool) -> OutputMode {
    match format {
        OutputFormat::Json => OutputMode::Quiet,
        OutputFormat::Text if verbose || !std::io::stderr().is_terminal() => OutputMode::Plain,
        OutputFormat::Text => OutputMode::Normal,
    }
}
