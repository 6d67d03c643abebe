//! Resource pool lifecycle through `vim-cmd hostsvc/rsrc`.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::VmxError;
use crate::host::Host;
use crate::identity::{self, is_root_pool_name};
use crate::transport::Transport;

static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?[0-9]+").expect("invalid number regex"));
static BOOL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(true|false)").expect("invalid bool regex"));
static LEVEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(low|high|normal)").expect("invalid level regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Shares {
    Low,
    #[default]
    Normal,
    High,
    Custom(u32),
}

impl Shares {
    /// `low`, `high` or a number; anything else means `normal`.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "low" => Shares::Low,
            "high" => Shares::High,
            other => other.parse().map(Shares::Custom).unwrap_or(Shares::Normal),
        }
    }
}

impl fmt::Display for Shares {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shares::Low => f.write_str("low"),
            Shares::Normal => f.write_str("normal"),
            Shares::High => f.write_str("high"),
            Shares::Custom(n) => write!(f, "{n}"),
        }
    }
}

/// Reservation, limit and shares for one resource (CPU in MHz, memory in MB).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub min: u64,
    pub min_expandable: bool,
    /// 0 means unlimited.
    pub max: u64,
    pub shares: Shares,
}

impl Default for Allocation {
    fn default() -> Self {
        Self {
            min: 0,
            min_expandable: true,
            max: 0,
            shares: Shares::Normal,
        }
    }
}

impl Allocation {
    fn flags(&self, resource: &str, always_min: bool) -> Vec<String> {
        let mut flags = Vec::with_capacity(4);
        if self.min > 0 || always_min {
            flags.push(format!("--{resource}-min={}", self.min));
        }
        flags.push(format!("--{resource}-min-expandable={}", self.min_expandable));
        if self.max > 0 {
            flags.push(format!("--{resource}-max={}", self.max));
        }
        flags.push(format!("--{resource}-shares={}", self.shares));
        flags
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PoolSpec {
    /// Full `/`-delimited path, without a leading `/`.
    pub name: String,
    pub cpu: Allocation,
    pub mem: Allocation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolInfo {
    pub id: String,
    pub name: String,
    pub cpu: Allocation,
    pub mem: Allocation,
}

pub(crate) fn validate_name(name: &str) -> Result<(), VmxError> {
    if name.is_empty() || is_root_pool_name(name) {
        return Err(VmxError::validation("resource pool name", "the root pool cannot be managed"));
    }
    if name.starts_with('/') {
        return Err(VmxError::validation("resource pool name", "cannot start with /"));
    }
    Ok(())
}

/// Create the pool under its parent, or adopt an existing pool with that path.
pub async fn create_pool<T: Transport>(host: &Host<T>, spec: &PoolSpec) -> Result<String, VmxError> {
    validate_name(&spec.name)?;

    if let Some(id) = identity::pool_id_by_name(host, &spec.name).await? {
        tracing::info!(name = %spec.name, id = %id, "resource pool already exists");
        return Ok(id);
    }

    let (parent, leaf) = spec.name.rsplit_once('/').unwrap_or(("Resources", spec.name.as_str()));
    let parent_id = identity::pool_id_by_name(host, parent)
        .await?
        .ok_or_else(|| VmxError::PoolNotFound {
            name: parent.to_string(),
        })?;

    let mut flags = spec.cpu.flags("cpu", true);
    flags.extend(spec.mem.flags("mem", true));
    host.run_ok(
        &format!("vim-cmd hostsvc/rsrc/create {} {parent_id} {leaf}", flags.join(" ")),
        "create resource pool",
    )
    .await?;

    let id = identity::pool_id_by_name(host, &spec.name)
        .await?
        .ok_or_else(|| VmxError::PoolNotFound {
            name: spec.name.clone(),
        })?;
    tracing::info!(name = %spec.name, id = %id, "created resource pool");
    Ok(id)
}

/// Current allocation of a pool, `None` once it has been deleted.
pub async fn read_pool<T: Transport>(host: &Host<T>, id: &str) -> Result<Option<PoolInfo>, VmxError> {
    let output = host
        .run(
            &format!("vim-cmd hostsvc/rsrc/pool_config_get {id}"),
            "resource pool_config_get",
        )
        .await?;
    if output.output.contains("deleted") {
        tracing::debug!(id, "resource pool already deleted");
        return Ok(None);
    }
    let text = output.into_result("resource pool_config_get")?;
    let (cpu, mem) = parse_pool_config(&text);

    let name = identity::pool_name_by_id(host, id)
        .await?
        .ok_or_else(|| VmxError::PoolNotFound {
            name: id.to_string(),
        })?;
    Ok(Some(PoolInfo {
        id: id.to_string(),
        name,
        cpu,
        mem,
    }))
}

/// Rename if the path changed, then apply the allocation.
pub async fn update_pool<T: Transport>(host: &Host<T>, id: &str, spec: &PoolSpec) -> Result<(), VmxError> {
    let wanted = spec.name.trim_start_matches('/');
    validate_name(wanted)?;

    let current = identity::pool_name_by_id(host, id).await?;
    if current.as_deref() != Some(wanted) {
        let leaf = wanted.rsplit('/').next().unwrap_or(wanted);
        tracing::info!(id, from = ?current, to = wanted, "renaming resource pool");
        host.run_ok(
            &format!("vim-cmd hostsvc/rsrc/rename {id} {leaf}"),
            "rename resource pool",
        )
        .await?;
    }

    let mut flags = spec.cpu.flags("cpu", false);
    flags.extend(spec.mem.flags("mem", false));
    host.run_ok(
        &format!("vim-cmd hostsvc/rsrc/pool_config_set {} {id}", flags.join(" ")),
        "update resource pool",
    )
    .await?;
    Ok(())
}

pub async fn delete_pool<T: Transport>(host: &Host<T>, id: &str) -> Result<(), VmxError> {
    host.run_ok(
        &format!("vim-cmd hostsvc/rsrc/destroy {id}"),
        "destroy resource pool",
    )
    .await?;
    tracing::info!(id, "destroyed resource pool");
    Ok(())
}

/// Split `pool_config_get` output into CPU and memory allocations.
///
/// Lines before `memoryAllocation = ` belong to CPU.
pub fn parse_pool_config(text: &str) -> (Allocation, Allocation) {
    let mut cpu = Allocation::default();
    let mut mem = Allocation::default();
    let mut current = &mut cpu;

    for line in text.lines() {
        if line.contains("memoryAllocation = ") {
            current = &mut mem;
        } else if line.contains("expandableReservation = ") {
            if let Some(m) = BOOL_RE.find(line) {
                current.min_expandable = m.as_str() == "true";
            }
        } else if line.contains("reservation = ") {
            if let Some(n) = NUMBER_RE.find(line).and_then(|m| m.as_str().parse::<i64>().ok()) {
                current.min = n.max(0) as u64;
            }
        } else if line.contains("limit = ") {
            if let Some(n) = NUMBER_RE.find(line).and_then(|m| m.as_str().parse::<i64>().ok()) {
                current.max = n.max(0) as u64;
            }
        } else if line.contains("shares = ") {
            if let Some(n) = NUMBER_RE.find(line).and_then(|m| m.as_str().parse::<u32>().ok()) {
                current.shares = Shares::Custom(n);
            }
        } else if line.contains("level = ") {
            if let Some(m) = LEVEL_RE.find(line) {
                current.shares = Shares::parse(m.as_str());
            }
        }
    }
    (cpu, mem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::FakeTransport;

    const CONFIG_GET: &str = r#"(vim.ResourceConfigSpec) {
   entity = 'vim.ResourcePool:pool2',
   cpuAllocation = (vim.ResourceAllocationInfo) {
      reservation = 500,
      expandableReservation = false,
      limit = -1,
      shares = (vim.SharesInfo) {
         shares = 4000,
         level = "normal"
      },
      overheadLimit = <unset>
   },
   memoryAllocation = (vim.ResourceAllocationInfo) {
      reservation = 1024,
      expandableReservation = true,
      limit = 4096,
      shares = (vim.SharesInfo) {
         shares = 2500,
         level = "custom"
      },
      overheadLimit = <unset>
   }
}"#;

    #[test]
    fn parses_cpu_and_memory_sections() {
        let (cpu, mem) = parse_pool_config(CONFIG_GET);
        assert_eq!(
            cpu,
            Allocation {
                min: 500,
                min_expandable: false,
                max: 0,
                shares: Shares::Normal,
            }
        );
        assert_eq!(
            mem,
            Allocation {
                min: 1024,
                min_expandable: true,
                max: 4096,
                shares: Shares::Custom(2500),
            }
        );
    }

    #[test]
    fn shares_parse_falls_back_to_normal() {
        assert_eq!(Shares::parse("HIGH"), Shares::High);
        assert_eq!(Shares::parse("8000"), Shares::Custom(8000));
        assert_eq!(Shares::parse("lots"), Shares::Normal);
    }

    #[test]
    fn create_flags_always_carry_min() {
        let flags = Allocation::default().flags("cpu", true);
        assert_eq!(
            flags,
            ["--cpu-min=0", "--cpu-min-expandable=true", "--cpu-shares=normal"]
        );
        let flags = Allocation::default().flags("mem", false);
        assert_eq!(flags, ["--mem-min-expandable=true", "--mem-shares=normal"]);
    }

    #[tokio::test]
    async fn create_resolves_parent_and_issues_rsrc_create() {
        let host = Host::new(
            FakeTransport::new()
                .on_sequence(
                    "grep -A1 '<name>dev</name>'",
                    &[(0, ""), (0, "objID>pool2</objID")],
                )
                .on("grep -A1 '<name>teamA</name>'", "objID>pool1</objID")
                .on("grep -A1 '<objID>pool2</objID>'", "<path>host/user/pool1/pool2</path>")
                .on("grep -B1 '<objID>pool1</objID>'", "name>teamA</name")
                .on("grep -B1 '<objID>pool2</objID>'", "name>dev</name"),
        );
        let spec = PoolSpec {
            name: "teamA/dev".into(),
            cpu: Allocation {
                max: 2000,
                ..Allocation::default()
            },
            mem: Allocation::default(),
        };
        let id = create_pool(&host, &spec).await.unwrap();
        assert_eq!(id, "pool2");
        let creates = host.transport().issued_matching("rsrc/create");
        assert_eq!(
            creates,
            ["vim-cmd hostsvc/rsrc/create --cpu-min=0 --cpu-min-expandable=true --cpu-max=2000 \
              --cpu-shares=normal --mem-min=0 --mem-min-expandable=true --mem-shares=normal pool1 dev"]
        );
    }

    #[tokio::test]
    async fn create_top_level_pool_uses_root_parent() {
        let host = Host::new(
            FakeTransport::new().on_sequence("grep -A1 '<name>ops</name>'", &[(0, ""), (0, "objID>pool9</objID")]),
        );
        let spec = PoolSpec {
            name: "ops".into(),
            ..PoolSpec::default()
        };
        create_pool(&host, &spec).await.unwrap();
        let create = &host.transport().issued_matching("rsrc/create")[0];
        assert!(create.ends_with("ha-root-pool ops"));
    }

    #[tokio::test]
    async fn existing_pool_is_adopted() {
        let host = Host::new(FakeTransport::new().on("grep -A1 '<name>ops</name>'", "objID>pool9</objID"));
        let spec = PoolSpec {
            name: "ops".into(),
            ..PoolSpec::default()
        };
        assert_eq!(create_pool(&host, &spec).await.unwrap(), "pool9");
        assert!(host.transport().issued_matching("rsrc/create").is_empty());
    }

    #[tokio::test]
    async fn leading_slash_is_rejected_before_any_call() {
        let host = Host::new(FakeTransport::new());
        let spec = PoolSpec {
            name: "/ops".into(),
            ..PoolSpec::default()
        };
        assert!(matches!(
            create_pool(&host, &spec).await,
            Err(VmxError::Validation { .. })
        ));
        assert!(host.transport().issued().is_empty());
    }

    #[tokio::test]
    async fn deleted_pool_reads_as_none() {
        let host = Host::new(FakeTransport::new().on_status(
            "pool_config_get",
            1,
            "The object 'vim.ResourcePool:pool2' has already been deleted",
        ));
        assert_eq!(read_pool(&host, "pool2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn update_renames_when_leaf_differs() {
        let host = Host::new(
            FakeTransport::new()
                .on("grep -A1 '<objID>pool9</objID>'", "<path>host/user/pool9</path>")
                .on("grep -B1 '<objID>pool9</objID>'", "name>ops</name"),
        );
        let spec = PoolSpec {
            name: "platform".into(),
            ..PoolSpec::default()
        };
        update_pool(&host, "pool9", &spec).await.unwrap();
        let issued = host.transport().issued();
        assert!(issued.contains(&"vim-cmd hostsvc/rsrc/rename pool9 platform".to_string()));
        assert!(issued.last().unwrap().starts_with("vim-cmd hostsvc/rsrc/pool_config_set"));
        assert!(issued.last().unwrap().ends_with(" pool9"));
    }
}
