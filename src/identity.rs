//! Name ↔ identifier resolution for guests and resource pools.
//!
//! Everything here is a string search over host listings and the pool
//! registry. An empty search result is `Ok(None)`; only a failing command is
//! an error.

use crate::error::VmxError;
use crate::host::Host;
use crate::transport::Transport;

/// Identifier of the root resource pool.
pub const ROOT_POOL_ID: &str = "ha-root-pool";

pub(crate) const POOLS_XML: &str = "/etc/vmware/hostd/pools.xml";

/// `/` and `Resources` both name the root pool.
pub fn is_root_pool_name(name: &str) -> bool {
    matches!(name, "/" | "Resources")
}

/// Most recently listed guest whose name matches.
pub async fn guest_id_by_name<T: Transport>(
    host: &Host<T>,
    name: &str,
) -> Result<Option<String>, VmxError> {
    let command = format!(
        "vim-cmd vmsvc/getallvms 2>/dev/null | sort -n | grep \"[0-9] * {name} .*{name}\" | awk '{{print $1}}' | tail -1"
    );
    let vmid = host.run(&command, "get vmid").await?.found("get vmid")?;
    tracing::debug!(name, ?vmid, "resolved guest name");
    Ok(vmid)
}

/// Confirm an externally supplied identifier is a registered guest.
pub async fn validate_guest_id<T: Transport>(
    host: &Host<T>,
    vmid: &str,
) -> Result<Option<String>, VmxError> {
    let command =
        format!("vim-cmd vmsvc/getallvms 2>/dev/null | awk '{{print $1}}' | grep '^{vmid}$'");
    host.run(&command, "validate vmid exists")
        .await?
        .found("validate vmid exists")
}

/// Resolve a `/`-delimited pool path to its identifier.
///
/// The registry is searched by leaf name. When a hierarchical path is given
/// the match is confirmed by rebuilding its full name, so `teamA/dev` does
/// not resolve to `teamB/dev`.
pub async fn pool_id_by_name<T: Transport>(
    host: &Host<T>,
    name: &str,
) -> Result<Option<String>, VmxError> {
    if is_root_pool_name(name) {
        return Ok(Some(ROOT_POOL_ID.to_string()));
    }

    let wanted = name.trim_matches('/');
    let leaf = wanted.rsplit('/').next().unwrap_or(wanted);
    let command =
        format!("grep -A1 '<name>{leaf}</name>' {POOLS_XML} | grep -o objID.*objID | tail -1");
    let Some(raw) = host
        .run(&command, "get existing resource pool id")
        .await?
        .found("get existing resource pool id")?
    else {
        return Ok(None);
    };
    let id = raw.replace("objID>", "").replace("</objID", "");

    if wanted.contains('/') {
        match pool_name_by_id(host, &id).await? {
            Some(full) if full == wanted => {}
            other => {
                tracing::debug!(wanted, found = ?other, "pool leaf matched on another branch");
                return Ok(None);
            }
        }
    }
    Ok(Some(id))
}

/// Rebuild a pool's full name by walking the ancestor chain in the registry.
pub async fn pool_name_by_id<T: Transport>(
    host: &Host<T>,
    id: &str,
) -> Result<Option<String>, VmxError> {
    if id == ROOT_POOL_ID {
        return Ok(Some("/".to_string()));
    }

    let command = format!("grep -A1 '<objID>{id}</objID>' {POOLS_XML} | grep '<path>'");
    let Some(path) = host
        .run(&command, "get resource pool path")
        .await?
        .found("get resource pool path")?
    else {
        return Ok(None);
    };

    // A missing ancestor means the registry changed under us; never return
    // a shortened path.
    let mut names = Vec::new();
    for segment in ancestor_ids(&path) {
        let command =
            format!("grep -B1 '<objID>{segment}</objID>' {POOLS_XML} | grep -o name.*name");
        let Some(raw) = host
            .run(&command, "get resource pool name")
            .await?
            .found("get resource pool name")?
        else {
            tracing::debug!(id, ancestor = segment, "resource pool ancestor not in registry");
            return Ok(None);
        };
        names.push(raw.replace("name>", "").replace("</name", ""));
    }
    Ok(Some(names.join("/")))
}

/// Identifier of the pool a guest is registered under.
pub async fn pool_of_guest<T: Transport>(
    host: &Host<T>,
    vmid: &str,
) -> Result<Option<String>, VmxError> {
    let command = format!(
        "grep -A2 'objID>{vmid}</objID' {POOLS_XML} | grep -o resourcePool.*resourcePool"
    );
    let found = host
        .run(&command, "check if guest is in resource pool")
        .await?
        .found("check if guest is in resource pool")?;
    Ok(found.map(|raw| raw.replace("resourcePool>", "").replace("</resourcePool", "")))
}

/// Pool identifiers in a registry `<path>` line, root first.
fn ancestor_ids(path_line: &str) -> impl Iterator<Item = &str> {
    path_line
        .split(['/', '<', '>', '\n'])
        .filter(|s| !s.is_empty() && !matches!(*s, "path" | "host" | "user"))
}
