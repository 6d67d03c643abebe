use std::path::PathBuf;

/// Default configuration file, looked up in the working directory.
pub const DEFAULT_CONFIG: &str = "vmxctl.toml";

/// Local scratch directory: `~/.cache/vmxctl/`
pub fn cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("vmxctl")
}

/// Batch file the import command is written to on Windows hosts.
pub fn import_batch_path() -> PathBuf {
    cache_dir().join("ovf_cmd.bat")
}
