use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum VmxError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("unable to connect to {address} after {attempts} attempts")]
    #[diagnostic(help("check that sshd is enabled on the host and the address/port are reachable"))]
    Connect {
        address: String,
        attempts: u32,
        #[source]
        source: russh::Error,
    },

    #[error("authentication rejected for {user}@{address}")]
    #[diagnostic(help("the host must allow keyboard-interactive or password login for this user"))]
    Authentication { user: String, address: String },

    #[error("failed to open a remote session on {address}: {message}")]
    Session { address: String, message: String },

    #[error("ssh error during {context}")]
    Ssh {
        context: String,
        #[source]
        source: russh::Error,
    },

    #[error("{description} failed (exit status {status}): {output}")]
    CommandFailed {
        description: String,
        status: u32,
        output: String,
    },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("guest '{name}' not found")]
    GuestNotFound { name: String },

    #[error("resource pool '{name}' not found")]
    PoolNotFound { name: String },

    #[error("virtual disk {path} not found")]
    DiskNotFound { path: String },

    #[error("disk store '{store}' does not exist")]
    #[diagnostic(help("available disk stores: {available}"))]
    DiskStoreMissing { store: String, available: String },

    #[error("guest path {path} already exists")]
    #[diagnostic(help("remove the directory or pick another guest name"))]
    GuestPathExists { path: String },

    #[error("not able to shrink virtual disk {path} from {current}G to {desired}G")]
    ShrinkRejected {
        path: String,
        current: u64,
        desired: u64,
    },

    #[error("guest {vmid} did not reach the powered-on state")]
    PowerOnFailed { vmid: String },

    #[error("image import failed: {message}")]
    Import { message: String },

    #[error("guest {vmid} was registered but a later step failed")]
    Partial {
        vmid: String,
        #[source]
        source: Box<VmxError>,
    },
}

impl VmxError {
    pub(crate) fn validation(field: &str, message: impl Into<String>) -> Self {
        VmxError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }
}
