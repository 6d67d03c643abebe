//! Remote command execution over an interactive SSH shell.
//!
//! Every call opens a fresh connection: there is no pooling and no state is
//! kept between operations. Only the connection step is retried; a command
//! that ran and failed is reported as-is, because re-running a host command
//! is not generally safe.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::{ChannelMsg, Disconnect, keys};

use crate::error::VmxError;

/// Connection attempts before giving up.
pub const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Address and credentials of the hypervisor host.
#[derive(Clone)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    secret: String,
}

impl RemoteEndpoint {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            secret: secret.into(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Trimmed combined stdout/stderr of one remote command plus its exit status.
///
/// A non-zero status is not an error by itself: some callers run commands
/// that are expected to fail and read the diagnostic text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub output: String,
    pub status: u32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Turn a non-zero exit into [`VmxError::CommandFailed`], keeping the output.
    pub fn into_result(self, description: &str) -> Result<String, VmxError> {
        if self.success() {
            Ok(self.output)
        } else {
            Err(VmxError::CommandFailed {
                description: description.to_string(),
                status: self.status,
                output: self.output,
            })
        }
    }

    /// Interpret a search pipeline ending in `grep`/`tail`.
    ///
    /// Empty output is "not found"; so is grep's exit status 1 with no
    /// output. Anything else non-zero is a failure.
    pub fn found(self, description: &str) -> Result<Option<String>, VmxError> {
        match self.status {
            0 if self.output.is_empty() => Ok(None),
            0 => Ok(Some(self.output)),
            1 if self.output.is_empty() => Ok(None),
            _ => self.into_result(description).map(Some),
        }
    }
}

/// The remote-shell seam every component talks through.
#[allow(async_fn_in_trait)] // trait is internal-only
pub trait Transport {
    fn endpoint(&self) -> &RemoteEndpoint;

    /// Run exactly one command to completion.
    ///
    /// `Err` means the transport itself failed; a command that ran and
    /// exited non-zero comes back as `Ok` with a non-zero status.
    async fn execute(&self, command: &str, description: &str) -> Result<CommandOutput, VmxError>;

    /// Stream a local file to `remote_path` on the host.
    async fn copy_file(&self, local_path: &Path, remote_path: &str) -> Result<(), VmxError>;
}

/// Accepts any host key, like `StrictHostKeyChecking=no`.
struct AcceptAnyHostKey;

impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// [`Transport`] over russh, authenticating with the endpoint secret.
pub struct SshTransport {
    endpoint: RemoteEndpoint,
    config: Arc<client::Config>,
}

impl SshTransport {
    pub fn new(endpoint: RemoteEndpoint) -> Self {
        Self {
            endpoint,
            config: Arc::new(client::Config::default()),
        }
    }

    async fn connect(&self) -> Result<client::Handle<AcceptAnyHostKey>, VmxError> {
        let address = self.endpoint.address();
        let mut attempt = 0;
        let mut handle = loop {
            attempt += 1;
            match client::connect(
                self.config.clone(),
                (self.endpoint.host.as_str(), self.endpoint.port),
                AcceptAnyHostKey,
            )
            .await
            {
                Ok(handle) => break handle,
                Err(source) if attempt >= CONNECT_ATTEMPTS => {
                    return Err(VmxError::Connect {
                        address,
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    tracing::debug!(address = %address, attempt, "connection failed, retrying: {e}");
                    tokio::time::sleep(CONNECT_RETRY_PAUSE).await;
                }
            }
        };

        if !self.authenticate(&mut handle).await? {
            return Err(VmxError::Authentication {
                user: self.endpoint.username.clone(),
                address,
            });
        }
        Ok(handle)
    }

    /// Keyboard-interactive first (answering every prompt with the secret),
    /// then plain password.
    async fn authenticate(
        &self,
        handle: &mut client::Handle<AcceptAnyHostKey>,
    ) -> Result<bool, VmxError> {
        let user = self.endpoint.username.as_str();
        let secret = self.endpoint.secret();
        let ssh_err = |source| VmxError::Ssh {
            context: "authentication".into(),
            source,
        };

        let mut response = handle
            .authenticate_keyboard_interactive_start(user, None::<String>)
            .await
            .map_err(ssh_err)?;
        loop {
            match response {
                client::KeyboardInteractiveAuthResponse::Success => return Ok(true),
                client::KeyboardInteractiveAuthResponse::Failure { .. } => break,
                client::KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                    let answers = prompts.iter().map(|_| secret.to_string()).collect();
                    response = handle
                        .authenticate_keyboard_interactive_respond(answers)
                        .await
                        .map_err(ssh_err)?;
                }
            }
        }

        let result = handle
            .authenticate_password(user, secret)
            .await
            .map_err(ssh_err)?;
        Ok(result.success())
    }

    async fn open_channel(
        &self,
        handle: &client::Handle<AcceptAnyHostKey>,
    ) -> Result<russh::Channel<client::Msg>, VmxError> {
        handle
            .channel_open_session()
            .await
            .map_err(|e| VmxError::Session {
                address: self.endpoint.address(),
                message: e.to_string(),
            })
    }
}

impl Transport for SshTransport {
    fn endpoint(&self) -> &RemoteEndpoint {
        &self.endpoint
    }

    async fn execute(&self, command: &str, description: &str) -> Result<CommandOutput, VmxError> {
        tracing::debug!(description, "running remote command");
        let handle = self.connect().await?;
        let mut channel = self.open_channel(&handle).await?;

        channel.exec(true, command).await.map_err(|source| VmxError::Ssh {
            context: description.to_string(),
            source,
        })?;

        let mut combined = Vec::new();
        let mut status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => combined.extend_from_slice(data),
                // ext 1 is stderr
                ChannelMsg::ExtendedData { ref data, ext: 1 } => combined.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
                _ => {}
            }
        }
        handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .ok();

        let output = String::from_utf8_lossy(&combined).trim().to_string();
        tracing::debug!(command, output = %output, status, "remote command finished");

        let status = status.ok_or_else(|| VmxError::Session {
            address: self.endpoint.address(),
            message: format!("'{description}' ended without an exit status"),
        })?;
        Ok(CommandOutput { output, status })
    }

    async fn copy_file(&self, local_path: &Path, remote_path: &str) -> Result<(), VmxError> {
        tracing::debug!(local = %local_path.display(), remote_path, "copying file to host");
        let file = tokio::fs::File::open(local_path)
            .await
            .map_err(|e| VmxError::Io {
                context: format!("opening {}", local_path.display()),
                source: e,
            })?;

        let handle = self.connect().await?;
        let mut channel = self.open_channel(&handle).await?;
        let ssh_err = |source| VmxError::Ssh {
            context: format!("copying to {remote_path}"),
            source,
        };

        channel
            .exec(true, format!("cat > {}", shell_quote(remote_path)))
            .await
            .map_err(ssh_err)?;
        channel.data(file).await.map_err(ssh_err)?;
        channel.eof().await.map_err(ssh_err)?;

        let mut status = None;
        while let Some(msg) = channel.wait().await {
            if let ChannelMsg::ExitStatus { exit_status } = msg {
                status = Some(exit_status);
            }
        }
        handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .ok();

        match status {
            Some(0) => Ok(()),
            Some(status) => Err(VmxError::CommandFailed {
                description: format!("copy to {remote_path}"),
                status,
                output: String::new(),
            }),
            None => Err(VmxError::Session {
                address: self.endpoint.address(),
                message: format!("copy to {remote_path} ended without an exit status"),
            }),
        }
    }
}

/// Wrap in double quotes for the host shell, escaping what double quotes don't protect.
pub fn shell_quote(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('"');
    for c in s.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_result_keeps_output_on_failure() {
        let out = CommandOutput {
            output: "No such file".into(),
            status: 1,
        };
        match out.into_result("list disk") {
            Err(VmxError::CommandFailed {
                description,
                status,
                output,
            }) => {
                assert_eq!(description, "list disk");
                assert_eq!(status, 1);
                assert_eq!(output, "No such file");
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[test]
    fn into_result_passes_success_through() {
        let out = CommandOutput {
            output: "42".into(),
            status: 0,
        };
        assert_eq!(out.into_result("get vmid").unwrap(), "42");
    }

    #[test]
    fn found_treats_empty_grep_as_absent() {
        let miss = CommandOutput {
            output: String::new(),
            status: 1,
        };
        assert_eq!(miss.found("lookup").unwrap(), None);

        let hit = CommandOutput {
            output: "12".into(),
            status: 0,
        };
        assert_eq!(hit.found("lookup").unwrap(), Some("12".into()));

        let broken = CommandOutput {
            output: "grep: /etc/vmware/hostd/pools.xml: No such file".into(),
            status: 2,
        };
        assert!(broken.found("lookup").is_err());
    }

    #[test]
    fn endpoint_debug_redacts_secret() {
        let ep = RemoteEndpoint::new("esxi", 22, "root", "hunter2");
        let dbg = format!("{ep:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("<redacted>"));
        assert_eq!(ep.address(), "esxi:22");
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connection_gives_up_after_all_attempts() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let transport = SshTransport::new(RemoteEndpoint::new("127.0.0.1", port, "root", "x"));

        let started = tokio::time::Instant::now();
        let err = transport.execute("true", "noop").await.unwrap_err();
        match err {
            VmxError::Connect { address, attempts, .. } => {
                assert_eq!(address, format!("127.0.0.1:{port}"));
                assert_eq!(attempts, CONNECT_ATTEMPTS);
            }
            other => panic!("expected Connect, got {other:?}"),
        }
        // one pause between each pair of attempts
        assert!(started.elapsed() >= CONNECT_RETRY_PAUSE * (CONNECT_ATTEMPTS - 1));
    }

    #[test]
    fn shell_quote_escapes_specials() {
        assert_eq!(shell_quote("/vmfs/volumes/ds1/a b"), "\"/vmfs/volumes/ds1/a b\"");
        assert_eq!(shell_quote("a\"b$c"), "\"a\\\"b\\$c\"");
    }
}
