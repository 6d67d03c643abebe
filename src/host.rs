use std::path::Path;

use tracing::Instrument;

use crate::error::VmxError;
use crate::transport::{CommandOutput, RemoteEndpoint, Transport};

/// A hypervisor host: the transport every component talks through plus the
/// span their log events are recorded under.
pub struct Host<T> {
    transport: T,
    span: tracing::Span,
}

impl<T: Transport> Host<T> {
    pub fn new(transport: T) -> Self {
        let span = tracing::info_span!("host", address = %transport.endpoint().address());
        Self { transport, span }
    }

    pub fn with_span(transport: T, span: tracing::Span) -> Self {
        Self { transport, span }
    }

    pub fn endpoint(&self) -> &RemoteEndpoint {
        self.transport.endpoint()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Run a command, returning the output even when it exited non-zero.
    pub async fn run(&self, command: &str, description: &str) -> Result<CommandOutput, VmxError> {
        self.transport
            .execute(command, description)
            .instrument(self.span.clone())
            .await
    }

    /// Run a command that is expected to succeed.
    pub async fn run_ok(&self, command: &str, description: &str) -> Result<String, VmxError> {
        self.run(command, description).await?.into_result(description)
    }

    pub async fn copy_file(&self, local_path: &Path, remote_path: &str) -> Result<(), VmxError> {
        self.transport
            .copy_file(local_path, remote_path)
            .instrument(self.span.clone())
            .await
    }
}
