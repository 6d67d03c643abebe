use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::VmxError;
use crate::host::Host;
use crate::transport::Transport;

const POWER_ON_SETTLE: Duration = Duration::from_secs(3);
const SHUTDOWN_POLL: Duration = Duration::from_secs(3);
const FORCE_OFF_SETTLE: Duration = Duration::from_secs(1);

pub(crate) const GUEST_NOT_FOUND: &str = "Unable to find a VM corresponding";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Off,
    On,
    Suspended,
    /// The guest identifier did not resolve.
    Unknown,
}

impl PowerState {
    /// Classify `vim-cmd vmsvc/power.getstate` output.
    pub fn classify(output: &str) -> Self {
        if output.contains(GUEST_NOT_FOUND) {
            PowerState::Unknown
        } else if output.contains("Powered off") {
            PowerState::Off
        } else if output.contains("Powered on") {
            PowerState::On
        } else if output.contains("Suspended") {
            PowerState::Suspended
        } else {
            PowerState::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::Off => "off",
            PowerState::On => "on",
            PowerState::Suspended => "suspended",
            PowerState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Power state a guest should be left in after apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DesiredPower {
    #[default]
    On,
    Off,
}

impl FromStr for DesiredPower {
    type Err = VmxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "on" => Ok(DesiredPower::On),
            "off" => Ok(DesiredPower::Off),
            other => Err(VmxError::validation(
                "power",
                format!("'{other}' must be on or off"),
            )),
        }
    }
}

pub async fn power_state<T: Transport>(host: &Host<T>, vmid: &str) -> Result<PowerState, VmxError> {
    let output = host
        .run(
            &format!("vim-cmd vmsvc/power.getstate {vmid}"),
            "vmsvc/power.getstate",
        )
        .await?;
    let state = PowerState::classify(&output.output);
    tracing::debug!(vmid, %state, "power state");
    Ok(state)
}

/// Power on and confirm by re-reading the state after a settle delay.
///
/// The exit status of `power.on` is not consulted; only the state after the
/// wait decides success.
pub async fn power_on<T: Transport>(host: &Host<T>, vmid: &str) -> Result<(), VmxError> {
    if power_state(host, vmid).await? == PowerState::On {
        return Ok(());
    }

    tracing::info!(vmid, "powering on guest");
    let issued = host
        .run(&format!("vim-cmd vmsvc/power.on {vmid}"), "vmsvc/power.on")
        .await?;
    if !issued.success() {
        tracing::debug!(vmid, output = %issued.output, "power.on reported failure");
    }
    tokio::time::sleep(POWER_ON_SETTLE).await;

    match power_state(host, vmid).await? {
        PowerState::On => Ok(()),
        _ => Err(VmxError::PowerOnFailed {
            vmid: vmid.to_string(),
        }),
    }
}

/// Power off, gracefully first when the guest is running and
/// `shutdown_timeout` (seconds) is non-zero.
pub async fn power_off<T: Transport>(
    host: &Host<T>,
    vmid: &str,
    shutdown_timeout: u32,
) -> Result<(), VmxError> {
    match power_state(host, vmid).await? {
        PowerState::Off | PowerState::Unknown => return Ok(()),
        PowerState::On if shutdown_timeout != 0 => {
            tracing::info!(vmid, shutdown_timeout, "shutting down guest");
            let issued = host
                .run(
                    &format!("vim-cmd vmsvc/power.shutdown {vmid}"),
                    "vmsvc/power.shutdown",
                )
                .await?;
            if !issued.success() {
                tracing::debug!(vmid, output = %issued.output, "power.shutdown reported failure");
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;

            for _ in 0..shutdown_timeout / 3 {
                if power_state(host, vmid).await? == PowerState::Off {
                    return Ok(());
                }
                tokio::time::sleep(SHUTDOWN_POLL).await;
            }
            tracing::warn!(vmid, "graceful shutdown timed out, forcing power off");
            force_off(host, vmid).await?;
            tokio::time::sleep(FORCE_OFF_SETTLE).await;
        }
        PowerState::On => {
            force_off(host, vmid).await?;
            tokio::time::sleep(FORCE_OFF_SETTLE).await;
        }
        PowerState::Suspended => force_off(host, vmid).await?,
    }
    Ok(())
}

async fn force_off<T: Transport>(host: &Host<T>, vmid: &str) -> Result<(), VmxError> {
    tracing::info!(vmid, "forcing power off");
    let output = host
        .run(&format!("vim-cmd vmsvc/power.off {vmid}"), "vmsvc/power.off")
        .await?;
    if output.success() || output.output.contains(GUEST_NOT_FOUND) {
        Ok(())
    } else {
        output.into_result("vmsvc/power.off").map(|_| ())
    }
}
