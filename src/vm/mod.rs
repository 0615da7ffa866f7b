//! VM control boundary for vmbmc.
//!
//! Every emulated BMC drives exactly one virtual machine through the
//! [`VmControl`] trait. The trait is the only thing the power and boot logic
//! knows about the hypervisor; the concrete backends live in the submodules:
//!
//! - [`vboxmanage`] shells out to the `VBoxManage` CLI (VirtualBox).
//! - [`memory`] keeps simulated VMs in process memory (dry runs, tests).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;
pub mod vboxmanage;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// Power state as reported by the hypervisor. The hypervisor only knows two
/// values; intermediate states are tracked by the power state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmPowerState {
    On,
    Off,
}

impl fmt::Display for VmPowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmPowerState::On => write!(f, "on"),
            VmPowerState::Off => write!(f, "off"),
        }
    }
}

/// Boot device selection understood by both IPMI and the VM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootDevice {
    /// Boot from network (PXE)
    Network,
    /// Boot from local disk
    Disk,
    /// Boot from CD/DVD
    Cdrom,
    /// No override; the VM keeps its own boot order
    #[default]
    BiosDefault,
}

impl fmt::Display for BootDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootDevice::Network => write!(f, "network"),
            BootDevice::Disk => write!(f, "disk"),
            BootDevice::Cdrom => write!(f, "cdrom"),
            BootDevice::BiosDefault => write!(f, "bios-default"),
        }
    }
}

/// Error type for hypervisor calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    /// The hypervisor has no VM with this name
    #[error("vm not found: {0}")]
    VmNotFound(String),

    /// The hypervisor could not be reached (binary missing, service down)
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The backend cannot perform this operation
    #[error("operation unsupported: {0}")]
    Unsupported(String),

    /// The call did not finish within the adapter timeout
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The backend ran the operation and reported a failure
    #[error("operation failed: {0}")]
    Failed(String),
}

/// Lifecycle verbs for one named VM.
///
/// Implementations must be safe to call from several sessions at once; each
/// session only ever passes its own `vm` name.
#[async_trait]
pub trait VmControl: Send + Sync {
    /// Power the VM on.
    async fn start(&self, vm: &str) -> Result<(), AdapterError>;

    /// Ask the guest to shut down (ACPI power button).
    async fn graceful_stop(&self, vm: &str) -> Result<(), AdapterError>;

    /// Cut power immediately.
    async fn hard_stop(&self, vm: &str) -> Result<(), AdapterError>;

    /// Hard reset a running VM.
    async fn hard_reset(&self, vm: &str) -> Result<(), AdapterError>;

    /// Inject a non-maskable interrupt.
    async fn send_nmi(&self, vm: &str) -> Result<(), AdapterError>;

    async fn power_state(&self, vm: &str) -> Result<VmPowerState, AdapterError>;

    async fn set_boot_device(&self, vm: &str, device: BootDevice) -> Result<(), AdapterError>;

    async fn boot_device(&self, vm: &str) -> Result<BootDevice, AdapterError>;
}

/// Shared handle to whichever backend the daemon was configured with.
pub type SharedVmControl = Arc<dyn VmControl>;

/// Run one adapter call with an upper bound on its duration.
///
/// A hung hypervisor call would otherwise wedge the session that issued it.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, AdapterError>
where
    F: std::future::Future<Output = Result<T, AdapterError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::Timeout(limit)),
    }
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use memory::MemoryAdapter;
pub use vboxmanage::VBoxManageAdapter;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_error_display() {
        let err = AdapterError::VmNotFound("vm1".to_string());
        assert_eq!(err.to_string(), "vm not found: vm1");

        let err = AdapterError::Timeout(Duration::from_secs(3));
        assert_eq!(err.to_string(), "operation timed out after 3s");
    }

    #[tokio::test]
    async fn bounded_reports_timeout() {
        let result: Result<(), AdapterError> = bounded(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert_eq!(result, Err(AdapterError::Timeout(Duration::from_millis(10))));
    }

    #[test]
    fn boot_device_defaults_to_bios() {
        assert_eq!(BootDevice::default(), BootDevice::BiosDefault);
    }
}
