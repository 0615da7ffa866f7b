//! VirtualBox backend driving the `VBoxManage` CLI.
//!
//! ## Architecture
//!
//! ```text
//! VmControl::start(vm)
//!     └─► tokio::process::Command  →  VBoxManage startvm <vm> --type headless
//!             └─► exit status + stderr  →  Ok(()) | AdapterError
//! ```
//!
//! Each call is a short-lived child process; nothing is cached between calls
//! so the reported state is always the hypervisor's own.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{AdapterError, BootDevice, VmControl, VmPowerState};

/// Stderr fragment VBoxManage prints for an unknown VM name or UUID.
const NOT_FOUND_MARKER: &str = "Could not find a registered machine";

/// VirtualBox adapter.
#[derive(Debug, Clone)]
pub struct VBoxManageAdapter {
    binary: PathBuf,
}

impl VBoxManageAdapter {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }

    /// Locate `VBoxManage` on `PATH` or in the usual install locations.
    pub fn discover() -> Result<Self, AdapterError> {
        find_vboxmanage().map(Self::new)
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Run `VBoxManage <args>` and return its stdout on success.
    async fn run(&self, args: &[&str]) -> Result<String, AdapterError> {
        debug!(binary = %self.binary.display(), args = ?args, "Running VBoxManage");

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                AdapterError::Unreachable(format!("{}: {}", self.binary.display(), e))
            })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(
            args = ?args,
            exit_status = ?output.status,
            stderr = %stderr.trim(),
            "VBoxManage failed"
        );
        Err(classify_failure(args.get(1).copied().unwrap_or_default(), &stderr))
    }

    async fn machine_info(&self, vm: &str) -> Result<String, AdapterError> {
        self.run(&["showvminfo", vm, "--machinereadable"]).await
    }
}

#[async_trait]
impl VmControl for VBoxManageAdapter {
    async fn start(&self, vm: &str) -> Result<(), AdapterError> {
        self.run(&["startvm", vm, "--type", "headless"]).await?;
        Ok(())
    }

    async fn graceful_stop(&self, vm: &str) -> Result<(), AdapterError> {
        self.run(&["controlvm", vm, "acpipowerbutton"]).await?;
        Ok(())
    }

    async fn hard_stop(&self, vm: &str) -> Result<(), AdapterError> {
        self.run(&["controlvm", vm, "poweroff"]).await?;
        Ok(())
    }

    async fn hard_reset(&self, vm: &str) -> Result<(), AdapterError> {
        self.run(&["controlvm", vm, "reset"]).await?;
        Ok(())
    }

    async fn send_nmi(&self, vm: &str) -> Result<(), AdapterError> {
        self.run(&["debugvm", vm, "injectnmi"]).await?;
        Ok(())
    }

    async fn power_state(&self, vm: &str) -> Result<VmPowerState, AdapterError> {
        let info = self.machine_info(vm).await?;
        Ok(parse_power_state(&info))
    }

    async fn set_boot_device(&self, vm: &str, device: BootDevice) -> Result<(), AdapterError> {
        let Some(arg) = boot_arg(device) else {
            return Err(AdapterError::Unsupported(format!(
                "boot device {device} has no VirtualBox equivalent"
            )));
        };
        self.run(&["modifyvm", vm, "--boot1", arg]).await?;
        Ok(())
    }

    async fn boot_device(&self, vm: &str) -> Result<BootDevice, AdapterError> {
        let info = self.machine_info(vm).await?;
        Ok(parse_boot_device(&info))
    }
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

/// Look up `key="value"` in `--machinereadable` output.
fn machine_readable_value<'a>(info: &'a str, key: &str) -> Option<&'a str> {
    info.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        (k.trim_matches('"') == key).then(|| v.trim().trim_matches('"'))
    })
}

fn parse_power_state(info: &str) -> VmPowerState {
    match machine_readable_value(info, "VMState") {
        Some("running") => VmPowerState::On,
        _ => VmPowerState::Off,
    }
}

fn parse_boot_device(info: &str) -> BootDevice {
    match machine_readable_value(info, "boot1") {
        Some("net") => BootDevice::Network,
        Some("disk") => BootDevice::Disk,
        Some("dvd") => BootDevice::Cdrom,
        _ => BootDevice::BiosDefault,
    }
}

fn boot_arg(device: BootDevice) -> Option<&'static str> {
    match device {
        BootDevice::Network => Some("net"),
        BootDevice::Disk => Some("disk"),
        BootDevice::Cdrom => Some("dvd"),
        BootDevice::BiosDefault => None,
    }
}

fn classify_failure(vm: &str, stderr: &str) -> AdapterError {
    if stderr.contains(NOT_FOUND_MARKER) {
        AdapterError::VmNotFound(vm.to_string())
    } else if stderr.contains("not supported") || stderr.contains("E_NOTIMPL") {
        AdapterError::Unsupported(stderr.trim().to_string())
    } else {
        AdapterError::Failed(stderr.trim().to_string())
    }
}

/// Resolve the path to the `VBoxManage` binary.
fn find_vboxmanage() -> Result<PathBuf, AdapterError> {
    if let Ok(path_var) = std::env::var("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join("VBoxManage");
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    let candidates: &[&str] = &[
        "/usr/bin/VBoxManage",
        "/usr/local/bin/VBoxManage",
        "/Applications/VirtualBox.app/Contents/MacOS/VBoxManage",
    ];

    for &path in candidates {
        if PathBuf::from(path).exists() {
            return Ok(PathBuf::from(path));
        }
    }

    Err(AdapterError::Unreachable(
        "VBoxManage binary not found; install VirtualBox or set backend.vboxmanage".to_string(),
    ))
}
