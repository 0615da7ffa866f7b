//! Boot device selection for one BMC.
//!
//! IPMI clients select the next boot device with "Set System Boot Options"
//! (parameter 5, boot flags). The device lives in bits 5:2 of the second
//! flags byte:
//!
//! ```text
//! 0x00  no override      → BootDevice::BiosDefault
//! 0x04  force PXE        → BootDevice::Network
//! 0x08  force hard disk  → BootDevice::Disk
//! 0x14  force CD/DVD     → BootDevice::Cdrom
//! ```
//!
//! The choice is persisted next to the BMC definition and only pushed to the
//! VM right before the next power-on.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::store::{StoreError, write_durable};
use crate::vm::{AdapterError, BootDevice, VmControl};

/// Mask selecting the device bits of boot flags byte 2.
pub const BOOT_DEVICE_MASK: u8 = 0x3c;

/// Length of the boot flags parameter data.
pub const BOOT_FLAGS_LEN: usize = 5;

/// Bit 7 of flags byte 1: the flags are valid.
const FLAGS_VALID: u8 = 0x80;

/// Boot flags answered when nothing was ever requested.
const DEFAULT_FLAGS: [u8; BOOT_FLAGS_LEN] = [0x00; BOOT_FLAGS_LEN];

#[derive(Debug, Error)]
pub enum BootError {
    #[error("unsupported boot device code {0:#04x}")]
    UnsupportedDevice(u8),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// IPMI device code for `device`.
pub fn device_code(device: BootDevice) -> u8 {
    match device {
        BootDevice::BiosDefault => 0x00,
        BootDevice::Network => 0x04,
        BootDevice::Disk => 0x08,
        BootDevice::Cdrom => 0x14,
    }
}

/// Device for an IPMI device code (already masked with [`BOOT_DEVICE_MASK`]).
pub fn device_from_code(code: u8) -> Result<BootDevice, BootError> {
    match code {
        0x00 => Ok(BootDevice::BiosDefault),
        0x04 => Ok(BootDevice::Network),
        0x08 => Ok(BootDevice::Disk),
        0x14 => Ok(BootDevice::Cdrom),
        other => Err(BootError::UnsupportedDevice(other)),
    }
}

/// Last requested boot device plus the raw flags it was requested with, so
/// "Get System Boot Options" can echo them back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootDeviceRecord {
    pub device: BootDevice,
    pub flags: [u8; BOOT_FLAGS_LEN],
}

impl Default for BootDeviceRecord {
    fn default() -> Self {
        Self {
            device: BootDevice::BiosDefault,
            flags: DEFAULT_FLAGS,
        }
    }
}

impl BootDeviceRecord {
    /// Record for a device chosen without raw flags (management API, tests).
    pub fn for_device(device: BootDevice) -> Self {
        let flags = match device {
            BootDevice::BiosDefault => DEFAULT_FLAGS,
            other => [FLAGS_VALID, device_code(other), 0x00, 0x00, 0x00],
        };
        Self { device, flags }
    }
}

/// Owns and persists one BMC's boot device choice.
#[derive(Debug)]
pub struct BootDeviceTranslator {
    path: PathBuf,
    record: Option<BootDeviceRecord>,
}

impl BootDeviceTranslator {
    /// Load the persisted record at `path`; a missing file means nothing was
    /// ever set.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, BootError> {
        let path = path.into();
        let record = match fs::read_to_string(&path) {
            Ok(text) => Some(toml::from_str(&text).map_err(|e| StoreError::Malformed {
                path: path.clone(),
                reason: e.to_string(),
            })?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(StoreError::Io {
                    path: path.clone(),
                    source: e,
                }
                .into());
            }
        };
        debug!(path = %path.display(), record = ?record, "Loaded boot device record");
        Ok(Self { path, record })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a new choice. Does not contact the VM.
    pub fn set_boot_device(&mut self, device: BootDevice) -> Result<(), BootError> {
        self.persist(BootDeviceRecord::for_device(device))
    }

    /// Persist a choice received as raw IPMI boot flags. Flags without the
    /// valid bit request no override, whatever device they name.
    pub fn set_from_flags(&mut self, flags: [u8; BOOT_FLAGS_LEN]) -> Result<BootDevice, BootError> {
        let device = if flags[0] & FLAGS_VALID == 0 {
            BootDevice::BiosDefault
        } else {
            device_from_code(flags[1] & BOOT_DEVICE_MASK)?
        };
        self.persist(BootDeviceRecord { device, flags })?;
        Ok(device)
    }

    /// Last persisted device, BIOS default if none was ever set.
    pub fn boot_device(&self) -> BootDevice {
        self.record().device
    }

    pub fn record(&self) -> BootDeviceRecord {
        self.record.clone().unwrap_or_default()
    }

    /// Snapshot of the device to push on the next power-on.
    pub fn pending(&self) -> PendingBoot {
        PendingBoot {
            device: self.boot_device(),
        }
    }

    /// Push the persisted device to the VM.
    pub async fn apply_pending(&self, adapter: &dyn VmControl, vm: &str) -> Result<(), AdapterError> {
        self.pending().apply(adapter, vm).await
    }

    fn persist(&mut self, record: BootDeviceRecord) -> Result<(), BootError> {
        if self.record.as_ref() == Some(&record) {
            return Ok(());
        }
        let text = toml::to_string(&record).map_err(|e| StoreError::Malformed {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        write_durable(&self.path, text.as_bytes())?;
        info!(path = %self.path.display(), device = %record.device, "Boot device persisted");
        self.record = Some(record);
        Ok(())
    }
}

/// A boot device waiting to be applied; detached from the translator so an
/// in-flight power transition can own it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingBoot {
    pub device: BootDevice,
}

impl PendingBoot {
    pub async fn apply(self, adapter: &dyn VmControl, vm: &str) -> Result<(), AdapterError> {
        if self.device == BootDevice::BiosDefault {
            // No override: leave the VM's own boot order alone.
            return Ok(());
        }
        adapter.set_boot_device(vm, self.device).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::memory::Op;
    use crate::vm::{MemoryAdapter, VmPowerState};

    #[test]
    fn codes_map_both_ways() {
        for device in [
            BootDevice::Network,
            BootDevice::Disk,
            BootDevice::Cdrom,
            BootDevice::BiosDefault,
        ] {
            assert_eq!(device_from_code(device_code(device)).unwrap(), device);
        }
    }

    #[test]
    fn bios_setup_code_is_unsupported() {
        assert!(matches!(
            device_from_code(0x18),
            Err(BootError::UnsupportedDevice(0x18))
        ));
    }

    #[test]
    fn defaults_to_bios_when_never_set() {
        let tmp = tempfile::tempdir().unwrap();
        let boot = BootDeviceTranslator::load(tmp.path().join("boot.toml")).unwrap();
        assert_eq!(boot.boot_device(), BootDevice::BiosDefault);
        assert_eq!(boot.record().flags, [0; BOOT_FLAGS_LEN]);
    }

    #[test]
    fn choice_survives_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("boot.toml");

        let mut boot = BootDeviceTranslator::load(&path).unwrap();
        boot.set_boot_device(BootDevice::Cdrom).unwrap();
        drop(boot);

        let boot = BootDeviceTranslator::load(&path).unwrap();
        assert_eq!(boot.boot_device(), BootDevice::Cdrom);
    }

    #[test]
    fn raw_flags_are_kept_verbatim() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("boot.toml");
        let flags = [0xc0, 0x04, 0x00, 0x00, 0x00];

        let mut boot = BootDeviceTranslator::load(&path).unwrap();
        assert_eq!(boot.set_from_flags(flags).unwrap(), BootDevice::Network);

        let boot = BootDeviceTranslator::load(&path).unwrap();
        assert_eq!(boot.record().flags, flags);
    }

    #[tokio::test]
    async fn flags_without_valid_bit_mean_no_override() {
        let tmp = tempfile::tempdir().unwrap();
        let adapter = MemoryAdapter::new();
        adapter.add_vm("vm1", VmPowerState::Off);
        let flags = [0x00, 0x14, 0x00, 0x00, 0x00];

        let mut boot = BootDeviceTranslator::load(tmp.path().join("boot.toml")).unwrap();
        boot.set_boot_device(BootDevice::Network).unwrap();
        assert_eq!(boot.set_from_flags(flags).unwrap(), BootDevice::BiosDefault);
        assert_eq!(boot.record().flags, flags);

        boot.apply_pending(&adapter, "vm1").await.unwrap();
        assert_eq!(adapter.calls(Op::SetBootDevice), 0);
    }

    #[test]
    fn unsupported_flags_do_not_persist() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("boot.toml");

        let mut boot = BootDeviceTranslator::load(&path).unwrap();
        assert!(boot.set_from_flags([0x80, 0x18, 0, 0, 0]).is_err());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn apply_pending_pushes_device() {
        let tmp = tempfile::tempdir().unwrap();
        let adapter = MemoryAdapter::new();
        adapter.add_vm("vm1", VmPowerState::Off);

        let mut boot = BootDeviceTranslator::load(tmp.path().join("boot.toml")).unwrap();
        boot.set_boot_device(BootDevice::Network).unwrap();
        boot.apply_pending(&adapter, "vm1").await.unwrap();

        assert_eq!(adapter.vm_boot("vm1"), Some(BootDevice::Network));
    }

    #[tokio::test]
    async fn bios_default_pushes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let adapter = MemoryAdapter::new();
        adapter.add_vm("vm1", VmPowerState::Off);

        let boot = BootDeviceTranslator::load(tmp.path().join("boot.toml")).unwrap();
        boot.apply_pending(&adapter, "vm1").await.unwrap();

        assert_eq!(adapter.calls(Op::SetBootDevice), 0);
    }
}
