//! In-memory VM backend.
//!
//! Simulates a set of named VMs entirely inside the process. Used for dry
//! runs (`backend.kind = "memory"`) and as the hypervisor in tests, where the
//! per-operation call counters, injected failures and artificial latency make
//! the power state machine's behaviour observable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{AdapterError, BootDevice, VmControl, VmPowerState};

/// Adapter operations, used as keys for call counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Start,
    GracefulStop,
    HardStop,
    HardReset,
    SendNmi,
    PowerState,
    SetBootDevice,
    BootDevice,
}

#[derive(Debug, Clone)]
struct SimulatedVm {
    power: VmPowerState,
    boot: BootDevice,
}

#[derive(Debug, Default)]
struct Inner {
    vms: HashMap<String, SimulatedVm>,
    calls: HashMap<Op, usize>,
    failures: HashMap<Op, AdapterError>,
    unreachable: bool,
    latency: Duration,
}

/// Cloneable handle; clones share the same simulated VMs.
#[derive(Debug, Clone, Default)]
pub struct MemoryAdapter {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a VM with the given initial power state.
    pub fn add_vm(&self, vm: &str, power: VmPowerState) {
        let mut inner = self.lock();
        inner.vms.insert(
            vm.to_string(),
            SimulatedVm {
                power,
                boot: BootDevice::BiosDefault,
            },
        );
    }

    /// Current simulated power state, bypassing call counting.
    pub fn vm_power(&self, vm: &str) -> Option<VmPowerState> {
        self.lock().vms.get(vm).map(|v| v.power)
    }

    /// Current simulated boot device, bypassing call counting.
    pub fn vm_boot(&self, vm: &str) -> Option<BootDevice> {
        self.lock().vms.get(vm).map(|v| v.boot)
    }

    /// Change a VM's power state behind the BMC's back.
    pub fn set_vm_power(&self, vm: &str, power: VmPowerState) {
        if let Some(v) = self.lock().vms.get_mut(vm) {
            v.power = power;
        }
    }

    /// Make every call for `op` fail with `error` until cleared.
    pub fn fail(&self, op: Op, error: AdapterError) {
        self.lock().failures.insert(op, error);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Simulate the whole backend going away.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Delay every call by `latency` before it takes effect.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Number of times `op` has been invoked.
    pub fn calls(&self, op: Op) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Total number of calls that change VM state (everything but queries).
    pub fn mutating_calls(&self) -> usize {
        [
            Op::Start,
            Op::GracefulStop,
            Op::HardStop,
            Op::HardReset,
            Op::SendNmi,
            Op::SetBootDevice,
        ]
        .iter()
        .map(|op| self.calls(*op))
        .sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means a test panicked mid-call; the map is
        // still consistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count the call, wait out the latency, then apply `f` to the VM.
    async fn call<T>(
        &self,
        op: Op,
        vm: &str,
        f: impl FnOnce(&mut SimulatedVm) -> Result<T, AdapterError>,
    ) -> Result<T, AdapterError> {
        let latency = {
            let mut inner = self.lock();
            *inner.calls.entry(op).or_insert(0) += 1;
            inner.latency
        };
        debug!(vm, op = ?op, "Simulated adapter call");

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.lock();
        if inner.unreachable {
            return Err(AdapterError::Unreachable("simulated backend is down".to_string()));
        }
        if let Some(err) = inner.failures.get(&op) {
            return Err(err.clone());
        }
        let machine = inner
            .vms
            .get_mut(vm)
            .ok_or_else(|| AdapterError::VmNotFound(vm.to_string()))?;
        f(machine)
    }
}

#[async_trait]
impl VmControl for MemoryAdapter {
    async fn start(&self, vm: &str) -> Result<(), AdapterError> {
        self.call(Op::Start, vm, |m| {
            m.power = VmPowerState::On;
            Ok(())
        })
        .await
    }

    async fn graceful_stop(&self, vm: &str) -> Result<(), AdapterError> {
        self.call(Op::GracefulStop, vm, |m| {
            m.power = VmPowerState::Off;
            Ok(())
        })
        .await
    }

    async fn hard_stop(&self, vm: &str) -> Result<(), AdapterError> {
        self.call(Op::HardStop, vm, |m| {
            m.power = VmPowerState::Off;
            Ok(())
        })
        .await
    }

    async fn hard_reset(&self, vm: &str) -> Result<(), AdapterError> {
        self.call(Op::HardReset, vm, |m| match m.power {
            VmPowerState::On => Ok(()),
            VmPowerState::Off => Err(AdapterError::Failed("vm is not running".to_string())),
        })
        .await
    }

    async fn send_nmi(&self, vm: &str) -> Result<(), AdapterError> {
        self.call(Op::SendNmi, vm, |m| match m.power {
            VmPowerState::On => Ok(()),
            VmPowerState::Off => Err(AdapterError::Failed("vm is not running".to_string())),
        })
        .await
    }

    async fn power_state(&self, vm: &str) -> Result<VmPowerState, AdapterError> {
        self.call(Op::PowerState, vm, |m| Ok(m.power)).await
    }

    async fn set_boot_device(&self, vm: &str, device: BootDevice) -> Result<(), AdapterError> {
        self.call(Op::SetBootDevice, vm, |m| {
            m.boot = device;
            Ok(())
        })
        .await
    }

    async fn boot_device(&self, vm: &str) -> Result<BootDevice, AdapterError> {
        self.call(Op::BootDevice, vm, |m| Ok(m.boot)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_and_stop_change_power() {
        let adapter = MemoryAdapter::new();
        adapter.add_vm("vm1", VmPowerState::Off);

        adapter.start("vm1").await.unwrap();
        assert_eq!(adapter.vm_power("vm1"), Some(VmPowerState::On));

        adapter.graceful_stop("vm1").await.unwrap();
        assert_eq!(adapter.vm_power("vm1"), Some(VmPowerState::Off));
        assert_eq!(adapter.calls(Op::Start), 1);
        assert_eq!(adapter.calls(Op::GracefulStop), 1);
    }

    #[tokio::test]
    async fn unknown_vm_is_not_found() {
        let adapter = MemoryAdapter::new();
        let err = adapter.power_state("ghost").await.unwrap_err();
        assert_eq!(err, AdapterError::VmNotFound("ghost".to_string()));
    }

    #[tokio::test]
    async fn injected_failure_leaves_vm_untouched() {
        let adapter = MemoryAdapter::new();
        adapter.add_vm("vm1", VmPowerState::Off);
        adapter.fail(Op::Start, AdapterError::Failed("boom".to_string()));

        assert!(adapter.start("vm1").await.is_err());
        assert_eq!(adapter.vm_power("vm1"), Some(VmPowerState::Off));
        assert_eq!(adapter.calls(Op::Start), 1);
    }

    #[tokio::test]
    async fn unreachable_backend_fails_every_call() {
        let adapter = MemoryAdapter::new();
        adapter.add_vm("vm1", VmPowerState::On);
        adapter.set_unreachable(true);

        let err = adapter.power_state("vm1").await.unwrap_err();
        assert!(matches!(err, AdapterError::Unreachable(_)));
    }
}
