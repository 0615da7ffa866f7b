//! Daemon configuration, read from `vmbmc.toml`.
//!
//! Every field has a default, so a missing file or an empty one is a valid
//! configuration. Durations are written the humantime way (`"5s"`,
//! `"1m 30s"`).
//!
//! ```toml
//! [default]
//! bmc_dir = "/var/lib/vmbmc"
//! server_port = 50891
//! show_passwords = false
//!
//! [session]
//! staleness_threshold = "5s"
//! isolation = "process"
//!
//! [backend]
//! kind = "vboxmanage"
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::paths::VmbmcPaths;
use crate::session::SessionSettings;
use crate::supervisor::SupervisorSettings;
use crate::vm::{MemoryAdapter, SharedVmControl, VBoxManageAdapter, VmPowerState};

pub const CONFIG_FILE: &str = "vmbmc.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmbmcConfig {
    pub default: DefaultConfig,
    pub session: SessionConfig,
    pub backend: BackendConfig,
}

/// Store location and management server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultConfig {
    /// Root of the BMC definition store. Resolved from the data directory
    /// when unset.
    pub bmc_dir: Option<PathBuf>,
    /// Management server port on 127.0.0.1.
    pub server_port: u16,
    /// Show credentials in `show` output instead of `***`.
    pub show_passwords: bool,
    /// How long a CLI command waits for the daemon.
    #[serde(with = "humantime_serde")]
    pub server_response_timeout: Duration,
}

impl Default for DefaultConfig {
    fn default() -> Self {
        Self {
            bmc_dir: None,
            server_port: 50891,
            show_passwords: false,
            server_response_timeout: Duration::from_secs(30),
        }
    }
}

/// Where sessions run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// One child process per session.
    #[default]
    Process,
    /// One tokio task per session inside the daemon.
    Task,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// A power transition older than this is re-polled on status queries.
    #[serde(with = "humantime_serde")]
    pub staleness_threshold: Duration,
    /// Bound on each hypervisor call.
    #[serde(with = "humantime_serde")]
    pub adapter_timeout: Duration,
    /// Time a stopping session gets before it is killed.
    #[serde(with = "humantime_serde")]
    pub stop_grace_period: Duration,
    #[serde(with = "humantime_serde")]
    pub status_timeout: Duration,
    /// Time a child session gets to bind and report ready.
    #[serde(with = "humantime_serde")]
    pub ready_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    pub isolation: Isolation,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let session = SessionSettings::default();
        let supervisor = SupervisorSettings::default();
        Self {
            staleness_threshold: session.staleness,
            adapter_timeout: session.adapter_timeout,
            stop_grace_period: supervisor.stop_grace_period,
            status_timeout: supervisor.status_timeout,
            ready_timeout: Duration::from_secs(10),
            health_check_interval: supervisor.health_check_interval,
            isolation: Isolation::Process,
        }
    }
}

impl SessionConfig {
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            staleness: self.staleness_threshold,
            adapter_timeout: self.adapter_timeout,
        }
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            stop_grace_period: self.stop_grace_period,
            status_timeout: self.status_timeout,
            health_check_interval: self.health_check_interval,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// VirtualBox through the `VBoxManage` CLI.
    #[default]
    Vboxmanage,
    /// Simulated VMs held in memory; every defined VM starts powered off.
    Memory,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Explicit `VBoxManage` path; searched on PATH when unset.
    pub vboxmanage: Option<PathBuf>,
}

impl BackendConfig {
    /// Build the configured VM backend. `vms` seeds the memory backend.
    pub fn build<'a>(&self, vms: impl IntoIterator<Item = &'a str>) -> Result<SharedVmControl> {
        match self.kind {
            BackendKind::Vboxmanage => {
                let adapter = match &self.vboxmanage {
                    Some(path) => VBoxManageAdapter::new(path.clone()),
                    None => VBoxManageAdapter::discover()
                        .context("VBoxManage not found; set backend.vboxmanage")?,
                };
                info!(binary = %adapter.binary().display(), "Using VBoxManage backend");
                Ok(Arc::new(adapter))
            }
            BackendKind::Memory => {
                let adapter = MemoryAdapter::new();
                for vm in vms {
                    if adapter.vm_power(vm).is_none() {
                        adapter.add_vm(vm, VmPowerState::Off);
                    }
                }
                info!("Using in-memory backend");
                Ok(Arc::new(adapter))
            }
        }
    }
}

impl VmbmcConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()));
            }
        };
        Self::from_toml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Store root: `bmc_dir` when set, else `<data dir>/bmcs`.
    pub fn bmc_dir(&self, paths: &VmbmcPaths) -> PathBuf {
        self.default
            .bmc_dir
            .clone()
            .unwrap_or_else(|| paths.bmcs.clone())
    }
}
