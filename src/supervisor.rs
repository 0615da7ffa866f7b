//! Session supervisor.
//!
//! The [`Supervisor`] is the registry of running sessions. It reads
//! definitions from the [`BmcStore`], asks a [`Launcher`] for one execution
//! unit per session, and keeps a [`SessionHandle`] per unit in a table
//! behind a single mutex. The mutex is only held to read or mutate the table,
//! never across a call into a session.
//!
//! Crashed sessions are detected by [`Supervisor::check_health`] and marked,
//! never restarted: an operator has to start them again.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::control::{ControlReply, ControlRequest};
use crate::state_machine::PowerState;
use crate::store::{BmcDefinition, BmcStore, StoreError};
use crate::unit::{Launcher, UnitError, UnitHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// How long a stopping session may take before it is killed.
    pub stop_grace_period: Duration,
    /// Upper bound on a status round trip to a session.
    pub status_timeout: Duration,
    pub health_check_interval: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            stop_grace_period: Duration::from_secs(10),
            status_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("session {identity:?}: {source}")]
    Unit {
        identity: String,
        #[source]
        source: UnitError,
    },

    #[error("session {0:?} is already being started")]
    StartInProgress(String),
}

/// Last known liveness of a session's execution unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Liveness {
    Running,
    Stopped,
    Crashed { reason: String },
}

/// Runtime record for one started session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub definition: BmcDefinition,
    pub unit: UnitHandle,
    pub liveness: Liveness,
    /// Starts of this identity after the first during this daemon's life.
    pub restart_count: u32,
    pub started_at: DateTime<Utc>,
}

impl SessionHandle {
    fn is_running(&self) -> bool {
        self.liveness == Liveness::Running && self.unit.exit_status().is_none()
    }
}

/// `status(identity)` result. `power: None` means unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub identity: String,
    pub liveness: Liveness,
    pub power: Option<PowerState>,
    pub error: Option<String>,
    pub addr: Option<SocketAddr>,
    pub restart_count: u32,
    pub started_at: Option<DateTime<Utc>>,
}

impl SessionStatus {
    pub fn running(&self) -> bool {
        self.liveness == Liveness::Running
    }
}

/// Status column of `list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListStatus {
    Running,
    Down,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    pub identity: String,
    pub vm: String,
    pub address: std::net::IpAddr,
    pub port: u16,
    pub status: ListStatus,
}

/// `show(identity)` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BmcDetails {
    pub definition: BmcDefinition,
    pub enabled: bool,
    pub liveness: Liveness,
    pub addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartAllReport {
    pub started: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Default)]
struct Table {
    sessions: HashMap<String, SessionHandle>,
    starting: HashSet<String>,
}

pub struct Supervisor {
    store: Arc<BmcStore>,
    launcher: Arc<dyn Launcher>,
    table: Mutex<Table>,
    settings: SupervisorSettings,
}

impl Supervisor {
    pub fn new(
        store: Arc<BmcStore>,
        launcher: Arc<dyn Launcher>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            store,
            launcher,
            table: Mutex::new(Table::default()),
            settings,
        }
    }

    pub fn store(&self) -> &BmcStore {
        &self.store
    }

    pub fn settings(&self) -> SupervisorSettings {
        self.settings
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self, identity: &str) -> bool {
        self.table()
            .sessions
            .get(identity)
            .is_some_and(SessionHandle::is_running)
    }

    /// Running, or being launched right now.
    fn is_busy(&self, identity: &str) -> bool {
        let table = self.table();
        table.starting.contains(identity)
            || table
                .sessions
                .get(identity)
                .is_some_and(SessionHandle::is_running)
    }

    /// Handle snapshot, if a session was started for `identity`.
    pub fn handle(&self, identity: &str) -> Option<SessionHandle> {
        self.table().sessions.get(identity).cloned()
    }

    // -- definitions ---------------------------------------------------------

    pub fn add(&self, definition: &BmcDefinition) -> Result<(), SupervisorError> {
        self.store.add(definition)?;
        info!(identity = %definition.identity, vm = %definition.vm, "BMC added");
        Ok(())
    }

    /// Remove a definition. Refused while its session runs.
    pub fn delete(&self, identity: &str) -> Result<(), SupervisorError> {
        self.store.remove(identity, &|id: &str| self.is_busy(id))?;
        self.table().sessions.remove(identity);
        info!(identity = %identity, "BMC deleted");
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<ListEntry>, SupervisorError> {
        let definitions = self.store.list_with_state()?;
        let table = self.table();
        let entries = definitions
            .into_iter()
            .map(|(definition, _enabled)| {
                let status = match table.sessions.get(&definition.identity) {
                    Some(handle) if handle.is_running() => ListStatus::Running,
                    Some(handle) if matches!(handle.liveness, Liveness::Crashed { .. }) => {
                        ListStatus::Error
                    }
                    Some(handle) if handle.unit.exit_status().is_some() => ListStatus::Error,
                    _ => ListStatus::Down,
                };
                ListEntry {
                    identity: definition.identity,
                    vm: definition.vm,
                    address: definition.address,
                    port: definition.port,
                    status,
                }
            })
            .collect();
        Ok(entries)
    }

    pub fn show(&self, identity: &str) -> Result<BmcDetails, SupervisorError> {
        let definition = self.store.get(identity)?;
        let enabled = self.store.is_enabled(identity)?;
        let (liveness, addr) = match self.handle(identity) {
            Some(handle) if handle.is_running() => (Liveness::Running, Some(handle.unit.addr())),
            Some(handle) => (exited_liveness(&handle), None),
            None => (Liveness::Stopped, None),
        };
        Ok(BmcDetails {
            definition,
            enabled,
            liveness,
            addr,
        })
    }

    // -- lifecycle -----------------------------------------------------------

    /// Start every enabled definition. One failure does not stop the rest.
    pub async fn start_all(&self) -> Result<StartAllReport, SupervisorError> {
        let mut report = StartAllReport::default();
        for (definition, enabled) in self.store.list_with_state()? {
            if !enabled {
                debug!(identity = %definition.identity, "Not enabled, skipping");
                continue;
            }
            match self.launch(definition.clone()).await {
                Ok(_) => report.started.push(definition.identity),
                Err(e) => {
                    error!(identity = %definition.identity, error = %e, "Session failed to start");
                    report.failed.push((definition.identity, e.to_string()));
                }
            }
        }
        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            "Started enabled sessions"
        );
        Ok(report)
    }

    /// Start one session and mark it enabled. Starting a running session is
    /// a no-op returning its address.
    pub async fn start_one(&self, identity: &str) -> Result<SocketAddr, SupervisorError> {
        let definition = self.store.get(identity)?;
        self.store.set_enabled(identity, true)?;
        self.launch(definition).await
    }

    async fn launch(&self, definition: BmcDefinition) -> Result<SocketAddr, SupervisorError> {
        let identity = definition.identity.clone();
        {
            let mut table = self.table();
            if let Some(handle) = table.sessions.get(&identity) {
                if handle.is_running() {
                    debug!(identity = %identity, "Already running");
                    return Ok(handle.unit.addr());
                }
            }
            if !table.starting.insert(identity.clone()) {
                return Err(SupervisorError::StartInProgress(identity));
            }
        }

        let launched = self.launcher.launch(&definition).await;

        // A delete that won the race before `starting` was set leaves no
        // definition behind; the fresh unit must not outlive it.
        let removed = matches!(self.store.get(&identity), Err(StoreError::NotFound(_)));
        if removed {
            self.table().starting.remove(&identity);
            if let Ok(unit) = launched {
                unit.stop(self.settings.stop_grace_period).await;
            }
            warn!(identity = %identity, "Definition deleted during launch");
            return Err(StoreError::NotFound(identity).into());
        }

        let mut table = self.table();
        table.starting.remove(&identity);
        // A failed relaunch keeps the previous (crashed) handle in place.
        let unit = launched.map_err(|source| SupervisorError::Unit {
            identity: identity.clone(),
            source,
        })?;
        let addr = unit.addr();
        let restart_count = table
            .sessions
            .remove(&identity)
            .map_or(0, |handle| handle.restart_count + 1);
        table.sessions.insert(
            identity.clone(),
            SessionHandle {
                definition,
                unit,
                liveness: Liveness::Running,
                restart_count,
                started_at: Utc::now(),
            },
        );
        info!(identity = %identity, addr = %addr, restart_count, "Session running");
        Ok(addr)
    }

    /// Stop one session and mark it disabled. Stopping a session that is
    /// not running is a no-op. Returns whether a unit was stopped.
    pub async fn stop_one(&self, identity: &str) -> Result<bool, SupervisorError> {
        let handle = self.table().sessions.remove(identity);
        let stopped = match handle {
            Some(handle) => {
                let exit = handle.unit.stop(self.settings.stop_grace_period).await;
                info!(identity = %identity, clean = exit.clean, detail = %exit.detail, "Session stopped");
                true
            }
            None => {
                debug!(identity = %identity, "Not running");
                false
            }
        };
        match self.store.set_enabled(identity, false) {
            Ok(()) => Ok(stopped),
            // The unit is gone either way; a missing definition has no flag.
            Err(StoreError::NotFound(_)) if stopped => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Stop every session, each bounded by the grace period. Enabled flags
    /// are left alone so the next `start_all` restores the same set.
    pub async fn stop_all(&self) {
        let handles: Vec<SessionHandle> = self.table().sessions.drain().map(|(_, h)| h).collect();
        let grace = self.settings.stop_grace_period;
        let stops = handles.iter().map(|handle| async move {
            let exit = handle.unit.stop(grace).await;
            debug!(identity = %handle.definition.identity, clean = exit.clean, "Session stopped");
        });
        join_all(stops).await;
        info!(count = handles.len(), "All sessions stopped");
    }

    /// Liveness and power state. Never blocks longer than the status
    /// timeout; an unreachable session reports an unknown power state.
    pub async fn status(&self, identity: &str) -> Result<SessionStatus, SupervisorError> {
        self.store.get(identity)?;
        self.check_health();

        let Some(handle) = self.handle(identity) else {
            return Ok(SessionStatus {
                identity: identity.to_string(),
                liveness: Liveness::Stopped,
                power: None,
                error: None,
                addr: None,
                restart_count: 0,
                started_at: None,
            });
        };

        let mut status = SessionStatus {
            identity: identity.to_string(),
            liveness: handle.liveness.clone(),
            power: None,
            error: None,
            addr: None,
            restart_count: handle.restart_count,
            started_at: Some(handle.started_at),
        };
        if !handle.is_running() {
            return Ok(status);
        }

        status.addr = Some(handle.unit.addr());
        match handle
            .unit
            .request(ControlRequest::Status, self.settings.status_timeout)
            .await
        {
            Ok(ControlReply::Status { power, error }) => {
                status.power = power;
                status.error = error;
            }
            Ok(other) => status.error = Some(format!("unexpected reply {other:?}")),
            Err(e) => {
                warn!(identity = %identity, error = %e, "Status unavailable");
                status.error = Some(e.to_string());
            }
        }
        Ok(status)
    }

    /// Mark units that ended on their own as crashed. Returns the newly
    /// crashed identities. Never restarts anything.
    pub fn check_health(&self) -> Vec<String> {
        let mut crashed = Vec::new();
        let mut table = self.table();
        for (identity, handle) in table.sessions.iter_mut() {
            if handle.liveness != Liveness::Running {
                continue;
            }
            if let Some(exit) = handle.unit.exit_status() {
                error!(identity = %identity, detail = %exit.detail, "Session exited unexpectedly");
                handle.liveness = Liveness::Crashed {
                    reason: exit.detail,
                };
                crashed.push(identity.clone());
            }
        }
        crashed
    }

    /// Run [`check_health`](Self::check_health) every
    /// `health_check_interval` until the returned task is aborted.
    pub fn spawn_health_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        let period = self.settings.health_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let crashed = supervisor.check_health();
                if !crashed.is_empty() {
                    warn!(crashed = ?crashed, "Health check found crashed sessions");
                }
            }
        })
    }
}

fn exited_liveness(handle: &SessionHandle) -> Liveness {
    match (&handle.liveness, handle.unit.exit_status()) {
        (Liveness::Crashed { reason }, _) => Liveness::Crashed {
            reason: reason.clone(),
        },
        (_, Some(exit)) => Liveness::Crashed {
            reason: exit.detail,
        },
        (liveness, None) => liveness.clone(),
    }
}
