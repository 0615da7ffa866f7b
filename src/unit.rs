//! Execution units: where a [`BmcSession`] actually runs.
//!
//! ```text
//! Launcher::launch(definition)
//!     ├─► ProcessLauncher  →  `vmbmc session --identity X` child process
//!     │        stdin/stdout carry JSON-line ControlRequest/ControlReply
//!     └─► TaskLauncher     →  tokio task owning the session (actor)
//!              └─► UnitHandle { addr, control, exit, kill }
//! ```
//!
//! Either way the supervisor sees the same [`UnitHandle`]: a control channel,
//! an exit watch and a kill switch. A child process gives each VM its own
//! address space, so a crash or leak in one session cannot reach another.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::boot::BootDeviceTranslator;
use crate::control::{ControlEnvelope, ControlReply, ControlRequest, read_frame, write_frame};
use crate::session::{BmcSession, SessionError, SessionSettings};
use crate::store::{BmcDefinition, BmcStore};
use crate::vm::SharedVmControl;

/// Queued control requests per unit.
const CONTROL_QUEUE: usize = 8;

#[derive(Debug, Error)]
pub enum UnitError {
    #[error("session could not bind its listen address: {0}")]
    Bind(String),

    #[error("session failed to start: {0}")]
    Start(String),

    #[error("session did not report ready within {0:?}")]
    ReadyTimeout(Duration),

    #[error("session is not running")]
    Gone,

    #[error("session did not answer within {0:?}")]
    NoReply(Duration),
}

/// How an execution unit ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitExit {
    /// The session returned normally (after a shutdown or lost supervisor).
    pub clean: bool,
    pub detail: String,
}

impl UnitExit {
    fn clean(detail: impl Into<String>) -> Self {
        Self {
            clean: true,
            detail: detail.into(),
        }
    }

    fn failed(detail: impl Into<String>) -> Self {
        Self {
            clean: false,
            detail: detail.into(),
        }
    }

    fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            Self::clean(status.to_string())
        } else {
            Self::failed(status.to_string())
        }
    }
}

/// Supervisor-side handle to one running session.
#[derive(Debug, Clone)]
pub struct UnitHandle {
    addr: SocketAddr,
    control: mpsc::Sender<ControlEnvelope>,
    exit: watch::Receiver<Option<UnitExit>>,
    kill: Arc<Notify>,
}

impl UnitHandle {
    /// Address the session's listener is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `Some` once the unit has ended.
    pub fn exit_status(&self) -> Option<UnitExit> {
        self.exit.borrow().clone()
    }

    /// Send one control request and wait at most `limit` for the reply.
    pub async fn request(
        &self,
        request: ControlRequest,
        limit: Duration,
    ) -> Result<ControlReply, UnitError> {
        let (tx, rx) = oneshot::channel();
        let exchange = async {
            self.control
                .send((request, tx))
                .await
                .map_err(|_| UnitError::Gone)?;
            rx.await.map_err(|_| UnitError::Gone)
        };
        tokio::time::timeout(limit, exchange)
            .await
            .map_err(|_| UnitError::NoReply(limit))?
    }

    /// Wait up to `limit` for the unit to end.
    pub async fn wait_exit(&self, limit: Duration) -> Option<UnitExit> {
        let mut exit = self.exit.clone();
        let ended = tokio::time::timeout(limit, exit.wait_for(Option::is_some)).await;
        match ended {
            Ok(Ok(status)) => status.clone(),
            // The watcher is gone without publishing; treat as ended.
            Ok(Err(_)) => Some(UnitExit::failed("unit watcher vanished")),
            Err(_) => None,
        }
    }

    /// Forcibly end the unit.
    pub fn kill(&self) {
        self.kill.notify_one();
    }

    /// Ask the session to shut down, wait `grace`, then kill it.
    pub async fn stop(&self, grace: Duration) -> UnitExit {
        if let Some(exit) = self.exit_status() {
            return exit;
        }
        let deadline = tokio::time::Instant::now() + grace;
        if let Err(e) = self.request(ControlRequest::Shutdown, grace).await {
            debug!(addr = %self.addr, error = %e, "Shutdown request not acknowledged");
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if let Some(exit) = self.wait_exit(remaining).await {
            return exit;
        }

        warn!(addr = %self.addr, grace = ?grace, "Session did not exit within grace period, killing");
        self.kill();
        self.wait_exit(grace)
            .await
            .unwrap_or_else(|| UnitExit::failed("kill not confirmed"))
    }
}

/// Starts sessions in some kind of execution unit.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start a session for `definition`. Returns once the session's listener
    /// is bound (or has definitively failed to bind).
    async fn launch(&self, definition: &BmcDefinition) -> Result<UnitHandle, UnitError>;
}

// ---------------------------------------------------------------------------
// In-process actors
// ---------------------------------------------------------------------------

/// Runs each session as a single tokio task sharing this process.
pub struct TaskLauncher {
    store: Arc<BmcStore>,
    adapter: SharedVmControl,
    settings: SessionSettings,
}

impl TaskLauncher {
    pub fn new(store: Arc<BmcStore>, adapter: SharedVmControl, settings: SessionSettings) -> Self {
        Self {
            store,
            adapter,
            settings,
        }
    }
}

#[async_trait]
impl Launcher for TaskLauncher {
    async fn launch(&self, definition: &BmcDefinition) -> Result<UnitHandle, UnitError> {
        let session = open_session(
            &self.store,
            definition.clone(),
            Arc::clone(&self.adapter),
            self.settings,
        )
        .await?;
        let addr = session
            .local_addr()
            .map_err(|e| UnitError::Start(e.to_string()))?;

        let (control, control_rx) = mpsc::channel(CONTROL_QUEUE);
        let (exit_tx, exit) = watch::channel(None);
        let kill = Arc::new(Notify::new());

        let task = tokio::spawn(session.run(control_rx));
        tokio::spawn(watch_task(
            definition.identity.clone(),
            task,
            Arc::clone(&kill),
            exit_tx,
        ));

        info!(identity = %definition.identity, addr = %addr, "Session task started");
        Ok(UnitHandle {
            addr,
            control,
            exit,
            kill,
        })
    }
}

async fn watch_task(
    identity: String,
    mut task: JoinHandle<Result<(), SessionError>>,
    kill: Arc<Notify>,
    exit_tx: watch::Sender<Option<UnitExit>>,
) {
    let exit = tokio::select! {
        joined = &mut task => match joined {
            Ok(Ok(())) => UnitExit::clean("session returned"),
            Ok(Err(e)) => UnitExit::failed(e.to_string()),
            Err(e) if e.is_panic() => UnitExit::failed("session task panicked"),
            Err(e) => UnitExit::failed(e.to_string()),
        },
        _ = kill.notified() => {
            task.abort();
            let _ = task.await;
            UnitExit::failed("killed")
        }
    };
    if exit.clean {
        debug!(identity = %identity, detail = %exit.detail, "Session task ended");
    } else {
        warn!(identity = %identity, detail = %exit.detail, "Session task ended abnormally");
    }
    let _ = exit_tx.send(Some(exit));
}

async fn open_session(
    store: &BmcStore,
    definition: BmcDefinition,
    adapter: SharedVmControl,
    settings: SessionSettings,
) -> Result<BmcSession<crate::ipmi::UdpTransport>, UnitError> {
    let boot = BootDeviceTranslator::load(store.boot_record_path(&definition.identity))
        .map_err(|e| UnitError::Start(e.to_string()))?;
    BmcSession::bind(definition, adapter, boot, settings)
        .await
        .map_err(|e| match e {
            SessionError::Bind { .. } => UnitError::Bind(e.to_string()),
            other => UnitError::Start(other.to_string()),
        })
}

// ---------------------------------------------------------------------------
// Child processes
// ---------------------------------------------------------------------------

/// Runs each session in its own `vmbmc session` child process.
pub struct ProcessLauncher {
    program: PathBuf,
    config_path: Option<PathBuf>,
    ready_timeout: Duration,
}

impl ProcessLauncher {
    /// `program` is the vmbmc binary; children get `config_path` so they
    /// resolve the same store and backend as the daemon.
    pub fn new(program: PathBuf, config_path: Option<PathBuf>, ready_timeout: Duration) -> Self {
        Self {
            program,
            config_path,
            ready_timeout,
        }
    }

    /// Re-execute the running binary.
    pub fn current_exe(
        config_path: Option<PathBuf>,
        ready_timeout: Duration,
    ) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, config_path, ready_timeout))
    }

    fn command(&self, identity: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("session").arg("--identity").arg(identity);
        if let Some(path) = &self.config_path {
            cmd.arg("--config").arg(path);
        }
        // stdout is the control channel; logs go to the inherited stderr.
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        // Terminal Ctrl-C goes to the daemon only; it stops sessions itself.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, definition: &BmcDefinition) -> Result<UnitHandle, UnitError> {
        let identity = definition.identity.clone();
        let mut child = self
            .command(&identity)
            .spawn()
            .map_err(|e| UnitError::Start(format!("spawn {}: {e}", self.program.display())))?;
        let pid = child.id();

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill().await;
            return Err(UnitError::Start("child stdio not captured".to_string()));
        };
        let mut stdout = BufReader::new(stdout);

        let ready = tokio::time::timeout(
            self.ready_timeout,
            read_frame::<_, ControlReply>(&mut stdout),
        )
        .await;
        let addr = match ready {
            Ok(Ok(Some(ControlReply::Ready { addr }))) => addr,
            Ok(Ok(Some(ControlReply::BindFailed { reason }))) => {
                let _ = child.wait().await;
                return Err(UnitError::Bind(reason));
            }
            Ok(Ok(Some(other))) => {
                let _ = child.kill().await;
                return Err(UnitError::Start(format!("unexpected first reply {other:?}")));
            }
            Ok(Ok(None)) => {
                let status = child.wait().await;
                return Err(UnitError::Start(match status {
                    Ok(status) => format!("exited before ready ({status})"),
                    Err(e) => format!("exited before ready ({e})"),
                }));
            }
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(UnitError::Start(e.to_string()));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(UnitError::ReadyTimeout(self.ready_timeout));
            }
        };

        let (control, control_rx) = mpsc::channel(CONTROL_QUEUE);
        let (exit_tx, exit) = watch::channel(None);
        let kill = Arc::new(Notify::new());

        let (replies_tx, replies_rx) = mpsc::channel(CONTROL_QUEUE);
        tokio::spawn(read_replies(identity.clone(), stdout, replies_tx));
        tokio::spawn(drive_child(ChildDriver {
            identity: identity.clone(),
            child,
            stdin: Some(stdin),
            control_rx,
            replies_rx,
            kill: Arc::clone(&kill),
            exit_tx,
        }));

        info!(identity = %identity, pid = ?pid, addr = %addr, "Session process started");
        Ok(UnitHandle {
            addr,
            control,
            exit,
            kill,
        })
    }
}

async fn read_replies(
    identity: String,
    mut stdout: BufReader<tokio::process::ChildStdout>,
    replies_tx: mpsc::Sender<ControlReply>,
) {
    loop {
        match read_frame::<_, ControlReply>(&mut stdout).await {
            Ok(Some(reply)) => {
                if replies_tx.send(reply).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!(identity = %identity, error = %e, "Bad reply from session process");
                return;
            }
        }
    }
}

struct ChildDriver {
    identity: String,
    child: Child,
    stdin: Option<ChildStdin>,
    control_rx: mpsc::Receiver<ControlEnvelope>,
    replies_rx: mpsc::Receiver<ControlReply>,
    kill: Arc<Notify>,
    exit_tx: watch::Sender<Option<UnitExit>>,
}

/// Forward control requests to the child, match replies in order, and
/// publish the exit when the child ends.
async fn drive_child(mut d: ChildDriver) {
    let mut waiting: VecDeque<oneshot::Sender<ControlReply>> = VecDeque::new();
    let mut replies_open = true;

    let exit = loop {
        tokio::select! {
            status = d.child.wait() => {
                break match status {
                    Ok(status) => UnitExit::from_status(status),
                    Err(e) => UnitExit::failed(e.to_string()),
                };
            }

            _ = d.kill.notified() => {
                if let Err(e) = d.child.kill().await {
                    error!(identity = %d.identity, error = %e, "Failed to kill session process");
                }
                break UnitExit::failed("killed");
            }

            envelope = d.control_rx.recv(), if d.stdin.is_some() => match envelope {
                Some((request, reply)) => {
                    let Some(stdin) = d.stdin.as_mut() else { continue };
                    match write_frame(stdin, &request).await {
                        Ok(()) => waiting.push_back(reply),
                        Err(e) => {
                            warn!(identity = %d.identity, error = %e, "Session process stdin closed");
                            d.stdin = None;
                        }
                    }
                }
                None => {
                    // Every handle is gone; closing stdin tells the child to exit.
                    d.stdin = None;
                }
            },

            reply = d.replies_rx.recv(), if replies_open => match reply {
                Some(reply) => {
                    if let Some(waiter) = waiting.pop_front() {
                        let _ = waiter.send(reply);
                    }
                }
                None => replies_open = false,
            },
        }
    };

    if exit.clean {
        info!(identity = %d.identity, detail = %exit.detail, "Session process exited");
    } else {
        warn!(identity = %d.identity, detail = %exit.detail, "Session process exited abnormally");
    }
    let _ = d.exit_tx.send(Some(exit));
}

/// Body of the `vmbmc session` child: bind, report readiness on stdout,
/// then bridge stdin control requests to the session until it ends.
pub async fn run_child_session(
    store: &BmcStore,
    definition: BmcDefinition,
    adapter: SharedVmControl,
    settings: SessionSettings,
) -> Result<(), UnitError> {
    let mut stdout = tokio::io::stdout();
    let session = match open_session(store, definition, adapter, settings).await {
        Ok(session) => session,
        Err(e) => {
            let reason = match &e {
                UnitError::Bind(reason) => reason.clone(),
                other => other.to_string(),
            };
            let _ = write_frame(&mut stdout, &ControlReply::BindFailed { reason }).await;
            return Err(e);
        }
    };
    let addr = session
        .local_addr()
        .map_err(|e| UnitError::Start(e.to_string()))?;
    write_frame(&mut stdout, &ControlReply::Ready { addr })
        .await
        .map_err(|e| UnitError::Start(e.to_string()))?;

    let (control, control_rx) = mpsc::channel(CONTROL_QUEUE);
    tokio::spawn(bridge_stdin(control, stdout));
    session
        .run(control_rx)
        .await
        .map_err(|e| UnitError::Start(e.to_string()))
}

/// One request at a time: read from stdin, hand to the session, write the
/// reply to stdout. Dropping `control` on EOF stops the session.
async fn bridge_stdin(control: mpsc::Sender<ControlEnvelope>, mut stdout: tokio::io::Stdout) {
    let mut stdin = BufReader::new(tokio::io::stdin());
    loop {
        let request = match read_frame::<_, ControlRequest>(&mut stdin).await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Malformed control request on stdin");
                return;
            }
        };
        let (tx, rx) = oneshot::channel();
        if control.send((request, tx)).await.is_err() {
            return;
        }
        let Ok(reply) = rx.await else { return };
        if write_frame(&mut stdout, &reply).await.is_err() {
            return;
        }
    }
}
