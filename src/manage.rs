//! Management surface: the daemon's JSON-lines server and its CLI client.
//!
//! The daemon listens on `127.0.0.1:<server_port>`. Each connection carries
//! newline-delimited [`ManageRequest`]s, each answered with one
//! [`ManageResponse`]. Commands that take several identities apply to each
//! one and report every failure together.

use std::fmt::Write as _;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::control::{FrameError, read_frame, write_frame};
use crate::store::BmcDefinition;
use crate::supervisor::{BmcDetails, ListEntry, Liveness, SessionStatus, Supervisor};

const MASK: &str = "***";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ManageRequest {
    Add { definition: BmcDefinition },
    Delete { identities: Vec<String> },
    Start { identities: Vec<String> },
    Stop { identities: Vec<String> },
    List,
    Show { identity: String },
    Status { identity: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ManageResponse {
    Ok,
    Error { message: String },
    List { entries: Vec<ListEntry> },
    Show { details: BmcDetails },
    Status { status: SessionStatus },
}

#[derive(Debug, Error)]
pub enum ManageError {
    #[error("cannot reach the vmbmc daemon at {addr} (is `vmbmc daemon` running?): {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("no answer from the daemon within {0:?}")]
    Timeout(Duration),

    #[error("the daemon closed the connection")]
    Closed,

    #[error(transparent)]
    Frame(#[from] FrameError),
}

pub fn server_addr(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct ManagementServer {
    listener: TcpListener,
    supervisor: Arc<Supervisor>,
    show_passwords: bool,
}

impl ManagementServer {
    pub async fn bind(
        port: u16,
        supervisor: Arc<Supervisor>,
        show_passwords: bool,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(server_addr(port)).await?;
        Ok(Self {
            listener,
            supervisor,
            show_passwords,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn serve(self, shutdown: impl Future<Output = ()>) {
        info!(addr = ?self.listener.local_addr().ok(), "Management server listening");
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Management server stopping");
                    return;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Management connection");
                        let supervisor = Arc::clone(&self.supervisor);
                        tokio::spawn(handle_connection(stream, supervisor, self.show_passwords));
                    }
                    Err(e) => {
                        error!(error = %e, "Management accept error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, supervisor: Arc<Supervisor>, show_passwords: bool) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    loop {
        let response = match read_frame::<_, ManageRequest>(&mut reader).await {
            Ok(Some(request)) => dispatch(&supervisor, request, show_passwords).await,
            Ok(None) => return,
            Err(FrameError::Json(e)) => ManageResponse::Error {
                message: format!("invalid request: {e}"),
            },
            Err(e) => {
                warn!(error = %e, "Management connection failed");
                return;
            }
        };
        if let Err(e) = write_frame(&mut write_half, &response).await {
            warn!(error = %e, "Failed to write management response");
            return;
        }
    }
}

/// Run one management command against the supervisor.
pub async fn dispatch(
    supervisor: &Supervisor,
    request: ManageRequest,
    show_passwords: bool,
) -> ManageResponse {
    debug!(request = ?request, "Management request");
    match request {
        ManageRequest::Add { definition } => match supervisor.add(&definition) {
            Ok(()) => ManageResponse::Ok,
            Err(e) => error_response(e),
        },
        ManageRequest::Delete { identities } => {
            let mut failures = Vec::new();
            for identity in identities {
                if let Err(e) = supervisor.delete(&identity) {
                    failures.push(e.to_string());
                }
            }
            collect(failures)
        }
        ManageRequest::Start { identities } => {
            let mut failures = Vec::new();
            for identity in identities {
                if let Err(e) = supervisor.start_one(&identity).await {
                    failures.push(e.to_string());
                }
            }
            collect(failures)
        }
        ManageRequest::Stop { identities } => {
            let mut failures = Vec::new();
            for identity in identities {
                if let Err(e) = supervisor.stop_one(&identity).await {
                    failures.push(e.to_string());
                }
            }
            collect(failures)
        }
        ManageRequest::List => match supervisor.list() {
            Ok(entries) => ManageResponse::List { entries },
            Err(e) => error_response(e),
        },
        ManageRequest::Show { identity } => match supervisor.show(&identity) {
            Ok(mut details) => {
                if !show_passwords {
                    details.definition.credentials.password = MASK.to_string();
                }
                ManageResponse::Show { details }
            }
            Err(e) => error_response(e),
        },
        ManageRequest::Status { identity } => match supervisor.status(&identity).await {
            Ok(status) => ManageResponse::Status { status },
            Err(e) => error_response(e),
        },
    }
}

fn error_response(e: impl std::fmt::Display) -> ManageResponse {
    ManageResponse::Error {
        message: e.to_string(),
    }
}

fn collect(failures: Vec<String>) -> ManageResponse {
    if failures.is_empty() {
        ManageResponse::Ok
    } else {
        ManageResponse::Error {
            message: failures.join("\n"),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Send one request to the daemon on `port` and wait for its answer.
pub async fn request(
    port: u16,
    request: &ManageRequest,
    limit: Duration,
) -> Result<ManageResponse, ManageError> {
    let addr = server_addr(port);
    let exchange = async {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ManageError::Connect { addr, source })?;
        let (read_half, mut write_half) = stream.into_split();
        write_frame(&mut write_half, request).await?;
        let mut reader = BufReader::new(read_half);
        read_frame::<_, ManageResponse>(&mut reader)
            .await?
            .ok_or(ManageError::Closed)
    };
    tokio::time::timeout(limit, exchange)
        .await
        .map_err(|_| ManageError::Timeout(limit))?
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Human-readable form of a successful response.
pub fn render(response: &ManageResponse) -> String {
    match response {
        ManageResponse::Ok => String::new(),
        ManageResponse::Error { message } => message.clone(),
        ManageResponse::List { entries } => render_list(entries),
        ManageResponse::Show { details } => render_show(details),
        ManageResponse::Status { status } => render_status(status),
    }
}

fn render_list(entries: &[ListEntry]) -> String {
    let mut rows: Vec<[String; 5]> = vec![[
        "BMC".to_string(),
        "VM".to_string(),
        "Status".to_string(),
        "Address".to_string(),
        "Port".to_string(),
    ]];
    let mut sorted: Vec<&ListEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.identity.cmp(&b.identity));
    for entry in sorted {
        let status = serde_json::to_value(entry.status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default();
        rows.push([
            entry.identity.clone(),
            entry.vm.clone(),
            status,
            entry.address.to_string(),
            entry.port.to_string(),
        ]);
    }
    table(&rows)
}

fn render_show(details: &BmcDetails) -> String {
    let def = &details.definition;
    let liveness = match &details.liveness {
        Liveness::Running => "running".to_string(),
        Liveness::Stopped => "down".to_string(),
        Liveness::Crashed { reason } => format!("error ({reason})"),
    };
    let rows = vec![
        ["Property".to_string(), "Value".to_string()],
        ["identity".to_string(), def.identity.clone()],
        ["vm".to_string(), def.vm.clone()],
        ["address".to_string(), def.address.to_string()],
        ["port".to_string(), def.port.to_string()],
        ["username".to_string(), def.credentials.username.clone()],
        ["password".to_string(), def.credentials.password.clone()],
        ["active".to_string(), details.enabled.to_string()],
        ["status".to_string(), liveness],
    ];
    table(&rows)
}

fn render_status(status: &SessionStatus) -> String {
    let power = status
        .power
        .map(|p| p.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let mut out = format!(
        "{}: {} (power {})",
        status.identity,
        if status.running() { "running" } else { "not running" },
        power
    );
    if let Some(error) = &status.error {
        let _ = write!(out, "\n  error: {error}");
    }
    if let Liveness::Crashed { reason } = &status.liveness {
        let _ = write!(out, "\n  crashed: {reason}");
    }
    out
}

fn table<const N: usize>(rows: &[[String; N]]) -> String {
    let mut widths = [0usize; N];
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }
    let mut out = String::new();
    for (i, row) in rows.iter().enumerate() {
        let line: Vec<String> = row
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect();
        let _ = writeln!(out, "{}", line.join("  ").trim_end());
        if i == 0 {
            let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
            let _ = writeln!(out, "{}", rule.join("  "));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionSettings;
    use crate::store::{BmcStore, Credentials};
    use crate::supervisor::{ListStatus, SupervisorSettings};
    use crate::unit::TaskLauncher;
    use crate::vm::{MemoryAdapter, VmPowerState};

    fn definition(identity: &str) -> BmcDefinition {
        BmcDefinition {
            identity: identity.to_string(),
            vm: "vm1".to_string(),
            address: "127.0.0.1".parse().unwrap(),
            port: 0,
            credentials: Credentials {
                username: "admin".to_string(),
                password: "secret".to_string(),
            },
        }
    }

    fn supervisor(dir: &std::path::Path) -> Arc<Supervisor> {
        let store = Arc::new(BmcStore::open(dir).unwrap());
        let adapter = MemoryAdapter::new();
        adapter.add_vm("vm1", VmPowerState::Off);
        let launcher = TaskLauncher::new(
            Arc::clone(&store),
            Arc::new(adapter),
            SessionSettings::default(),
        );
        Arc::new(Supervisor::new(
            store,
            Arc::new(launcher),
            SupervisorSettings::default(),
        ))
    }

    #[test]
    fn request_wire_format() {
        let json = serde_json::to_string(&ManageRequest::Stop {
            identities: vec!["a".to_string()],
        })
        .unwrap();
        assert_eq!(json, r#"{"cmd":"stop","identities":["a"]}"#);
    }

    #[tokio::test]
    async fn show_masks_password_unless_asked() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        sup.add(&definition("a")).unwrap();

        let show = ManageRequest::Show {
            identity: "a".to_string(),
        };
        let ManageResponse::Show { details } = dispatch(&sup, show.clone(), false).await else {
            panic!("expected show");
        };
        assert_eq!(details.definition.credentials.password, "***");

        let ManageResponse::Show { details } = dispatch(&sup, show, true).await else {
            panic!("expected show");
        };
        assert_eq!(details.definition.credentials.password, "secret");
    }

    #[tokio::test]
    async fn multi_identity_failures_are_collected() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        sup.add(&definition("a")).unwrap();

        let response = dispatch(
            &sup,
            ManageRequest::Delete {
                identities: vec!["a".to_string(), "ghost".to_string()],
            },
            false,
        )
        .await;
        let ManageResponse::Error { message } = response else {
            panic!("expected error");
        };
        assert!(message.contains("ghost"));
        assert!(sup.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn client_and_server_talk() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        let server = ManagementServer::bind(0, Arc::clone(&sup), false)
            .await
            .unwrap();
        let port = server.local_addr().unwrap().port();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let serving = tokio::spawn(server.serve(async {
            let _ = stop_rx.await;
        }));

        let limit = Duration::from_secs(5);
        let added = request(
            port,
            &ManageRequest::Add {
                definition: definition("a"),
            },
            limit,
        )
        .await
        .unwrap();
        assert_eq!(added, ManageResponse::Ok);

        let started = request(
            port,
            &ManageRequest::Start {
                identities: vec!["a".to_string()],
            },
            limit,
        )
        .await
        .unwrap();
        assert_eq!(started, ManageResponse::Ok);

        let ManageResponse::List { entries } = request(port, &ManageRequest::List, limit)
            .await
            .unwrap()
        else {
            panic!("expected list");
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, ListStatus::Running);

        sup.stop_all().await;
        let _ = stop_tx.send(());
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn client_reports_missing_daemon() {
        // Bind and drop to find a port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = request(port, &ManageRequest::List, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ManageError::Connect { .. }));
    }

    #[test]
    fn list_renders_as_table() {
        let entries = vec![ListEntry {
            identity: "bmc-a".to_string(),
            vm: "vm1".to_string(),
            address: "::".parse().unwrap(),
            port: 6223,
            status: ListStatus::Down,
        }];
        let text = render(&ManageResponse::List { entries });
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("BMC"));
        assert!(lines[2].contains("bmc-a"));
        assert!(lines[2].contains("down"));
        assert!(lines[2].contains("6223"));
    }
}
