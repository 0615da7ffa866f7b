//! vmbmc: virtual BMC daemon and command-line client.
//!
//! `vmbmc daemon` runs the supervisor and its management server; the other
//! subcommands talk to a running daemon over the management port. The
//! hidden `session` subcommand is what the daemon spawns for each BMC.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use vmbmc::config::{Isolation, VmbmcConfig};
use vmbmc::logging;
use vmbmc::manage::{self, ManageRequest, ManageResponse, ManagementServer};
use vmbmc::paths::VmbmcPaths;
use vmbmc::store::{BmcDefinition, BmcStore, Credentials, validate_identity};
use vmbmc::supervisor::Supervisor;
use vmbmc::unit::{self, Launcher, ProcessLauncher, TaskLauncher};

#[derive(Parser, Debug)]
#[command(name = "vmbmc", version, about = "Virtual BMCs for virtual machines")]
struct Cli {
    /// Configuration file (default: ~/.config/vmbmc/vmbmc.toml)
    #[arg(long, global = true, env = "VMBMC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the supervisor and management server in the foreground
    Daemon,

    /// Create a new BMC for a VM
    Add {
        /// Name of the VM as the hypervisor knows it
        vm: String,
        /// Name of the BMC (defaults to the VM name)
        #[arg(long)]
        identity: Option<String>,
        /// IPMI username
        #[arg(long, default_value = "admin")]
        username: String,
        /// IPMI password
        #[arg(long, default_value = "password")]
        password: String,
        /// Port to listen on
        #[arg(long, default_value_t = 6223)]
        port: u16,
        /// Address to bind to
        #[arg(long, default_value = "::")]
        address: IpAddr,
    },

    /// Delete one or more BMCs (their sessions must be stopped)
    Delete {
        #[arg(required = true)]
        identities: Vec<String>,
    },

    /// Start one or more BMCs
    Start {
        #[arg(required = true)]
        identities: Vec<String>,
    },

    /// Stop one or more BMCs
    Stop {
        #[arg(required = true)]
        identities: Vec<String>,
    },

    /// List all BMCs
    List,

    /// Show a BMC's properties
    Show { identity: String },

    /// Report a BMC's liveness and power state
    Status { identity: String },

    /// Run one BMC session (spawned by the daemon)
    #[command(hide = true)]
    Session {
        #[arg(long)]
        identity: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.command {
        Command::Daemon | Command::Session { .. } => "info",
        _ => "warn",
    };
    let _log_guard = logging::init(level);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")?;

    let result = runtime.block_on(run(cli));

    // A session child may still be parked on a blocking stdin read.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(cli: Cli) -> Result<()> {
    let paths = VmbmcPaths::resolve().context("HOME is not set")?;
    let config_path = cli.config.clone().unwrap_or_else(|| paths.config_file());
    let config = VmbmcConfig::load(&config_path)?;

    let request = match cli.command {
        Command::Daemon => return daemon(&paths, &config, &config_path).await,
        Command::Session { identity } => return session(&paths, &config, &identity).await,
        Command::Add {
            vm,
            identity,
            username,
            password,
            port,
            address,
        } => {
            let identity = identity.unwrap_or_else(|| vm.clone());
            validate_identity(&identity)?;
            ManageRequest::Add {
                definition: BmcDefinition {
                    identity,
                    vm,
                    address,
                    port,
                    credentials: Credentials { username, password },
                },
            }
        }
        Command::Delete { identities } => ManageRequest::Delete { identities },
        Command::Start { identities } => ManageRequest::Start { identities },
        Command::Stop { identities } => ManageRequest::Stop { identities },
        Command::List => ManageRequest::List,
        Command::Show { identity } => ManageRequest::Show { identity },
        Command::Status { identity } => ManageRequest::Status { identity },
    };

    let response = manage::request(
        config.default.server_port,
        &request,
        config.default.server_response_timeout,
    )
    .await?;
    match response {
        ManageResponse::Error { message } => bail!(message),
        other => {
            let text = manage::render(&other);
            if !text.is_empty() {
                print!("{text}");
                if !text.ends_with('\n') {
                    println!();
                }
            }
            Ok(())
        }
    }
}

async fn daemon(paths: &VmbmcPaths, config: &VmbmcConfig, config_path: &Path) -> Result<()> {
    paths.ensure().context("Failed to create vmbmc directories")?;
    let store = Arc::new(
        BmcStore::open(config.bmc_dir(paths)).context("Failed to open the BMC store")?,
    );
    info!(store = %store.root().display(), isolation = ?config.session.isolation, "Starting vmbmc daemon");

    let launcher: Arc<dyn Launcher> = match config.session.isolation {
        Isolation::Process => Arc::new(
            ProcessLauncher::current_exe(
                Some(config_path.to_path_buf()),
                config.session.ready_timeout,
            )
            .context("Cannot locate the vmbmc executable")?,
        ),
        Isolation::Task => {
            let definitions = store.list()?;
            let adapter = config
                .backend
                .build(definitions.iter().map(|d| d.vm.as_str()))?;
            Arc::new(TaskLauncher::new(
                Arc::clone(&store),
                adapter,
                config.session.session_settings(),
            ))
        }
    };

    let supervisor = Arc::new(Supervisor::new(
        store,
        launcher,
        config.session.supervisor_settings(),
    ));
    let server = ManagementServer::bind(
        config.default.server_port,
        Arc::clone(&supervisor),
        config.default.show_passwords,
    )
    .await
    .with_context(|| {
        format!(
            "Cannot bind the management server to port {}",
            config.default.server_port
        )
    })?;

    let report = supervisor.start_all().await?;
    for (identity, reason) in &report.failed {
        warn!(identity = %identity, reason = %reason, "BMC not started");
    }
    let monitor = supervisor.spawn_health_monitor();

    server.serve(shutdown_signal()).await;

    monitor.abort();
    supervisor.stop_all().await;
    info!("vmbmc daemon stopped");
    Ok(())
}

async fn session(paths: &VmbmcPaths, config: &VmbmcConfig, identity: &str) -> Result<()> {
    let store = BmcStore::open(config.bmc_dir(paths)).context("Failed to open the BMC store")?;
    let definition = store.get(identity)?;
    let adapter = config.backend.build([definition.vm.as_str()])?;
    unit::run_child_session(&store, definition, adapter, config.session.session_settings())
        .await
        .with_context(|| format!("Session {identity} failed"))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
