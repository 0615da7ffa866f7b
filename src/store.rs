//! Durable store of virtual BMC definitions.
//!
//! One directory per BMC under the store root:
//!
//! ```text
//! <root>/<identity>/config.toml   definition + enabled flag
//! <root>/<identity>/boot.toml     last requested boot device (see crate::boot)
//! ```
//!
//! Every mutation is written to a temporary file, fsynced, renamed into place
//! and the parent directory fsynced before the call returns.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

const CONFIG_FILE: &str = "config.toml";
const BOOT_FILE: &str = "boot.toml";

/// Username/password pair an IPMI client presents to this BMC.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// One configured virtual BMC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BmcDefinition {
    /// Unique name of this BMC within the store.
    pub identity: String,
    /// Name of the VM this BMC controls, as the hypervisor knows it.
    pub vm: String,
    pub address: IpAddr,
    pub port: u16,
    pub credentials: Credentials,
}

impl BmcDefinition {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// On-disk form of `config.toml`.
#[derive(Debug, Serialize, Deserialize)]
struct BmcRecord {
    #[serde(default)]
    enabled: bool,
    bmc: BmcDefinition,
}

/// Error type for store operations. These are configuration errors: they go
/// back to the administrative caller and never affect a running session.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a BMC named {0:?} already exists")]
    DuplicateIdentity(String),

    #[error("no BMC named {0:?}")]
    NotFound(String),

    #[error("the session for {0:?} is running; stop it first")]
    SessionActive(String),

    #[error("invalid BMC identity {0:?}")]
    InvalidIdentity(String),

    #[error("malformed BMC record {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },

    #[error("store I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Lets the store ask whether a session is still using a definition.
pub trait SessionProbe {
    fn is_session_running(&self, identity: &str) -> bool;
}

impl<F> SessionProbe for F
where
    F: Fn(&str) -> bool,
{
    fn is_session_running(&self, identity: &str) -> bool {
        self(identity)
    }
}

/// Directory-per-BMC definition store.
#[derive(Debug)]
pub struct BmcStore {
    root: PathBuf,
    /// Held exclusively for the duration of a durable write only.
    write_lock: RwLock<()>,
}

impl BmcStore {
    /// Open (creating if needed) the store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_err(&root))?;
        Ok(Self {
            root,
            write_lock: RwLock::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Per-BMC state directory.
    pub fn state_dir(&self, identity: &str) -> PathBuf {
        self.root.join(identity)
    }

    /// Path of the persisted boot device record for `identity`.
    pub fn boot_record_path(&self, identity: &str) -> PathBuf {
        self.state_dir(identity).join(BOOT_FILE)
    }

    /// Add a new definition. Disabled until started.
    pub fn add(&self, definition: &BmcDefinition) -> Result<(), StoreError> {
        validate_identity(&definition.identity)?;
        if definition.vm.trim().is_empty() {
            return Err(StoreError::Malformed {
                path: self.state_dir(&definition.identity),
                reason: "vm name must not be empty".to_string(),
            });
        }

        let _guard = self.write_lock.write().unwrap_or_else(|e| e.into_inner());
        let dir = self.state_dir(&definition.identity);

        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if dir.join(CONFIG_FILE).exists() {
                    return Err(StoreError::DuplicateIdentity(definition.identity.clone()));
                }
                // Left behind by an add or remove that never finished.
                warn!(identity = %definition.identity, "Reclaiming BMC directory without a definition");
                fs::remove_dir_all(&dir)
                    .and_then(|()| fs::create_dir(&dir))
                    .map_err(io_err(&dir))?;
            }
            Err(e) => return Err(io_err(&dir)(e)),
        }

        let record = BmcRecord {
            enabled: false,
            bmc: definition.clone(),
        };
        if let Err(e) = write_record(&dir, &record).and_then(|_| sync_dir(&self.root)) {
            warn!(identity = %definition.identity, error = %e, "Rolling back partially added BMC");
            let _ = fs::remove_dir_all(&dir);
            return Err(e);
        }

        info!(identity = %definition.identity, vm = %definition.vm, "BMC definition added");
        Ok(())
    }

    /// Remove a definition and all of its persisted state.
    pub fn remove(
        &self,
        identity: &str,
        sessions: &dyn SessionProbe,
    ) -> Result<BmcDefinition, StoreError> {
        validate_identity(identity)?;
        let _guard = self.write_lock.write().unwrap_or_else(|e| e.into_inner());

        let definition = self.read_record(identity)?.bmc;
        if sessions.is_session_running(identity) {
            return Err(StoreError::SessionActive(identity.to_string()));
        }

        let dir = self.state_dir(identity);
        fs::remove_dir_all(&dir).map_err(io_err(&dir))?;
        sync_dir(&self.root)?;

        info!(identity, "BMC definition removed");
        Ok(definition)
    }

    pub fn get(&self, identity: &str) -> Result<BmcDefinition, StoreError> {
        validate_identity(identity)?;
        let _guard = self.write_lock.read().unwrap_or_else(|e| e.into_inner());
        Ok(self.read_record(identity)?.bmc)
    }

    /// Snapshot of every definition, in no particular order.
    pub fn list(&self) -> Result<Vec<BmcDefinition>, StoreError> {
        Ok(self
            .list_with_state()?
            .into_iter()
            .map(|(definition, _)| definition)
            .collect())
    }

    /// Snapshot of every definition together with its enabled flag.
    /// Unreadable entries are logged and skipped.
    pub fn list_with_state(&self) -> Result<Vec<(BmcDefinition, bool)>, StoreError> {
        let _guard = self.write_lock.read().unwrap_or_else(|e| e.into_inner());
        let entries = fs::read_dir(&self.root).map_err(io_err(&self.root))?;

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&self.root))?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(identity) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            match self.read_record(&identity) {
                Ok(record) => out.push((record.bmc, record.enabled)),
                Err(e) => debug!(identity = %identity, error = %e, "Skipping unreadable BMC entry"),
            }
        }
        Ok(out)
    }

    pub fn is_enabled(&self, identity: &str) -> Result<bool, StoreError> {
        validate_identity(identity)?;
        let _guard = self.write_lock.read().unwrap_or_else(|e| e.into_inner());
        Ok(self.read_record(identity)?.enabled)
    }

    /// Persist whether the supervisor should run this BMC at startup.
    pub fn set_enabled(&self, identity: &str, enabled: bool) -> Result<(), StoreError> {
        validate_identity(identity)?;
        let _guard = self.write_lock.write().unwrap_or_else(|e| e.into_inner());

        let mut record = self.read_record(identity)?;
        if record.enabled == enabled {
            return Ok(());
        }
        record.enabled = enabled;
        write_record(&self.state_dir(identity), &record)
    }

    fn read_record(&self, identity: &str) -> Result<BmcRecord, StoreError> {
        let path = self.state_dir(identity).join(CONFIG_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(identity.to_string()));
            }
            Err(e) => return Err(io_err(&path)(e)),
        };
        let record: BmcRecord = toml::from_str(&text).map_err(|e| StoreError::Malformed {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        if record.bmc.identity != identity {
            return Err(StoreError::Malformed {
                path,
                reason: format!("record names {:?}", record.bmc.identity),
            });
        }
        Ok(record)
    }
}

/// Identities become directory names, so keep them to a portable charset.
pub fn validate_identity(identity: &str) -> Result<(), StoreError> {
    let valid = !identity.is_empty()
        && !identity.starts_with('.')
        && identity
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentity(identity.to_string()))
    }
}

fn write_record(dir: &Path, record: &BmcRecord) -> Result<(), StoreError> {
    let path = dir.join(CONFIG_FILE);
    let text = toml::to_string(record).map_err(|e| StoreError::Malformed {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    write_durable(&path, text.as_bytes())
}

/// Replace `path` with `contents` such that a crash leaves either the old or
/// the new file, never a torn one.
pub(crate) fn write_durable(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = path.with_extension("tmp");

    let mut file = fs::File::create(&tmp).map_err(io_err(&tmp))?;
    file.write_all(contents).map_err(io_err(&tmp))?;
    file.sync_all().map_err(io_err(&tmp))?;
    drop(file);

    fs::rename(&tmp, path).map_err(io_err(path))?;
    sync_dir(dir)
}

fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    #[cfg(unix)]
    {
        fs::File::open(dir)
            .and_then(|d| d.sync_all())
            .map_err(io_err(dir))?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}
