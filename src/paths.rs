//! Directory layout for vmbmc.
//!
//! Provides a single `VmbmcPaths` struct that resolves the standard
//! directories and creates them on first use:
//!
//! - Config:  `~/.config/vmbmc/`            (`vmbmc.toml`)
//! - Data:    `~/.local/share/vmbmc/`       (BMC store under `bmcs/`)
//! - Logs:    `~/.local/share/vmbmc/logs/`  (`~/Library/Logs/vmbmc/` on macOS)
//!
//! XDG variables override the home-relative defaults.

use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::CONFIG_FILE;

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
const BUNDLE_ID: &str = "io.vmbmc.vmbmc";
const APP_NAME: &str = "vmbmc";

/// All resolved application directory paths.
#[derive(Debug, Clone)]
pub struct VmbmcPaths {
    /// Human-editable config: `~/.config/vmbmc/`
    pub config: PathBuf,
    /// Machine-managed application data root
    pub data: PathBuf,
    /// Default BMC definition store
    pub bmcs: PathBuf,
    /// Application logs
    pub logs: PathBuf,
}

impl VmbmcPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories; `ensure()` does.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;
        Some(Self::under(&home))
    }

    /// Resolve relative to an explicit home directory.
    pub fn under(home: &Path) -> Self {
        let data = resolve_data_dir(home);
        Self {
            config: resolve_config_dir(home),
            bmcs: data.join("bmcs"),
            logs: resolve_log_dir(home),
            data,
        }
    }

    /// Default location of `vmbmc.toml`.
    pub fn config_file(&self) -> PathBuf {
        self.config.join(CONFIG_FILE)
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.data, &self.bmcs, &self.logs] {
            if !dir.exists() {
                std::fs::create_dir_all(dir)?;
                info!("created directory: {}", dir.display());
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_data_dir(home: &Path) -> PathBuf {
    home.join("Library")
        .join("Application Support")
        .join(BUNDLE_ID)
}

#[cfg(not(target_os = "macos"))]
fn resolve_data_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".local").join("share").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    resolve_data_dir(home).join("logs")
}
