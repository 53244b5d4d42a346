//! The supervisor's persisted configuration.
//!
//! A postcard-encoded record of the update interval and every vault this
//! supervisor has been asked to run. The file is preferred in the working
//! directory (which doubles as test mode) and falls back to the system
//! application directory; it is written atomically via a temporary file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const CONFIG_FILE_NAME: &str = "coffer-vaultd.cfg";

/// Applied when a fresh config file is written.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub update_interval_secs: u64,
    pub vaults: Vec<VaultEntry>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: DEFAULT_UPDATE_INTERVAL.as_secs(),
            vaults: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultEntry {
    pub account_name: String,
    /// Serialized [`coffer_store::Keys`].
    pub keys: Bytes,
    pub chunkstore_path: String,
    pub chunkstore_capacity: u64,
    pub requested_to_run: bool,
}

impl SupervisorConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        postcard::from_bytes(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = postcard::to_allocvec(self).context("failed to serialize config")?;
        let tmp = path.with_extension("cfg.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("failed to write config file {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to move config file into place at {}", path.display()))
    }
}

/// Resolves the config file location: a file in the working directory wins,
/// otherwise the system application directory is used (and created), whether
/// or not a config file exists there yet.
pub fn establish_config_path() -> anyhow::Result<PathBuf> {
    let local = Path::new(".").join(CONFIG_FILE_NAME);
    if local.exists() {
        debug!("using config file in working directory");
        return Ok(local);
    }
    let dir = coffer_util::coffer_app_dir()
        .context("could not determine the system application directory")?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    Ok(dir.join(CONFIG_FILE_NAME))
}
