//! Periodic update checking.
//!
//! Downloading is an opaque concern behind [`Downloader`]: given a file name
//! and a target directory, it fetches and verifies, reporting whether a
//! newer file landed. The supervisor's job is only to know which local
//! version is current, ask for something newer, and on POSIX repoint the
//! convenience symlink in the system application directory.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, warn};

/// Name of the network bootstrap contact file shared by all vaults.
pub const BOOTSTRAP_GLOBAL: &str = "bootstrap-global.dat";

pub const APP_NAME: &str = "coffer";
pub const VAULT_NAME: &str = "coffer-vault";
pub const VAULT_MANAGER_NAME: &str = "coffer-vaultd";

pub const MIN_UPDATE_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const MAX_UPDATE_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// The applications whose versioned binaries the update check tracks.
pub const APPLICATIONS: [&str; 3] = [APP_NAME, VAULT_NAME, VAULT_MANAGER_NAME];

/// Fetches updated files into a directory.
pub trait Downloader: Send + Sync + 'static {
    /// Checks whether a file newer than `file_name` is available, and if so
    /// downloads and verifies it into `dir`. Returns the name of the newly
    /// downloaded file, or `None` when the local copy is already current.
    fn update_and_verify(&self, file_name: &str, dir: &Path) -> anyhow::Result<Option<String>>;
}

/// A downloader that never finds anything newer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDownloader;

impl Downloader for NullDownloader {
    fn update_and_verify(&self, _file_name: &str, _dir: &Path) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

/// A version parsed from a `M.mm.pp` file name component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}.{:02}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let major = parts.next().ok_or(())?.parse().map_err(|_| ())?;
        let minor = parts.next().ok_or(())?.parse().map_err(|_| ())?;
        let patch = parts.next().ok_or(())?.parse().map_err(|_| ())?;
        if parts.next().is_some() {
            return Err(());
        }
        Ok(Self {
            major,
            minor,
            patch,
        })
    }
}

/// The platform component of versioned file names for this build.
pub fn current_platform() -> &'static str {
    if cfg!(target_os = "windows") {
        "win"
    } else if cfg!(target_os = "macos") {
        "osx"
    } else {
        "linux"
    }
}

/// `<app>_<platform>_<M.mm.pp>`.
pub fn version_file_name(application: &str, platform: &str, version: Version) -> String {
    format!("{application}_{platform}_{version}")
}

/// The inverse of [`version_file_name`]. The application name must not
/// contain underscores; the fields are split from the right.
pub fn parse_version_file_name(name: &str) -> Option<(&str, &str, Version)> {
    let mut parts = name.rsplitn(3, '_');
    let version = Version::from_str(parts.next()?).ok()?;
    let platform = parts.next()?;
    let application = parts.next()?;
    if application.is_empty() || platform.is_empty() {
        return None;
    }
    Some((application, platform, version))
}

/// Finds the newest locally present versioned file of `application` for the
/// running platform. Falls back to the zero version's name when none exist,
/// which asks the downloader for any version at all.
pub fn find_latest_local_version(dir: &Path, application: &str) -> String {
    let mut latest: Option<(Version, String)> = None;
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("could not scan {} for versions: {err}", dir.display());
            return version_file_name(application, current_platform(), Version::default());
        }
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        // The version component contains dots, so strip the executable
        // suffix explicitly rather than going through file_stem.
        let stem = file_name
            .strip_suffix(std::env::consts::EXE_SUFFIX)
            .unwrap_or(file_name);
        let Some((app, platform, version)) = parse_version_file_name(stem) else {
            continue;
        };
        if app == application
            && platform == current_platform()
            && latest.as_ref().map_or(true, |(best, _)| version > *best)
        {
            latest = Some((version, stem.to_owned()));
        }
    }
    match latest {
        Some((version, name)) => {
            debug!(%version, "latest local {application} build is {name}");
            name
        }
        None => {
            debug!("no local {application} build found");
            version_file_name(application, current_platform(), Version::default())
        }
    }
}

/// Repoints the convenience symlink for `application` in the system
/// application directory at a freshly downloaded file.
#[cfg(unix)]
pub fn refresh_symlink(application: &str, target: &Path) {
    let Some(dir) = coffer_util::coffer_app_dir() else {
        return;
    };
    let link = dir.join(application);
    if let Err(err) = std::fs::remove_file(&link) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove symlink {}: {err}", link.display());
        }
    }
    match std::os::unix::fs::symlink(target, &link) {
        Ok(()) => debug!(
            "symlink {} now points at {}",
            link.display(),
            target.display()
        ),
        Err(err) => warn!("failed to create symlink {}: {err}", link.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering_and_display() {
        let old = Version {
            major: 0,
            minor: 9,
            patch: 11,
        };
        let new = Version {
            major: 1,
            minor: 0,
            patch: 0,
        };
        assert!(new > old);
        assert_eq!(old.to_string(), "0.09.11");
        assert_eq!("0.09.11".parse::<Version>().unwrap(), old);
        assert!("1.0".parse::<Version>().is_err());
        assert!("1.0.0.0".parse::<Version>().is_err());
        assert!("one.two.three".parse::<Version>().is_err());
    }

    #[test]
    fn file_name_roundtrip() {
        let version = Version {
            major: 2,
            minor: 3,
            patch: 4,
        };
        let name = version_file_name("coffer-vault", "linux", version);
        assert_eq!(name, "coffer-vault_linux_2.03.04");
        assert_eq!(
            parse_version_file_name(&name),
            Some(("coffer-vault", "linux", version))
        );
        assert_eq!(parse_version_file_name("not-versioned"), None);
        assert_eq!(parse_version_file_name("_linux_1.00.00"), None);
    }

    #[test]
    fn latest_local_version_prefers_the_highest() {
        let dir = tempfile::tempdir().unwrap();
        let platform = current_platform();
        for version in ["0.01.00", "0.02.07", "0.02.06"] {
            std::fs::write(
                dir.path().join(format!("coffer-vault_{platform}_{version}")),
                b"",
            )
            .unwrap();
        }
        // Other apps and platforms do not count.
        std::fs::write(dir.path().join(format!("coffer_{platform}_9.00.00")), b"").unwrap();
        std::fs::write(dir.path().join("coffer-vault_other_9.00.00"), b"").unwrap();

        assert_eq!(
            find_latest_local_version(dir.path(), "coffer-vault"),
            format!("coffer-vault_{platform}_0.02.07")
        );
        assert_eq!(
            find_latest_local_version(dir.path(), "coffer-vaultd"),
            format!("coffer-vaultd_{platform}_0.00.00")
        );
    }
}
