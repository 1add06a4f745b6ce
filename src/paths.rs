// src/paths.rs

//! Install-root layout and home discovery
//!
//! ```text
//! /volumeX/docker/syrviscore/            # install root (SYRVIS_HOME)
//! ├── current -> versions/0.1.0          # active pointer
//! ├── versions/
//! │   ├── 0.0.1/bin/syrvis
//! │   └── 0.1.0/bin/syrvis
//! ├── bin/syrvis                         # wrapper script
//! ├── backups/0.0.1.tar.gz               # pre-upgrade snapshot
//! ├── config/
//! ├── data/
//! ├── .syrviscore-manifest.json
//! └── .syrviscore.lock
//! ```

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Manifest file name inside the install root
pub const MANIFEST_FILE: &str = ".syrviscore-manifest.json";

/// Lock file serializing mutating operations
pub const LOCK_FILE: &str = ".syrviscore.lock";

/// Name of the active pointer symlink
pub const CURRENT_LINK: &str = "current";

/// Directory holding one subdirectory per installed version
pub const VERSIONS_DIR: &str = "versions";

/// Entry point every version directory must provide, relative to it
pub const ENTRY_POINT: &str = "bin/syrvis";

/// Directory holding pre-upgrade snapshots
pub const BACKUPS_DIR: &str = "backups";

/// Prefix of install staging directories under `versions/`
pub const STAGING_PREFIX: &str = ".staging-";

/// Environment variable naming the install root
pub const HOME_ENV: &str = "SYRVIS_HOME";

const PACKAGE_NAME: &str = "syrviscore";

/// Paths of an install root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn versions_dir(&self) -> PathBuf {
        self.root.join(VERSIONS_DIR)
    }

    pub fn version_dir(&self, version: &str) -> PathBuf {
        self.versions_dir().join(version)
    }

    /// Relative target stored in the `current` symlink
    pub fn pointer_target(version: &str) -> PathBuf {
        Path::new(VERSIONS_DIR).join(version)
    }

    pub fn current_link(&self) -> PathBuf {
        self.root.join(CURRENT_LINK)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn wrapper_path(&self) -> PathBuf {
        self.bin_dir().join("syrvis")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join(BACKUPS_DIR)
    }

    /// `backups/<version>.tar.gz`
    pub fn backup_path(&self, version: &str) -> PathBuf {
        self.backups_dir().join(format!("{}.tar.gz", version))
    }

    pub fn entry_point(&self, version: &str) -> PathBuf {
        self.version_dir(version).join(ENTRY_POINT)
    }

    /// Create the shared directories of a fresh installation
    pub fn ensure_structure(&self) -> Result<()> {
        for dir in [
            self.versions_dir(),
            self.bin_dir(),
            self.root.join("config").join("traefik"),
            self.root.join("data").join("traefik").join("config"),
            self.root.join("data").join("portainer"),
            self.root.join("data").join("cloudflared"),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Names of the version directories on disk, staging and hidden entries excluded
    pub fn version_dirs_on_disk(&self) -> Result<Vec<String>> {
        let dir = self.versions_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }
}

/// Locate the install root
///
/// Tries, in order: the explicit path, `SYRVIS_HOME` (already folded into
/// `explicit` by the CLI), then `/volume1` through `/volume9` for a
/// `docker/syrviscore` directory holding a manifest.
pub fn discover_home(explicit: Option<&Path>) -> Result<PathBuf> {
    discover_home_in(explicit, Path::new("/"))
}

fn discover_home_in(explicit: Option<&Path>, fs_root: &Path) -> Result<PathBuf> {
    if let Some(path) = explicit {
        debug!("Using explicit install root: {}", path.display());
        return Ok(path.to_path_buf());
    }

    for volume in 1..=9 {
        let candidate = fs_root
            .join(format!("volume{}", volume))
            .join("docker")
            .join(PACKAGE_NAME);
        if candidate.join(MANIFEST_FILE).is_file() {
            debug!("Discovered install root: {}", candidate.display());
            return Ok(candidate);
        }
    }

    Err(Error::HomeNotFound(
        "cannot find a SyrvisCore installation; pass --home or set SYRVIS_HOME".to_string(),
    ))
}

/// Default root for a brand-new installation: the first existing volume
pub fn default_install_path() -> PathBuf {
    default_install_path_in(Path::new("/"))
}

fn default_install_path_in(fs_root: &Path) -> PathBuf {
    let volume = (1..=9)
        .map(|n| fs_root.join(format!("volume{}", n)))
        .find(|p| p.is_dir())
        .unwrap_or_else(|| fs_root.join("volume1"));
    volume.join("docker").join(PACKAGE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let layout = Layout::new("/volume1/docker/syrviscore");
        assert_eq!(
            layout.version_dir("0.1.0"),
            PathBuf::from("/volume1/docker/syrviscore/versions/0.1.0")
        );
        assert_eq!(
            layout.manifest_path(),
            PathBuf::from("/volume1/docker/syrviscore/.syrviscore-manifest.json")
        );
        assert_eq!(Layout::pointer_target("0.1.0"), PathBuf::from("versions/0.1.0"));
        assert_eq!(
            layout.backup_path("0.1.0"),
            PathBuf::from("/volume1/docker/syrviscore/backups/0.1.0.tar.gz")
        );
    }

    #[test]
    fn test_explicit_home_wins() {
        let home = discover_home_in(Some(Path::new("/srv/syrvis")), Path::new("/nonexistent")).unwrap();
        assert_eq!(home, PathBuf::from("/srv/syrvis"));
    }

    #[test]
    fn test_discover_searches_volumes_for_manifest() {
        let fs_root = TempDir::new().unwrap();
        let without_manifest = fs_root.path().join("volume1/docker/syrviscore");
        std::fs::create_dir_all(&without_manifest).unwrap();
        let with_manifest = fs_root.path().join("volume3/docker/syrviscore");
        std::fs::create_dir_all(&with_manifest).unwrap();
        std::fs::write(with_manifest.join(MANIFEST_FILE), "{}").unwrap();

        let home = discover_home_in(None, fs_root.path()).unwrap();
        assert_eq!(home, with_manifest);
    }

    #[test]
    fn test_discover_fails_without_installation() {
        let fs_root = TempDir::new().unwrap();
        let result = discover_home_in(None, fs_root.path());
        assert!(matches!(result, Err(Error::HomeNotFound(_))));
    }

    #[test]
    fn test_default_install_path_uses_first_volume() {
        let fs_root = TempDir::new().unwrap();
        std::fs::create_dir_all(fs_root.path().join("volume2")).unwrap();
        assert_eq!(
            default_install_path_in(fs_root.path()),
            fs_root.path().join("volume2/docker/syrviscore")
        );
    }

    #[test]
    fn test_version_dirs_skip_staging() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        std::fs::create_dir_all(layout.version_dir("0.2.0")).unwrap();
        std::fs::create_dir_all(layout.version_dir("0.1.0")).unwrap();
        std::fs::create_dir_all(layout.versions_dir().join(".staging-0.3.0-abc")).unwrap();

        assert_eq!(layout.version_dirs_on_disk().unwrap(), vec!["0.1.0", "0.2.0"]);
    }
}
