// src/store/mod.rs

//! Version store: installed versions, the active pointer and the manifest
//!
//! Every mutating operation runs under the store lock and follows the same
//! order: filesystem changes first, manifest commit last. Activation swaps
//! the `current` pointer before committing the manifest; a crash in between
//! leaves a pointer/manifest mismatch that `verify` reports and `repair`
//! fixes.

pub mod backup;
pub mod lock;
pub mod manifest;
pub mod pointer;
pub mod wrapper;

pub use lock::StoreLock;
pub use manifest::{HistoryKind, HistoryRecord, Manifest, VersionEntry, VersionStatus};
pub use pointer::Pointer;

use crate::error::{Error, Result};
use crate::paths::{Layout, STAGING_PREFIX};
use crate::release::ReleaseProvider;
use crate::service::{NoopController, ServiceController};
use chrono::{DateTime, Utc};
use manifest::compare_versions;
use semver::Version;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default wait for the store lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables for a [`VersionStore`]
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// How long mutating operations wait for another process's lock
    pub lock_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

/// Outcome of an activation (activate, rollback, activating install)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
    pub from: Option<String>,
    pub to: String,
    pub kind: HistoryKind,
    /// The version was already active and the pointer agreed; nothing changed
    pub already_active: bool,
    /// Non-fatal problems (service stop/start, wrapper refresh)
    pub warnings: Vec<String>,
}

/// Outcome of an install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub version: String,
    pub sha256: String,
    pub source: String,
    /// Snapshot of the previously active version taken before activating
    pub backup: Option<PathBuf>,
    /// Non-fatal problems before activation (pre-upgrade backup)
    pub warnings: Vec<String>,
    pub activation: Option<ActivationReport>,
}

/// One row of `list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: String,
    pub status: VersionStatus,
    pub installed_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub sha256: Option<String>,
}

/// Installed versions, oldest first
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Listing {
    pub versions: Vec<VersionInfo>,
    pub active: Option<String>,
    /// Set when the manifest parsed but breaks the single-active invariant
    pub degraded: Option<String>,
}

/// Plan or result of a cleanup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub kept: Vec<String>,
    pub dry_run: bool,
}

/// A disagreement between the manifest, the pointer and the disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inconsistency {
    /// Manifest parsed but breaks the single-active invariant
    ManifestInvalid(String),
    /// A version is active but `current` does not exist
    PointerMissing { expected: String },
    /// `current` names a version whose directory is gone
    PointerDangling { version: String },
    /// `current` names a different version than the manifest
    PointerMismatch {
        pointer: String,
        manifest: Option<String>,
    },
    /// `current` is not a link into `versions/`
    PointerForeign(PathBuf),
    /// Manifest entry without a version directory
    MissingDirectory(String),
    /// Version directory without a manifest entry
    OrphanDirectory(String),
    /// Version directory without a usable entry point
    IncompleteVersion { version: String, reason: String },
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inconsistency::ManifestInvalid(reason) => write!(f, "manifest is invalid: {}", reason),
            Inconsistency::PointerMissing { expected } => {
                write!(f, "active version is {} but 'current' is missing", expected)
            }
            Inconsistency::PointerDangling { version } => {
                write!(f, "'current' points at {} whose directory is missing", version)
            }
            Inconsistency::PointerMismatch { pointer, manifest } => match manifest {
                Some(active) => write!(
                    f,
                    "'current' points at {} but the manifest's active version is {}",
                    pointer, active
                ),
                None => write!(
                    f,
                    "'current' points at {} but the manifest has no active version",
                    pointer
                ),
            },
            Inconsistency::PointerForeign(target) => write!(
                f,
                "'current' does not point into versions/ ({})",
                target.display()
            ),
            Inconsistency::MissingDirectory(version) => {
                write!(f, "version {} is in the manifest but its directory is missing", version)
            }
            Inconsistency::OrphanDirectory(version) => {
                write!(f, "directory versions/{} has no manifest entry", version)
            }
            Inconsistency::IncompleteVersion { version, reason } => {
                write!(f, "version {} is incomplete: {}", version, reason)
            }
        }
    }
}

/// Change made by `repair`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairAction {
    RepointedCurrent { from: Option<String>, to: String },
    DroppedEntry(String),
    RemovedStaging(String),
}

impl fmt::Display for RepairAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepairAction::RepointedCurrent { from: Some(from), to } => {
                write!(f, "re-pointed 'current' from {} to {}", from, to)
            }
            RepairAction::RepointedCurrent { from: None, to } => {
                write!(f, "pointed 'current' at {}", to)
            }
            RepairAction::DroppedEntry(version) => {
                write!(f, "dropped manifest entry {} (directory missing)", version)
            }
            RepairAction::RemovedStaging(name) => {
                write!(f, "removed leftover staging directory {}", name)
            }
        }
    }
}

/// Summary for `info`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreInfo {
    pub root: PathBuf,
    pub initialized: bool,
    pub install_path: Option<String>,
    pub active: Option<String>,
    pub setup_complete: bool,
    pub installed: usize,
    pub schema_version: Option<u32>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Versions installed under one install root
pub struct VersionStore {
    layout: Layout,
    options: StoreOptions,
    controller: Box<dyn ServiceController>,
}

impl VersionStore {
    /// Open the store at `root`; nothing is touched until an operation runs
    pub fn new(root: impl Into<PathBuf>, options: StoreOptions) -> Self {
        Self {
            layout: Layout::new(root),
            options,
            controller: Box::new(NoopController),
        }
    }

    /// Use `controller` to stop and start services around activations
    pub fn with_controller(mut self, controller: impl ServiceController + 'static) -> Self {
        self.controller = Box::new(controller);
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    fn lock(&self) -> Result<StoreLock> {
        StoreLock::acquire(&self.layout.lock_path(), self.options.lock_timeout)
    }

    /// Validated manifest for a mutation, or a fresh one for a new store
    fn load_for_update(&self) -> Result<Manifest> {
        Ok(Manifest::load(&self.layout.manifest_path())?
            .unwrap_or_else(|| Manifest::new(self.layout.root())))
    }

    fn read_manifest(&self) -> Result<Option<Manifest>> {
        Manifest::read(&self.layout.manifest_path())
    }

    /// Install `version` from `provider`, activating it when asked or when
    /// nothing is active yet
    pub fn install(
        &self,
        version: &Version,
        provider: &dyn ReleaseProvider,
        activate: bool,
    ) -> Result<InstallReport> {
        let id = version.to_string();
        let _lock = self.lock()?;
        let mut manifest = self.load_for_update()?;

        if manifest.contains(&id) || self.layout.version_dir(&id).exists() {
            return Err(Error::VersionAlreadyInstalled(id));
        }

        self.layout
            .ensure_structure()
            .map_err(|e| install_failed(&id, e))?;
        for name in self.sweep_staging()? {
            warn!("Removed leftover staging directory {}", name);
        }

        let activating = activate || manifest.active_version.is_none();
        let mut warnings = Vec::new();
        let backup = match manifest.active_version.as_deref() {
            Some(from) if activating => match backup::create_pre_upgrade(&self.layout, from, &id) {
                Ok(path) => path,
                Err(e) => {
                    warn!("Failed to back up {}: {}", from, e);
                    warnings.push(format!("could not back up {}: {}", from, e));
                    None
                }
            },
            _ => None,
        };

        let staging = tempfile::Builder::new()
            .prefix(&format!("{}{}-", STAGING_PREFIX, id))
            .tempdir_in(self.layout.versions_dir())
            .map_err(|e| install_failed(&id, e.into()))?;

        info!("Fetching {} into {}", id, staging.path().display());
        let artifact = provider
            .fetch(version, staging.path())
            .and_then(|artifact| {
                check_entry_point(&id, staging.path())?;
                Ok(artifact)
            })
            .map_err(|e| install_failed(&id, e))?;

        // The emptied staging path is ignored by TempDir's cleanup after the rename
        let final_dir = self.layout.version_dir(&id);
        fs::rename(staging.path(), &final_dir).map_err(|e| install_failed(&id, e.into()))?;

        manifest.add_version(&id, Some(artifact.sha256.clone()), Utc::now());
        if let Err(e) = manifest.save(&self.layout.manifest_path()) {
            if let Err(cleanup) = fs::remove_dir_all(&final_dir) {
                warn!("Failed to remove {}: {}", final_dir.display(), cleanup);
            }
            return Err(install_failed(&id, e));
        }
        info!("Installed {} (sha256 {})", id, artifact.sha256);

        let activation = if activating {
            let kind = match manifest.active_version.as_deref() {
                None => HistoryKind::Install,
                Some(old) if compare_versions(&id, old).is_gt() => HistoryKind::Upgrade,
                Some(_) => HistoryKind::Activate,
            };
            Some(self.activate_locked(&mut manifest, &id, kind)?)
        } else {
            None
        };

        Ok(InstallReport {
            version: id,
            sha256: artifact.sha256,
            source: artifact.source,
            backup,
            warnings,
            activation,
        })
    }

    /// Make an installed version the active one
    pub fn activate(&self, version: &str) -> Result<ActivationReport> {
        let _lock = self.lock()?;
        let mut manifest = self.load_for_update()?;
        self.activate_locked(&mut manifest, version, HistoryKind::Activate)
    }

    /// Return to the previously active version
    pub fn rollback(&self) -> Result<ActivationReport> {
        let _lock = self.lock()?;
        let mut manifest = self.load_for_update()?;
        let target = manifest.rollback_target().ok_or(Error::NoRollbackTarget)?;
        info!("Rolling back to {}", target);
        self.activate_locked(&mut manifest, &target, HistoryKind::Rollback)
    }

    /// The version `rollback` would activate, without changing anything
    pub fn rollback_target(&self) -> Result<Option<String>> {
        Ok(self
            .read_manifest()?
            .and_then(|manifest| manifest.rollback_target()))
    }

    fn activate_locked(
        &self,
        manifest: &mut Manifest,
        version: &str,
        kind: HistoryKind,
    ) -> Result<ActivationReport> {
        check_version_id(version)?;
        if !manifest.contains(version) {
            return Err(Error::VersionNotFound(version.to_string()));
        }
        let version_dir = self.layout.version_dir(version);
        check_entry_point(version, &version_dir)?;

        let previous = manifest.active_version.clone();
        let pointed = pointer::resolve(&self.layout)?;
        if previous.as_deref() == Some(version)
            && pointed == (Pointer::Version { version: version.to_string(), dangling: false })
        {
            info!("{} is already active", version);
            return Ok(ActivationReport {
                from: previous,
                to: version.to_string(),
                kind,
                already_active: true,
                warnings: Vec::new(),
            });
        }

        let mut warnings = Vec::new();
        let stopped = previous
            .as_deref()
            .filter(|old| *old != version && self.layout.version_dir(old).is_dir());
        if let Some(old) = stopped
            && let Err(e) = self.controller.stop(&self.layout.version_dir(old))
        {
            warn!("Failed to stop {}: {}", old, e);
            warnings.push(format!("failed to stop {}: {}", old, e));
        }

        let previous_target = pointer::read_target(&self.layout).map_err(Error::PointerSwapFailed)?;
        if let Err(e) = pointer::swap(&self.layout, version) {
            if let Some(old) = stopped
                && let Err(e) = self.controller.start(&self.layout.version_dir(old))
            {
                warn!("Failed to restart {}: {}", old, e);
            }
            return Err(Error::PointerSwapFailed(e));
        }

        let mut updated = manifest.clone();
        updated.set_active(version, kind, Utc::now());
        if let Err(e) = updated.save(&self.layout.manifest_path()) {
            if let Err(restore) = pointer::restore(&self.layout, previous_target.as_deref()) {
                warn!("Failed to restore the previous pointer: {}", restore);
            }
            if let Some(old) = stopped
                && let Err(restart) = self.controller.start(&self.layout.version_dir(old))
            {
                warn!("Failed to restart {}: {}", old, restart);
            }
            return Err(e);
        }
        *manifest = updated;
        info!("Activated {} ({})", version, kind);

        if let Err(e) = wrapper::write(&self.layout) {
            warn!("Failed to refresh the syrvis wrapper: {}", e);
            warnings.push(format!("failed to refresh bin/syrvis: {}", e));
        }
        if let Err(e) = self.controller.start(&version_dir) {
            warn!("Failed to start {}: {}", version, e);
            warnings.push(format!("failed to start {}: {}", version, e));
        }

        Ok(ActivationReport {
            from: previous,
            to: version.to_string(),
            kind,
            already_active: false,
            warnings,
        })
    }

    /// Installed versions, oldest first
    pub fn list(&self) -> Result<Listing> {
        let Some(manifest) = self.read_manifest()? else {
            return Ok(Listing::default());
        };

        let degraded = manifest.validate().err().map(|e| match e {
            Error::ManifestCorrupt(reason) => reason,
            other => other.to_string(),
        });
        let versions = manifest
            .versions_by_install_time()
            .into_iter()
            .map(|(version, entry)| VersionInfo {
                version: version.to_string(),
                status: entry.status,
                installed_at: entry.installed_at,
                activated_at: entry.activated_at,
                sha256: entry.sha256.clone(),
            })
            .collect();

        Ok(Listing {
            versions,
            active: manifest.active_version,
            degraded,
        })
    }

    /// Remove everything except the active version and the `keep` most
    /// recently installed ones
    pub fn cleanup(&self, keep: usize, dry_run: bool) -> Result<CleanupReport> {
        if keep == 0 {
            return Err(Error::InvalidArgument(
                "--keep must be at least 1".to_string(),
            ));
        }

        let _lock = self.lock()?;
        let mut manifest = self.load_for_update()?;

        let ordered: Vec<String> = manifest
            .versions_by_install_time()
            .into_iter()
            .map(|(version, _)| version.to_string())
            .collect();
        let mut retain: BTreeSet<&str> = ordered.iter().rev().take(keep).map(String::as_str).collect();
        if let Some(active) = manifest.active_version.as_deref() {
            retain.insert(active);
        }

        let (kept, doomed): (Vec<String>, Vec<String>) = ordered
            .iter()
            .cloned()
            .partition(|version| retain.contains(version.as_str()));

        if dry_run {
            return Ok(CleanupReport {
                removed: doomed,
                kept,
                dry_run: true,
            });
        }

        let mut removed = Vec::new();
        let mut failures = Vec::new();
        for version in doomed {
            match remove_version_dir(&self.layout.version_dir(&version)) {
                Ok(()) => {
                    manifest.remove_version(&version);
                    info!("Removed {}", version);
                    removed.push(version);
                }
                Err(e) => {
                    warn!("Failed to remove {}: {}", version, e);
                    failures.push((version, e.to_string()));
                }
            }
        }

        if !removed.is_empty() {
            manifest.save(&self.layout.manifest_path())?;
        }

        if !failures.is_empty() {
            return Err(Error::CleanupPartialFailure { removed, failures });
        }
        Ok(CleanupReport {
            removed,
            kept,
            dry_run: false,
        })
    }

    /// Remove one installed version that is not active
    pub fn uninstall(&self, version: &str) -> Result<()> {
        check_version_id(version)?;
        let _lock = self.lock()?;
        let mut manifest = self.load_for_update()?;

        let pointed = pointer::resolve(&self.layout)?;
        if manifest.active_version.as_deref() == Some(version) || pointed.version() == Some(version) {
            return Err(Error::CannotUninstallActive(version.to_string()));
        }

        let dir = self.layout.version_dir(version);
        let known = manifest.contains(version);
        if !known && !dir.exists() {
            return Err(Error::VersionNotFound(version.to_string()));
        }

        remove_version_dir(&dir)?;
        if known {
            manifest.remove_version(version);
            manifest.save(&self.layout.manifest_path())?;
        }

        info!("Uninstalled {}", version);
        Ok(())
    }

    /// Compare the manifest, the pointer and the version directories
    pub fn verify(&self) -> Result<Vec<Inconsistency>> {
        let manifest = self
            .read_manifest()?
            .unwrap_or_else(|| Manifest::new(self.layout.root()));
        let mut found = Vec::new();

        if let Err(e) = manifest.validate() {
            found.push(Inconsistency::ManifestInvalid(match e {
                Error::ManifestCorrupt(reason) => reason,
                other => other.to_string(),
            }));
        }

        let active = manifest.active_version.clone();
        match (pointer::resolve(&self.layout)?, active) {
            (Pointer::Missing, None) => {}
            (Pointer::Missing, Some(expected)) => {
                found.push(Inconsistency::PointerMissing { expected })
            }
            (Pointer::Foreign(target), _) => found.push(Inconsistency::PointerForeign(target)),
            (Pointer::Version { version, dangling }, active) => {
                if active.as_deref() != Some(version.as_str()) {
                    found.push(Inconsistency::PointerMismatch {
                        pointer: version.clone(),
                        manifest: active,
                    });
                }
                if dangling {
                    found.push(Inconsistency::PointerDangling { version });
                }
            }
        }

        let on_disk = self.layout.version_dirs_on_disk()?;
        for version in manifest.versions.keys() {
            let dir = self.layout.version_dir(version);
            if !dir.is_dir() {
                found.push(Inconsistency::MissingDirectory(version.clone()));
            } else if let Err(e) = check_entry_point(version, &dir) {
                let reason = match e {
                    Error::IncompleteVersion { reason, .. } => reason,
                    other => other.to_string(),
                };
                found.push(Inconsistency::IncompleteVersion {
                    version: version.clone(),
                    reason,
                });
            }
        }
        for version in on_disk {
            if !manifest.contains(&version) {
                found.push(Inconsistency::OrphanDirectory(version));
            }
        }

        debug!("Verify found {} inconsistencies", found.len());
        Ok(found)
    }

    /// Fix what can be fixed without guessing: the pointer, stale entries
    /// and leftover staging directories
    pub fn repair(&self) -> Result<Vec<RepairAction>> {
        let _lock = self.lock()?;
        let mut manifest = self.load_for_update()?;
        let mut actions: Vec<RepairAction> = self
            .sweep_staging()?
            .into_iter()
            .map(RepairAction::RemovedStaging)
            .collect();

        let stale: Vec<String> = manifest
            .versions
            .keys()
            .filter(|version| {
                manifest.active_version.as_deref() != Some(version.as_str())
                    && !self.layout.version_dir(version).is_dir()
            })
            .cloned()
            .collect();
        for version in stale {
            manifest.remove_version(&version);
            actions.push(RepairAction::DroppedEntry(version));
        }

        if let Some(active) = manifest.active_version.clone() {
            let pointed = pointer::resolve(&self.layout)?;
            let consistent = matches!(
                &pointed,
                Pointer::Version { version, dangling: false } if *version == active
            );
            if !consistent {
                check_entry_point(&active, &self.layout.version_dir(&active))?;
                pointer::swap(&self.layout, &active).map_err(Error::PointerSwapFailed)?;
                actions.push(RepairAction::RepointedCurrent {
                    from: pointed.version().map(str::to_string),
                    to: active,
                });
            }
        }

        if actions
            .iter()
            .any(|action| matches!(action, RepairAction::DroppedEntry(_)))
        {
            manifest.save(&self.layout.manifest_path())?;
        }

        for action in &actions {
            info!("Repair: {}", action);
        }
        Ok(actions)
    }

    /// Installation summary
    pub fn info(&self) -> Result<StoreInfo> {
        let root = self.layout.root().to_path_buf();
        Ok(match self.read_manifest()? {
            Some(manifest) => StoreInfo {
                root,
                initialized: true,
                install_path: Some(manifest.install_path),
                active: manifest.active_version,
                setup_complete: manifest.setup_complete,
                installed: manifest.versions.len(),
                schema_version: Some(manifest.schema_version),
                created_at: Some(manifest.created_at),
            },
            None => StoreInfo {
                root,
                initialized: false,
                install_path: None,
                active: None,
                setup_complete: false,
                installed: 0,
                schema_version: None,
                created_at: None,
            },
        })
    }

    /// Update history, oldest first
    pub fn history(&self) -> Result<Vec<HistoryRecord>> {
        Ok(self
            .read_manifest()?
            .map(|manifest| manifest.update_history)
            .unwrap_or_default())
    }

    /// Remove staging directories; only called with the lock held, so none
    /// of them belongs to a running install
    fn sweep_staging(&self) -> Result<Vec<String>> {
        let dir = self.layout.versions_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut removed = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(STAGING_PREFIX) {
                fs::remove_dir_all(entry.path())?;
                removed.push(name);
            }
        }
        Ok(removed)
    }
}

fn install_failed(version: &str, source: Error) -> Error {
    Error::InstallFailed {
        version: version.to_string(),
        source: Box::new(source),
    }
}

/// Version identifiers name exactly one directory under `versions/`
fn check_version_id(version: &str) -> Result<()> {
    let mut components = Path::new(version).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None)
            if !version.starts_with('.') && !version.contains('/') =>
        {
            Ok(())
        }
        _ => Err(Error::InvalidVersion(version.to_string())),
    }
}

/// A version directory is usable when `bin/syrvis` is an executable file
fn check_entry_point(version: &str, dir: &Path) -> Result<()> {
    let incomplete = |reason: &str| Error::IncompleteVersion {
        version: version.to_string(),
        reason: reason.to_string(),
    };

    if !dir.is_dir() {
        return Err(incomplete("version directory is missing"));
    }
    let entry = dir.join(crate::paths::ENTRY_POINT);
    match fs::metadata(&entry) {
        Ok(meta) if !meta.is_file() => Err(incomplete("bin/syrvis is not a file")),
        Ok(meta) if meta.permissions().mode() & 0o111 == 0 => {
            Err(incomplete("bin/syrvis is not executable"))
        }
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(incomplete("bin/syrvis is missing")),
        Err(e) => Err(e.into()),
    }
}

fn remove_version_dir(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
