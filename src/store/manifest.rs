// src/store/manifest.rs

//! Installation manifest
//!
//! The manifest is the authoritative record of installed versions, the active
//! version and the update history. It is always rewritten whole: serialized to
//! a temporary file next to the original, synced, then renamed over it.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// Current manifest schema version
pub const SCHEMA_VERSION: u32 = 3;

/// Status of an installed version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Available,
    Active,
}

impl VersionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            VersionStatus::Available => "available",
            VersionStatus::Active => "active",
        }
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Kind of change recorded in the update history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    Install,
    Upgrade,
    Rollback,
    Activate,
}

impl HistoryKind {
    pub fn as_str(&self) -> &str {
        match self {
            HistoryKind::Install => "install",
            HistoryKind::Upgrade => "upgrade",
            HistoryKind::Rollback => "rollback",
            HistoryKind::Activate => "activate",
        }
    }
}

impl fmt::Display for HistoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Per-version record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub status: VersionStatus,
    #[serde(with = "timestamp")]
    pub installed_at: DateTime<Utc>,
    #[serde(default, with = "timestamp::option")]
    pub activated_at: Option<DateTime<Utc>>,
    /// SHA-256 of the release bundle this version was installed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// One change of the active version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub from: Option<String>,
    pub to: String,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: HistoryKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default)]
    pub active_version: Option<String>,
    pub install_path: String,
    #[serde(default)]
    pub setup_complete: bool,
    #[serde(default = "Utc::now", with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub versions: BTreeMap<String, VersionEntry>,
    #[serde(default)]
    pub update_history: Vec<HistoryRecord>,
    /// Keys owned by other tools (e.g. `privileged_setup`), kept verbatim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Manifest {
    /// Create an empty manifest for the given install root
    pub fn new(install_path: &Path) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            active_version: None,
            install_path: install_path.display().to_string(),
            setup_complete: false,
            created_at: Utc::now(),
            versions: BTreeMap::new(),
            update_history: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    /// Parse a manifest without checking the single-active invariant
    pub fn parse(raw: &str) -> Result<Self> {
        let manifest: Manifest = serde_json::from_str(raw)
            .map_err(|e| Error::ManifestCorrupt(format!("invalid JSON ({})", e)))?;

        if manifest.schema_version > SCHEMA_VERSION {
            return Err(Error::ManifestCorrupt(format!(
                "unsupported schema version {} (this syrvisctl understands up to {})",
                manifest.schema_version, SCHEMA_VERSION
            )));
        }

        Ok(manifest)
    }

    /// Read a manifest from disk without validating it
    ///
    /// Returns `Ok(None)` when no manifest exists yet.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::parse(&raw).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read and validate a manifest
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let manifest = Self::read(path)?;
        if let Some(manifest) = &manifest {
            manifest.validate()?;
        }
        Ok(manifest)
    }

    /// Check the single-active invariant
    pub fn validate(&self) -> Result<()> {
        let active: Vec<&str> = self
            .versions
            .iter()
            .filter(|(_, entry)| entry.status == VersionStatus::Active)
            .map(|(version, _)| version.as_str())
            .collect();

        match (&self.active_version, active.as_slice()) {
            (None, []) => Ok(()),
            (Some(version), [only]) if version == only => Ok(()),
            (Some(version), []) if !self.versions.contains_key(version) => Err(
                Error::ManifestCorrupt(format!("active version {} has no version entry", version)),
            ),
            (Some(version), []) => Err(Error::ManifestCorrupt(format!(
                "active version {} is not marked active",
                version
            ))),
            (_, many) if many.len() > 1 => Err(Error::ManifestCorrupt(format!(
                "multiple versions marked active: {}",
                many.join(", ")
            ))),
            (None, [only]) => Err(Error::ManifestCorrupt(format!(
                "version {} is marked active but no active version is recorded",
                only
            ))),
            (Some(version), [other]) => Err(Error::ManifestCorrupt(format!(
                "active version is {} but {} is marked active",
                version, other
            ))),
            _ => unreachable!("all active-entry shapes are covered"),
        }
    }

    /// Atomically write this manifest to `path`
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.schema_version = SCHEMA_VERSION;

        let mut json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        json.push(b'\n');

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = tempfile::Builder::new()
            .prefix(".syrviscore-manifest.")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        temp.write_all(&json)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| Error::Io(e.error))?;

        debug!("Manifest written to {}", path.display());
        Ok(())
    }

    pub fn contains(&self, version: &str) -> bool {
        self.versions.contains_key(version)
    }

    /// Record a freshly installed version as available
    pub fn add_version(&mut self, version: &str, sha256: Option<String>, now: DateTime<Utc>) {
        self.versions.insert(
            version.to_string(),
            VersionEntry {
                status: VersionStatus::Available,
                installed_at: now,
                activated_at: None,
                sha256,
            },
        );
    }

    pub fn remove_version(&mut self, version: &str) -> Option<VersionEntry> {
        self.versions.remove(version)
    }

    /// Mark `version` active, demote the previous one and append a history record
    ///
    /// Returns the previously active version.
    pub fn set_active(
        &mut self,
        version: &str,
        kind: HistoryKind,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let previous = self.active_version.take();

        if let Some(old) = previous.as_deref()
            && let Some(entry) = self.versions.get_mut(old)
        {
            entry.status = VersionStatus::Available;
        }

        if let Some(entry) = self.versions.get_mut(version) {
            entry.status = VersionStatus::Active;
            entry.activated_at = Some(now);
        }
        self.active_version = Some(version.to_string());

        if previous.as_deref() != Some(version) {
            self.update_history.push(HistoryRecord {
                from: previous.clone(),
                to: version.to_string(),
                timestamp: now,
                kind,
            });
        }

        previous
    }

    /// Installed versions ordered by install time, oldest first
    pub fn versions_by_install_time(&self) -> Vec<(&str, &VersionEntry)> {
        let mut entries: Vec<(&str, &VersionEntry)> = self
            .versions
            .iter()
            .map(|(version, entry)| (version.as_str(), entry))
            .collect();
        entries.sort_by(|(va, a), (vb, b)| {
            a.installed_at
                .cmp(&b.installed_at)
                .then_with(|| compare_versions(va, vb))
        });
        entries
    }

    /// Version to return to on rollback
    ///
    /// History is replayed as a stack of activations: installs, upgrades and
    /// activations push their target, a rollback pops back down to its target.
    /// The result is the nearest stacked version that differs from the active
    /// one and is still installed, so repeated rollbacks walk further back
    /// instead of toggling between two versions.
    pub fn rollback_target(&self) -> Option<String> {
        let active = self.active_version.as_deref();
        self.activation_stack()
            .into_iter()
            .rev()
            .find(|version| Some(*version) != active && self.versions.contains_key(*version))
            .map(str::to_string)
    }

    fn activation_stack(&self) -> Vec<&str> {
        let mut stack: Vec<&str> = Vec::new();

        for record in &self.update_history {
            match record.kind {
                HistoryKind::Rollback => {
                    while stack.last().is_some_and(|top| *top != record.to) {
                        stack.pop();
                    }
                    if stack.is_empty() {
                        stack.push(&record.to);
                    }
                }
                HistoryKind::Install | HistoryKind::Upgrade | HistoryKind::Activate => {
                    if stack.is_empty()
                        && let Some(from) = record.from.as_deref()
                    {
                        stack.push(from);
                    }
                    if stack.last() != Some(&record.to.as_str()) {
                        stack.push(&record.to);
                    }
                }
            }
        }

        stack
    }
}

/// Order version strings semantically, falling back to plain string order
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (semver::Version::parse(a), semver::Version::parse(b)) {
        (Ok(va), Ok(vb)) => va.cmp(&vb),
        _ => a.cmp(b),
    }
}

/// Manifest timestamps: RFC 3339 on write; naive ISO 8601 (UTC) accepted on read
mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub fn parse(raw: &str) -> Result<DateTime<Utc>, String> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Ok(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|e| format!("invalid timestamp '{}': {}", raw, e))
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            ts: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match ts {
                Some(ts) => super::serialize(ts, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|raw| super::parse(&raw).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn manifest_with(versions: &[&str]) -> Manifest {
        let mut manifest = Manifest::new(Path::new("/volume1/docker/syrviscore"));
        for (i, v) in versions.iter().enumerate() {
            manifest.add_version(v, None, at(i as i64));
        }
        manifest
    }

    #[test]
    fn test_new_manifest_is_valid() {
        let manifest = Manifest::new(Path::new("/volume1/docker/syrviscore"));
        assert_eq!(manifest.schema_version, SCHEMA_VERSION);
        assert!(manifest.validate().is_ok());
        assert_eq!(manifest.rollback_target(), None);
    }

    #[test]
    fn test_set_active_demotes_previous_and_records_history() {
        let mut manifest = manifest_with(&["1.0.0", "1.1.0"]);
        assert_eq!(manifest.set_active("1.0.0", HistoryKind::Install, at(10)), None);
        let previous = manifest.set_active("1.1.0", HistoryKind::Activate, at(20));

        assert_eq!(previous.as_deref(), Some("1.0.0"));
        assert_eq!(manifest.versions["1.0.0"].status, VersionStatus::Available);
        assert_eq!(manifest.versions["1.1.0"].status, VersionStatus::Active);
        assert_eq!(manifest.versions["1.1.0"].activated_at, Some(at(20)));
        assert!(manifest.validate().is_ok());

        let last = manifest.update_history.last().unwrap();
        assert_eq!(last.from.as_deref(), Some("1.0.0"));
        assert_eq!(last.to, "1.1.0");
        assert_eq!(last.kind, HistoryKind::Activate);
    }

    #[test]
    fn test_reactivating_active_version_adds_no_history() {
        let mut manifest = manifest_with(&["1.0.0"]);
        manifest.set_active("1.0.0", HistoryKind::Install, at(1));
        manifest.set_active("1.0.0", HistoryKind::Activate, at(2));
        assert_eq!(manifest.update_history.len(), 1);
    }

    #[test]
    fn test_validate_rejects_multiple_active() {
        let mut manifest = manifest_with(&["1.0.0", "1.1.0"]);
        manifest.set_active("1.0.0", HistoryKind::Install, at(1));
        manifest.versions.get_mut("1.1.0").unwrap().status = VersionStatus::Active;

        let err = manifest.validate().unwrap_err();
        assert!(matches!(err, Error::ManifestCorrupt(ref msg) if msg.contains("multiple")));
    }

    #[test]
    fn test_validate_rejects_active_version_mismatch() {
        let mut manifest = manifest_with(&["1.0.0", "1.1.0"]);
        manifest.set_active("1.0.0", HistoryKind::Install, at(1));
        manifest.active_version = Some("1.1.0".to_string());
        assert!(matches!(manifest.validate(), Err(Error::ManifestCorrupt(_))));

        manifest.active_version = None;
        assert!(matches!(manifest.validate(), Err(Error::ManifestCorrupt(_))));

        manifest.active_version = Some("9.9.9".to_string());
        manifest.versions.get_mut("1.0.0").unwrap().status = VersionStatus::Available;
        assert!(matches!(manifest.validate(), Err(Error::ManifestCorrupt(_))));
    }

    #[test]
    fn test_rollback_walks_back_through_distinct_predecessors() {
        let mut manifest = manifest_with(&["1.0.0", "1.1.0", "1.2.0"]);
        manifest.set_active("1.0.0", HistoryKind::Install, at(1));
        manifest.set_active("1.1.0", HistoryKind::Activate, at(2));
        manifest.set_active("1.2.0", HistoryKind::Activate, at(3));

        assert_eq!(manifest.rollback_target().as_deref(), Some("1.1.0"));
        manifest.set_active("1.1.0", HistoryKind::Rollback, at(4));

        assert_eq!(manifest.rollback_target().as_deref(), Some("1.0.0"));
        manifest.set_active("1.0.0", HistoryKind::Rollback, at(5));

        assert_eq!(manifest.rollback_target(), None);
    }

    #[test]
    fn test_rollback_skips_removed_versions() {
        let mut manifest = manifest_with(&["1.0.0", "1.1.0", "1.2.0"]);
        manifest.set_active("1.0.0", HistoryKind::Install, at(1));
        manifest.set_active("1.1.0", HistoryKind::Activate, at(2));
        manifest.set_active("1.2.0", HistoryKind::Activate, at(3));
        manifest.remove_version("1.1.0");

        assert_eq!(manifest.rollback_target().as_deref(), Some("1.0.0"));
    }

    #[test]
    fn test_rollback_after_reactivation_returns_most_recent_distinct() {
        let mut manifest = manifest_with(&["1.0.0", "1.1.0", "1.2.0"]);
        manifest.set_active("1.0.0", HistoryKind::Install, at(1));
        manifest.set_active("1.1.0", HistoryKind::Activate, at(2));
        manifest.set_active("1.2.0", HistoryKind::Activate, at(3));
        manifest.set_active("1.1.0", HistoryKind::Activate, at(4));

        assert_eq!(manifest.rollback_target().as_deref(), Some("1.2.0"));
    }

    #[test]
    fn test_rollback_seeds_stack_from_first_record() {
        let mut manifest = manifest_with(&["0.9.0", "1.0.0"]);
        manifest.versions.get_mut("1.0.0").unwrap().status = VersionStatus::Active;
        manifest.active_version = Some("1.0.0".to_string());
        manifest.update_history.push(HistoryRecord {
            from: Some("0.9.0".to_string()),
            to: "1.0.0".to_string(),
            timestamp: at(5),
            kind: HistoryKind::Upgrade,
        });

        assert_eq!(manifest.rollback_target().as_deref(), Some("0.9.0"));
    }

    #[test]
    fn test_versions_by_install_time() {
        let mut manifest = manifest_with(&[]);
        manifest.add_version("2.0.0", None, at(1));
        manifest.add_version("1.0.0", None, at(2));
        manifest.add_version("1.10.0", None, at(3));
        manifest.add_version("1.9.0", None, at(3));

        let order: Vec<&str> = manifest
            .versions_by_install_time()
            .into_iter()
            .map(|(v, _)| v)
            .collect();
        assert_eq!(order, vec!["2.0.0", "1.0.0", "1.9.0", "1.10.0"]);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".syrviscore-manifest.json");

        let mut manifest = manifest_with(&["1.0.0", "1.1.0"]);
        manifest.versions.get_mut("1.1.0").unwrap().sha256 = Some("ab12".to_string());
        manifest.set_active("1.0.0", HistoryKind::Install, at(1));
        manifest
            .extra
            .insert("privileged_setup".to_string(), serde_json::json!({"docker_group": true}));
        manifest.save(&path).unwrap();

        let loaded = Manifest::load(&path).unwrap().unwrap();
        assert_eq!(loaded, manifest);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_load_missing_manifest() {
        let dir = TempDir::new().unwrap();
        let loaded = Manifest::load(&dir.path().join("missing.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_parse_rejects_garbage_and_future_schema() {
        assert!(matches!(
            Manifest::parse("{not json"),
            Err(Error::ManifestCorrupt(_))
        ));
        assert!(matches!(
            Manifest::parse(r#"{"schema_version": 99, "install_path": "/x"}"#),
            Err(Error::ManifestCorrupt(_))
        ));
    }

    #[test]
    fn test_parse_accepts_naive_timestamps_from_older_tooling() {
        let raw = r#"{
            "schema_version": 2,
            "active_version": "0.1.0",
            "install_path": "/volume1/docker/syrviscore",
            "setup_complete": true,
            "created_at": "2024-05-01T10:00:00.123456",
            "versions": {
                "0.1.0": {"installed_at": "2024-05-01T10:00:01.5", "status": "active",
                          "activated_at": "2024-05-01T10:00:02"}
            },
            "update_history": [],
            "privileged_setup": {"completed": true}
        }"#;

        let manifest = Manifest::parse(raw).unwrap();
        assert!(manifest.validate().is_ok());
        assert!(manifest.setup_complete);
        assert_eq!(
            manifest.versions["0.1.0"].activated_at,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 2).unwrap())
        );
        assert!(manifest.extra.contains_key("privileged_setup"));
    }
}
