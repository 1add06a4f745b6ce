// src/store/backup.rs

//! Pre-upgrade snapshots
//!
//! `backups/<version>.tar.gz` holds the state of the installation as it was
//! while `<version>` was active: `backup-metadata.json`, the manifest as
//! `manifest.json`, the `config/` tree and the persistent service data under
//! `data/`. Service logs are left out.

use crate::error::{Error, Result};
use crate::paths::Layout;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::{debug, info};

/// Layout version of the archive contents
pub const BACKUP_SCHEMA_VERSION: u32 = 1;

/// Name of the metadata entry inside a backup
pub const METADATA_ENTRY: &str = "backup-metadata.json";

/// Single files copied when present, relative to the install root
const FILES: &[&str] = &["data/traefik/acme.json", "data/traefik/traefik.yml"];

/// Directories copied whole when present
const TREES: &[&str] = &[
    "config",
    "data/traefik/config",
    "data/portainer",
    "data/cloudflared",
];

/// Contents of `backup-metadata.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub backup_version: u32,
    pub created_at: DateTime<Utc>,
    pub version: String,
    pub manager_version: String,
    pub reason: String,
    pub syrvis_home: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgraded_to: Option<String>,
}

/// Snapshot the installation before `to` replaces the active `from`
///
/// Returns `None` without touching anything when a backup of `from` already
/// exists; the first snapshot of a version is never overwritten.
pub fn create_pre_upgrade(layout: &Layout, from: &str, to: &str) -> Result<Option<PathBuf>> {
    let path = layout.backup_path(from);
    if path.exists() {
        debug!("Backup {} already exists", path.display());
        return Ok(None);
    }

    let dir = layout.backups_dir();
    fs::create_dir_all(&dir)?;

    let metadata = BackupMetadata {
        backup_version: BACKUP_SCHEMA_VERSION,
        created_at: Utc::now(),
        version: from.to_string(),
        manager_version: env!("CARGO_PKG_VERSION").to_string(),
        reason: "pre-upgrade".to_string(),
        syrvis_home: layout.root().display().to_string(),
        upgraded_to: Some(to.to_string()),
    };
    let json = serde_json::to_vec_pretty(&metadata).map_err(|e| Error::Io(io::Error::other(e)))?;

    let temp = tempfile::Builder::new()
        .prefix(&format!(".{}.", from))
        .suffix(".tmp")
        .tempfile_in(&dir)?;
    {
        let mut builder = tar::Builder::new(GzEncoder::new(temp.as_file(), Compression::default()));

        let mut header = tar::Header::new_gnu();
        header.set_size(json.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(metadata.created_at.timestamp().max(0) as u64);
        header.set_cksum();
        builder.append_data(&mut header, METADATA_ENTRY, json.as_slice())?;

        let manifest = layout.manifest_path();
        if manifest.is_file() {
            builder.append_path_with_name(&manifest, "manifest.json")?;
        }
        for rel in FILES {
            let src = layout.root().join(rel);
            if src.is_file() {
                builder.append_path_with_name(&src, rel)?;
            }
        }
        for rel in TREES {
            let src = layout.root().join(rel);
            if src.is_dir() {
                builder.append_dir_all(rel, &src)?;
            }
        }

        builder.into_inner()?.finish()?;
    }
    temp.as_file().sync_all()?;
    temp.persist(&path).map_err(|e| Error::Io(e.error))?;

    info!("Backed up {} to {}", from, path.display());
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    fn entries(path: &std::path::Path) -> Vec<(String, Vec<u8>)> {
        let file = fs::File::open(path).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let name = entry.path().unwrap().to_string_lossy().into_owned();
                let mut data = Vec::new();
                entry.read_to_end(&mut data).unwrap();
                (name, data)
            })
            .collect()
    }

    #[test]
    fn test_backup_captures_config_and_data() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        let root = dir.path();
        fs::create_dir_all(root.join("config/traefik")).unwrap();
        fs::write(root.join("config/traefik/dynamic.yml"), b"http: {}\n").unwrap();
        fs::create_dir_all(root.join("data/traefik/logs")).unwrap();
        fs::write(root.join("data/traefik/acme.json"), b"{}").unwrap();
        fs::write(root.join("data/traefik/logs/access.log"), b"GET /\n").unwrap();
        fs::write(layout.manifest_path(), b"{\"active_version\": \"1.0.0\"}\n").unwrap();

        let path = create_pre_upgrade(&layout, "1.0.0", "1.1.0").unwrap().unwrap();
        assert_eq!(path, layout.backup_path("1.0.0"));

        let entries = entries(&path);
        let names: Vec<&str> = entries.iter().map(|(name, _)| name.as_str()).collect();
        assert!(names.contains(&"manifest.json"));
        assert!(names.contains(&"config/traefik/dynamic.yml"));
        assert!(names.contains(&"data/traefik/acme.json"));
        assert!(!names.iter().any(|name| name.contains("logs")));

        let (_, raw) = entries
            .iter()
            .find(|(name, _)| name == METADATA_ENTRY)
            .unwrap();
        let metadata: BackupMetadata = serde_json::from_slice(raw).unwrap();
        assert_eq!(metadata.version, "1.0.0");
        assert_eq!(metadata.upgraded_to.as_deref(), Some("1.1.0"));
        assert_eq!(metadata.reason, "pre-upgrade");
    }

    #[test]
    fn test_existing_backup_is_kept() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        fs::create_dir_all(layout.backups_dir()).unwrap();
        fs::write(layout.backup_path("1.0.0"), b"earlier snapshot").unwrap();

        assert_eq!(create_pre_upgrade(&layout, "1.0.0", "1.2.0").unwrap(), None);
        assert_eq!(fs::read(layout.backup_path("1.0.0")).unwrap(), b"earlier snapshot");
    }

    #[test]
    fn test_backup_without_state_holds_metadata_only() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());

        let path = create_pre_upgrade(&layout, "0.9.0", "1.0.0").unwrap().unwrap();
        let names: Vec<String> = entries(&path).into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec![METADATA_ENTRY]);

        let leftovers: Vec<_> = fs::read_dir(layout.backups_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
