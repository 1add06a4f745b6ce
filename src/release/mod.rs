// src/release/mod.rs

//! Release providers and service bundle handling
//!
//! A release provider resolves version identifiers and materializes the
//! service bundle for a version into a directory:
//! - `github`: releases published on GitHub
//! - `archive`: a bundle or wheel already on local disk
//! - `wheel`: turns a service wheel into a version directory

pub mod archive;
pub mod github;
pub mod wheel;

pub use archive::LocalArchive;
pub use github::GitHubReleases;
pub use wheel::WheelInstaller;

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use semver::Version;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path};
use tar::Archive;
use tracing::debug;

/// Result of materializing a bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Where the bundle came from (URL or file path)
    pub source: String,
    /// Hex SHA-256 of the bundle archive
    pub sha256: String,
}

/// Source of installable service bundles
pub trait ReleaseProvider {
    /// Resolve the newest installable version
    fn latest(&self) -> Result<Version>;

    /// Unpack the bundle for `version` into `dest`
    ///
    /// `dest` exists and is empty. Implementations must signal
    /// `Error::ReleaseNotFound` for unknown versions and `Error::Network` /
    /// `Error::Unavailable` for transient failures.
    fn fetch(&self, version: &Version, dest: &Path) -> Result<Artifact>;
}

/// Parse a user-supplied version identifier, tolerating a leading `v`
pub fn parse_version(raw: &str) -> Result<Version> {
    let trimmed = raw.trim();
    let bare = trimmed.strip_prefix('v').unwrap_or(trimmed);
    Version::parse(bare).map_err(|_| Error::InvalidVersion(raw.to_string()))
}

/// Hex SHA-256 of a file
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Extract a `.tar.gz` service bundle into `dest`
///
/// Entries with absolute paths or `..` components are rejected. A bundle
/// wrapped in a single top-level directory is flattened.
pub fn unpack_bundle(archive_path: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(true);

    let mut count = 0usize;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        if path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsafe path in bundle: {}", path.display()),
            )));
        }

        entry.unpack_in(dest)?;
        count += 1;
    }

    if count == 0 {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            "bundle archive is empty",
        )));
    }

    hoist_single_root(dest)?;
    debug!("Unpacked {} entries into {}", count, dest.display());
    Ok(())
}

/// Move the contents of a lone top-level directory up into `dest`
fn hoist_single_root(dest: &Path) -> Result<()> {
    let entries: Vec<fs::DirEntry> = fs::read_dir(dest)?.collect::<io::Result<_>>()?;
    let [only] = entries.as_slice() else {
        return Ok(());
    };
    if !only.file_type()?.is_dir() || only.file_name() == "bin" {
        return Ok(());
    }

    let wrapper = only.path();
    for child in fs::read_dir(&wrapper)? {
        let child = child?;
        fs::rename(child.path(), dest.join(child.file_name()))?;
    }
    fs::remove_dir(&wrapper)?;
    Ok(())
}
