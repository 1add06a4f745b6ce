// src/store/pointer.rs

//! The `current` symlink naming the active version
//!
//! The link is never unlinked and recreated in place: a new link is created
//! under a temporary name beside it and renamed over `current`, so a crash
//! leaves either the old or the new target.

use crate::paths::{Layout, VERSIONS_DIR};
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// What the `current` link resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pointer {
    /// No link exists
    Missing,
    /// Link names `versions/<version>`; `dangling` when that directory is gone
    Version { version: String, dangling: bool },
    /// Link exists but does not name a version directory
    Foreign(PathBuf),
}

impl Pointer {
    pub fn version(&self) -> Option<&str> {
        match self {
            Pointer::Version { version, .. } => Some(version),
            _ => None,
        }
    }
}

/// Atomically point `current` at `versions/<version>`
pub fn swap(layout: &Layout, version: &str) -> io::Result<()> {
    replace(layout, &Layout::pointer_target(version))?;
    debug!("Pointed {} at {}", layout.current_link().display(), version);
    Ok(())
}

/// Raw target of `current`, `None` when there is no link
pub fn read_target(layout: &Layout) -> io::Result<Option<PathBuf>> {
    match fs::read_link(layout.current_link()) {
        Ok(target) => Ok(Some(target)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        // not a symlink; nothing to restore
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(None),
        Err(e) => Err(e),
    }
}

/// Put back a target captured with [`read_target`]
pub fn restore(layout: &Layout, previous: Option<&Path>) -> io::Result<()> {
    match previous {
        Some(target) => replace(layout, target),
        None => match fs::remove_file(layout.current_link()) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        },
    }
}

fn replace(layout: &Layout, target: &Path) -> io::Result<()> {
    let link = layout.current_link();
    let staged = layout
        .root()
        .join(format!(".current.tmp-{}", std::process::id()));

    match fs::remove_file(&staged) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    symlink(target, &staged)?;
    if let Err(e) = fs::rename(&staged, &link) {
        let _ = fs::remove_file(&staged);
        return Err(e);
    }
    Ok(())
}

/// Inspect the `current` link
pub fn resolve(layout: &Layout) -> io::Result<Pointer> {
    let link = layout.current_link();
    let target = match fs::read_link(&link) {
        Ok(target) => target,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Pointer::Missing),
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => {
            // `current` exists but is not a symlink
            return Ok(Pointer::Foreign(link));
        }
        Err(e) => return Err(e),
    };

    let Some(version) = version_from_target(layout, &target) else {
        return Ok(Pointer::Foreign(target));
    };

    let dangling = !layout.version_dir(&version).is_dir();
    Ok(Pointer::Version { version, dangling })
}

fn version_from_target(layout: &Layout, target: &Path) -> Option<String> {
    let rest = if target.is_absolute() {
        target.strip_prefix(layout.versions_dir()).ok()?
    } else {
        target.strip_prefix(VERSIONS_DIR).ok()?
    };

    let mut components = rest.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => Some(name.to_string_lossy().into_owned()),
        _ => None,
    }
}
