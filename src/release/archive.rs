// src/release/archive.rs

//! Service bundles and wheels already present on local disk (offline installs)

use super::wheel::{WHEEL_SUFFIX, WheelInstaller};
use super::{Artifact, ReleaseProvider, parse_version, sha256_file, unpack_bundle};
use crate::error::{Error, Result};
use semver::Version;
use std::path::{Path, PathBuf};
use tracing::info;

const BUNDLE_PREFIX: &str = "syrviscore-";
const BUNDLE_SUFFIX: &str = ".tar.gz";

/// A prebuilt `syrviscore-<version>.tar.gz` bundle carrying `bin/syrvis`,
/// or a `syrviscore-<version>-*.whl` service wheel
#[derive(Debug, Clone)]
pub struct LocalArchive {
    path: PathBuf,
    wheels: WheelInstaller,
}

impl LocalArchive {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            wheels: WheelInstaller::default(),
        }
    }

    /// Build the virtualenv of a wheel with `installer`
    pub fn with_installer(mut self, installer: WheelInstaller) -> Self {
        self.wheels = installer;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_wheel(&self) -> bool {
        self.path.to_string_lossy().ends_with(WHEEL_SUFFIX)
    }

    /// Version encoded in the file name, if any
    pub fn file_version(&self) -> Option<Version> {
        let name = self.path.file_name()?.to_str()?;
        let rest = name.strip_prefix(BUNDLE_PREFIX)?;
        let version = match rest.strip_suffix(WHEEL_SUFFIX) {
            // name-version-python-abi-platform
            Some(wheel) => wheel.split('-').next()?,
            None => rest.strip_suffix(BUNDLE_SUFFIX)?,
        };
        parse_version(version).ok()
    }
}

impl ReleaseProvider for LocalArchive {
    fn latest(&self) -> Result<Version> {
        self.file_version().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "cannot tell the version of {}; name it {}<version>{} or pass the version explicitly",
                self.path.display(),
                BUNDLE_PREFIX,
                if self.is_wheel() { "-py3-none-any.whl" } else { BUNDLE_SUFFIX }
            ))
        })
    }

    fn fetch(&self, version: &Version, dest: &Path) -> Result<Artifact> {
        if !self.path.is_file() {
            return Err(Error::ReleaseNotFound(self.path.display().to_string()));
        }
        if let Some(named) = self.file_version()
            && &named != version
        {
            return Err(Error::InvalidArgument(format!(
                "{} contains version {}, not {}",
                self.path.display(),
                named,
                version
            )));
        }

        info!("Installing {} from {}", version, self.path.display());
        let sha256 = sha256_file(&self.path)?;
        if self.is_wheel() {
            self.wheels.install(&self.path, dest)?;
        } else {
            unpack_bundle(&self.path, dest)?;
        }

        Ok(Artifact {
            source: self.path.display().to_string(),
            sha256,
        })
    }
}
