// src/error.rs

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Core error types for syrvisctl
#[derive(Error, Debug)]
pub enum Error {
    /// Install called for an identifier that is already present
    #[error("version {0} is already installed; use 'syrvisctl activate {0}' instead")]
    VersionAlreadyInstalled(String),

    /// Activate/rollback/uninstall target not present
    #[error("version {0} is not installed; run 'syrvisctl list' to see installed versions")]
    VersionNotFound(String),

    /// Rollback with no eligible predecessor in history
    #[error("no previous version available for rollback")]
    NoRollbackTarget,

    /// Uninstall targeting the active version
    #[error("cannot uninstall active version {0}; activate another version first")]
    CannotUninstallActive(String),

    /// Version directory exists but has no usable entry point
    #[error("version {version} is incomplete: {reason}")]
    IncompleteVersion { version: String, reason: String },

    /// Artifact fetch/unpack error, the store is left unchanged
    #[error("failed to install version {version}: {source}")]
    InstallFailed {
        version: String,
        #[source]
        source: Box<Error>,
    },

    /// Manifest fails to parse or violates the single-active invariant
    #[error("manifest is corrupt: {0}; repair it by hand before making changes")]
    ManifestCorrupt(String),

    /// Another process holds the mutation lock
    #[error("another syrvisctl process is modifying the installation (waited {}s)", .waited.as_secs())]
    ManifestLocked { path: PathBuf, waited: Duration },

    /// One or more removals failed during cleanup
    #[error(
        "cleanup removed {} version(s) but failed for {}",
        .removed.len(),
        format_failures(.failures)
    )]
    CleanupPartialFailure {
        removed: Vec<String>,
        failures: Vec<(String, String)>,
    },

    /// Atomic replacement of the `current` symlink failed
    #[error("failed to switch the active version pointer: {0}")]
    PointerSwapFailed(#[source] std::io::Error),

    /// The release provider has no such version
    #[error("release {0} not found")]
    ReleaseNotFound(String),

    /// Transport failure talking to the release provider
    #[error("network error: {0}")]
    Network(String),

    /// The release provider answered but refused to serve the request
    #[error("release service unavailable: {0}")]
    Unavailable(String),

    /// Version identifier is not a semantic version
    #[error("invalid version '{0}': expected a semantic version such as 1.2.0")]
    InvalidVersion(String),

    /// Caller supplied an argument outside its domain
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No installation root could be determined
    #[error("{0}")]
    HomeNotFound(String),

    /// Service controller stop/start failure
    #[error("service command failed: {0}")]
    Service(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Process exit code for this error kind
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::VersionAlreadyInstalled(_) => 10,
            Error::VersionNotFound(_) => 11,
            Error::NoRollbackTarget => 12,
            Error::CannotUninstallActive(_) => 13,
            Error::InstallFailed { .. } => 14,
            Error::ManifestCorrupt(_) => 15,
            Error::ManifestLocked { .. } => 16,
            Error::CleanupPartialFailure { .. } => 17,
            Error::PointerSwapFailed(_) => 18,
            Error::IncompleteVersion { .. } => 19,
            Error::ReleaseNotFound(_) => 20,
            Error::Network(_) | Error::Unavailable(_) => 21,
            Error::HomeNotFound(_) => 22,
            Error::InvalidVersion(_) | Error::InvalidArgument(_) => 23,
            Error::Service(_) | Error::Io(_) => 1,
        }
    }
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(version, reason)| format!("{version} ({reason})"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias using syrvisctl's Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_per_kind() {
        let errors = [
            Error::VersionAlreadyInstalled("1.0.0".into()),
            Error::VersionNotFound("1.0.0".into()),
            Error::NoRollbackTarget,
            Error::CannotUninstallActive("1.0.0".into()),
            Error::InstallFailed {
                version: "1.0.0".into(),
                source: Box::new(Error::Network("timeout".into())),
            },
            Error::ManifestCorrupt("bad".into()),
            Error::ManifestLocked {
                path: PathBuf::from("/tmp/lock"),
                waited: Duration::from_secs(30),
            },
            Error::CleanupPartialFailure {
                removed: vec![],
                failures: vec![],
            },
            Error::PointerSwapFailed(std::io::Error::other("boom")),
        ];

        let mut codes: Vec<u8> = errors.iter().map(Error::exit_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(codes.iter().all(|&c| c > 1));
    }

    #[test]
    fn test_already_installed_message_is_actionable() {
        let msg = Error::VersionAlreadyInstalled("0.2.0".into()).to_string();
        assert_eq!(
            msg,
            "version 0.2.0 is already installed; use 'syrvisctl activate 0.2.0' instead"
        );
    }

    #[test]
    fn test_cleanup_failure_lists_versions() {
        let err = Error::CleanupPartialFailure {
            removed: vec!["0.1.0".into()],
            failures: vec![("0.2.0".into(), "permission denied".into())],
        };
        let msg = err.to_string();
        assert!(msg.contains("removed 1 version(s)"));
        assert!(msg.contains("0.2.0 (permission denied)"));
    }
}
