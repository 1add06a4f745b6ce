// src/service.rs

//! Stopping and starting the services of an installed version
//!
//! Activation treats these calls as best-effort: a failure is reported as a
//! warning and never undoes the activation itself.

use crate::error::{Error, Result};
use crate::paths::{ENTRY_POINT, HOME_ENV};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Default budget for a single stop/start call
pub const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_secs(120);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Controls the running service instance of a version
pub trait ServiceController {
    fn stop(&self, version_dir: &Path) -> Result<()>;
    fn start(&self, version_dir: &Path) -> Result<()>;
}

/// Leaves services alone (`--no-restart`)
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopController;

impl ServiceController for NoopController {
    fn stop(&self, _version_dir: &Path) -> Result<()> {
        Ok(())
    }

    fn start(&self, _version_dir: &Path) -> Result<()> {
        Ok(())
    }
}

/// Runs `<version>/bin/syrvis stop|start` with `SYRVIS_HOME` set
#[derive(Debug, Clone)]
pub struct ScriptController {
    home: PathBuf,
    timeout: Duration,
}

impl ScriptController {
    pub fn new(home: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            home: home.into(),
            timeout,
        }
    }

    fn run(&self, version_dir: &Path, action: &str) -> Result<()> {
        let entry = version_dir.join(ENTRY_POINT);
        info!("Running {} {}", entry.display(), action);

        let mut child = Command::new(&entry)
            .arg(action)
            .env(HOME_ENV, &self.home)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| Error::Service(format!("cannot run `syrvis {}`: {}", action, e)))?;

        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                debug!("`syrvis {}` finished with {}", action, status);
                if status.success() {
                    return Ok(());
                }
                return Err(Error::Service(format!(
                    "`syrvis {}` exited with {}",
                    action, status
                )));
            }

            if started.elapsed() >= self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Service(format!(
                    "`syrvis {}` timed out after {}s",
                    action,
                    self.timeout.as_secs()
                )));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl ServiceController for ScriptController {
    fn stop(&self, version_dir: &Path) -> Result<()> {
        self.run(version_dir, "stop")
    }

    fn start(&self, version_dir: &Path) -> Result<()> {
        self.run(version_dir, "start")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn version_with_script(script: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        let entry = dir.path().join(ENTRY_POINT);
        fs::create_dir_all(entry.parent().unwrap()).unwrap();
        fs::write(&entry, script).unwrap();
        fs::set_permissions(&entry, fs::Permissions::from_mode(0o755)).unwrap();
        dir
    }

    #[test]
    fn test_script_receives_action_and_home() {
        let version = version_with_script("#!/bin/sh\necho \"$1\" >> \"$SYRVIS_HOME/calls\"\n");
        let home = TempDir::new().unwrap();
        let controller = ScriptController::new(home.path(), Duration::from_secs(10));

        controller.stop(version.path()).unwrap();
        controller.start(version.path()).unwrap();

        let calls = fs::read_to_string(home.path().join("calls")).unwrap();
        assert_eq!(calls, "stop\nstart\n");
    }

    #[test]
    fn test_failing_script_is_an_error() {
        let version = version_with_script("#!/bin/sh\nexit 3\n");
        let controller = ScriptController::new("/tmp", Duration::from_secs(10));

        let err = controller.start(version.path()).unwrap_err();
        assert!(matches!(err, Error::Service(ref msg) if msg.contains("start")));
    }

    #[test]
    fn test_hanging_script_times_out() {
        let version = version_with_script("#!/bin/sh\nsleep 30\n");
        let controller = ScriptController::new("/tmp", Duration::from_millis(300));

        let started = Instant::now();
        let err = controller.stop(version.path()).unwrap_err();
        assert!(matches!(err, Error::Service(ref msg) if msg.contains("timed out")));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_missing_entry_point() {
        let dir = TempDir::new().unwrap();
        let controller = ScriptController::new("/tmp", Duration::from_secs(1));
        assert!(matches!(controller.stop(dir.path()), Err(Error::Service(_))));
    }
}
