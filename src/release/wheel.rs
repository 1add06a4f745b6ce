// src/release/wheel.rs

//! Service wheels installed into a per-version virtualenv
//!
//! The wheel is kept in `cli/`, the virtualenv lives in `cli/venv`, and
//! `bin/syrvis` is a shim that runs the console script with the venv's own
//! interpreter. pip writes absolute shebangs into console scripts, and those
//! point into the staging directory the venv was built in, so the shim never
//! executes the script directly.

use crate::error::{Error, Result};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Interpreter used to create virtualenvs
pub const DEFAULT_PYTHON: &str = "python3";

/// File suffix of Python wheels
pub const WHEEL_SUFFIX: &str = ".whl";

const SHIM: &str = r#"#!/bin/sh
# Generated by syrvisctl: runs the syrvis console script from this version's virtualenv
HERE="$(cd "$(dirname "$0")/.." && pwd)"
exec "$HERE/cli/venv/bin/python" "$HERE/cli/venv/bin/syrvis" "$@"
"#;

/// Builds a version directory from a service wheel
#[derive(Debug, Clone)]
pub struct WheelInstaller {
    python: PathBuf,
}

impl Default for WheelInstaller {
    fn default() -> Self {
        Self::new(DEFAULT_PYTHON)
    }
}

impl WheelInstaller {
    pub fn new(python: impl Into<PathBuf>) -> Self {
        Self {
            python: python.into(),
        }
    }

    /// Install `wheel` into `dest/cli/venv` and write `dest/bin/syrvis`
    pub fn install(&self, wheel: &Path, dest: &Path) -> Result<()> {
        let name = wheel.file_name().ok_or_else(|| {
            Error::InvalidArgument(format!("{} is not a wheel file", wheel.display()))
        })?;

        let cli_dir = dest.join("cli");
        fs::create_dir_all(&cli_dir)?;
        let local_wheel = cli_dir.join(name);
        fs::copy(wheel, &local_wheel)?;

        let venv = cli_dir.join("venv");
        info!("Creating virtualenv {}", venv.display());
        run(Command::new(&self.python).arg("-m").arg("venv").arg(&venv))?;

        info!("Installing {}", name.to_string_lossy());
        run(Command::new(venv.join("bin/python"))
            .args(["-m", "pip", "install", "--quiet", "--no-input"])
            .arg("--disable-pip-version-check")
            .arg(&local_wheel))?;

        if !venv.join("bin/syrvis").is_file() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} does not provide a syrvis command", name.to_string_lossy()),
            )));
        }

        let bin_dir = dest.join("bin");
        fs::create_dir_all(&bin_dir)?;
        let shim = bin_dir.join("syrvis");
        fs::write(&shim, SHIM)?;
        fs::set_permissions(&shim, fs::Permissions::from_mode(0o755))?;

        debug!("Wrote {}", shim.display());
        Ok(())
    }
}

fn run(command: &mut Command) -> Result<()> {
    let program = command.get_program().to_string_lossy().into_owned();
    let output = command
        .output()
        .map_err(|e| io::Error::new(e.kind(), format!("failed to run {}: {}", program, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Io(io::Error::other(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            stderr.trim()
        ))));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// Stand-in interpreter: `-m venv DIR` copies itself to `DIR/bin/python`,
    /// `-m pip install` drops a `syrvis` script beside it, anything else runs
    /// through /bin/sh
    const FAKE_PYTHON: &str = r#"#!/bin/sh
if [ "$1" = "-m" ] && [ "$2" = "venv" ]; then
    mkdir -p "$3/bin" && cp "$0" "$3/bin/python"
    exit $?
fi
if [ "$1" = "-m" ] && [ "$2" = "pip" ]; then
    printf 'echo "syrvis $*"\n' > "$(dirname "$0")/syrvis"
    exit 0
fi
exec /bin/sh "$@"
"#;

    pub fn fake_python(dir: &Path) -> PathBuf {
        let path = dir.join("python3");
        fs::write(&path, FAKE_PYTHON).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::fake_python;
    use super::*;
    use tempfile::TempDir;

    fn wheel(dir: &Path) -> PathBuf {
        let path = dir.join("syrviscore-0.2.0-py3-none-any.whl");
        fs::write(&path, b"PK\x03\x04").unwrap();
        path
    }

    #[test]
    fn test_install_builds_venv_and_shim() {
        let dir = TempDir::new().unwrap();
        let installer = WheelInstaller::new(fake_python(dir.path()));
        let dest = dir.path().join("staging");
        fs::create_dir(&dest).unwrap();

        installer.install(&wheel(dir.path()), &dest).unwrap();

        assert!(dest.join("cli/syrviscore-0.2.0-py3-none-any.whl").is_file());
        assert!(dest.join("cli/venv/bin/syrvis").is_file());
        let mode = fs::metadata(dest.join("bin/syrvis")).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn test_shim_survives_relocation() {
        let dir = TempDir::new().unwrap();
        let installer = WheelInstaller::new(fake_python(dir.path()));
        let staging = dir.path().join(".staging-0.2.0");
        fs::create_dir(&staging).unwrap();
        installer.install(&wheel(dir.path()), &staging).unwrap();

        let final_dir = dir.path().join("0.2.0");
        fs::rename(&staging, &final_dir).unwrap();

        let output = Command::new(final_dir.join("bin/syrvis"))
            .arg("status")
            .output()
            .unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "syrvis status");
    }

    #[test]
    fn test_missing_interpreter_fails() {
        let dir = TempDir::new().unwrap();
        let installer = WheelInstaller::new(dir.path().join("no-such-python"));
        let dest = dir.path().join("dest");
        fs::create_dir(&dest).unwrap();

        let err = installer.install(&wheel(dir.path()), &dest).unwrap_err();
        assert!(err.to_string().contains("no-such-python"));
        assert!(!dest.join("bin/syrvis").exists());
    }

    #[test]
    fn test_wheel_without_console_script_fails() {
        let dir = TempDir::new().unwrap();
        let python = fake_python(dir.path());
        // venv creation only, the install step is a no-op
        fs::write(
            &python,
            "#!/bin/sh\n[ \"$2\" = venv ] && mkdir -p \"$3/bin\" && cp \"$0\" \"$3/bin/python\"\nexit 0\n",
        )
        .unwrap();
        let dest = dir.path().join("dest");
        fs::create_dir(&dest).unwrap();

        let err = WheelInstaller::new(python)
            .install(&wheel(dir.path()), &dest)
            .unwrap_err();
        assert!(err.to_string().contains("does not provide a syrvis command"));
    }
}
