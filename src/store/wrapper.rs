// src/store/wrapper.rs

//! `<home>/bin/syrvis`, the stable command that dispatches to the active version

use crate::error::Result;
use crate::paths::{CURRENT_LINK, ENTRY_POINT, HOME_ENV, Layout};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use tracing::debug;

fn render(layout: &Layout) -> String {
    format!(
        r#"#!/bin/sh
# SyrvisCore CLI wrapper
# Generated by syrvisctl; rewritten on every activation.

INSTALL_DIR="{home}"
export {env}="${{INSTALL_DIR}}"

if [ -L "${{INSTALL_DIR}}/{current}" ]; then
    exec "${{INSTALL_DIR}}/{current}/{entry}" "$@"
fi

echo "Error: no service version installed." >&2
echo "Run 'syrvisctl install' to install a service version." >&2
exit 1
"#,
        home = layout.root().display(),
        env = HOME_ENV,
        current = CURRENT_LINK,
        entry = ENTRY_POINT,
    )
}

/// Write the wrapper script, replacing any previous one atomically
pub fn write(layout: &Layout) -> Result<()> {
    let bin_dir = layout.bin_dir();
    fs::create_dir_all(&bin_dir)?;

    let mut temp = tempfile::Builder::new()
        .prefix(".syrvis.")
        .tempfile_in(&bin_dir)?;
    temp.write_all(render(layout).as_bytes())?;
    temp.as_file()
        .set_permissions(fs::Permissions::from_mode(0o755))?;
    temp.persist(layout.wrapper_path())
        .map_err(|e| crate::Error::Io(e.error))?;

    debug!("Wrote wrapper {}", layout.wrapper_path().display());
    Ok(())
}
