//! Filesystem preparation done before the server starts: installing config
//! templates and handing the data directory to the runtime user.

use std::fs::{self, File, Permissions};
use std::io;
use std::os::unix::fs::{PermissionsExt, chown, lchown};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{RuntimeUser, TemplateSpec};
use crate::error::{EntrypointError, Result};

const CONFIG_FILE_MODE: u32 = 0o644;

/// Copy every template into `config_dir`, overwriting what is there.
///
/// Each file is written to a hidden sibling and renamed into place, so running
/// this on every start is safe. Missing template sources are skipped. Returns
/// the destinations that were written.
pub fn install_templates(
    templates: &[TemplateSpec],
    config_dir: &Path,
    owner: Option<RuntimeUser>,
) -> Result<Vec<PathBuf>> {
    let setup_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: io::Error| EntrypointError::Setup { path, source }
    };

    fs::create_dir_all(config_dir).map_err(setup_err(config_dir))?;

    let mut installed = Vec::with_capacity(templates.len());
    for template in templates {
        // Any readable non-directory source counts, including pipes.
        if !template.source.exists() || template.source.is_dir() {
            warn!(source = %template.source.display(), "config template missing, skipping");
            continue;
        }
        let dest = config_dir.join(&template.file_name);
        install_one(&template.source, &dest, owner).map_err(setup_err(&dest))?;
        debug!(source = %template.source.display(), dest = %dest.display(), "installed config template");
        installed.push(dest);
    }
    Ok(installed)
}

fn install_one(source: &Path, dest: &Path, owner: Option<RuntimeUser>) -> io::Result<()> {
    let file_name = dest.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let staging = dest.with_file_name(format!(".{file_name}.tmp"));

    io::copy(&mut File::open(source)?, &mut File::create(&staging)?)?;
    fs::set_permissions(&staging, Permissions::from_mode(CONFIG_FILE_MODE))?;
    if let Some(user) = owner {
        chown(&staging, Some(user.uid), Some(user.gid))?;
    }
    fs::rename(&staging, dest)
}

/// Create the data directory if needed and recursively hand it to `owner`.
pub fn prepare_data_dir(data_dir: &Path, owner: Option<RuntimeUser>) -> Result<()> {
    let setup_err = |source| EntrypointError::Setup { path: data_dir.to_path_buf(), source };
    fs::create_dir_all(data_dir).map_err(setup_err)?;
    if let Some(user) = owner {
        chown_recursive(data_dir, user).map_err(setup_err)?;
        info!(path = %data_dir.display(), uid = user.uid, gid = user.gid, "data directory ownership updated");
    }
    Ok(())
}

/// Symlinks are re-owned themselves, never followed.
fn chown_recursive(path: &Path, user: RuntimeUser) -> io::Result<()> {
    lchown(path, Some(user.uid), Some(user.gid))?;
    if fs::symlink_metadata(path)?.is_dir() {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                chown_recursive(&entry.path(), user)?;
            } else {
                lchown(entry.path(), Some(user.uid), Some(user.gid))?;
            }
        }
    }
    Ok(())
}
