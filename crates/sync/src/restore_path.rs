//! Where restored files land.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::SyncError;

/// Gives up after this many taken ` (N)` names.
const MAX_SUFFIX: u32 = 10_000;

/// Checks that a stored file name is a single plain path component.
///
/// Restores join the name onto a destination directory, so it must not be
/// able to escape it: empty names, absolute paths, separators, `.` and `..`
/// are all rejected.
pub(crate) fn validate_restore_name(name: &str) -> Result<(), SyncError> {
    let invalid = |why: &str| Err(SyncError::InvalidName(format!("{why}: {name:?}")));
    if name.is_empty() {
        return invalid("empty name");
    }
    if name.contains('/') || name.contains('\\') {
        return invalid("path separators not allowed");
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        (Some(Component::ParentDir | Component::CurDir), _) => {
            invalid("relative directory not allowed")
        }
        (Some(Component::RootDir | Component::Prefix(_)), _) => {
            invalid("absolute path not allowed")
        }
        _ => invalid("not a single path component"),
    }
}

/// `name` for `n == 0`, otherwise `stem (n).ext`.
fn candidate(name: &str, n: u32) -> String {
    if n == 0 {
        return name.to_string();
    }
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{} ({n}){}", &name[..dot], &name[dot..]),
        _ => format!("{name} ({n})"),
    }
}

/// Moves `part` to `dir/name`, or to `dir/stem (N).ext` with the smallest
/// free `N`. Never replaces an existing file.
///
/// Each name is claimed with an exclusive create before the rename, so two
/// restores of the same name cannot pick the same target.
pub(crate) async fn place_unique(
    part: &Path,
    dir: &Path,
    name: &str,
) -> Result<PathBuf, SyncError> {
    validate_restore_name(name)?;

    for n in 0..=MAX_SUFFIX {
        let dest = dir.join(candidate(name, n));
        let claim = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&dest)
            .await;
        match claim {
            Ok(file) => {
                drop(file);
                if let Err(e) = tokio::fs::rename(part, &dest).await {
                    let _ = tokio::fs::remove_file(&dest).await;
                    return Err(e.into());
                }
                return Ok(dest);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(path = ?dest, "restore name taken");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(SyncError::InvalidName(format!(
        "no free name for {name:?} after {MAX_SUFFIX} attempts"
    )))
}
