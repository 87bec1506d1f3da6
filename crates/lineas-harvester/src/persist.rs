use crate::error::{HarvestError, Result};
use serde::Serialize;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use tempfile::NamedTempFile;

pub(crate) const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Replace `path` with `contents` so that readers see either the old or the new file.
pub(crate) fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    write_and_persist(path, contents, true).map_err(|e| HarvestError::persistence(path, e))
}

/// Like [`atomic_write`] but never replaces an existing file.
///
/// Returns `false` when `path` already exists.
pub(crate) fn atomic_create(path: &Path, contents: &[u8]) -> Result<bool> {
    match write_and_persist(path, contents, false) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(HarvestError::persistence(path, e)),
    }
}

/// Copy `from` to `to` with the same durability as [`atomic_write`].
pub(crate) fn durable_copy(from: &Path, to: &Path) -> Result<()> {
    let contents = fs::read(from).map_err(|e| HarvestError::persistence(from, e))?;
    atomic_write(to, &contents)
}

fn write_and_persist(path: &Path, contents: &[u8], replace: bool) -> std::io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(contents)?;
    temp.flush()?;
    temp.as_file().sync_all()?;
    if replace {
        temp.persist(path).map_err(|e| e.error)?;
    } else {
        temp.persist_noclobber(path).map_err(|e| e.error)?;
    }
    Ok(())
}

pub(crate) fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &json)
}

pub(crate) fn strip_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_replaces_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("data.csv");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(leftovers.len(), 1, "temp files must not linger");
    }

    #[test]
    fn test_atomic_write_failure_keeps_original() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.csv");
        atomic_write(&path, b"original").unwrap();

        // A directory in the way makes the rename fail
        let blocked = tmp.path().join("blocked");
        fs::create_dir_all(blocked.join("child")).unwrap();
        let err = atomic_write(&blocked, b"new").unwrap_err();
        assert!(matches!(err, HarvestError::Persistence { .. }));

        assert_eq!(fs::read(&path).unwrap(), b"original");
    }

    #[test]
    fn test_atomic_create_keeps_existing_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("backup.csv");

        assert!(atomic_create(&path, b"first").unwrap());
        assert!(!atomic_create(&path, b"second").unwrap());

        assert_eq!(fs::read(&path).unwrap(), b"first");
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_durable_copy() {
        let tmp = TempDir::new().unwrap();
        let from = tmp.path().join("rucs.csv");
        let to = tmp.path().join("rucs.csv.prev");
        fs::write(&from, b"RUC\n20100047218\n").unwrap();
        fs::write(&to, b"stale").unwrap();

        durable_copy(&from, &to).unwrap();
        assert_eq!(fs::read(&to).unwrap(), fs::read(&from).unwrap());

        let err = durable_copy(&tmp.path().join("missing.csv"), &to).unwrap_err();
        assert!(matches!(err, HarvestError::Persistence { .. }));
    }

    #[test]
    fn test_strip_bom() {
        assert_eq!(strip_bom(b"\xEF\xBB\xBFRUC"), b"RUC");
        assert_eq!(strip_bom(b"RUC"), b"RUC");
    }
}
