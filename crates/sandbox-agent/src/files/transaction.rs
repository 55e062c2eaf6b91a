//! Sibling-temp-file writes with rollback.

use super::FileOpError;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Ownership and mode to stamp onto a freshly written file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileOwnership {
    pub mode: u32,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// The state of the target before the write, held until the edit is judged.
#[derive(Debug)]
pub struct Snapshot {
    path: PathBuf,
    original: Option<Vec<u8>>,
    ownership: Option<FileOwnership>,
}

impl Snapshot {
    pub fn capture(path: &Path) -> Result<Self, FileOpError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Self {
                path: path.to_path_buf(),
                original: Some(bytes),
                ownership: Some(ownership_of(path)?),
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self {
                path: path.to_path_buf(),
                original: None,
                ownership: None,
            }),
            Err(err) => Err(FileOpError::io(path, err)),
        }
    }

    pub fn existed(&self) -> bool {
        self.original.is_some()
    }

    pub fn original_text(&self) -> Option<String> {
        self.original
            .as_ref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn ownership(&self) -> Option<FileOwnership> {
        self.ownership
    }

    /// Put the target back the way it was: rewrite the original bytes or
    /// remove a file the transaction created.
    pub fn rollback(self) -> Result<(), FileOpError> {
        match (&self.original, self.ownership) {
            (Some(bytes), Some(ownership)) => {
                write_atomic(&self.path, bytes, ownership).map(|_| ())
            }
            _ => match fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(FileOpError::io(&self.path, err)),
            },
        }
    }
}

/// Write `bytes` to a temp file next to `path` and rename it over the target.
///
/// Returns a warning when ownership could not be applied; the content is
/// committed either way.
pub fn write_atomic(
    path: &Path,
    bytes: &[u8],
    ownership: FileOwnership,
) -> Result<Option<String>, FileOpError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(parent).map_err(|err| FileOpError::io(parent, err))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.flush())
        .map_err(|err| FileOpError::io(path, err))?;
    set_mode(tmp.path(), ownership.mode).map_err(|err| FileOpError::io(path, err))?;
    let warning = set_owner(tmp.path(), ownership.uid, ownership.gid).err().map(|err| {
        format!(
            "[Warning: could not set ownership of {} ({err})]",
            path.display()
        )
    });
    tmp.persist(path)
        .map_err(|err| FileOpError::io(path, err.error))?;
    Ok(warning)
}

#[cfg(unix)]
fn ownership_of(path: &Path) -> Result<FileOwnership, FileOpError> {
    use std::os::unix::fs::MetadataExt;
    let meta = fs::metadata(path).map_err(|err| FileOpError::io(path, err))?;
    Ok(FileOwnership {
        mode: meta.mode() & 0o7777,
        uid: Some(meta.uid()),
        gid: Some(meta.gid()),
    })
}

#[cfg(not(unix))]
fn ownership_of(_path: &Path) -> Result<FileOwnership, FileOpError> {
    Ok(FileOwnership {
        mode: 0o644,
        uid: None,
        gid: None,
    })
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_owner(path: &Path, uid: Option<u32>, gid: Option<u32>) -> std::io::Result<()> {
    use std::os::unix::fs::MetadataExt;
    if uid.is_none() && gid.is_none() {
        return Ok(());
    }
    let meta = fs::metadata(path)?;
    if uid.map_or(true, |uid| uid == meta.uid()) && gid.map_or(true, |gid| gid == meta.gid()) {
        return Ok(());
    }
    std::os::unix::fs::chown(path, uid, gid)
}

#[cfg(not(unix))]
fn set_owner(_path: &Path, _uid: Option<u32>, _gid: Option<u32>) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PLAIN: FileOwnership = FileOwnership {
        mode: 0o644,
        uid: None,
        gid: None,
    };

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_write_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a.txt");
        assert_eq!(write_atomic(&target, b"one\n", PLAIN).unwrap(), None);
        write_atomic(&target, b"two\n", PLAIN).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"two\n");
        assert_eq!(entries(dir.path()), vec!["a.txt"]);
    }

    #[test]
    fn test_rollback_restores_original() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a.txt");
        fs::write(&target, "keep\n").unwrap();
        let snapshot = Snapshot::capture(&target).unwrap();
        assert!(snapshot.existed());
        write_atomic(&target, b"broken\n", PLAIN).unwrap();
        snapshot.rollback().unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "keep\n");
    }

    #[test]
    fn test_rollback_removes_created_file() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("new.sh");
        let snapshot = Snapshot::capture(&target).unwrap();
        assert!(!snapshot.existed());
        write_atomic(&target, b"if\n", PLAIN).unwrap();
        snapshot.rollback().unwrap();
        assert!(!target.exists());
        assert!(entries(dir.path()).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_existing_mode_is_preserved() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("run.sh");
        fs::write(&target, "echo\n").unwrap();
        fs::set_permissions(&target, fs::Permissions::from_mode(0o755)).unwrap();
        let snapshot = Snapshot::capture(&target).unwrap();
        let ownership = snapshot.ownership().unwrap();
        assert_eq!(ownership.mode, 0o755);
        write_atomic(&target, b"echo hi\n", ownership).unwrap();
        let mode = fs::metadata(&target).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o755);
    }
}
