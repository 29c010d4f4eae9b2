//! [RemoteStore] on a mounted filesystem (NFS, sshfs, a second disk, ...).

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use super::{AdapterError, RemoteStore, TransferMode, TransferOptions};
use crate::util::{part_path, process};
use crate::util::progress::ProgressReader;
use crate::util::retention::ArchiveRecord;

/// Stores archive sets below a local directory.
///
/// Copies run on a helper thread bounded by a timeout, so a hung mount
/// fails the member instead of blocking the run.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
    timeout: Duration,
}

impl DirectoryStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            timeout: Duration::from_secs(3600),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolve `identifier` below the root, refusing to leave it.
    fn resolve(&self, identifier: &str) -> Result<PathBuf, AdapterError> {
        let relative = Path::new(identifier);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if identifier.is_empty() || escapes {
            return Err(AdapterError::failed(
                "directory",
                format!("{identifier:?} is no path below {}", self.root.display()),
            ));
        }
        Ok(self.root.join(relative))
    }
}

impl RemoteStore for DirectoryStore {
    fn list(&self, prefix: &str) -> Result<Vec<ArchiveRecord>, AdapterError> {
        // nothing uploaded yet
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str().filter(|n| n.starts_with(prefix)) else {
                continue;
            };
            if let Some(record) = ArchiveRecord::from_name(name) {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn delete(&self, identifier: &str) -> Result<(), AdapterError> {
        let path = self.resolve(identifier)?;
        if path.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn put(
        &self,
        local: &Path,
        remote: &str,
        options: TransferOptions,
    ) -> Result<u64, AdapterError> {
        let dest = self.resolve(remote)?;
        let part = part_path(&dest);

        let local = local.to_path_buf();
        let (written, name) = (part.clone(), remote.to_string());
        let bytes = process::bounded("directory", self.timeout, move || {
            let copy = || {
                if let Some(parent) = written.parent() {
                    fs::create_dir_all(parent)?;
                }
                match options.mode {
                    TransferMode::Streaming => stream(&local, &written, &name, options.progress),
                    TransferMode::Buffered => buffer(&local, &written, &name, options.progress),
                }
            };
            copy().map_err(|e| {
                let _ = fs::remove_file(&written);
                AdapterError::from(e)
            })
        })?;

        fs::rename(&part, &dest)?;
        Ok(bytes)
    }
}

fn stream(local: &Path, dest: &Path, name: &str, progress: bool) -> io::Result<u64> {
    let file = File::open(local)?;
    let total = file.metadata()?.len();
    let mut reader: Box<dyn Read + '_> = if progress {
        Box::new(ProgressReader::new(BufReader::new(file), name, Some(total)))
    } else {
        Box::new(BufReader::new(file))
    };
    let mut writer = BufWriter::new(File::create(dest)?);
    let bytes = io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    Ok(bytes)
}

fn buffer(local: &Path, dest: &Path, name: &str, progress: bool) -> io::Result<u64> {
    let content = fs::read(local)?;
    fs::write(dest, &content)?;
    if progress {
        log::info!(target: "upload::progress", "{name}: {} bytes", content.len());
    }
    Ok(content.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(mode: TransferMode) -> TransferOptions {
        TransferOptions {
            mode,
            progress: true,
        }
    }

    #[test]
    fn put_in_both_modes() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let file = local.path().join("www.tar.gz");
        fs::write(&file, vec![1u8; 4096]).unwrap();

        let store = DirectoryStore::new(remote.path());
        for (mode, name) in [
            (TransferMode::Streaming, "20240101-020000/www.tar.gz"),
            (TransferMode::Buffered, "20240102-020000/www.tar.gz"),
        ] {
            let bytes = store.put(&file, name, options(mode)).unwrap();
            assert_eq!(bytes, 4096);
            assert_eq!(fs::read(remote.path().join(name)).unwrap().len(), 4096);
            assert!(!part_path(&remote.path().join(name)).exists());
        }
    }

    #[test]
    fn list_and_delete_archive_sets() {
        let remote = tempfile::tempdir().unwrap();
        fs::create_dir_all(remote.path().join("20240101-020000")).unwrap();
        fs::create_dir_all(remote.path().join("20240201-020000")).unwrap();
        fs::create_dir_all(remote.path().join("photos")).unwrap();

        let store = DirectoryStore::new(remote.path());
        let mut names: Vec<_> = store.list("").unwrap().into_iter().map(|r| r.name).collect();
        names.sort();
        assert_eq!(names, ["20240101-020000", "20240201-020000"]);
        assert_eq!(store.list("202402").unwrap().len(), 1);

        store.delete("20240101-020000").unwrap();
        assert!(!remote.path().join("20240101-020000").exists());
    }

    #[test]
    fn refuses_to_leave_root() {
        let remote = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(remote.path());
        assert!(store.delete("../etc").is_err());
        assert!(store.delete("/etc").is_err());
        assert!(store.delete("").is_err());
    }

    #[test]
    fn failed_put_leaves_no_file() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(remote.path());

        let missing = local.path().join("missing.sql");
        let err = store.put(&missing, "20240101-020000/missing.sql", options(TransferMode::Streaming));
        assert!(err.is_err());
        assert!(!remote.path().join("20240101-020000/missing.sql").exists());
        assert!(!remote.path().join("20240101-020000/missing.sql.part").exists());
    }

    #[test]
    fn missing_root_lists_nothing() {
        let remote = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(&remote.path().join("not-created-yet"));
        assert!(store.list("").unwrap().is_empty());
    }

    #[test]
    fn put_creates_missing_root() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let file = local.path().join("gametic.sql");
        fs::write(&file, b"CREATE TABLE node;").unwrap();

        let root = remote.path().join("not-created-yet");
        let store = DirectoryStore::new(&root);
        store
            .put(&file, "20240101-020000/gametic.sql", options(TransferMode::Buffered))
            .unwrap();
        assert_eq!(store.list("").unwrap().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn hung_copy_times_out() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        // opening a fifo without a writer blocks like a dead mount
        let fifo = local.path().join("stuck.sql");
        let status = std::process::Command::new("mkfifo").arg(&fifo).status().unwrap();
        assert!(status.success());

        let store = DirectoryStore::new(remote.path()).with_timeout(Duration::from_millis(200));
        let err = store
            .put(&fifo, "20240101-020000/stuck.sql", options(TransferMode::Streaming))
            .unwrap_err();

        assert!(matches!(err, AdapterError::Timeout { .. }));
        assert!(!remote.path().join("20240101-020000/stuck.sql").exists());
    }
}
