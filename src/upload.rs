//! Upload of an [ArchiveSet] to the [RemoteStore].
//!
//! In low-memory mode members are streamed one at a time; otherwise they are
//! handed over whole and several transfers may run at once.

use std::fs;
use std::io;
use std::path::PathBuf;

use crate::backends::{RemoteStore, TransferMode, TransferOptions};
use crate::config::General;
use crate::run::{ArchiveSet, ItemOutcome};
use crate::util::is_part_file;
use crate::util::items::process_items;

#[derive(Debug, Clone, Copy)]
pub struct UploadStrategy {
    /// Never hold a whole member in memory and transfer one member at a time.
    pub low_memory: bool,
    /// Log transfer progress.
    pub progress: bool,
    /// Transfers running at once outside of low-memory mode.
    pub concurrency: usize,
}

impl UploadStrategy {
    pub fn from_config(general: &General) -> Self {
        Self {
            low_memory: general.low_memory,
            progress: general.upload_progress,
            concurrency: general.concurrency,
        }
    }

    pub fn mode(&self) -> TransferMode {
        if self.low_memory {
            TransferMode::Streaming
        } else {
            TransferMode::Buffered
        }
    }

    /// Transfers allowed to run at once.
    pub fn concurrency(&self) -> usize {
        if self.low_memory {
            1
        } else {
            self.concurrency.max(1)
        }
    }

    /// Upload every member of `set` to `<run_id>/<file name>`.
    ///
    /// A failed member doesn't stop the upload of the remaining members.
    pub fn upload(&self, set: &ArchiveSet, store: &dyn RemoteStore) -> io::Result<Vec<ItemOutcome>> {
        let members = members(set)?;
        let options = TransferOptions {
            mode: self.mode(),
            progress: self.progress,
        };
        log::info!(
            target: "upload",
            "Uploading {} file(s) of {} ({:?}, {} at once)",
            members.len(),
            set.run_id(),
            options.mode,
            self.concurrency()
        );

        Ok(process_items(&members, self.concurrency(), |(name, path)| {
            let remote = format!("{}/{name}", set.run_id());
            match store.put(path, &remote, options) {
                Ok(bytes) => {
                    log::debug!(target: "upload", "Uploaded {remote} ({bytes} bytes)");
                    ItemOutcome::done(name).bytes(bytes)
                }
                Err(e) => {
                    log::error!(target: "upload", "Uploading {remote} failed: {e}");
                    ItemOutcome::with_status(name, e.into())
                }
            }
        }))
    }
}

/// Files of `set` in name order, without partially written ones.
///
/// A set whose directory doesn't exist has no members.
fn members(set: &ArchiveSet) -> io::Result<Vec<(String, PathBuf)>> {
    let entries = match fs::read_dir(set.dir()) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut members = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() || is_part_file(&path) {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            members.push((name.to_string(), path));
        }
    }
    members.sort();
    Ok(members)
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    use chrono::NaiveDateTime;

    use super::*;
    use crate::backends::AdapterError;
    use crate::run::{ItemStatus, RunId};
    use crate::util::retention::ArchiveRecord;

    /// Refuses buffered transfers of files above `max_buffer` bytes, the way a
    /// host with a memory cap would kill the process.
    #[derive(Default)]
    struct RecordingStore {
        max_buffer: u64,
        fail: Option<&'static str>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        puts: Mutex<Vec<(String, TransferMode)>>,
    }

    impl RemoteStore for RecordingStore {
        fn list(&self, _prefix: &str) -> Result<Vec<ArchiveRecord>, AdapterError> {
            Ok(Vec::new())
        }

        fn delete(&self, _identifier: &str) -> Result<(), AdapterError> {
            Ok(())
        }

        fn put(&self, local: &Path, remote: &str, options: TransferOptions) -> Result<u64, AdapterError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(10));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            self.puts
                .lock()
                .unwrap()
                .push((remote.to_string(), options.mode));

            if self.fail.is_some_and(|f| remote.ends_with(f)) {
                return Err(AdapterError::failed("fake", "quota exceeded"));
            }
            let size = fs::metadata(local)?.len();
            if options.mode == TransferMode::Buffered && size > self.max_buffer {
                return Err(AdapterError::failed("fake", "out of memory"));
            }
            Ok(size)
        }
    }

    fn archive_set(files: &[(&str, usize)]) -> (tempfile::TempDir, ArchiveSet) {
        let root = tempfile::tempdir().unwrap();
        let started = NaiveDateTime::parse_from_str("2024-03-01 02:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        let set = ArchiveSet::new(root.path(), RunId::new(started));
        fs::create_dir_all(set.dir()).unwrap();
        for (name, size) in files {
            fs::write(set.dir().join(name), vec![0u8; *size]).unwrap();
        }
        (root, set)
    }

    fn strategy(low_memory: bool) -> UploadStrategy {
        UploadStrategy {
            low_memory,
            progress: false,
            concurrency: 4,
        }
    }

    #[test]
    fn low_memory_streams_one_member_at_a_time() {
        let (_root, set) = archive_set(&[("a.tar.gz", 64), ("b.tar.gz", 64), ("c.sql", 4096), ("d.sql", 64)]);
        let store = RecordingStore {
            max_buffer: 1024,
            ..Default::default()
        };

        let outcomes = strategy(true).upload(&set, &store).unwrap();

        assert!(outcomes.iter().all(|o| o.status == ItemStatus::Done));
        assert_eq!(store.peak.load(Ordering::SeqCst), 1);
        let puts = store.puts.lock().unwrap();
        assert!(puts.iter().all(|(_, mode)| *mode == TransferMode::Streaming));
        let order: Vec<_> = puts.iter().map(|(remote, _)| remote.as_str()).collect();
        assert_eq!(
            order,
            [
                "20240301-020000/a.tar.gz",
                "20240301-020000/b.tar.gz",
                "20240301-020000/c.sql",
                "20240301-020000/d.sql",
            ]
        );
    }

    #[test]
    fn buffered_mode_overflows_where_low_memory_does_not() {
        let (_root, set) = archive_set(&[("huge.sql", 4096)]);
        let store = RecordingStore {
            max_buffer: 1024,
            ..Default::default()
        };

        let outcomes = strategy(false).upload(&set, &store).unwrap();
        assert!(outcomes[0].status.is_failure());

        let outcomes = strategy(true).upload(&set, &store).unwrap();
        assert_eq!(outcomes[0].status, ItemStatus::Done);
        assert_eq!(outcomes[0].bytes, Some(4096));
    }

    #[test]
    fn standard_mode_runs_transfers_in_parallel() {
        let files: Vec<_> = (0..8).map(|i| (format!("part{i}.tar.gz"), 16)).collect();
        let files: Vec<_> = files.iter().map(|(n, s)| (n.as_str(), *s)).collect();
        let (_root, set) = archive_set(&files);
        let store = RecordingStore {
            max_buffer: u64::MAX,
            ..Default::default()
        };

        let outcomes = strategy(false).upload(&set, &store).unwrap();
        assert_eq!(outcomes.len(), 8);
        assert!(store.peak.load(Ordering::SeqCst) <= 4);
        assert!(store
            .puts
            .lock()
            .unwrap()
            .iter()
            .all(|(_, mode)| *mode == TransferMode::Buffered));
    }

    #[test]
    fn failed_member_does_not_abort_the_rest() {
        let (_root, set) = archive_set(&[("gametic.sql", 32), ("proyecto.tar.gz", 32)]);
        let store = RecordingStore {
            max_buffer: u64::MAX,
            fail: Some("gametic.sql"),
            ..Default::default()
        };

        let outcomes = strategy(false).upload(&set, &store).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].status.is_failure());
        assert_eq!(outcomes[1].name, "proyecto.tar.gz");
        assert_eq!(outcomes[1].bytes, Some(32));
    }

    #[test]
    fn skips_partial_files_and_missing_sets() {
        let (root, set) = archive_set(&[("www.tar.gz", 8), ("db.sql.part", 8)]);
        let store = RecordingStore {
            max_buffer: u64::MAX,
            ..Default::default()
        };
        let outcomes = strategy(false).upload(&set, &store).unwrap();
        assert_eq!(outcomes.len(), 1);

        let missing = ArchiveSet::new(&root.path().join("nowhere"), set.run_id());
        assert!(strategy(false).upload(&missing, &store).unwrap().is_empty());
    }
}
