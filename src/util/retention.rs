//! Retention of archive sets in the local and the remote pool.
//!
//! An archive set is expired once it is older than the `keep_days` of its
//! pool. The age is taken from the run id embedded in the name, never from
//! file modification times, since syncing may change those.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{NaiveDateTime, TimeDelta};
use derive_more::Display;

use crate::backends::{AdapterError, RemoteStore};
use crate::run::{ItemOutcome, RunId};
use crate::util::items::process_items;

/// Independently evaluated expiry domain.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    #[display("local")]
    Local,
    #[display("remote")]
    Remote,
}

/// An existing archive set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRecord {
    pub name: String,
    pub created_at: NaiveDateTime,
}

impl ArchiveRecord {
    /// Record for the archive set called `name`.
    ///
    /// Returns [None] for names that aren't run ids, i.e. for anything not
    /// created by us.
    pub fn from_name(name: &str) -> Option<Self> {
        let run_id = RunId::parse(name)?;
        Some(Self {
            name: name.to_string(),
            created_at: run_id.created_at(),
        })
    }
}

/// A pool of archive sets retention is applied to.
pub trait RetentionTarget: Sync {
    fn pool(&self) -> Pool;

    /// Days an archive set is kept.
    fn keep_days(&self) -> u32;

    /// All archive sets currently in the pool.
    fn enumerate(&self) -> Result<Vec<ArchiveRecord>, AdapterError>;

    fn delete(&self, name: &str) -> Result<(), AdapterError>;
}

/// Decides which archive sets are kept.
#[derive(Copy, Clone, Debug)]
pub struct Retention {
    keep: TimeDelta,
    current: RunId,
}

impl Retention {
    /// Keep archive sets for `keep_days`, and the set of the `current` run
    /// regardless of its age.
    pub fn new(keep_days: u32, current: RunId) -> Self {
        Self {
            keep: TimeDelta::days(i64::from(keep_days)),
            current,
        }
    }

    /// Returns if `record` is to be retained at `now`.
    pub fn retain(&self, record: &ArchiveRecord, now: NaiveDateTime) -> bool {
        if record.name == self.current.to_string() {
            return true;
        }
        now - record.created_at <= self.keep
    }
}

/// Archive sets of `target` expired at `now`, oldest first.
pub fn expired(
    target: &dyn RetentionTarget,
    current: RunId,
    now: NaiveDateTime,
) -> Result<Vec<ArchiveRecord>, AdapterError> {
    let retention = Retention::new(target.keep_days(), current);
    let mut expired: Vec<_> = target
        .enumerate()?
        .into_iter()
        .filter(|record| !retention.retain(record, now))
        .collect();
    expired.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(expired)
}

/// Delete every expired archive set of `target`.
///
/// All expired sets are listed before the first one is deleted. Failing to
/// delete one set doesn't keep the others from being deleted.
pub fn purge(
    target: &dyn RetentionTarget,
    current: RunId,
    now: NaiveDateTime,
    concurrency: usize,
) -> Result<Vec<ItemOutcome>, AdapterError> {
    let pool = target.pool();
    let expired = expired(target, current, now)?;
    log::info!(
        target: "retention",
        "{} expired {pool} archive set(s) older than {} days",
        expired.len(),
        target.keep_days()
    );

    Ok(process_items(&expired, concurrency, |record| {
        let result = target.delete(&record.name);
        match &result {
            Ok(()) => log::debug!(target: "retention", "Deleted {pool} archive set {}", record.name),
            Err(e) => log::error!(target: "retention", "Deleting {pool} archive set {} failed: {e}", record.name),
        }
        ItemOutcome::from_result(&record.name, result)
    }))
}

/// Archive sets below the local backup directory.
#[derive(Debug, Clone)]
pub struct LocalPool {
    root: PathBuf,
    keep_days: u32,
}

impl LocalPool {
    pub fn new(root: &Path, keep_days: u32) -> Self {
        Self {
            root: root.to_path_buf(),
            keep_days,
        }
    }
}

impl RetentionTarget for LocalPool {
    fn pool(&self) -> Pool {
        Pool::Local
    }

    fn keep_days(&self) -> u32 {
        self.keep_days
    }

    fn enumerate(&self) -> Result<Vec<ArchiveRecord>, AdapterError> {
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
            if let Some(record) = entry.file_name().to_str().and_then(ArchiveRecord::from_name) {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn delete(&self, name: &str) -> Result<(), AdapterError> {
        if RunId::parse(name).is_none() {
            return Err(AdapterError::failed("local", format!("{name} is no archive set")));
        }
        fs::remove_dir_all(self.root.join(name))?;
        Ok(())
    }
}

/// Archive sets on the remote store.
pub struct RemotePool<'a> {
    store: &'a dyn RemoteStore,
    keep_days: u32,
}

impl<'a> RemotePool<'a> {
    pub fn new(store: &'a dyn RemoteStore, keep_days: u32) -> Self {
        Self { store, keep_days }
    }
}

impl RetentionTarget for RemotePool<'_> {
    fn pool(&self) -> Pool {
        Pool::Remote
    }

    fn keep_days(&self) -> u32 {
        self.keep_days
    }

    fn enumerate(&self) -> Result<Vec<ArchiveRecord>, AdapterError> {
        self.store.list("")
    }

    fn delete(&self, name: &str) -> Result<(), AdapterError> {
        self.store.delete(name)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use super::*;
    use crate::run::ItemStatus;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn record(s: &str) -> ArchiveRecord {
        let id = RunId::new(at(s));
        ArchiveRecord::from_name(&id.to_string()).unwrap()
    }

    struct FakePool {
        keep_days: u32,
        records: Vec<ArchiveRecord>,
        broken: Option<String>,
        deleted: Mutex<BTreeSet<String>>,
    }

    impl FakePool {
        fn new(keep_days: u32, records: Vec<ArchiveRecord>) -> Self {
            Self {
                keep_days,
                records,
                broken: None,
                deleted: Mutex::default(),
            }
        }
    }

    impl RetentionTarget for FakePool {
        fn pool(&self) -> Pool {
            Pool::Remote
        }

        fn keep_days(&self) -> u32 {
            self.keep_days
        }

        fn enumerate(&self) -> Result<Vec<ArchiveRecord>, AdapterError> {
            Ok(self.records.clone())
        }

        fn delete(&self, name: &str) -> Result<(), AdapterError> {
            if self.broken.as_deref() == Some(name) {
                return Err(AdapterError::failed("fake", "permission denied"));
            }
            self.deleted.lock().unwrap().insert(name.to_string());
            Ok(())
        }
    }

    #[test]
    fn expires_strictly_after_keep_days() {
        let current = RunId::new(at("2024-03-10 02:00:00"));
        let retention = Retention::new(7, current);
        let now = at("2024-03-10 02:00:00");

        assert!(retention.retain(&record("2024-03-03 02:00:00"), now));
        assert!(!retention.retain(&record("2024-03-03 01:59:59"), now));
        assert!(retention.retain(&record("2024-03-09 02:00:00"), now));
    }

    #[test]
    fn keep_zero_days_retains_only_current_run() {
        let now = at("2024-03-10 02:00:05");
        let current = RunId::new(at("2024-03-10 02:00:00"));
        let pool = FakePool::new(
            0,
            vec![
                record("2024-03-09 02:00:00"),
                record("2024-03-10 02:00:00"),
            ],
        );

        let expired = expired(&pool, current, now).unwrap();
        let names: Vec<_> = expired.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["20240309-020000"]);
    }

    #[test]
    fn current_run_is_never_expired() {
        // clock went backwards: the current run looks a year old
        let now = at("2025-03-10 02:00:00");
        let current = RunId::new(at("2024-03-10 02:00:00"));
        let pool = FakePool::new(1, vec![record("2024-03-10 02:00:00")]);
        assert!(expired(&pool, current, now).unwrap().is_empty());
    }

    #[test]
    fn failed_delete_does_not_block_others() {
        let now = at("2024-03-10 02:00:00");
        let current = RunId::new(now);
        let mut pool = FakePool::new(
            1,
            vec![
                record("2024-03-01 02:00:00"),
                record("2024-03-02 02:00:00"),
                record("2024-03-03 02:00:00"),
            ],
        );
        pool.broken = Some("20240302-020000".into());

        let outcomes = purge(&pool, current, now, 1).unwrap();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].status, ItemStatus::Done);
        assert!(outcomes[1].status.is_failure());
        assert_eq!(outcomes[2].status, ItemStatus::Done);

        let deleted = pool.deleted.lock().unwrap();
        assert!(deleted.contains("20240301-020000"));
        assert!(deleted.contains("20240303-020000"));
    }

    #[test]
    fn local_pool_only_touches_archive_sets() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("20240101-020000")).unwrap();
        fs::write(root.path().join("20240101-020000/www.tar.gz"), b"x").unwrap();
        fs::create_dir(root.path().join("20240309-020000")).unwrap();
        fs::create_dir(root.path().join("keep-me")).unwrap();
        fs::write(root.path().join("20240102-020000"), b"not a directory").unwrap();

        let now = at("2024-03-10 02:00:00");
        let pool = LocalPool::new(root.path(), 7);
        let outcomes = purge(&pool, RunId::new(now), now, 2).unwrap();

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].name, "20240101-020000");
        assert!(!root.path().join("20240101-020000").exists());
        assert!(root.path().join("20240309-020000").exists());
        assert!(root.path().join("keep-me").exists());
        assert!(root.path().join("20240102-020000").exists());
    }

    #[test]
    fn missing_local_root_has_nothing_to_purge() {
        let root = tempfile::tempdir().unwrap();
        let pool = LocalPool::new(&root.path().join("missing"), 7);
        assert!(pool.enumerate().unwrap().is_empty());
    }
}
