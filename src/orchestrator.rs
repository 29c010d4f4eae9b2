//! Drives one backup run through the fixed sequence of actions.
//!
//! Actions run one after another in [ActionKind] order; items inside an
//! action may run concurrently. Neither a failed item nor a failed action
//! stops the run, everything is recorded in the [BackupRun].

use std::fs;
use std::time::Instant;

use chrono::{Local, NaiveDateTime, TimeDelta};

use crate::backends::{AdapterError, Adapters, RemoteStore};
use crate::config::{Config, DatabaseSpec};
use crate::report;
use crate::run::{ActionKind, ActionOutcome, ArchiveSet, BackupRun, ItemOutcome, ItemStatus, RunId};
use crate::upload::UploadStrategy;
use crate::util::items::process_items;
use crate::util::retention::{self, LocalPool, RemotePool};

pub struct Orchestrator<'a> {
    config: &'a Config,
    adapters: Adapters,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a Config, adapters: Adapters) -> Self {
        Self { config, adapters }
    }

    /// Run the pipeline now.
    pub fn run(&self) -> BackupRun {
        self.run_at(Local::now().naive_local())
    }

    /// Run the pipeline as if started at `now`.
    pub fn run_at(&self, now: NaiveDateTime) -> BackupRun {
        let run_id = RunId::new(now);
        let mut run = BackupRun::new(run_id, self.config.actions.enabled());
        let clock = Clock::new(run.started_at);
        let set = ArchiveSet::new(&self.config.general.local_dir, run_id);
        log::info!(target: "run", "Starting backup run {run_id}");

        let producing = [ActionKind::CompressDirectories, ActionKind::ExportDatabases];
        let set_ready = if producing.iter().any(|kind| run.is_enabled(*kind)) {
            fs::create_dir_all(set.dir()).map_err(|e| {
                log::error!(target: "run", "Creating {} failed: {e}", set.dir().display());
                format!("Creating {} failed: {e}", set.dir().display())
            })
        } else {
            Ok(())
        };

        for kind in ActionKind::ALL {
            if kind == ActionKind::SendEmail || !run.is_enabled(kind) {
                continue;
            }
            let started_at = clock.now();
            log::info!(target: "run", "{kind}");

            let outcome = match (&set_ready, kind) {
                (Err(e), ActionKind::CompressDirectories | ActionKind::ExportDatabases) => {
                    ActionOutcome::failed(kind, started_at, e)
                }
                _ => match self.execute(kind, &set, clock.now()) {
                    Ok(items) => ActionOutcome::new(kind, started_at, items),
                    Err(e) => {
                        log::error!(target: "run", "{kind} failed: {e}");
                        ActionOutcome::failed(kind, started_at, e)
                    }
                },
            };
            log::info!(target: "run", "{kind}: {}", outcome.status());
            run.record(outcome);
        }

        let status = run.finalize();
        log::info!(target: "run", "Backup run {run_id} finished with {status}");

        if run.is_enabled(ActionKind::SendEmail) {
            let started_at = clock.now();
            let outcome = match self.notify(&run) {
                Ok(items) => ActionOutcome::new(ActionKind::SendEmail, started_at, items),
                Err(e) => {
                    log::error!(target: "notify", "Sending the report failed: {e}");
                    ActionOutcome::failed(ActionKind::SendEmail, started_at, e)
                }
            };
            run.record(outcome);
        }

        run
    }

    /// Execute one action, returning its item outcomes or an action-scoped
    /// error.
    fn execute(
        &self,
        kind: ActionKind,
        set: &ArchiveSet,
        now: NaiveDateTime,
    ) -> Result<Vec<ItemOutcome>, AdapterError> {
        match kind {
            ActionKind::CompressDirectories => self.compress_directories(set),
            ActionKind::ExportDatabases => self.export_databases(set),
            ActionKind::CheckDatabaseSizes => self.check_database_sizes(),
            ActionKind::DeleteLocalExpired => self.delete_local_expired(set.run_id(), now),
            ActionKind::DeleteRemoteExpired => self.delete_remote_expired(set.run_id(), now),
            ActionKind::UploadArchives => self.upload_archives(set),
            ActionKind::SendEmail => Ok(Vec::new()),
        }
    }

    fn concurrency(&self) -> usize {
        self.config.general.concurrency()
    }

    fn compress_directories(&self, set: &ArchiveSet) -> Result<Vec<ItemOutcome>, AdapterError> {
        let archiver = &self.adapters.archiver;
        let directories: Vec<_> = self.config.directories.iter().collect();
        if !directories.is_empty() {
            archiver.ensure_available()?;
        }

        Ok(process_items(&directories, self.concurrency(), |(alias, source)| {
            let dest = set.directory_archive(alias);
            log::debug!(target: "action::compress", "Compressing {} as {alias}", source.display());
            match archiver.compress(source, &dest) {
                Ok(()) => {
                    let outcome = ItemOutcome::done(*alias);
                    match fs::metadata(&dest) {
                        Ok(meta) => outcome.bytes(meta.len()),
                        Err(_) => outcome,
                    }
                }
                Err(e) => {
                    log::error!(target: "action::compress", "Compressing {alias} failed: {e}");
                    ItemOutcome::with_status(*alias, e.into())
                }
            }
        }))
    }

    fn export_databases(&self, set: &ArchiveSet) -> Result<Vec<ItemOutcome>, AdapterError> {
        let database = &self.adapters.database;
        let specs: Vec<&DatabaseSpec> = self.config.databases.iter().filter(|db| db.export).collect();
        if !specs.is_empty() {
            database.check_dump()?;
        }

        Ok(process_items(&specs, self.concurrency(), |spec| {
            let dest = set.database_export(&spec.alias);
            match database.dump(spec, &dest) {
                Ok(written) => {
                    log::debug!(target: "action::export", "Exported {} to {}", spec.name, written.display());
                    let outcome = ItemOutcome::done(&spec.alias);
                    match fs::metadata(&written) {
                        Ok(meta) => outcome.bytes(meta.len()),
                        Err(_) => outcome,
                    }
                }
                Err(e) => {
                    log::error!(target: "action::export", "Exporting {} failed: {e}", spec.alias);
                    ItemOutcome::with_status(&spec.alias, e.into())
                }
            }
        }))
    }

    fn check_database_sizes(&self) -> Result<Vec<ItemOutcome>, AdapterError> {
        let database = &self.adapters.database;
        let specs: Vec<&DatabaseSpec> = self
            .config
            .databases
            .iter()
            .filter(|db| db.check_size)
            .collect();
        if !specs.is_empty() {
            database.check_measure()?;
        }

        Ok(process_items(&specs, self.concurrency(), |spec| {
            match database.measure(spec) {
                // a maximum of 0 only reports the size
                Ok(size_mb) if spec.max_size > 0 && size_mb > spec.max_size as f64 => {
                    log::warn!(
                        target: "action::check_size",
                        "{} uses {size_mb:.0} MB, more than {} MB",
                        spec.alias,
                        spec.max_size
                    );
                    ItemOutcome::with_status(
                        &spec.alias,
                        ItemStatus::SizeAlert {
                            size_mb,
                            max_mb: spec.max_size,
                        },
                    )
                }
                Ok(size_mb) => {
                    log::debug!(target: "action::check_size", "{} uses {size_mb:.1} MB", spec.alias);
                    ItemOutcome::done(&spec.alias).detail(format!("{size_mb:.1} MB"))
                }
                Err(e) => {
                    log::error!(target: "action::check_size", "Measuring {} failed: {e}", spec.alias);
                    ItemOutcome::with_status(&spec.alias, e.into())
                }
            }
        }))
    }

    fn delete_local_expired(
        &self,
        current: RunId,
        now: NaiveDateTime,
    ) -> Result<Vec<ItemOutcome>, AdapterError> {
        let general = &self.config.general;
        let pool = LocalPool::new(&general.local_dir, general.keep_days_local);
        retention::purge(&pool, current, now, self.concurrency())
    }

    fn delete_remote_expired(
        &self,
        current: RunId,
        now: NaiveDateTime,
    ) -> Result<Vec<ItemOutcome>, AdapterError> {
        let store = self.remote()?;
        store.ensure_available()?;
        let pool = RemotePool::new(store, self.config.general.keep_days_remote);
        retention::purge(&pool, current, now, self.concurrency())
    }

    fn upload_archives(&self, set: &ArchiveSet) -> Result<Vec<ItemOutcome>, AdapterError> {
        let store = self.remote()?;
        store.ensure_available()?;
        let strategy = UploadStrategy::from_config(&self.config.general);
        Ok(strategy.upload(set, store)?)
    }

    fn remote(&self) -> Result<&dyn RemoteStore, AdapterError> {
        self.adapters
            .remote
            .as_deref()
            .ok_or_else(|| AdapterError::Unavailable {
                tool: "remote store".into(),
                reason: "no [remote] section configured".into(),
            })
    }

    fn notify(&self, run: &BackupRun) -> Result<Vec<ItemOutcome>, AdapterError> {
        let unavailable = |reason: &str| AdapterError::Unavailable {
            tool: "mailer".into(),
            reason: reason.into(),
        };
        let email = self
            .config
            .email
            .as_ref()
            .ok_or_else(|| unavailable("no [email] section configured"))?;
        let mailer = self
            .adapters
            .mailer
            .as_deref()
            .ok_or_else(|| unavailable("no mailer configured"))?;

        match report::decide_and_send(run, self.config.actions.send_email, mailer, email) {
            None => Ok(Vec::new()),
            Some(Ok(())) => Ok(vec![ItemOutcome::done(&email.receiver)]),
            Some(Err(e)) => Err(e),
        }
    }
}

/// Wall clock anchored at the start of the run.
struct Clock {
    start: NaiveDateTime,
    since: Instant,
}

impl Clock {
    fn new(start: NaiveDateTime) -> Self {
        Self {
            start,
            since: Instant::now(),
        }
    }

    fn now(&self) -> NaiveDateTime {
        self.start + TimeDelta::from_std(self.since.elapsed()).unwrap_or_default()
    }
}
