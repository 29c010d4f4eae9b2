//! State of a single backup run: the run identifier, the ordered
//! [ActionOutcome]s recorded by the pipeline and the final [RunStatus].

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Local, NaiveDateTime, Timelike};
use derive_more::Display;

use crate::backends::AdapterError;

const RUN_ID_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Identifier of a run and of the archive set it produces.
///
/// Formatted as `%Y%m%d-%H%M%S` so identifiers sort lexicographically by
/// creation time and the creation time can be recovered from the name alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(NaiveDateTime);

impl RunId {
    /// Create the identifier for a run started at `started_at`.
    ///
    /// Sub-second precision is dropped since the name can't represent it.
    pub fn new(started_at: NaiveDateTime) -> Self {
        Self(started_at.with_nanosecond(0).unwrap_or(started_at))
    }

    pub fn now() -> Self {
        Self::new(Local::now().naive_local())
    }

    /// Parse an archive-set name back into its [RunId].
    pub fn parse(name: &str) -> Option<Self> {
        NaiveDateTime::parse_from_str(name, RUN_ID_FORMAT)
            .ok()
            .map(Self)
    }

    pub fn created_at(&self) -> NaiveDateTime {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(RUN_ID_FORMAT))
    }
}

/// The files produced by one run, kept together in `<local_dir>/<run_id>/`.
#[derive(Debug, Clone)]
pub struct ArchiveSet {
    run_id: RunId,
    dir: PathBuf,
}

impl ArchiveSet {
    pub fn new(local_dir: &Path, run_id: RunId) -> Self {
        let dir = local_dir.join(run_id.to_string());
        Self { run_id, dir }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the directory archive for `alias`.
    pub fn directory_archive(&self, alias: &str) -> PathBuf {
        self.dir.join(format!("{alias}.tar.gz"))
    }

    /// Path of the database export for `alias`, before any compression suffix.
    pub fn database_export(&self, alias: &str) -> PathBuf {
        self.dir.join(format!("{alias}.sql"))
    }
}

/// Coarse-grained pipeline stage.
///
/// The declaration order is the execution order of the pipeline.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ActionKind {
    #[display("Compress directories")]
    CompressDirectories,
    #[display("Export databases")]
    ExportDatabases,
    #[display("Check database sizes")]
    CheckDatabaseSizes,
    #[display("Delete expired local backups")]
    DeleteLocalExpired,
    #[display("Delete expired remote backups")]
    DeleteRemoteExpired,
    #[display("Upload archives")]
    UploadArchives,
    #[display("Send email")]
    SendEmail,
}

impl ActionKind {
    /// All actions in pipeline order.
    pub const ALL: [ActionKind; 7] = [
        Self::CompressDirectories,
        Self::ExportDatabases,
        Self::CheckDatabaseSizes,
        Self::DeleteLocalExpired,
        Self::DeleteRemoteExpired,
        Self::UploadArchives,
        Self::SendEmail,
    ];
}

/// Result of processing one item (directory, database, archive member, ...).
#[derive(Debug, Clone, PartialEq)]
pub enum ItemStatus {
    Done,
    Failed(String),
    TimedOut(Duration),
    /// The database is larger than its configured maximum. Informational only.
    SizeAlert { size_mb: f64, max_mb: u64 },
}

impl ItemStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::TimedOut(_))
    }
}

impl From<AdapterError> for ItemStatus {
    fn from(error: AdapterError) -> Self {
        match error {
            AdapterError::Timeout { timeout, .. } => Self::TimedOut(timeout),
            other => Self::Failed(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome {
    pub name: String,
    pub status: ItemStatus,
    /// Bytes written or transferred for the item, if known.
    pub bytes: Option<u64>,
    /// Extra information shown in the report, e.g. a measured size.
    pub detail: Option<String>,
}

impl ItemOutcome {
    pub fn done(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ItemStatus::Done,
            bytes: None,
            detail: None,
        }
    }

    pub fn with_status(name: impl Into<String>, status: ItemStatus) -> Self {
        Self {
            name: name.into(),
            status,
            bytes: None,
            detail: None,
        }
    }

    pub fn bytes(mut self, bytes: u64) -> Self {
        self.bytes = Some(bytes);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Turn the result of an adapter call into an outcome for `name`.
    pub fn from_result<T>(name: impl Into<String>, result: Result<T, AdapterError>) -> Self {
        match result {
            Ok(_) => Self::done(name),
            Err(e) => Self::with_status(name, e.into()),
        }
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    #[display("succeeded")]
    Succeeded,
    #[display("partially failed")]
    PartiallyFailed,
    #[display("failed")]
    Failed,
}

/// Everything recorded about one executed [ActionKind].
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub kind: ActionKind,
    pub started_at: NaiveDateTime,
    pub items: Vec<ItemOutcome>,
    /// Error not attributable to a single item, e.g. an unavailable adapter.
    pub error: Option<String>,
}

impl ActionOutcome {
    pub fn new(kind: ActionKind, started_at: NaiveDateTime, items: Vec<ItemOutcome>) -> Self {
        Self {
            kind,
            started_at,
            items,
            error: None,
        }
    }

    pub fn failed(kind: ActionKind, started_at: NaiveDateTime, error: impl ToString) -> Self {
        Self {
            kind,
            started_at,
            items: Vec::new(),
            error: Some(error.to_string()),
        }
    }

    pub fn status(&self) -> ActionStatus {
        if self.error.is_some() {
            return ActionStatus::Failed;
        }

        let failed = self.items.iter().filter(|i| i.status.is_failure()).count();
        if failed == 0 {
            ActionStatus::Succeeded
        } else if failed == self.items.len() {
            ActionStatus::Failed
        } else {
            ActionStatus::PartiallyFailed
        }
    }

    pub fn has_alerts(&self) -> bool {
        self.items
            .iter()
            .any(|i| matches!(i.status, ItemStatus::SizeAlert { .. }))
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    #[display("success")]
    Success,
    #[display("partial failure")]
    PartialFailure,
    #[display("failure")]
    Failure,
}

/// One execution of the pipeline.
#[derive(Debug, Clone)]
pub struct BackupRun {
    pub run_id: RunId,
    pub started_at: NaiveDateTime,
    pub enabled: BTreeSet<ActionKind>,
    pub outcomes: Vec<ActionOutcome>,
    status: Option<RunStatus>,
}

impl BackupRun {
    pub fn new(run_id: RunId, enabled: BTreeSet<ActionKind>) -> Self {
        Self {
            run_id,
            started_at: run_id.created_at(),
            enabled,
            outcomes: Vec::new(),
            status: None,
        }
    }

    pub fn is_enabled(&self, kind: ActionKind) -> bool {
        self.enabled.contains(&kind)
    }

    pub fn record(&mut self, outcome: ActionOutcome) {
        debug_assert!(
            self.is_enabled(outcome.kind),
            "only enabled actions record outcomes"
        );
        debug_assert!(
            self.outcomes.last().is_none_or(|last| last.kind < outcome.kind),
            "outcomes are recorded in pipeline order"
        );
        self.outcomes.push(outcome);
    }

    pub fn outcome(&self, kind: ActionKind) -> Option<&ActionOutcome> {
        self.outcomes.iter().find(|o| o.kind == kind)
    }

    /// Compute the overall status from every outcome except the notification.
    ///
    /// Only the first call computes the status, later calls return it.
    pub fn finalize(&mut self) -> RunStatus {
        if let Some(status) = self.status {
            return status;
        }

        let mut any_failed = false;
        let mut any_ok = false;
        let mut any_partial = false;
        let mut any_alert = false;

        for outcome in self.outcomes.iter().filter(|o| o.kind != ActionKind::SendEmail) {
            match outcome.status() {
                ActionStatus::Succeeded => any_ok = true,
                ActionStatus::PartiallyFailed => any_partial = true,
                ActionStatus::Failed => any_failed = true,
            }
            any_alert |= outcome.has_alerts();
        }

        let status = if any_failed && !any_ok && !any_partial {
            RunStatus::Failure
        } else if any_failed || any_partial || any_alert {
            RunStatus::PartialFailure
        } else {
            RunStatus::Success
        };

        self.status = Some(status);
        status
    }

    /// The status computed by [BackupRun::finalize], if it ran.
    pub fn status(&self) -> Option<RunStatus> {
        self.status
    }

    /// Whether the report email could not be delivered.
    pub fn notification_failed(&self) -> bool {
        self.outcome(ActionKind::SendEmail)
            .is_some_and(|o| o.status() == ActionStatus::Failed)
    }

    /// Process exit code for the external scheduler.
    ///
    /// `0` success, `1` partial failure, `2` failure, `3` report not delivered.
    pub fn exit_code(&self) -> u8 {
        if self.notification_failed() {
            return 3;
        }
        match self.status {
            Some(RunStatus::Success) => 0,
            Some(RunStatus::PartialFailure) => 1,
            Some(RunStatus::Failure) | None => 2,
        }
    }
}
