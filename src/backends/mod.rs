//! Capability adapters for the external tools the pipeline relies on.
//!
//! Each tool is reached through a narrow trait so the pipeline never depends
//! on how a tool is invoked:
//!
//! - [Archiver]: packs a directory into a `.tar.gz`. See [archiver].
//! - [DatabaseClient]: dumps and measures database schemas. See [mysql].
//! - [RemoteStore]: lists, deletes and stores archive sets remotely. See
//!   [rclone] and [directory].
//! - [Mailer]: delivers the run report. See [mail].
//!
//! The concrete binding of every capability is chosen by the configuration
//! in [Adapters::from_config].

pub mod archiver;
pub mod directory;
pub mod mail;
pub mod mysql;
pub mod rclone;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_more::{Display, Error, From};

use crate::config::{ArchiverKind, Config, DatabaseSpec, RemoteConfig};
use crate::util::retention::ArchiveRecord;

pub use archiver::{NativeArchiver, TarCommand};
pub use directory::DirectoryStore;
pub use mail::{SendmailMailer, SmtpMailer};
pub use mysql::MySqlClient;
pub use rclone::RcloneStore;

#[derive(Debug, Display, Error, From)]
/// Errors raised by capability adapters.
pub enum AdapterError {
    /// The tool or connection is missing altogether.
    #[display("{tool} is not available: {reason}")]
    Unavailable { tool: String, reason: String },
    /// The tool did not finish in time and was killed.
    #[display("{tool} did not finish within {}s", timeout.as_secs())]
    Timeout { tool: String, timeout: Duration },
    /// The tool ran but reported an error.
    #[display("{tool} failed: {message}")]
    Failed {
        tool: String,
        message: String,
        /// Exit code of the tool, if it exited with one.
        code: Option<i32>,
    },
    /// The mail could not be built or delivered.
    #[display("Sending mail failed: {_0}")]
    Mail(#[error(ignore)] String),
    #[from]
    Io(io::Error),
}

impl AdapterError {
    pub fn failed(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            tool: tool.into(),
            message: message.into(),
            code: None,
        }
    }
}

/// Packs a directory into a gzip compressed tarball.
pub trait Archiver: Send + Sync {
    /// Compress `source` into the archive `dest`.
    ///
    /// `dest` only appears once the archive is complete.
    fn compress(&self, source: &Path, dest: &Path) -> Result<(), AdapterError>;

    /// Checks if the archiver can be used at all.
    fn ensure_available(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// Access to the database server holding the configured schemas.
pub trait DatabaseClient: Send + Sync {
    /// Dump the schema of `spec` without its excluded tables to `dest`.
    ///
    /// Returns the path actually written, which may carry an additional
    /// compression suffix.
    fn dump(&self, spec: &DatabaseSpec, dest: &Path) -> Result<PathBuf, AdapterError>;

    /// Size of the schema of `spec` in MB.
    fn measure(&self, spec: &DatabaseSpec) -> Result<f64, AdapterError>;

    fn check_dump(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    fn check_measure(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// How the bytes of a file travel to the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Stream the file in small chunks; never hold it in memory.
    Streaming,
    /// Hand the whole file over at once.
    Buffered,
}

#[derive(Debug, Clone, Copy)]
pub struct TransferOptions {
    pub mode: TransferMode,
    /// Log the progress of the transfer.
    pub progress: bool,
}

/// Remote location receiving the archive sets.
///
/// Identifiers are paths relative to the root of the store; archive sets are
/// the top-level directories named after their run id.
pub trait RemoteStore: Send + Sync {
    /// Archive sets at the root of the store whose name starts with `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<ArchiveRecord>, AdapterError>;

    /// Delete the archive set `identifier` with all its content.
    fn delete(&self, identifier: &str) -> Result<(), AdapterError>;

    /// Store `local` as `remote`, returning the number of bytes transferred.
    fn put(&self, local: &Path, remote: &str, options: TransferOptions)
        -> Result<u64, AdapterError>;

    fn ensure_available(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// Delivery of the run report.
pub trait Mailer: Send + Sync {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), AdapterError>;
}

/// Checks if `program` can be executed, either as a path or through `PATH`.
pub fn check_executable(program: &Path) -> Result<(), AdapterError> {
    which::which(program)
        .map(|_| ())
        .map_err(|e| AdapterError::Unavailable {
            tool: program.display().to_string(),
            reason: e.to_string(),
        })
}

/// The adapters used by one run.
pub struct Adapters {
    pub archiver: Box<dyn Archiver>,
    pub database: Box<dyn DatabaseClient>,
    pub remote: Option<Box<dyn RemoteStore>>,
    pub mailer: Option<Box<dyn Mailer>>,
}

impl Adapters {
    /// Build the adapters selected by `config`.
    pub fn from_config(config: &Config) -> Result<Self, AdapterError> {
        let timeout = config.general.tool_timeout();
        let executables = &config.executables;

        let archiver: Box<dyn Archiver> = match config.general.archiver {
            ArchiverKind::Native => Box::new(NativeArchiver::new(timeout)),
            ArchiverKind::Tar => Box::new(TarCommand::new(executables.tar.clone(), timeout)),
        };

        let database = Box::new(MySqlClient::new(
            executables.mysqldump.clone(),
            executables.mysql.clone(),
            timeout,
        ));

        let remote: Option<Box<dyn RemoteStore>> = match &config.remote {
            Some(RemoteConfig::Rclone { path }) => Some(Box::new(RcloneStore::new(
                executables.rclone.clone(),
                path.clone(),
                timeout,
            ))),
            Some(RemoteConfig::Directory { path }) => {
                Some(Box::new(DirectoryStore::new(path).with_timeout(timeout)))
            }
            None => None,
        };

        let mailer: Option<Box<dyn Mailer>> = match &config.email {
            Some(email) => Some(mail::from_config(email, &executables.sendmail, timeout)?),
            None => None,
        };

        Ok(Self {
            archiver,
            database,
            remote,
            mailer,
        })
    }
}
