//! Configuration of a backup run, read from a TOML file.
//!
//! ```toml
//! [general]
//! local_dir = "/home/user/backups"
//! keep_days_local = 7
//! keep_days_remote = 30
//!
//! [actions]
//! compress_directories = true
//! export_databases = true
//! upload_archives = true
//! send_email = "only_on_error"
//!
//! [remote]
//! kind = "rclone"
//! path = "gdrive:backups"
//!
//! [directories]
//! proyecto = "/home/user/www/proyecto"
//!
//! [[databases]]
//! alias = "gametic"
//! name = "gametic"
//! user = "backup"
//! password = "..."
//! exclude = ["actions", "authmap"]
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use derive_more::{Display, Error, From};
use regex::Regex;

use crate::report::SendPolicy;
use crate::run::ActionKind;

/// Upper bound of [General::tool_timeout] in seconds: one week.
const MAX_TOOL_TIMEOUT: u64 = 7 * 24 * 60 * 60;

static ALIAS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("alias regex is valid"));

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
/// Configuration of a backup run.
pub struct Config {
    #[serde(default)]
    pub general: General,

    #[serde(default)]
    pub actions: Actions,

    #[serde(default)]
    pub executables: Executables,

    /// Remote store receiving the archive sets.
    #[serde(default)]
    pub remote: Option<RemoteConfig>,

    /// Directories to compress, by alias.
    #[serde(default)]
    pub directories: BTreeMap<String, PathBuf>,

    #[serde(default)]
    pub databases: Vec<DatabaseSpec>,

    /// Recipient and transport of the run report.
    #[serde(default)]
    pub email: Option<EmailConfig>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct General {
    /// Directory holding one archive set per run.
    pub local_dir: PathBuf,

    /// Days archive sets are kept in [General::local_dir].
    pub keep_days_local: u32,

    /// Days archive sets are kept on the remote store.
    pub keep_days_remote: u32,

    /// Transfer one file at a time and never buffer a whole file in memory.
    ///
    /// Meant for hosts enforcing tight memory limits on processes. Also
    /// limits every other action to one item at a time.
    pub low_memory: bool,

    /// Log the progress of uploads.
    pub upload_progress: bool,

    /// Maximum number of items processed at once within an action.
    pub concurrency: usize,

    /// Seconds an external tool may run before it is killed.
    pub tool_timeout: u64,

    pub archiver: ArchiverKind,
}

impl Default for General {
    fn default() -> Self {
        Self {
            local_dir: PathBuf::from("backups"),
            keep_days_local: 7,
            keep_days_remote: 30,
            low_memory: false,
            upload_progress: false,
            concurrency: 2,
            tool_timeout: 3600,
            archiver: ArchiverKind::default(),
        }
    }
}

impl General {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout)
    }

    /// Number of items an action may process at once.
    pub fn concurrency(&self) -> usize {
        if self.low_memory {
            1
        } else {
            self.concurrency.max(1)
        }
    }
}

/// Binding of the archiver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiverKind {
    /// Compress in process.
    #[default]
    Native,
    /// Run the system `tar`.
    Tar,
}

/// Actions enabled for a run.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Actions {
    pub compress_directories: bool,
    pub export_databases: bool,
    pub check_database_sizes: bool,
    pub delete_local_expired: bool,
    pub delete_remote_expired: bool,
    pub upload_archives: bool,
    pub send_email: SendPolicy,
}

impl Default for Actions {
    fn default() -> Self {
        Self {
            compress_directories: true,
            export_databases: true,
            check_database_sizes: false,
            delete_local_expired: true,
            delete_remote_expired: false,
            upload_archives: false,
            send_email: SendPolicy::Never,
        }
    }
}

impl Actions {
    /// The set of enabled [ActionKind]s.
    pub fn enabled(&self) -> BTreeSet<ActionKind> {
        [
            (ActionKind::CompressDirectories, self.compress_directories),
            (ActionKind::ExportDatabases, self.export_databases),
            (ActionKind::CheckDatabaseSizes, self.check_database_sizes),
            (ActionKind::DeleteLocalExpired, self.delete_local_expired),
            (ActionKind::DeleteRemoteExpired, self.delete_remote_expired),
            (ActionKind::UploadArchives, self.upload_archives),
            (ActionKind::SendEmail, self.send_email != SendPolicy::Never),
        ]
        .into_iter()
        .filter_map(|(kind, enabled)| enabled.then_some(kind))
        .collect()
    }
}

/// Paths of the external tools. Plain names are looked up in `PATH`.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Executables {
    pub tar: PathBuf,
    pub mysqldump: PathBuf,
    pub mysql: PathBuf,
    pub rclone: PathBuf,
    pub sendmail: PathBuf,
}

impl Default for Executables {
    fn default() -> Self {
        Self {
            tar: "tar".into(),
            mysqldump: "mysqldump".into(),
            mysql: "mysql".into(),
            rclone: "rclone".into(),
            sendmail: "/usr/sbin/sendmail".into(),
        }
    }
}

/// Binding of the remote store.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteConfig {
    /// An rclone remote path, e.g. `gdrive:backups`.
    Rclone { path: String },
    /// A mounted directory.
    Directory { path: PathBuf },
}

/// One database to export and/or measure.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSpec {
    /// Name of the export file.
    pub alias: String,

    #[serde(default = "default_db_host")]
    pub host: String,

    #[serde(default = "default_db_port")]
    pub port: u16,

    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Name of the schema.
    pub name: String,

    /// Tables left out of the export.
    #[serde(default)]
    pub exclude: Vec<String>,

    #[serde(default = "default_true")]
    pub export: bool,

    #[serde(default)]
    pub check_size: bool,

    /// Size in MB above which the size check raises an alert.
    #[serde(default)]
    pub max_size: u64,

    /// Gzip the export while writing it.
    #[serde(default)]
    pub compress: bool,
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    3306
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmailConfig {
    pub sender: String,
    pub receiver: String,
    #[serde(default = "default_subject")]
    pub subject: String,
    pub transport: MailTransport,
}

fn default_subject() -> String {
    "Backup".to_string()
}

/// How the report leaves the host.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum MailTransport {
    Smtp {
        server: String,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        tls: SmtpTls,
    },
    /// Hand the mail to the local MTA via `sendmail`.
    Sendmail,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmtpTls {
    /// Plain text connection.
    None,
    /// Upgrade the connection with `STARTTLS`.
    #[default]
    Starttls,
    /// TLS from the first byte (SMTPS).
    Wrapper,
}

#[derive(Debug, Display, Error, From)]
/// Errors on loading the [Config].
pub enum ConfigError {
    /// The config file can't be read.
    #[display("Reading the config file failed: {_0}")]
    Read(io::Error),
    /// The config file isn't valid TOML or doesn't match the [Config].
    #[display("Parsing the config file failed: {_0}")]
    Parse(toml::de::Error),
    /// The config is well-formed but inconsistent.
    #[display("Invalid config: {_0}")]
    #[from(ignore)]
    Invalid(#[error(ignore)] String),
}

impl Config {
    /// Read and validate the config at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the config for inconsistencies serde can't catch.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.general.concurrency == 0 {
            return invalid("general.concurrency must be at least 1".into());
        }
        if !(1..=MAX_TOOL_TIMEOUT).contains(&self.general.tool_timeout) {
            return invalid(format!(
                "general.tool_timeout must be between 1 and {MAX_TOOL_TIMEOUT} seconds"
            ));
        }

        for alias in self.directories.keys() {
            if !ALIAS.is_match(alias) {
                return invalid(format!("directory alias {alias:?} is no valid file name"));
            }
        }

        let mut aliases = HashSet::new();
        for db in &self.databases {
            if !ALIAS.is_match(&db.alias) {
                return invalid(format!("database alias {:?} is no valid file name", db.alias));
            }
            if !aliases.insert(db.alias.as_str()) {
                return invalid(format!("database alias {:?} is used twice", db.alias));
            }
        }

        let actions = &self.actions;
        if (actions.upload_archives || actions.delete_remote_expired) && self.remote.is_none() {
            return invalid("uploads and remote deletion need a [remote] section".into());
        }
        if actions.send_email != SendPolicy::Never && self.email.is_none() {
            return invalid("sending the report needs an [email] section".into());
        }

        Ok(())
    }
}
