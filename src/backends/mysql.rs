//! [DatabaseClient] for MySQL and MariaDB servers using their command line
//! clients.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;

use super::{check_executable, AdapterError, DatabaseClient};
use crate::config::DatabaseSpec;
use crate::util::{part_path, process};

/// Dumps with `mysqldump` and measures with `mysql`.
///
/// The password is handed over in the `MYSQL_PWD` environment variable so it
/// doesn't show up in the process list.
#[derive(Debug, Clone)]
pub struct MySqlClient {
    mysqldump: PathBuf,
    mysql: PathBuf,
    timeout: Duration,
}

impl MySqlClient {
    pub fn new(mysqldump: PathBuf, mysql: PathBuf, timeout: Duration) -> Self {
        Self {
            mysqldump,
            mysql,
            timeout,
        }
    }

    fn command(program: &Path, spec: &DatabaseSpec) -> Command {
        let mut command = Command::new(program);
        command
            .arg(format!("--host={}", spec.host))
            .arg(format!("--port={}", spec.port))
            .arg(format!("--user={}", spec.user))
            .env("MYSQL_PWD", &spec.password);
        command
    }

    fn dump_command(&self, spec: &DatabaseSpec) -> Command {
        let mut dump = Self::command(&self.mysqldump, spec);
        dump.arg("--single-transaction") // consistent dump without locking
            .arg("--force"); // keep going on errors, e.g. broken views
        for table in &spec.exclude {
            dump.arg(format!("--ignore-table={}.{table}", spec.name));
        }
        dump.arg(&spec.name);
        dump
    }

    fn size_command(&self, spec: &DatabaseSpec) -> Command {
        let query = format!(
            "SELECT COALESCE(SUM(data_length + index_length), 0) / 1024 / 1024 \
             FROM information_schema.TABLES WHERE table_schema = '{}'",
            escape_literal(&spec.name)
        );
        let mut mysql = Self::command(&self.mysql, spec);
        mysql
            .arg("--batch")
            .arg("--skip-column-names")
            .arg("--execute")
            .arg(query);
        mysql
    }
}

impl DatabaseClient for MySqlClient {
    fn dump(&self, spec: &DatabaseSpec, dest: &Path) -> Result<PathBuf, AdapterError> {
        let dest = if spec.compress {
            let mut name = dest.as_os_str().to_owned();
            name.push(".gz");
            PathBuf::from(name)
        } else {
            dest.to_path_buf()
        };
        let part = part_path(&dest);

        log::info!(target: "adapter::mysql", "Create database dump of {}", spec.name);
        log::debug!(target: "adapter::mysql", "Save database dump at: {}", dest.display());
        if !spec.exclude.is_empty() {
            log::debug!(target: "adapter::mysql", "Excluded tables: {}", spec.exclude.join(", "));
        }

        let file = BufWriter::new(File::create(&part)?);
        let mut dump = self.dump_command(spec);
        let result = if spec.compress {
            let mut encoder = GzEncoder::new(file, Compression::default());
            process::run_with_io(&mut dump, self.timeout, None, &mut encoder)
                .and_then(|()| finish(encoder.finish()))
        } else {
            let mut file = file;
            process::run_with_io(&mut dump, self.timeout, None, &mut file)
                .and_then(|()| finish(Ok(file)))
        };

        if let Err(e) = result {
            let _ = fs::remove_file(&part);
            return Err(e);
        }

        fs::rename(&part, &dest)?;
        log::info!(target: "adapter::mysql", "Finished database dump of {}", spec.name);
        Ok(dest)
    }

    fn measure(&self, spec: &DatabaseSpec) -> Result<f64, AdapterError> {
        let output = process::run(&mut self.size_command(spec), self.timeout)?;
        parse_size(&output).ok_or_else(|| {
            AdapterError::failed("mysql", format!("unexpected size of {}: {output:?}", spec.name))
        })
    }

    fn check_dump(&self) -> Result<(), AdapterError> {
        check_executable(&self.mysqldump)
    }

    fn check_measure(&self) -> Result<(), AdapterError> {
        check_executable(&self.mysql)
    }
}

fn finish(file: io::Result<BufWriter<File>>) -> Result<(), AdapterError> {
    file?.flush()?;
    Ok(())
}

/// Escape `value` for use inside a single quoted SQL string.
fn escape_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "''")
}

/// Parse the single value printed by the size query.
fn parse_size(output: &str) -> Option<f64> {
    output.lines().last()?.trim().parse().ok()
}
