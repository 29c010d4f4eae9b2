//! [RemoteStore] backed by [rclone](https://rclone.org), which covers Google
//! Drive, S3, SFTP and many more without privileges on the host.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use super::{check_executable, AdapterError, RemoteStore, TransferMode, TransferOptions};
use crate::util::process;
use crate::util::progress::ProgressReader;
use crate::util::retention::ArchiveRecord;

/// Exit code of rclone if the directory doesn't exist.
const DIRECTORY_NOT_FOUND: i32 = 3;

/// An entry printed by `rclone lsjson`.
#[derive(Debug, serde::Deserialize)]
struct ListEntry {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "IsDir", default)]
    is_dir: bool,
}

#[derive(Debug, Clone)]
pub struct RcloneStore {
    rclone: PathBuf,
    /// Remote directory holding the archive sets, e.g. `gdrive:backups`.
    root: String,
    timeout: Duration,
}

impl RcloneStore {
    pub fn new(rclone: PathBuf, root: String, timeout: Duration) -> Self {
        Self {
            rclone,
            root,
            timeout,
        }
    }

    fn remote_path(&self, identifier: &str) -> Result<String, AdapterError> {
        let escapes = identifier.is_empty()
            || identifier.starts_with('/')
            || identifier.split('/').any(|part| part == ".." || part == ".");
        if escapes {
            return Err(AdapterError::failed(
                "rclone",
                format!("{identifier:?} is no path below {}", self.root),
            ));
        }

        if self.root.ends_with(':') || self.root.ends_with('/') {
            Ok(format!("{}{identifier}", self.root))
        } else {
            Ok(format!("{}/{identifier}", self.root))
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.rclone)
    }
}

impl RemoteStore for RcloneStore {
    fn list(&self, prefix: &str) -> Result<Vec<ArchiveRecord>, AdapterError> {
        let mut lsjson = self.command();
        lsjson.arg("lsjson").arg("--dirs-only").arg(&self.root);
        let output = match process::run(&mut lsjson, self.timeout) {
            Ok(output) => output,
            // nothing uploaded yet
            Err(AdapterError::Failed {
                code: Some(DIRECTORY_NOT_FOUND),
                ..
            }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let entries: Vec<ListEntry> = serde_json::from_str(&output)
            .map_err(|e| AdapterError::failed("rclone", format!("unexpected lsjson output: {e}")))?;
        log::trace!(target: "adapter::rclone", "{} entries in {}", entries.len(), self.root);

        Ok(entries
            .into_iter()
            .filter(|entry| entry.is_dir && entry.name.starts_with(prefix))
            .filter_map(|entry| ArchiveRecord::from_name(&entry.name))
            .collect())
    }

    fn delete(&self, identifier: &str) -> Result<(), AdapterError> {
        let mut purge = self.command();
        purge.arg("purge").arg(self.remote_path(identifier)?);
        process::run(&mut purge, self.timeout)?;
        Ok(())
    }

    fn put(
        &self,
        local: &Path,
        remote: &str,
        options: TransferOptions,
    ) -> Result<u64, AdapterError> {
        let dest = self.remote_path(remote)?;
        let file = File::open(local)?;
        let size = file.metadata()?.len();

        match options.mode {
            TransferMode::Streaming => {
                // rcat reads the file from stdin, the memory used is bounded
                // by the pipe and rclone's chunk size
                let mut rcat = self.command();
                rcat.arg("rcat").arg("--buffer-size=0").arg(&dest);

                let reader = BufReader::new(file);
                let mut source: Box<dyn Read + Send + '_> = if options.progress {
                    Box::new(ProgressReader::new(reader, remote, Some(size)))
                } else {
                    Box::new(reader)
                };
                process::run_with_io(&mut rcat, self.timeout, Some(&mut source), &mut io::sink())?;
            }
            TransferMode::Buffered => {
                drop(file);
                if options.progress {
                    log::info!(target: "upload::progress", "{remote}: copying {size} bytes");
                }
                let mut copyto = self.command();
                copyto.arg("copyto").arg(local).arg(&dest);
                process::run(&mut copyto, self.timeout)?;
            }
        }

        Ok(size)
    }

    fn ensure_available(&self) -> Result<(), AdapterError> {
        check_executable(&self.rclone)
    }
}
