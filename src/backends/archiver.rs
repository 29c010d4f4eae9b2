//! [Archiver]s packing a directory into a `.tar.gz`.
//!
//! [NativeArchiver] builds the tarball in process, [TarCommand] hands the
//! work to the system `tar`. Both write to a `.part` file first which is
//! renamed once the archive is complete.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;

use super::{check_executable, AdapterError, Archiver};
use crate::util::{part_path, process};

/// Name of `source` inside the archive.
fn base_name(source: &Path) -> Result<&Path, AdapterError> {
    source
        .file_name()
        .map(Path::new)
        .ok_or_else(|| AdapterError::failed("archiver", format!("{} has no name", source.display())))
}

fn ensure_source(source: &Path) -> Result<(), AdapterError> {
    if source.is_dir() {
        Ok(())
    } else {
        Err(AdapterError::failed(
            "archiver",
            format!("{} does not exist", source.display()),
        ))
    }
}

fn write_tarball(source: &Path, base: &Path, dest: &Path) -> io::Result<()> {
    let file = BufWriter::new(File::create(dest)?);
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(base, source)?;
    let mut file = builder.into_inner()?.finish()?;
    file.flush()
}

/// Builds the tarball with the `tar` and `flate2` crates.
///
/// The tarball is written on a helper thread. If it isn't complete within
/// the timeout the archive is given up and its `.part` file never renamed.
#[derive(Debug, Clone, Copy)]
pub struct NativeArchiver {
    timeout: Duration,
}

impl NativeArchiver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Archiver for NativeArchiver {
    fn compress(&self, source: &Path, dest: &Path) -> Result<(), AdapterError> {
        ensure_source(source)?;
        let base = base_name(source)?.to_path_buf();
        let part = part_path(dest);
        log::debug!(target: "adapter::archiver", "Compress {} into {}", source.display(), part.display());

        let source = source.to_path_buf();
        let written = part.clone();
        process::bounded("archiver", self.timeout, move || {
            write_tarball(&source, &base, &written).map_err(|e| {
                let _ = fs::remove_file(&written);
                AdapterError::from(e)
            })
        })?;

        fs::rename(&part, dest)?;
        Ok(())
    }
}

/// Builds the tarball by running `tar czf`.
#[derive(Debug, Clone)]
pub struct TarCommand {
    tar: PathBuf,
    timeout: Duration,
}

impl TarCommand {
    pub fn new(tar: PathBuf, timeout: Duration) -> Self {
        Self { tar, timeout }
    }
}

impl Archiver for TarCommand {
    fn compress(&self, source: &Path, dest: &Path) -> Result<(), AdapterError> {
        ensure_source(source)?;
        let base = base_name(source)?;
        let parent = source.parent().unwrap_or(Path::new("/"));
        let part = part_path(dest);

        let mut tar = Command::new(&self.tar);
        tar.arg("czf").arg(&part).arg("-C").arg(parent).arg(base);

        if let Err(e) = process::run(&mut tar, self.timeout) {
            let _ = fs::remove_file(&part);
            return Err(e);
        }

        fs::rename(&part, dest)?;
        Ok(())
    }

    fn ensure_available(&self) -> Result<(), AdapterError> {
        check_executable(&self.tar)
    }
}
