//! Helpers shared by the pipeline and the adapters.

pub mod items;
pub mod process;
pub mod progress;
pub mod retention;

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Name under which `dest` is written until it is complete.
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(OsString::from).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Whether `path` is a partially written file.
pub fn is_part_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "part")
}
