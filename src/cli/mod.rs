use std::path::PathBuf;

use clap::Parser;
use log::LevelFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long, env = "HOSTING_BACKUP_VERBOSE")]
    pub verbose: Option<LevelFilter>,

    /// Path of the TOML config. A default config is written if it doesn't exist.
    pub config: PathBuf,
}
