//! Library to back up web hosting accounts: website directories and MySQL
//! databases.
//!
//! A run compresses the configured directories, exports the configured
//! databases, applies retention to the local and the remote pool, uploads the
//! fresh archive set and finally mails a report. The pipeline is driven by the
//! [`orchestrator`], external tools are reached through the [`backends`].

#![forbid(unsafe_code)]

pub mod backends;
pub mod cli;
pub mod config;
pub mod orchestrator;
pub mod report;
pub mod run;
pub mod upload;
pub mod util;
