use std::process::ExitCode;

use clap::Parser;

use hosting_backup_lib::backends::Adapters;
use hosting_backup_lib::cli::Cli;
use hosting_backup_lib::config::Config;
use hosting_backup_lib::orchestrator::Orchestrator;

/// Exit code if the config can't be loaded or was just created.
const CONFIG_ERROR: u8 = 4;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // init logger
    let mut env_logger = env_logger::builder();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    if let Err(e) = env_logger.try_init() {
        eprintln!("Initializing the logger failed: {e}");
    }

    if std::fs::exists(&cli.config).is_ok_and(|b| !b) {
        log::info!(
            "Writing default config to {} because it doesn't exist yet",
            cli.config.display()
        );
        match toml::to_string_pretty(&Config::default()) {
            Ok(config_str) => {
                if let Err(e) = std::fs::write(&cli.config, config_str) {
                    log::error!(
                        "Writing default config to {} failed: {e}",
                        cli.config.display()
                    );
                }
            }
            Err(e) => log::error!("Serializing the default config failed: {e}"),
        }
        return ExitCode::from(CONFIG_ERROR);
    }

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::from(CONFIG_ERROR);
        }
    };

    let adapters = match Adapters::from_config(&config) {
        Ok(adapters) => adapters,
        Err(e) => {
            log::error!("Setting up the backends failed: {e}");
            return ExitCode::from(CONFIG_ERROR);
        }
    };

    let run = Orchestrator::new(&config, adapters).run();
    ExitCode::from(run.exit_code())
}
