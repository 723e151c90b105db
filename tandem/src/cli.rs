use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::ArgMatches;
use tandem_config::{Config, OverridableConfig};

use crate::cliapp::make_app;
use crate::setup;

/// Runs the command line application.
pub fn execute() -> Result<()> {
    let app = make_app();
    let matches = app.get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map_or(".tandem", String::as_str);
    let mut config = Config::from_path(config_path)
        .with_context(|| format!("failed to load config from {config_path}"))?;

    if let Some(matches) = matches.subcommand_matches("run") {
        config.apply_override(extract_config_args(matches))?;
        return run(config);
    }

    if let Some(matches) = matches.subcommand_matches("config") {
        return manage_config(&config, matches);
    }

    unreachable!();
}

/// Extracts config overrides from the `run` arguments.
fn extract_config_args(matches: &ArgMatches) -> OverridableConfig {
    let value = |name: &str| matches.get_one::<String>(name).cloned();

    OverridableConfig {
        host: value("host"),
        port: value("port"),
        upstream: value("upstream"),
        application_id: value("application_id"),
        api_version: value("api_version"),
        session_token_header: value("session_token_header"),
        log_level: value("log_level"),
    }
}

fn manage_config(config: &Config, matches: &ArgMatches) -> Result<()> {
    if let Some(matches) = matches.subcommand_matches("show") {
        let output = match matches.get_one::<String>("format").map(String::as_str) {
            Some("debug") => format!("{config:#?}\n"),
            _ => config.to_yaml_string()?,
        };

        io::stdout().write_all(output.as_bytes())?;
        return Ok(());
    }

    unreachable!();
}

/// Starts the server with the given config and blocks until it shuts down.
pub fn run(config: Config) -> Result<()> {
    tandem_log::init(config.logging());
    setup::check_config(&config)?;
    setup::dump_spawn_infos(&config);
    setup::init_metrics(&config)?;

    tandem_server::run(config)?;
    Ok(())
}
