//! Definition of the command line app.

use clap::{Arg, ArgAction, Command};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ABOUT: &str = "Tandem joins API requests with their responses and forwards them \
                         to the collector.";

pub fn make_app() -> Command {
    Command::new("tandem")
        .disable_help_subcommand(true)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .propagate_version(true)
        .max_term_width(79)
        .version(VERSION)
        .about(ABOUT)
        .arg(
            Arg::new("config")
                .value_name("CONFIG")
                .long("config")
                .short('c')
                .global(true)
                .env("TANDEM_CONFIG")
                .default_value(".tandem")
                .help("The path to the config folder."),
        )
        .subcommand(
            Command::new("run")
                .about("Run tandem")
                .after_help(
                    "This runs tandem in the foreground until it's shut down. It will bind \
                     to the port and network interface configured in the config file.",
                )
                .arg(
                    Arg::new("host")
                        .long("host")
                        .short('H')
                        .value_name("HOST")
                        .help("The network interface to bind the HTTP server to."),
                )
                .arg(
                    Arg::new("port")
                        .long("port")
                        .short('P')
                        .value_name("PORT")
                        .help("The port to bind the HTTP server to."),
                )
                .arg(
                    Arg::new("upstream")
                        .long("upstream")
                        .short('u')
                        .value_name("URL")
                        .help("The base URL of the collector."),
                )
                .arg(
                    Arg::new("application_id")
                        .long("application-id")
                        .value_name("ID")
                        .env("TANDEM_APPLICATION_ID")
                        .hide_env_values(true)
                        .help("The application id used to authenticate with the collector."),
                )
                .arg(
                    Arg::new("api_version")
                        .long("api-version")
                        .value_name("VERSION")
                        .help("The API version attached to every event."),
                )
                .arg(
                    Arg::new("session_token_header")
                        .long("session-token-header")
                        .value_name("HEADER")
                        .help("The request header carrying the session token."),
                )
                .arg(
                    Arg::new("log_level")
                        .long("log-level")
                        .value_name("LEVEL")
                        .value_parser(["error", "warn", "info", "debug", "trace", "off"])
                        .help("The log level."),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Manage the tandem config")
                .subcommand_required(true)
                .arg_required_else_help(true)
                .subcommand(
                    Command::new("show")
                        .about("Show the entire config for debugging purposes")
                        .after_help(
                            "This dumps out the entire config including the values which \
                             are not in the config file but filled in from defaults.",
                        )
                        .arg(
                            Arg::new("format")
                                .short('f')
                                .long("format")
                                .value_parser(["debug", "yaml"])
                                .default_value("yaml")
                                .action(ArgAction::Set)
                                .help("The output format"),
                        ),
                ),
        )
}
