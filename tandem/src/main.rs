//! The Tandem binary.
//!
//! Tandem receives the request and response halves of API calls from a gateway, joins them into
//! complete transactions and forwards a sampled subset to the collector. See [`tandem_server`]
//! for the data flow.
//!
//! # Usage
//!
//! ```text
//! tandem --config .tandem run --application-id <ID>
//! ```
//!
//! The config folder may contain a `config.yml`. All values have defaults except for the
//! application id, which can also be passed through `TANDEM_APPLICATION_ID`.

mod cli;
mod cliapp;
mod setup;

use std::process;

pub fn main() {
    let exit_code = match cli::execute() {
        Ok(()) => 0,
        Err(err) => {
            tandem_log::ensure_error(&err);
            1
        }
    };

    process::exit(exit_code);
}
