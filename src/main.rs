mod archiver;
mod cli;
mod commands;
mod env_loader;
mod error;
mod logging;
mod tools;

use crate::archiver::config::unknown_env_keys;
use crate::tools::CancelToken;

fn main() {
    env_loader::load_dotenv();

    for key in unknown_env_keys() {
        eprintln!("warning: unknown environment variable {key} is ignored");
    }

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || handler_token.cancel()) {
        eprintln!("warning: interrupt handler not installed: {err}");
    }

    if let Err(err) = cli::run(cancel) {
        eprintln!("error: {err:#}");
        std::process::exit(error::exit_code_for(&err).code());
    }
}
