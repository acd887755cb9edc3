mod cli;
mod core;
mod platform;

use std::process;

fn main() {
    let args = cli::parse();

    if let Err(e) = cli::commands::dispatch(args) {
        eprintln!("isorun: {e:#}");
        process::exit(1);
    }
}
