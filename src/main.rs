use std::sync::Arc;

use clap::Parser;

use apiwitness::cli::Cli;
use apiwitness::error::Error;
use apiwitness::logger::Logger;
use apiwitness::supervisor;

/// Maps the run outcome to the process exit status. Subcommand exit codes
/// pass through verbatim.
fn exit_code(err: &Error) -> i32 {
    match err {
        Error::Subcommand { code } => *code,
        Error::TraceEmpty => 1,
        Error::Config(_)
        | Error::NoInterfaces
        | Error::UnknownInterface(_)
        | Error::InvalidFilter { .. }
        | Error::OutputDir { .. } => 2,
        Error::CaptureOpen { .. } | Error::CaptureRead { .. } => 3,
        Error::Ingest(_) | Error::ArchiveWrite { .. } => 4,
    }
}

fn main() {
    let cli = Cli::parse();

    let logger = match Logger::new(cli.json, cli.log_file.as_deref(), cli.debug) {
        Ok(logger) => Arc::new(logger),
        Err(e) => {
            eprintln!("error: failed to open log file: {}", e);
            std::process::exit(2);
        }
    };

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(2);
        }
    };

    // The shipped binary has no ingest client; remote output is available
    // to embedders that supply one.
    match supervisor::run(config, None, logger) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(exit_code(&e));
        }
    }
}
