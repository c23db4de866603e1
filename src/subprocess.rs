//! Subcommand execution.
//!
//! When a command bounds the capture's lifetime, its stdout and stderr are
//! piped straight through, bracketed by a textual delimiter so the
//! subcommand's output is easy to separate from the capture's own.
//! A non-zero exit becomes [`Error::Subcommand`] so the process can
//! propagate the subcommand's exit code verbatim.

use std::process::{Command, Stdio};

use crate::error::Error;

/// Printed to stdout and stderr before and after the subcommand runs.
pub const OUTPUT_DELIMITER: &str = "======= _AKITA_SUBCOMMAND_ =======";

/// Runs `command` in a shell, optionally as another user via sudo.
pub fn run_command(user: Option<&str>, command: &str) -> Result<(), Error> {
    println!("{}", OUTPUT_DELIMITER);
    eprintln!("{}", OUTPUT_DELIMITER);

    let mut cmd = match user {
        Some(user) => {
            let mut c = Command::new("sudo");
            c.args(["-u", user, "sh", "-c", command]);
            c
        }
        None => {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        }
    };

    let status = cmd
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .map_err(|e| Error::Config(format!("failed to run subcommand: {}", e)));

    println!("{}", OUTPUT_DELIMITER);
    eprintln!("{}", OUTPUT_DELIMITER);

    let status = status?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::Subcommand {
            code: status.code().unwrap_or(1),
        })
    }
}
