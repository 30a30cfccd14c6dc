//! Asynchronous utilities for use with Tokio.
//!
//! We keep the fiddly parts of async Rust and external process handling here,
//! so that the pipeline code can stay readable.

use std::{pin::Pin, process::Output};

use futures::Stream;

use crate::prelude::*;

pub mod blocking;
pub mod io;

/// A type alias for a boxed stream. This is used to make it easier to work
/// streams that return complex types.
pub type BoxedStream<Item> = Pin<Box<dyn Stream<Item = Item> + Send>>;

/// Report any command failures, and include any error output.
///
/// Standard output and standard error are logged at appropriate levels. If
/// `is_error_line` is supplied, a successful exit will still be treated as a
/// failure when any line of standard error matches it.
pub fn check_for_command_failure(
    command_name: &str,
    output: &Output,
    is_error_line: Option<&dyn Fn(&str) -> bool>,
) -> Result<()> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name = command_name,
        bytes = output.stdout.len(),
        "Standard output from command"
    );

    if output.status.success() {
        debug!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command"
        );
        if let Some(is_error_line) = is_error_line {
            if stderr.lines().any(is_error_line) {
                return Err(anyhow!(
                    "{} printed error output:\n{}",
                    command_name,
                    stderr,
                ));
            }
        }
        Ok(())
    } else {
        warn!(
            command_name = command_name,
            output = %stderr,
            "Standard error from failed command",
        );
        if let Some(exit_code) = output.status.code() {
            Err(anyhow!(
                "{} failed with exit code {} and error output:\n{}",
                command_name,
                exit_code,
                stderr,
            ))
        } else {
            Err(anyhow!(
                "{} failed with error output:\n{}",
                command_name,
                stderr,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::process::{Command, Output};

    use super::*;

    fn run(script: &str) -> Output {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .output()
            .expect("sh should be available")
    }

    #[test]
    fn reports_exit_code_and_stderr() {
        let err = check_for_command_failure("sh", &run("echo oops >&2; exit 3"), None)
            .unwrap_err()
            .to_string();
        assert!(err.contains("exit code 3"));
        assert!(err.contains("oops"));
    }

    #[test]
    fn error_lines_fail_successful_commands() {
        let output = run("echo 'Syntax Error: broken xref' >&2");
        assert!(check_for_command_failure("sh", &output, None).is_ok());
        let is_error = |line: &str| line.contains("Error");
        assert!(check_for_command_failure("sh", &output, Some(&is_error)).is_err());
    }
}
