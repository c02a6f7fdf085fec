//! External process execution.
//!
//! The driven setup scripts are black boxes with an exit-code contract: a
//! non-zero status is the sole failure signal we consume. Stdout is logged,
//! stderr is surfaced as a warning on success and folded into the error on
//! failure.

use crate::error::{StevedoreError, StevedoreResult};
use log::{info, warn};
use std::process::Command;

/// Captured output of one external invocation.
#[derive(Debug)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

/// Run `argv`, returning the captured output regardless of exit status.
pub fn run(argv: &[String]) -> StevedoreResult<ProcessOutput> {
    let (program, args) = argv.split_first().ok_or_else(|| {
        StevedoreError::ExternalProcess("empty argument vector".into())
    })?;
    let output = Command::new(program).args(args).output().map_err(|err| {
        StevedoreError::ExternalProcess(format!("failed to spawn {program}: {err}"))
    })?;
    Ok(ProcessOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        status: output.status.code().unwrap_or(-1),
    })
}

/// Run `argv` and treat any non-zero exit code as fatal.
pub fn run_checked(argv: &[String]) -> StevedoreResult<ProcessOutput> {
    let output = run(argv)?;
    if !output.stdout.trim().is_empty() {
        info!("output of {}: {}", argv[0], output.stdout.trim());
    }
    if output.status != 0 {
        return Err(StevedoreError::ExternalProcess(format!(
            "{argv:?} failed with err: {}, out: {}, ret: {}",
            output.stderr.trim(),
            output.stdout.trim(),
            output.status
        )));
    }
    if !output.stderr.trim().is_empty() {
        warn!("warning of {}: {}", argv[0], output.stderr.trim());
    }
    Ok(output)
}
