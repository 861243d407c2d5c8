//! External command execution.
//!
//! Commands are world-touching and must go through the HAL so workflows can
//! be tested without spawning real processes. Every call takes a
//! `CancelToken`; cancellation kills the child and surfaces as
//! `HalError::Cancelled`.

use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;

use crate::{CancelToken, HalResult};

#[derive(Debug, Clone)]
pub struct CommandOptions {
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            env: Vec::new(),
            // Image syncs and mkfs runs are slow on rotational media.
            timeout: Duration::from_secs(3600),
        }
    }
}

impl CommandOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

pub trait ProcessOps {
    /// Run a command to completion and capture its output.
    ///
    /// A non-zero exit status is an error (`HalError::CommandFailed`).
    fn command_output(
        &self,
        token: &CancelToken,
        program: &str,
        args: &[&str],
        opts: &CommandOptions,
    ) -> HalResult<Output>;

    /// Run a command, streaming stdout and stderr line-by-line into the
    /// given handlers.
    fn command_stream(
        &self,
        token: &CancelToken,
        program: &str,
        args: &[&str],
        opts: &CommandOptions,
        on_stdout: &mut dyn FnMut(&str),
        on_stderr: &mut dyn FnMut(&str),
    ) -> HalResult<()>;

    /// Run a command for its side effect only.
    fn command_status(
        &self,
        token: &CancelToken,
        program: &str,
        args: &[&str],
        opts: &CommandOptions,
    ) -> HalResult<()> {
        self.command_output(token, program, args, opts).map(|_| ())
    }
}
