//! Fake HAL implementation for testing.
//!
//! Records all operations without executing them, so deployment workflows
//! can be exercised in CI without root privileges or real block devices.
//! External command conversations (sgdisk, snapper, lsblk, grub2-editenv)
//! are driven by scripted per-program outputs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex};

use super::loop_ops::LoopOps;
use super::mount_ops::MountOps;
use super::process_ops::{CommandOptions, ProcessOps};
use super::syscall_ops::SyscallOps;
use crate::{CancelToken, HalError, HalResult};

/// Operation records for testing and verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Mount {
        source: PathBuf,
        target: PathBuf,
        fstype: Option<String>,
        options: Vec<String>,
    },
    Unmount {
        target: PathBuf,
    },
    Command {
        program: String,
        args: Vec<String>,
    },
    LoopAttach {
        image: PathBuf,
    },
    LoopDetach {
        device: String,
    },
    Chroot {
        path: PathBuf,
    },
    Chdir {
        path: PathBuf,
    },
    Fchdir,
}

#[derive(Debug, Clone)]
struct ScriptedResult {
    /// Substring one of the arguments must contain; `None` matches any
    /// invocation.
    matcher: Option<String>,
    /// `Ok` carries stdout, `Err` carries stderr for a simulated failure.
    result: Result<String, String>,
}

#[derive(Debug, Default)]
struct FakeHalState {
    operations: Vec<Operation>,
    mounted_paths: HashSet<PathBuf>,
    /// Scripted command results keyed by program name.
    scripted: HashMap<String, VecDeque<ScriptedResult>>,
    /// Programs that fire the given token and report cancellation when run.
    cancel_on: Vec<(String, CancelToken)>,
    loop_counter: u32,
}

/// Fake HAL implementation that records operations without executing them.
#[derive(Debug, Clone, Default)]
pub struct FakeHal {
    state: Arc<Mutex<FakeHalState>>,
}

impl FakeHal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all recorded operations.
    pub fn operations(&self) -> Vec<Operation> {
        self.state.lock().unwrap().operations.clone()
    }

    /// Recorded commands as `(program, args)` pairs, in execution order.
    pub fn commands(&self) -> Vec<(String, Vec<String>)> {
        self.state
            .lock()
            .unwrap()
            .operations
            .iter()
            .filter_map(|op| match op {
                Operation::Command { program, args } => Some((program.clone(), args.clone())),
                _ => None,
            })
            .collect()
    }

    /// Check if a specific operation was recorded.
    pub fn has_operation(&self, check: impl Fn(&Operation) -> bool) -> bool {
        self.state.lock().unwrap().operations.iter().any(check)
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.operations.clear();
        state.mounted_paths.clear();
        state.scripted.clear();
    }

    fn push_scripted(&self, program: &str, scripted: ScriptedResult) {
        self.state
            .lock()
            .unwrap()
            .scripted
            .entry(program.to_string())
            .or_default()
            .push_back(scripted);
    }

    /// Queue a successful stdout for the next invocation of `program`.
    pub fn push_command_output(&self, program: &str, stdout: &str) {
        self.push_scripted(
            program,
            ScriptedResult {
                matcher: None,
                result: Ok(stdout.to_string()),
            },
        );
    }

    /// Queue a successful stdout for the next invocation of `program`
    /// whose arguments contain `arg_substr`. Invocations that match no
    /// queued entry fall back to empty success without consuming one.
    pub fn push_command_output_matching(&self, program: &str, arg_substr: &str, stdout: &str) {
        self.push_scripted(
            program,
            ScriptedResult {
                matcher: Some(arg_substr.to_string()),
                result: Ok(stdout.to_string()),
            },
        );
    }

    /// Queue a failure for the next invocation of `program`.
    pub fn push_command_failure(&self, program: &str, stderr: &str) {
        self.push_scripted(
            program,
            ScriptedResult {
                matcher: None,
                result: Err(stderr.to_string()),
            },
        );
    }

    /// Fire `token` and report cancellation when `program` is run. Used to
    /// simulate cancellation arriving in the middle of a long subprocess.
    pub fn cancel_on_command(&self, program: &str, token: &CancelToken) {
        self.state
            .lock()
            .unwrap()
            .cancel_on
            .push((program.to_string(), token.clone()));
    }

    fn record(&self, op: Operation) {
        self.state.lock().unwrap().operations.push(op);
    }

    /// Pops the next queued entry matching this invocation.
    ///
    /// Entries without a matcher are consumed strictly in FIFO order;
    /// matcher-carrying entries are only consumed by invocations whose
    /// arguments contain the matcher.
    fn next_scripted(&self, program: &str, args: &[&str]) -> Option<Result<String, String>> {
        let mut state = self.state.lock().unwrap();
        let queue = state.scripted.get_mut(program)?;
        let index = queue.iter().position(|entry| match &entry.matcher {
            None => true,
            Some(matcher) => args.iter().any(|a| a.contains(matcher.as_str())),
        })?;
        // A positional (matcher-less) entry at the front always wins; a
        // matched entry deeper in the queue is pulled out of order.
        queue.remove(index).map(|entry| entry.result)
    }

    fn run_scripted(&self, token: &CancelToken, program: &str, args: &[&str]) -> HalResult<Output> {
        token.err_if_cancelled()?;
        let cancel = {
            let state = self.state.lock().unwrap();
            state
                .cancel_on
                .iter()
                .find(|(p, _)| p == program)
                .map(|(_, t)| t.clone())
        };
        if let Some(cancel_token) = cancel {
            cancel_token.cancel();
            return Err(HalError::Cancelled);
        }

        self.record(Operation::Command {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        });

        match self.next_scripted(program, args) {
            Some(Ok(stdout)) => Ok(Output {
                status: ExitStatus::from_raw(0),
                stdout: stdout.into_bytes(),
                stderr: Vec::new(),
            }),
            Some(Err(stderr)) => Err(HalError::CommandFailed {
                program: program.to_string(),
                code: Some(1),
                stderr,
            }),
            None => Ok(Output {
                status: ExitStatus::from_raw(0),
                stdout: Vec::new(),
                stderr: Vec::new(),
            }),
        }
    }
}

impl ProcessOps for FakeHal {
    fn command_output(
        &self,
        token: &CancelToken,
        program: &str,
        args: &[&str],
        _opts: &CommandOptions,
    ) -> HalResult<Output> {
        self.run_scripted(token, program, args)
    }

    fn command_stream(
        &self,
        token: &CancelToken,
        program: &str,
        args: &[&str],
        _opts: &CommandOptions,
        on_stdout: &mut dyn FnMut(&str),
        _on_stderr: &mut dyn FnMut(&str),
    ) -> HalResult<()> {
        let output = self.run_scripted(token, program, args)?;
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            on_stdout(line);
        }
        Ok(())
    }
}

impl MountOps for FakeHal {
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fstype: Option<&str>,
        options: &[String],
    ) -> HalResult<()> {
        self.record(Operation::Mount {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            fstype: fstype.map(String::from),
            options: options.to_vec(),
        });
        self.state
            .lock()
            .unwrap()
            .mounted_paths
            .insert(target.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> HalResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.mounted_paths.remove(target) {
            return Err(HalError::NotMounted(target.to_path_buf()));
        }
        state.operations.push(Operation::Unmount {
            target: target.to_path_buf(),
        });
        Ok(())
    }

    fn is_mounted(&self, target: &Path) -> HalResult<bool> {
        Ok(self.state.lock().unwrap().mounted_paths.contains(target))
    }
}

impl LoopOps for FakeHal {
    fn losetup_attach(&self, image: &Path, _scan_partitions: bool) -> HalResult<String> {
        self.record(Operation::LoopAttach {
            image: image.to_path_buf(),
        });
        let mut state = self.state.lock().unwrap();
        state.loop_counter += 1;
        Ok(format!("/dev/loop{}", state.loop_counter - 1))
    }

    fn losetup_detach(&self, loop_device: &str) -> HalResult<()> {
        self.record(Operation::LoopDetach {
            device: loop_device.to_string(),
        });
        Ok(())
    }
}

impl SyscallOps for FakeHal {
    fn chroot(&self, path: &Path) -> HalResult<()> {
        self.record(Operation::Chroot {
            path: path.to_path_buf(),
        });
        Ok(())
    }

    fn chdir(&self, path: &Path) -> HalResult<()> {
        self.record(Operation::Chdir {
            path: path.to_path_buf(),
        });
        Ok(())
    }

    fn fchdir(&self, _dir: &File) -> HalResult<()> {
        self.record(Operation::Fchdir);
        Ok(())
    }
}
