//! Linux HAL implementation using real syscalls and subprocesses.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::process::{Command, ExitStatus, Output, Stdio};
use std::time::{Duration, Instant};

use wait_timeout::ChildExt;

use super::loop_ops::LoopOps;
use super::mount_ops::MountOps;
use super::process_ops::{CommandOptions, ProcessOps};
use super::syscall_ops::SyscallOps;
use crate::{CancelToken, HalError, HalResult};

/// Polling granularity for cancellation while waiting on a child process.
const WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default)]
pub struct LinuxHal;

impl LinuxHal {
    pub fn new() -> Self {
        Self
    }

    fn spawn(
        program: &str,
        args: &[&str],
        opts: &CommandOptions,
    ) -> HalResult<std::process::Child> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &opts.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }
        cmd.spawn().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                HalError::CommandNotFound(program.to_string())
            } else {
                HalError::Io(err)
            }
        })
    }

    /// Wait for the child in short slices, killing it when the token fires
    /// or the deadline passes.
    fn wait_cancellable(
        token: &CancelToken,
        program: &str,
        child: &mut std::process::Child,
        timeout: Duration,
    ) -> HalResult<ExitStatus> {
        let start = Instant::now();
        loop {
            if token.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(HalError::Cancelled);
            }
            if start.elapsed() >= timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(HalError::CommandTimeout {
                    program: program.to_string(),
                    timeout_secs: timeout.as_secs(),
                });
            }
            match child
                .wait_timeout(WAIT_SLICE)
                .map_err(HalError::Io)?
            {
                Some(status) => return Ok(status),
                None => continue,
            }
        }
    }
}

fn check_status(program: &str, status: ExitStatus, stderr: &[u8]) -> HalResult<()> {
    if status.success() {
        return Ok(());
    }
    Err(HalError::CommandFailed {
        program: program.to_string(),
        code: status.code(),
        stderr: String::from_utf8_lossy(stderr).trim_end().to_string(),
    })
}

impl ProcessOps for LinuxHal {
    fn command_output(
        &self,
        token: &CancelToken,
        program: &str,
        args: &[&str],
        opts: &CommandOptions,
    ) -> HalResult<Output> {
        token.err_if_cancelled()?;
        log::debug!("running: {program} {}", args.join(" "));
        let mut child = Self::spawn(program, args, opts)?;

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let stdout_handle = std::thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut out) = stdout.take() {
                let _ = out.read_to_end(&mut buf);
            }
            buf
        });
        let stderr_handle = std::thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut err) = stderr.take() {
                let _ = err.read_to_end(&mut buf);
            }
            buf
        });

        let status = match Self::wait_cancellable(token, program, &mut child, opts.timeout) {
            Ok(status) => status,
            Err(err) => {
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(err);
            }
        };

        let stdout = stdout_handle.join().unwrap_or_default();
        let stderr = stderr_handle.join().unwrap_or_default();
        check_status(program, status, &stderr)?;
        Ok(Output {
            status,
            stdout,
            stderr,
        })
    }

    fn command_stream(
        &self,
        token: &CancelToken,
        program: &str,
        args: &[&str],
        opts: &CommandOptions,
        on_stdout: &mut dyn FnMut(&str),
        on_stderr: &mut dyn FnMut(&str),
    ) -> HalResult<()> {
        token.err_if_cancelled()?;
        log::debug!("running (streamed): {program} {}", args.join(" "));
        let mut child = Self::spawn(program, args, opts)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stderr_handle = std::thread::spawn(move || {
            let mut lines = Vec::new();
            if let Some(err) = stderr {
                for line in BufReader::new(err).lines().map_while(Result::ok) {
                    lines.push(line);
                }
            }
            lines
        });

        // Reading stdout on the calling thread lets the line handler observe
        // progress without synchronization; cancellation is checked per line
        // and again while waiting for exit.
        if let Some(out) = stdout {
            for line in BufReader::new(out).lines().map_while(Result::ok) {
                if token.is_cancelled() {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stderr_handle.join();
                    return Err(HalError::Cancelled);
                }
                on_stdout(&line);
            }
        }

        let status = match Self::wait_cancellable(token, program, &mut child, opts.timeout) {
            Ok(status) => status,
            Err(err) => {
                let _ = stderr_handle.join();
                return Err(err);
            }
        };

        let stderr_lines = stderr_handle.join().unwrap_or_default();
        for line in &stderr_lines {
            on_stderr(line);
        }
        check_status(program, status, stderr_lines.join("\n").as_bytes())
    }
}

impl MountOps for LinuxHal {
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fstype: Option<&str>,
        options: &[String],
    ) -> HalResult<()> {
        let mut flags = nix::mount::MsFlags::empty();
        let mut data = Vec::new();
        for opt in options {
            match opt.as_str() {
                "bind" => flags |= nix::mount::MsFlags::MS_BIND,
                "ro" => flags |= nix::mount::MsFlags::MS_RDONLY,
                other => data.push(other),
            }
        }
        let data = data.join(",");
        let data = (!data.is_empty()).then_some(data.as_str());

        log::debug!(
            "mount {} -> {} (type {:?}, options {:?})",
            source.display(),
            target.display(),
            fstype,
            options
        );
        nix::mount::mount(Some(source), target, fstype, flags, data)?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> HalResult<()> {
        log::debug!("unmount {}", target.display());
        nix::mount::umount2(target, nix::mount::MntFlags::empty())?;
        Ok(())
    }

    fn is_mounted(&self, target: &Path) -> HalResult<bool> {
        let content = std::fs::read_to_string("/proc/self/mountinfo")?;
        let target = target.to_string_lossy();
        Ok(content.lines().any(|line| {
            line.split_whitespace().nth(4).is_some_and(|mnt| mnt == target)
        }))
    }
}

impl LoopOps for LinuxHal {
    fn losetup_attach(&self, image: &Path, scan_partitions: bool) -> HalResult<String> {
        let image = image.to_string_lossy();
        let mut args = vec!["--show", "--find"];
        if scan_partitions {
            args.push("-P");
        }
        args.push(&image);
        let opts = CommandOptions::with_timeout(Duration::from_secs(30));
        let output = self.command_output(&CancelToken::new(), "losetup", &args, &opts)?;
        let device = String::from_utf8(output.stdout)?.trim().to_string();
        if device.is_empty() {
            return Err(HalError::Parse("losetup returned no device".to_string()));
        }
        Ok(device)
    }

    fn losetup_detach(&self, loop_device: &str) -> HalResult<()> {
        let opts = CommandOptions::with_timeout(Duration::from_secs(30));
        self.command_status(&CancelToken::new(), "losetup", &["-d", loop_device], &opts)
    }
}

impl SyscallOps for LinuxHal {
    fn chroot(&self, path: &Path) -> HalResult<()> {
        nix::unistd::chroot(path)?;
        Ok(())
    }

    fn chdir(&self, path: &Path) -> HalResult<()> {
        nix::unistd::chdir(path)?;
        Ok(())
    }

    fn fchdir(&self, dir: &File) -> HalResult<()> {
        nix::unistd::fchdir(dir.as_raw_fd())?;
        Ok(())
    }
}
