//! Scoped chroot environment.
//!
//! Bind-mounts the default API filesystems plus any configured extra binds
//! into the target root, runs a callback (or a command) chrooted, and
//! restores the previous root through a saved directory descriptor before
//! returning.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use elemental_hal::{CancelToken, CommandOptions, MountOps, ProcessOps, SyscallOps, SystemHal};

const DEFAULT_MOUNTS: [&str; 4] = ["/dev", "/dev/pts", "/proc", "/sys"];

pub struct Chroot<'a> {
    hal: &'a dyn SystemHal,
    token: CancelToken,
    path: PathBuf,
    default_mounts: Vec<PathBuf>,
    /// External path -> path inside the chroot. Kept sorted by the external
    /// key so bind setup order is deterministic.
    extra_mounts: BTreeMap<PathBuf, PathBuf>,
    active_mounts: Vec<PathBuf>,
}

impl<'a> Chroot<'a> {
    pub fn new(hal: &'a dyn SystemHal, token: CancelToken, path: impl Into<PathBuf>) -> Self {
        Self {
            hal,
            token,
            path: path.into(),
            default_mounts: DEFAULT_MOUNTS.iter().map(PathBuf::from).collect(),
            extra_mounts: BTreeMap::new(),
            active_mounts: Vec::new(),
        }
    }

    /// Suppresses the `/dev`, `/dev/pts`, `/proc` and `/sys` binds. Used
    /// when the callback only drives tools that operate on plain files.
    pub fn without_default_binds(mut self) -> Self {
        self.default_mounts.clear();
        self
    }

    /// Sets additional bind mounts, keyed by the path outside the chroot.
    pub fn set_extra_mounts(&mut self, mounts: BTreeMap<PathBuf, PathBuf>) {
        self.extra_mounts = mounts;
    }

    pub fn active_mounts(&self) -> &[PathBuf] {
        &self.active_mounts
    }

    fn mount_point_for(&self, inner: &Path) -> PathBuf {
        let inner = inner.to_string_lossy();
        let base = self.path.to_string_lossy();
        PathBuf::from(format!("{}{}", base.trim_end_matches('/'), inner))
    }

    /// Creates and binds the default and extra mounts.
    ///
    /// If any mount fails, everything mounted so far is unmounted again; a
    /// second `prepare` without an intervening `close` is rejected.
    pub fn prepare(&mut self) -> Result<()> {
        if !self.active_mounts.is_empty() {
            bail!("there are already active mountpoints for this instance");
        }

        let result = self.prepare_mounts();
        if result.is_err() {
            if let Err(close_err) = self.close() {
                log::error!("cleaning up after failed chroot preparation: {close_err:#}");
            }
        }
        result
    }

    fn prepare_mounts(&mut self) -> Result<()> {
        let defaults: Vec<(PathBuf, PathBuf)> = self
            .default_mounts
            .iter()
            .map(|m| (m.clone(), m.clone()))
            .collect();
        let extras: Vec<(PathBuf, PathBuf)> = self
            .extra_mounts
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (external, internal) in defaults.into_iter().chain(extras) {
            let mount_point = self.mount_point_for(&internal);
            if external.is_file() {
                // Binding a file requires an existing file as target.
                if let Some(parent) = mount_point.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating '{}'", parent.display()))?;
                }
                if !mount_point.exists() {
                    std::fs::write(&mount_point, "")
                        .with_context(|| format!("creating '{}'", mount_point.display()))?;
                }
            } else {
                std::fs::create_dir_all(&mount_point)
                    .with_context(|| format!("creating '{}'", mount_point.display()))?;
            }
            log::debug!("mounting {} to chroot", mount_point.display());
            self.hal
                .bind_mount(&external, &mount_point)
                .with_context(|| format!("binding '{}'", external.display()))?;
            self.active_mounts.push(mount_point);
        }
        Ok(())
    }

    /// Unmounts all active mounts in reverse order.
    ///
    /// Mounts that fail to unmount are retained in the active list so a
    /// retry is possible; the error enumerates them.
    pub fn close(&mut self) -> Result<()> {
        // Syncing before unmounting reduces device-busy errors observed on
        // trivial or very fast callbacks.
        let _ = self.hal.command_output(
            &self.token,
            "sync",
            &[],
            &CommandOptions::with_timeout(Duration::from_secs(60)),
        );

        let mut failures = Vec::new();
        while let Some(current) = self.active_mounts.pop() {
            log::debug!("unmounting {} from chroot", current.display());
            if let Err(err) = self.hal.unmount(&current) {
                log::error!("error unmounting {}: {err}", current.display());
                failures.push(current);
            }
        }
        if !failures.is_empty() {
            let listed: Vec<String> = failures.iter().map(|p| p.display().to_string()).collect();
            self.active_mounts = failures;
            bail!("failed closing chroot environment, unmount failures: {listed:?}");
        }
        Ok(())
    }

    /// Runs the given callback inside the chroot.
    pub fn run_callback<T>(&mut self, callback: impl FnOnce() -> Result<T>) -> Result<T> {
        let cwd = std::env::current_dir().context("reading current directory")?;

        if !self.path.is_absolute() {
            let absolute = cwd.join(&self.path);
            log::warn!(
                "requested chroot path {} is not absolute, changing it to {}",
                self.path.display(),
                absolute.display()
            );
            self.path = absolute;
        }

        let old_root = File::open("/").context("opening current root")?;

        let prepared_here = self.active_mounts.is_empty();
        if prepared_here {
            self.prepare().context("preparing chroot binds")?;
        }

        let mut result = self.enter_and_run(&old_root, callback);

        if prepared_here {
            if let Err(close_err) = self.close() {
                result = match result {
                    Ok(_) => Err(close_err),
                    Err(err) => Err(err.context(format!("closing chroot: {close_err:#}"))),
                };
            }
        }

        if let Err(err) = std::env::set_current_dir(&cwd) {
            let restore = anyhow!(err).context("restoring working directory");
            result = match result {
                Ok(_) => Err(restore),
                Err(err) => Err(err.context(format!("{restore:#}"))),
            };
        }
        result
    }

    fn enter_and_run<T>(
        &mut self,
        old_root: &File,
        callback: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        self.hal
            .chdir(&self.path)
            .with_context(|| format!("changing directory to '{}'", self.path.display()))?;
        self.hal
            .chroot(&self.path)
            .with_context(|| format!("chrooting into '{}'", self.path.display()))?;

        let result = callback();

        // Always restore the original root before surfacing the callback
        // result, the process must never keep running inside the target.
        let restore = || -> Result<()> {
            self.hal.fchdir(old_root).context("returning to old root")?;
            self.hal
                .chroot(Path::new("."))
                .context("chrooting back to old root")?;
            Ok(())
        };
        match (result, restore()) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(restore_err)) => Err(restore_err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(restore_err)) => Err(err.context(format!("{restore_err:#}"))),
        }
    }

    /// Executes a command inside the chroot and returns its stdout.
    pub fn run(&mut self, program: &str, args: &[&str]) -> Result<Vec<u8>> {
        let hal = self.hal;
        let token = self.token.clone();
        let program_owned = program.to_string();
        let args_owned: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.run_callback(move || {
            let args: Vec<&str> = args_owned.iter().map(String::as_str).collect();
            let output = hal.command_output(
                &token,
                &program_owned,
                &args,
                &CommandOptions::default(),
            )?;
            Ok(output.stdout)
        })
        .with_context(|| format!("running '{program}' in chroot"))
    }
}

/// Runs the given callback in a chroot at `path` with the default binds
/// plus `bind_mounts`.
pub fn chrooted_callback<T>(
    hal: &dyn SystemHal,
    token: CancelToken,
    path: &Path,
    bind_mounts: BTreeMap<PathBuf, PathBuf>,
    callback: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let mut chroot = Chroot::new(hal, token, path);
    chroot.set_extra_mounts(bind_mounts);
    chroot.run_callback(callback)
}

#[cfg(test)]
mod tests {
    use elemental_hal::{FakeHal, Operation};

    use super::*;

    fn chroot_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn prepare_then_close_leaves_zero_active_mounts() {
        let dir = chroot_dir();
        let hal = FakeHal::new();
        let mut chroot = Chroot::new(&hal, CancelToken::new(), dir.path());
        chroot.prepare().unwrap();
        assert_eq!(chroot.active_mounts().len(), 4);
        chroot.close().unwrap();
        assert!(chroot.active_mounts().is_empty());

        for mnt in DEFAULT_MOUNTS {
            let target = PathBuf::from(format!("{}{}", dir.path().display(), mnt));
            assert!(!hal.is_mounted(&target).unwrap());
        }
    }

    #[test]
    fn double_prepare_is_rejected() {
        let dir = chroot_dir();
        let hal = FakeHal::new();
        let mut chroot = Chroot::new(&hal, CancelToken::new(), dir.path());
        chroot.prepare().unwrap();
        let err = chroot.prepare().unwrap_err();
        assert!(err.to_string().contains("already active"));
    }

    #[test]
    fn extra_mounts_are_bound_in_sorted_order() {
        let dir = chroot_dir();
        let hal = FakeHal::new();
        let mut chroot = Chroot::new(&hal, CancelToken::new(), dir.path()).without_default_binds();
        let mut extra = BTreeMap::new();
        extra.insert(PathBuf::from("/z/outside"), PathBuf::from("/z-inside"));
        extra.insert(PathBuf::from("/a/outside"), PathBuf::from("/a-inside"));
        chroot.set_extra_mounts(extra);
        chroot.prepare().unwrap();

        let sources: Vec<PathBuf> = hal
            .operations()
            .iter()
            .filter_map(|op| match op {
                Operation::Mount { source, .. } => Some(source.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            sources,
            vec![PathBuf::from("/a/outside"), PathBuf::from("/z/outside")]
        );
        chroot.close().unwrap();
    }

    #[test]
    fn callback_runs_between_chroot_and_restore() {
        let dir = chroot_dir();
        let hal = FakeHal::new();
        let mut chroot = Chroot::new(&hal, CancelToken::new(), dir.path());
        chroot.run_callback(|| Ok(())).unwrap();

        let ops = hal.operations();
        let chroots: Vec<&Operation> = ops
            .iter()
            .filter(|op| matches!(op, Operation::Chroot { .. }))
            .collect();
        // Once into the target, once back to the saved root.
        assert_eq!(chroots.len(), 2);
        assert!(matches!(
            chroots[1],
            Operation::Chroot { path } if path == Path::new(".")
        ));
        assert!(ops.iter().any(|op| matches!(op, Operation::Fchdir)));
        assert!(chroot.active_mounts().is_empty());
    }

    #[test]
    fn failing_callback_still_tears_everything_down() {
        let dir = chroot_dir();
        let hal = FakeHal::new();
        let mut chroot = Chroot::new(&hal, CancelToken::new(), dir.path());
        let err = chroot
            .run_callback(|| -> Result<()> { Err(anyhow!("callback exploded")) })
            .unwrap_err();

        assert!(format!("{err:#}").contains("callback exploded"));
        assert!(chroot.active_mounts().is_empty());
        // The root was restored despite the failure.
        assert!(hal.has_operation(|op| matches!(op, Operation::Fchdir)));
        // A sync ran before the unmounts.
        let commands = hal.commands();
        assert_eq!(
            commands.iter().filter(|(p, _)| p == "sync").count(),
            1
        );
        // No mounts remain.
        for mnt in DEFAULT_MOUNTS {
            let target = PathBuf::from(format!("{}{}", dir.path().display(), mnt));
            assert!(!hal.is_mounted(&target).unwrap());
        }
    }

    #[test]
    fn run_executes_the_command_between_enter_and_restore() {
        let dir = chroot_dir();
        let hal = FakeHal::new();
        hal.push_command_output("os-prober", "ok\n");
        let mut chroot = Chroot::new(&hal, CancelToken::new(), dir.path());
        let stdout = chroot.run("os-prober", &["--all"]).unwrap();
        assert_eq!(stdout, b"ok\n");

        let ops = hal.operations();
        let enter = ops
            .iter()
            .position(|op| matches!(op, Operation::Chroot { path } if path == dir.path()))
            .unwrap();
        let command = ops
            .iter()
            .position(|op| matches!(
                op,
                Operation::Command { program, .. } if program == "os-prober"
            ))
            .unwrap();
        let restore = ops
            .iter()
            .position(|op| matches!(op, Operation::Chroot { path } if path == Path::new(".")))
            .unwrap();
        assert!(enter < command && command < restore);
    }

    #[test]
    fn unmounts_happen_in_reverse_mount_order() {
        let dir = chroot_dir();
        let hal = FakeHal::new();
        let mut chroot = Chroot::new(&hal, CancelToken::new(), dir.path());
        chroot.prepare().unwrap();
        chroot.close().unwrap();

        let mounts: Vec<PathBuf> = hal
            .operations()
            .iter()
            .filter_map(|op| match op {
                Operation::Mount { target, .. } => Some(target.clone()),
                _ => None,
            })
            .collect();
        let unmounts: Vec<PathBuf> = hal
            .operations()
            .iter()
            .filter_map(|op| match op {
                Operation::Unmount { target } => Some(target.clone()),
                _ => None,
            })
            .collect();
        let mut reversed = mounts.clone();
        reversed.reverse();
        assert_eq!(unmounts, reversed);
    }

    #[test]
    fn failed_unmounts_are_retained_for_retry() {
        let dir = chroot_dir();
        let hal = FakeHal::new();
        let mut chroot = Chroot::new(&hal, CancelToken::new(), dir.path());
        chroot.prepare().unwrap();
        // Forcibly unmount one entry behind the runner's back so close sees
        // a failure for it.
        let victim = chroot.active_mounts()[1].clone();
        hal.unmount(&victim).unwrap();

        let err = chroot.close().unwrap_err();
        assert!(err.to_string().contains("unmount failures"));
        // The failed entry is retained for a retry.
        assert_eq!(chroot.active_mounts(), &[victim]);
    }
}
