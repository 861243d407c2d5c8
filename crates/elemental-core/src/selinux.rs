//! SELinux relabel call-out.
//!
//! Relabeling runs chrooted in the staged snapshot, after fstab is written
//! and before the snapshot is locked. Targets without an SELinux policy
//! skip the step.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use elemental_hal::{CancelToken, CommandOptions, ProcessOps, SystemHal};

use crate::chroot;

/// Path of the file contexts database relative to a policy directory.
const FILE_CONTEXTS: &str = "contexts/files/file_contexts";

/// Finds the file contexts of the configured policy, if any.
fn find_file_contexts(root: &Path) -> Option<PathBuf> {
    let selinux_dir = root.join("etc/selinux");
    let entries = std::fs::read_dir(&selinux_dir).ok()?;
    let mut candidates: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.join(FILE_CONTEXTS).is_file())
        .collect();
    candidates.sort();
    candidates.first().map(|policy| {
        Path::new("/etc/selinux")
            .join(policy.file_name().unwrap_or_default())
            .join(FILE_CONTEXTS)
    })
}

/// Relabels the whole tree under `root` using the target's own `setfiles`.
///
/// A missing policy or `setfiles` binary downgrades to a debug log entry;
/// an actual relabel failure is fatal so the snapshot is never committed in
/// a labeled-unknown state.
pub fn chrooted_relabel(hal: &dyn SystemHal, token: &CancelToken, root: &Path) -> Result<()> {
    let Some(contexts) = find_file_contexts(root) else {
        log::debug!("no SELinux policy under '{}', skipping relabel", root.display());
        return Ok(());
    };
    if !root.join("usr/sbin/setfiles").is_file() && !root.join("sbin/setfiles").is_file() {
        log::debug!("no setfiles binary under '{}', skipping relabel", root.display());
        return Ok(());
    }

    log::info!("relabeling '{}'", root.display());
    let hal_ref = hal;
    let token_clone = token.clone();
    let contexts_str = contexts.to_string_lossy().to_string();
    chroot::chrooted_callback(hal, token.clone(), root, Default::default(), move || {
        hal_ref
            .command_status(
                &token_clone,
                "setfiles",
                &["-i", "-F", "-e", "/proc", "-e", "/sys", "-e", "/dev", &contexts_str, "/"],
                &CommandOptions::default(),
            )
            .context("running setfiles")?;
        Ok(())
    })
    .with_context(|| format!("relabelling '{}'", root.display()))
}

#[cfg(test)]
mod tests {
    use elemental_hal::FakeHal;

    use super::*;

    #[test]
    fn skips_targets_without_policy() {
        let dir = tempfile::tempdir().unwrap();
        let hal = FakeHal::new();
        chrooted_relabel(&hal, &CancelToken::new(), dir.path()).unwrap();
        assert!(hal.commands().is_empty());
    }

    #[test]
    fn relabels_when_policy_and_setfiles_exist() {
        let dir = tempfile::tempdir().unwrap();
        let policy = dir.path().join("etc/selinux/targeted/contexts/files");
        std::fs::create_dir_all(&policy).unwrap();
        std::fs::write(policy.join("file_contexts"), "").unwrap();
        std::fs::create_dir_all(dir.path().join("usr/sbin")).unwrap();
        std::fs::write(dir.path().join("usr/sbin/setfiles"), "").unwrap();

        let hal = FakeHal::new();
        chrooted_relabel(&hal, &CancelToken::new(), dir.path()).unwrap();

        let commands = hal.commands();
        let setfiles: Vec<_> = commands.iter().filter(|(p, _)| p == "setfiles").collect();
        assert_eq!(setfiles.len(), 1);
        assert!(setfiles[0]
            .1
            .contains(&"/etc/selinux/targeted/contexts/files/file_contexts".to_string()));
    }

    #[test]
    fn relabel_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let policy = dir.path().join("etc/selinux/targeted/contexts/files");
        std::fs::create_dir_all(&policy).unwrap();
        std::fs::write(policy.join("file_contexts"), "").unwrap();
        std::fs::create_dir_all(dir.path().join("sbin")).unwrap();
        std::fs::write(dir.path().join("sbin/setfiles"), "").unwrap();

        let hal = FakeHal::new();
        hal.push_command_failure("setfiles", "relabel exploded");
        let err = chrooted_relabel(&hal, &CancelToken::new(), dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("relabel exploded"));
    }
}
