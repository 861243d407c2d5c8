//! Upgrade operations running within a started transaction: image sync,
//! three-way merge of snapshotted rw volumes, fstab maintenance and the
//! final snapshot lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use regex::Regex;

use crate::btrfs::{SNAPSHOTS_PATH, TOP_SUBVOL};
use crate::chroot::Chroot;
use crate::deployment::{ImageSource, PartRole};
use crate::fstab::{self, FstabLine, FSTAB_FILE};
use crate::rsync::Rsync;
use crate::snapper::config_name;
use crate::unpack::Unpacker;

use super::{
    snapshot_id_from_path, MergePaths, SnapperTransaction, Transaction, TxStatus,
    FIRST_SNAPSHOT_ID,
};

impl<'a> SnapperTransaction<'a> {
    fn ensure_started(&self, transaction: &Transaction) -> Result<()> {
        self.token().err_if_cancelled()?;
        if transaction.status != TxStatus::Started {
            bail!("transaction '{}' is not started", transaction.id);
        }
        Ok(())
    }

    /// Syncs the image tree into the transaction's snapshot.
    ///
    /// The first transaction fully populates persistent paths so `/etc`,
    /// `/var` and friends receive their initial content; upgrades only
    /// sync the immutable content and snapshotted paths. Sets the source
    /// digest on success.
    pub fn sync_image_content(
        &mut self,
        image_source: &mut ImageSource,
        transaction: &Transaction,
    ) -> Result<()> {
        self.ensure_started(transaction)?;
        log::info!("unpacking image source: {image_source}");

        let full_sync = transaction.id == FIRST_SNAPSHOT_ID;
        let excludes = self.sync_excludes(full_sync);
        let delete_excludes = self.sync_delete_excludes();

        let unpacker = Unpacker::new(self.hal(), self.token().clone(), image_source);
        let digest = unpacker
            .synched_unpack(&transaction.path, &excludes, &delete_excludes)
            .with_context(|| format!("unpacking image to '{}'", transaction.path.display()))?;
        if !digest.is_empty() {
            image_source.set_digest(digest);
        }
        Ok(())
    }

    /// Excluded directories for the image sync. Non snapshotted rw volumes
    /// and foreign mount points are excluded on upgrades but included for
    /// the very first snapshot at installation time.
    pub(super) fn sync_excludes(&self, full_sync: bool) -> Vec<PathBuf> {
        let mut excludes = vec![Path::new("/").join(SNAPSHOTS_PATH)];
        for part in self.partitions() {
            if !full_sync && part.role != PartRole::System {
                if let Some(mount_point) = &part.mount_point {
                    excludes.push(mount_point.clone());
                }
            }
            for volume in &part.rw_volumes {
                if volume.snapshotted {
                    excludes.push(volume.path.join(SNAPSHOTS_PATH));
                } else if !full_sync {
                    excludes.push(volume.path.clone());
                }
            }
        }
        excludes
    }

    /// Paths protected from deletion at the sync destination. RW volume
    /// paths are likely mountpoints and must never be deleted by the sync.
    pub(super) fn sync_delete_excludes(&self) -> Vec<PathBuf> {
        let mut excludes = vec![Path::new("/").join(SNAPSHOTS_PATH)];
        for part in self.partitions() {
            if part.role != PartRole::System {
                if let Some(mount_point) = &part.mount_point {
                    excludes.push(mount_point.clone());
                }
            }
            for volume in &part.rw_volumes {
                excludes.push(volume.path.clone());
            }
        }
        excludes
    }

    /// Performs the three-way merge of snapshotted rw volumes.
    ///
    /// Conflicts are resolved by always keeping customizations over
    /// changes coming from the OS image.
    pub fn merge(&mut self, transaction: &mut Transaction) -> Result<()> {
        self.ensure_started(transaction)?;

        log::info!("configuring snapper");
        self.configure_snapper(transaction)
            .context("configuring snapper")?;

        log::info!("starting three-way merge of snapshotted rw volumes");
        self.run_merges(transaction)
            .context("merging content of snapshotted rw volumes")?;
        Ok(())
    }

    fn configure_snapper(&mut self, transaction: &mut Transaction) -> Result<()> {
        self.snapper()
            .configure_root(&transaction.path, self.max_snapshots())
            .context("setting root configuration")?;
        self.configure_rw_volumes(transaction)
            .context("configuring snapshotted subvolumes")
    }

    /// Creates the per-volume snapper configuration and a stock snapshot
    /// inside the staged snapshot. Runs chrooted without the default API
    /// filesystem binds.
    fn configure_rw_volumes(&mut self, transaction: &mut Transaction) -> Result<()> {
        let volumes: Vec<PathBuf> = self
            .partitions()
            .iter()
            .flat_map(|p| p.rw_volumes.iter())
            .filter(|v| v.snapshotted)
            .map(|v| v.path.clone())
            .collect();
        if volumes.is_empty() {
            return Ok(());
        }

        let snapper = self.snapper();
        let callback_volumes = volumes.clone();
        let mut chroot = Chroot::new(self.hal(), self.token().clone(), &transaction.path)
            .without_default_binds();
        chroot.run_callback(move || {
            for volume in &callback_volumes {
                snapper
                    .create_config(Path::new("/"), volume)
                    .with_context(|| format!("creating config for '{}'", volume.display()))?;

                let description = format!("stock {} contents", volume.display());
                let mut metadata = BTreeMap::new();
                metadata.insert("stock".to_string(), "true".to_string());
                snapper
                    .create_snapshot(
                        Path::new("/"),
                        &config_name(volume),
                        0,
                        false,
                        &description,
                        &metadata,
                    )
                    .with_context(|| format!("creating snapshot '{}'", volume.display()))?;
            }
            Ok(())
        })?;

        for volume in volumes {
            let rel = volume.to_string_lossy();
            let rel = rel.trim_start_matches('/').to_string();
            if let Some(merge) = transaction.merges.get_mut(&volume) {
                merge.new = transaction.path.join(rel);
            }
        }
        Ok(())
    }

    fn run_merges(&mut self, transaction: &mut Transaction) -> Result<()> {
        let volumes: Vec<PathBuf> = transaction.merges.keys().cloned().collect();
        for volume in volumes {
            let merge = transaction.merges[&volume].clone();
            if merge.new.as_os_str().is_empty() {
                continue;
            }
            let tmp_dir = tempfile::tempdir()
                .context("creating temporary directory to store snapper output")?;

            let status_file = tmp_dir
                .path()
                .join(format!("snap_status_{}", config_name(&volume)));
            self.custom_changes_status(&volume, &merge, &status_file)?;
            self.apply_custom_changes(&status_file, &volume, &merge)?;
        }
        Ok(())
    }

    /// Diffs the old stock content against the current customized content
    /// and stores the result in `output`.
    fn custom_changes_status(
        &self,
        volume: &Path,
        merge: &MergePaths,
        output: &Path,
    ) -> Result<()> {
        let old_id = snapshot_id_from_path(&merge.old)?;
        let modified_id = snapshot_id_from_path(&merge.modified)?;
        let root = snapper_root_from_merge(volume, merge)?;
        self.snapper()
            .status(&root, &config_name(volume), output, old_id, modified_id)
    }

    /// Reads the status diff and applies the reported customizations onto
    /// the new volume content.
    fn apply_custom_changes(
        &self,
        status_file: &Path,
        volume: &Path,
        merge: &MergePaths,
    ) -> Result<()> {
        log::debug!("applying custom changes of '{}'", volume.display());
        let content = std::fs::read_to_string(status_file)
            .with_context(|| format!("reading status file '{}'", status_file.display()))?;
        let changes = collect_custom_changes(&content, volume);

        for deleted in &changes.deletions {
            let target = merge.new.join(deleted.trim_start_matches('/'));
            if let Err(err) = std::fs::remove_file(&target) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    std::fs::remove_dir_all(&target)
                        .with_context(|| format!("removing '{}'", target.display()))?;
                }
            }
        }

        if changes.sync_entries.is_empty() {
            return Ok(());
        }
        let sync_files = status_file
            .parent()
            .unwrap_or(Path::new("."))
            .join(format!("sync_{}", config_name(volume)));
        let mut listing = changes.sync_entries.join("\n");
        listing.push('\n');
        std::fs::write(&sync_files, listing)
            .with_context(|| format!("writing modified files list '{}'", sync_files.display()))?;

        let mut flags = crate::rsync::default_flags();
        flags.push(format!("--files-from={}", sync_files.display()));
        Rsync::with_flags(self.hal(), self.token().clone(), flags).sync_data(
            &merge.modified,
            &merge.new,
            &[&format!("/{SNAPSHOTS_PATH}")],
        )
    }

    /// Updates the fstab file of the staged snapshot, creating it when the
    /// image did not ship one.
    pub fn update_fstab(&self, transaction: &Transaction) -> Result<()> {
        self.ensure_started(transaction)?;
        log::info!("updating fstab");

        let fstab_path = transaction.path.join(FSTAB_FILE);
        if fstab_path.exists() {
            return self.update_fstab_lines(transaction, &fstab_path);
        }
        self.create_fstab(transaction, &fstab_path)
            .context("creating fstab")
    }

    fn update_fstab_lines(&self, transaction: &Transaction, fstab_path: &Path) -> Result<()> {
        let mut old_lines = Vec::new();
        let mut new_lines = Vec::new();
        for part in self.partitions() {
            let uuid = part.uuid.clone().unwrap_or_default();
            for volume in &part.rw_volumes {
                if !volume.snapshotted {
                    continue;
                }
                let subvol = snapshot_subvol(transaction.id, &volume.path);
                let mut options = volume.mount_opts.clone();
                options.push(format!("subvol={subvol}"));
                old_lines.push(FstabLine {
                    mount_point: volume.path.clone(),
                    ..Default::default()
                });
                new_lines.push(FstabLine {
                    device: format!("UUID={uuid}"),
                    mount_point: volume.path.clone(),
                    filesystem: part.fs().to_string(),
                    options,
                    fsck_order: 0,
                });
            }
        }
        fstab::update_fstab(fstab_path, &old_lines, &new_lines)
    }

    fn create_fstab(&self, transaction: &Transaction, fstab_path: &Path) -> Result<()> {
        let mut lines = Vec::new();
        for part in self.partitions() {
            let uuid = part
                .uuid
                .as_deref()
                .with_context(|| format!("partition '{}' has no UUID", part.label))?;
            let device = format!("UUID={uuid}");

            if let Some(mount_point) = &part.mount_point {
                let mut options = part.mount_opts.clone();
                let fsck_order = if part.role == PartRole::System {
                    options.insert(0, "ro".to_string());
                    1
                } else {
                    2
                };
                lines.push(FstabLine {
                    device: device.clone(),
                    mount_point: mount_point.clone(),
                    filesystem: part.fs().to_string(),
                    options,
                    fsck_order,
                });
            }

            for volume in &part.rw_volumes {
                let subvol = if volume.snapshotted {
                    snapshot_subvol(transaction.id, &volume.path)
                } else {
                    format!("{TOP_SUBVOL}{}", volume.path.display())
                };
                let mut options = volume.mount_opts.clone();
                options.push(format!("subvol={subvol}"));
                lines.push(FstabLine {
                    device: device.clone(),
                    mount_point: volume.path.clone(),
                    filesystem: part.fs().to_string(),
                    options,
                    fsck_order: 0,
                });
            }

            if part.role == PartRole::System {
                lines.push(FstabLine {
                    device: device.clone(),
                    mount_point: Path::new("/").join(SNAPSHOTS_PATH),
                    filesystem: part.fs().to_string(),
                    options: vec![format!("subvol={TOP_SUBVOL}/{SNAPSHOTS_PATH}")],
                    fsck_order: 0,
                });
            }
        }
        fstab::write_fstab(fstab_path, &lines)
    }

    /// Locks the transaction's snapshot read-only.
    pub fn lock(&self, transaction: &Transaction) -> Result<()> {
        self.ensure_started(transaction)?;
        log::info!("setting new snapshot as read-only");
        self.snapper()
            .set_permissions(&transaction.path, transaction.id, true)
            .context("configuring new snapshot as read-only")
    }
}

/// Subvolume reference of a snapshotted volume inside snapshot `id`.
fn snapshot_subvol(id: u32, volume: &Path) -> String {
    format!(
        "{TOP_SUBVOL}/{SNAPSHOTS_PATH}/{id}/snapshot{}",
        volume.display()
    )
}

/// Determines the snapper root shared by the old and modified snapshot
/// paths of a merge.
fn snapper_root_from_merge(volume: &Path, merge: &MergePaths) -> Result<PathBuf> {
    let pattern = format!(
        r"(.*){}/\.snapshots/\d+/snapshot$",
        regex::escape(&volume.to_string_lossy())
    );
    let re = Regex::new(&pattern).context("building merge root pattern")?;

    let old = merge.old.to_string_lossy();
    let old_root = re
        .captures(&old)
        .with_context(|| format!("could not determine snapper root for '{old}'"))?[1]
        .to_string();

    let modified = merge.modified.to_string_lossy();
    let modified_root = re
        .captures(&modified)
        .with_context(|| format!("could not determine snapper root for '{modified}'"))?[1]
        .to_string();

    if old_root != modified_root {
        bail!("could not determine snapper root, inconsistent merge");
    }
    Ok(PathBuf::from(modified_root))
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct CustomChanges {
    /// Paths (relative to the volume) removed by the user.
    pub deletions: Vec<String>,
    /// Paths (relative to the volume) created or modified by the user.
    pub sync_entries: Vec<String>,
}

/// Parses `snapper status` output into the change set to replay.
///
/// Lines whose first four action columns are unchanged carry extended
/// attribute changes only; those are spurious because the stock snapshot
/// predates the SELinux relabel, so they are skipped.
pub(crate) fn collect_custom_changes(content: &str, volume: &Path) -> CustomChanges {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN
        .get_or_init(|| Regex::new(r"(([-+ct.])[p.][u.][g.][x.][a.])\s+(.*)").unwrap());
    let volume_prefix = volume.to_string_lossy();

    let mut changes = CustomChanges::default();
    for line in content.lines() {
        let Some(captures) = re.captures(line) else {
            continue;
        };
        let mask = &captures[1];
        let path = captures[3].trim();
        if mask.starts_with("....") {
            continue;
        }
        let stripped = path
            .strip_prefix(volume_prefix.as_ref())
            .unwrap_or(path)
            .to_string();
        if mask.starts_with('-') {
            changes.deletions.push(stripped);
        } else {
            changes.sync_entries.push(stripped);
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_lines_are_classified() {
        let content = "\
+.....  /etc/new.conf
c.....  /etc/changed.conf
-.....  /etc/removed.conf
....x.  /etc/xattr-only.conf
t.....  /etc/type-changed
garbage line
";
        let changes = collect_custom_changes(content, Path::new("/etc"));
        assert_eq!(changes.deletions, vec!["/removed.conf"]);
        assert_eq!(
            changes.sync_entries,
            vec!["/new.conf", "/changed.conf", "/type-changed"]
        );
    }

    #[test]
    fn xattr_only_lines_are_skipped() {
        let changes = collect_custom_changes("....x.  /etc/spurious\n", Path::new("/etc"));
        assert_eq!(changes, CustomChanges::default());
    }

    #[test]
    fn permission_changes_are_synced() {
        let changes = collect_custom_changes(".p....  /etc/chmod-only\n", Path::new("/etc"));
        assert_eq!(changes.sync_entries, vec!["/chmod-only"]);
    }

    #[test]
    fn snapshot_subvol_references() {
        assert_eq!(
            snapshot_subvol(4, Path::new("/etc")),
            "@/.snapshots/4/snapshot/etc"
        );
    }

    #[test]
    fn merge_root_requires_consistent_parents() {
        let merge = MergePaths {
            old: PathBuf::from("/mnt/@/.snapshots/3/snapshot/etc/.snapshots/1/snapshot"),
            modified: PathBuf::from("/mnt/@/.snapshots/3/snapshot/etc/.snapshots/7/snapshot"),
            new: PathBuf::from("/mnt/@/.snapshots/4/snapshot/etc"),
        };
        let root = snapper_root_from_merge(Path::new("/etc"), &merge).unwrap();
        assert_eq!(root, PathBuf::from("/mnt/@/.snapshots/3/snapshot"));

        let inconsistent = MergePaths {
            old: PathBuf::from("/mnt/@/.snapshots/2/snapshot/etc/.snapshots/1/snapshot"),
            ..merge
        };
        assert!(snapper_root_from_merge(Path::new("/etc"), &inconsistent).is_err());
    }

    #[test]
    fn merge_root_rejects_unparsable_paths() {
        let merge = MergePaths {
            old: PathBuf::from("/somewhere/else"),
            modified: PathBuf::from("/somewhere/else"),
            new: PathBuf::new(),
        };
        assert!(snapper_root_from_merge(Path::new("/etc"), &merge).is_err());
    }
}
