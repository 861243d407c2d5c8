//! Snapshot-based transactions.
//!
//! Every mutating operation on the deployed system (first install,
//! customization apply, version upgrade) is staged into a new read-only
//! snapshot and either committed or rolled back in its entirety.

mod upgrade_helper;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use elemental_hal::{CancelToken, MountOps, SystemHal};
use regex::Regex;

use crate::btrfs::{self, SNAPSHOTS_PATH, TOP_SUBVOL};
use crate::cleanstack::CleanStack;
use crate::deployment::{Deployment, Partition};
use crate::snapper::{self, Snapper};

/// The install transaction always carries this snapshot ID.
pub const FIRST_SNAPSHOT_ID: u32 = 1;

/// Retention limit handed to the snapshot tool.
pub const DEFAULT_MAX_SNAPSHOTS: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxStatus {
    #[default]
    Init,
    Started,
    Committed,
    RolledBack,
}

/// Snapshot triple driving the three-way merge of one rw volume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergePaths {
    /// Stock content of the volume at the previous snapshot.
    pub old: PathBuf,
    /// User-modified content at the previous snapshot.
    pub modified: PathBuf,
    /// Volume content inside the staged snapshot.
    pub new: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: u32,
    pub path: PathBuf,
    pub status: TxStatus,
    pub merges: HashMap<PathBuf, MergePaths>,
}

/// Parses the snapshot ID out of a `.snapshots/<n>/snapshot` path.
pub(crate) fn snapshot_id_from_path(path: &Path) -> Result<u32> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| Regex::new(r".*/\.snapshots/(\d+)/snapshot$").unwrap());
    let path_str = path.to_string_lossy();
    let captures = re
        .captures(&path_str)
        .with_context(|| format!("could not determine snapshot ID from '{path_str}'"))?;
    captures[1]
        .parse::<u32>()
        .with_context(|| format!("parsing snapshot ID from '{path_str}'"))
}

/// Snapper-backed transaction engine.
pub struct SnapperTransaction<'a> {
    hal: &'a dyn SystemHal,
    token: CancelToken,
    partitions: Vec<Partition>,
    max_snapshots: u32,
    /// Directory the top subvolume `@` is reachable at.
    top_dir: Option<PathBuf>,
    /// Default subvolume before the transaction started, as reported by
    /// `btrfs subvolume get-default`.
    prev_default: Option<String>,
    clean_stack: CleanStack<'a>,
}

impl<'a> SnapperTransaction<'a> {
    pub fn new(hal: &'a dyn SystemHal, token: CancelToken) -> Self {
        Self {
            hal,
            token,
            partitions: Vec::new(),
            max_snapshots: DEFAULT_MAX_SNAPSHOTS,
            top_dir: None,
            prev_default: None,
            clean_stack: CleanStack::new(),
        }
    }

    /// Binds the engine to an already known top subvolume directory,
    /// skipping device discovery in `init`. Used by the installer, which
    /// mounted the system partition itself.
    pub fn with_root(mut self, top_dir: impl Into<PathBuf>) -> Self {
        self.top_dir = Some(top_dir.into());
        self
    }

    pub(crate) fn snapper(&self) -> Snapper<'a> {
        Snapper::new(self.hal, self.token.clone())
    }

    pub(crate) fn hal(&self) -> &'a dyn SystemHal {
        self.hal
    }

    pub(crate) fn token(&self) -> &CancelToken {
        &self.token
    }

    pub(crate) fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub(crate) fn max_snapshots(&self) -> u32 {
        self.max_snapshots
    }

    fn top_dir(&self) -> Result<&Path> {
        self.top_dir
            .as_deref()
            .context("transaction engine not initialized")
    }

    /// Binds the engine to the deployment's system partition and verifies
    /// the target Btrfs layout. Idempotent.
    pub fn init(&mut self, deployment: &Deployment) -> Result<()> {
        self.token.err_if_cancelled()?;
        self.partitions = deployment.partitions().cloned().collect();
        if self.top_dir.is_some() {
            return Ok(());
        }

        let system = deployment
            .get_system_partition()
            .context("deployment has no system partition")?;
        let uuid = system
            .uuid
            .as_deref()
            .context("system partition has no UUID")?;
        let device = crate::block::get_device_by_uuid(self.hal, &self.token, uuid)
            .context("resolving system partition")?
            .with_context(|| format!("no block device with UUID {uuid}"))?;

        let top = device
            .mount_points
            .iter()
            .find_map(|mp| {
                let with_top = mp.join(TOP_SUBVOL);
                if with_top.join(SNAPSHOTS_PATH).is_dir() {
                    Some(with_top)
                } else if mp.join(SNAPSHOTS_PATH).is_dir() {
                    Some(mp.clone())
                } else {
                    None
                }
            })
            .context("system partition does not expose a btrfs snapshot layout")?;

        log::debug!("transaction engine bound to '{}'", top.display());
        self.top_dir = Some(top);
        Ok(())
    }

    /// Acquires the next snapshot ID, creates the snapshot and binds the
    /// snapshots directory into it.
    pub fn start(&mut self) -> Result<Transaction> {
        self.token.err_if_cancelled()?;
        let top = self.top_dir()?.to_path_buf();
        let snapshots_dir = top.join(SNAPSHOTS_PATH);

        self.prev_default = btrfs::get_default(self.hal, &self.token, &top)
            .context("reading current default subvolume")?;

        let active_id = self
            .prev_default
            .as_deref()
            .and_then(|p| snapshot_id_from_path(Path::new(p)).ok());

        let (id, path) = match active_id {
            None => {
                // Fresh layout: the install snapshot is created directly.
                let id = FIRST_SNAPSHOT_ID;
                let path = snapshots_dir.join(id.to_string()).join("snapshot");
                btrfs::create_subvolume(self.hal, &self.token, &path, false)
                    .context("creating install snapshot")?;
                (id, path)
            }
            Some(base) => {
                let id = self
                    .snapper()
                    .create_snapshot(
                        &top,
                        snapper::ROOT_CONFIG,
                        base,
                        true,
                        "elemental update",
                        &Default::default(),
                    )
                    .context("creating update snapshot")?;
                (id, snapshots_dir.join(id.to_string()).join("snapshot"))
            }
        };
        log::info!("started transaction {id} at '{}'", path.display());

        let mut transaction = Transaction {
            id,
            path: path.clone(),
            status: TxStatus::Started,
            merges: HashMap::new(),
        };

        if let Some(base) = active_id {
            let active_path = snapshots_dir.join(base.to_string()).join("snapshot");
            self.prepare_merges(&mut transaction, &active_path)
                .context("preparing rw volume merges")?;
        }

        // Make the snapshots directory reachable from inside the snapshot.
        let bind_target = path.join(SNAPSHOTS_PATH);
        std::fs::create_dir_all(&bind_target)
            .with_context(|| format!("creating '{}'", bind_target.display()))?;
        self.hal
            .bind_mount(&snapshots_dir, &bind_target)
            .context("mounting snapshots volume")?;
        let hal = self.hal;
        self.clean_stack.push(move || {
            hal.unmount(&bind_target)?;
            Ok(())
        });

        Ok(transaction)
    }

    /// Collects the old and modified snapshot paths of every snapshotted
    /// volume from the active snapshot.
    fn prepare_merges(&self, transaction: &mut Transaction, active_path: &Path) -> Result<()> {
        let snapper = self.snapper();
        let volumes: Vec<_> = self
            .partitions
            .iter()
            .flat_map(|p| p.rw_volumes.iter())
            .filter(|v| v.snapshotted)
            .cloned()
            .collect();
        for volume in volumes {
            let rel = volume.path.to_string_lossy();
            let rel = rel.trim_start_matches('/');
            let vol_dir = active_path.join(rel);
            let old = vol_dir
                .join(SNAPSHOTS_PATH)
                .join(FIRST_SNAPSHOT_ID.to_string())
                .join("snapshot");
            if !old.is_dir() {
                log::warn!(
                    "no stock snapshot for '{}', skipping merge",
                    volume.path.display()
                );
                continue;
            }
            let modified_id = snapper
                .create_snapshot(
                    active_path,
                    &snapper::config_name(&volume.path),
                    0,
                    false,
                    "pre-upgrade state",
                    &Default::default(),
                )
                .with_context(|| {
                    format!("snapshotting current state of '{}'", volume.path.display())
                })?;
            let modified = vol_dir
                .join(SNAPSHOTS_PATH)
                .join(modified_id.to_string())
                .join("snapshot");
            transaction.merges.insert(
                volume.path.clone(),
                MergePaths {
                    old,
                    modified,
                    new: PathBuf::new(),
                },
            );
        }
        Ok(())
    }

    /// Makes the transaction's snapshot the new default and releases all
    /// temporary binds. A commit failure promotes the rollback.
    pub fn commit(&mut self, transaction: &mut Transaction) -> Result<()> {
        match self.try_commit(transaction) {
            Ok(()) => {
                transaction.status = TxStatus::Committed;
                log::info!("transaction {} committed", transaction.id);
                Ok(())
            }
            Err(err) => Err(self.rollback(transaction, err)),
        }
    }

    fn try_commit(&mut self, transaction: &Transaction) -> Result<()> {
        self.token.err_if_cancelled()?;
        if transaction.status != TxStatus::Started {
            bail!("transaction '{}' is not started", transaction.id);
        }
        let top = self.top_dir()?.to_path_buf();
        let rel_path = format!(
            "{TOP_SUBVOL}/{SNAPSHOTS_PATH}/{}/snapshot",
            transaction.id
        );
        btrfs::set_default(self.hal, &self.token, &top, &rel_path)
            .context("setting new default snapshot")?;
        self.clean_stack
            .cleanup(Ok(()))
            .context("releasing transaction resources")?;
        Ok(())
    }

    /// Deletes the transaction's snapshot, restores the previous default
    /// and joins any cleanup errors onto `incoming`.
    pub fn rollback(&mut self, transaction: &mut Transaction, incoming: anyhow::Error) -> anyhow::Error {
        log::error!(
            "rolling back transaction {}: {incoming:#}",
            transaction.id
        );
        let mut err = incoming;

        // Unmount binds first, the snapshot cannot be deleted while the
        // snapshots directory is still bound inside it.
        if let Err(cleanup_err) = self.clean_stack.run_for(true) {
            err = err.context(format!("cleanup: {cleanup_err:#}"));
        }

        if transaction.path.is_dir() {
            if let Err(delete_err) =
                btrfs::delete_subvolume(self.hal, &self.token, &transaction.path)
            {
                err = err.context(format!("deleting snapshot: {delete_err:#}"));
            }
            if let Some(parent) = transaction.path.parent() {
                if let Err(remove_err) = std::fs::remove_dir_all(parent) {
                    err = err.context(format!(
                        "removing '{}': {remove_err}",
                        parent.display()
                    ));
                }
            }
        }

        if let Some(previous) = self.prev_default.take() {
            let top = self.top_dir.clone().unwrap_or_default();
            if let Err(restore_err) =
                btrfs::set_default(self.hal, &self.token, &top, &previous)
            {
                err = err.context(format!("restoring default subvolume: {restore_err:#}"));
            }
        }

        transaction.status = TxStatus::RolledBack;
        err
    }

    /// Kernel command line booting into the transaction's snapshot.
    pub fn generate_kernel_cmdline(&self, transaction: &Transaction) -> String {
        format!(
            "rootfstype=btrfs rootflags=subvol={TOP_SUBVOL}/{SNAPSHOTS_PATH}/{}/snapshot",
            transaction.id
        )
    }
}

#[cfg(test)]
mod tests;
