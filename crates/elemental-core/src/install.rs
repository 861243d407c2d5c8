//! End-to-end installation: disk provisioning, Btrfs volume layout and the
//! first deployment transaction.

use std::path::PathBuf;

use anyhow::{Context, Result};
use elemental_hal::{CancelToken, LoopOps, MountOps, Platform, SystemHal};

use crate::block;
use crate::btrfs;
use crate::cleanstack::CleanStack;
use crate::deployment::{Deployment, PartRole, Partition};
use crate::partitioning;
use crate::upgrade::Upgrader;

/// Retry budget for partition device nodes appearing after mkfs.
const DEVICE_WAIT_ATTEMPTS: u32 = 4;

pub struct Installer<'a> {
    hal: &'a dyn SystemHal,
    token: CancelToken,
    platform: Platform,
    /// Installation wipes disks; nothing is touched unless the caller
    /// confirmed the destructive intent.
    confirmed: bool,
}

impl<'a> Installer<'a> {
    pub fn new(
        hal: &'a dyn SystemHal,
        token: CancelToken,
        platform: Platform,
        confirmed: bool,
    ) -> Self {
        Self {
            hal,
            token,
            platform,
            confirmed,
        }
    }

    /// Provisions every disk of the deployment and runs the first
    /// transaction against it.
    pub fn install(&self, deployment: &mut Deployment) -> Result<()> {
        let mut cleanup = CleanStack::new();
        let result = self.run_install(deployment, &mut cleanup);
        cleanup.cleanup(result)
    }

    fn run_install(
        &self,
        deployment: &mut Deployment,
        cleanup: &mut CleanStack<'a>,
    ) -> Result<()> {
        let mut system_top = None;
        for disk in &mut deployment.disks {
            // Image-file targets are attached to a loop device for the
            // duration of the installation.
            if disk.device.is_file() {
                let loop_device = self
                    .hal
                    .losetup_attach(&disk.device, true)
                    .with_context(|| format!("attaching '{}'", disk.device.display()))?;
                log::info!(
                    "attached '{}' to {loop_device}",
                    disk.device.display()
                );
                let hal = self.hal;
                let detached = loop_device.clone();
                cleanup.push(move || {
                    hal.losetup_detach(&detached)?;
                    Ok(())
                });
                disk.device = PathBuf::from(loop_device);
            }

            partitioning::partition_and_format_disk(self.hal, &self.token, disk, self.confirmed)
                .with_context(|| format!("partitioning '{}'", disk.device.display()))?;
            for part in &disk.partitions {
                if let Some(top) = self
                    .create_partition_volumes(cleanup, part)
                    .context("creating rw volumes")?
                {
                    if part.role == PartRole::System {
                        system_top = Some(top);
                    }
                }
            }
        }

        let system_top = system_top.context("no system partition was provisioned")?;
        let mut upgrader = Upgrader::new(self.hal, self.token.clone(), self.platform);
        upgrader = upgrader.with_system_root(system_top);
        upgrader
            .upgrade(deployment)
            .context("running installation transaction")?;
        Ok(())
    }

    /// Mounts a freshly formatted partition and creates its top subvolume
    /// plus all non-snapshotted rw volumes. Snapshotted volumes are set up
    /// later by the transaction engine through the snapshot tool.
    ///
    /// Returns the top subvolume directory when one was created.
    fn create_partition_volumes(
        &self,
        cleanup: &mut CleanStack<'a>,
        part: &Partition,
    ) -> Result<Option<PathBuf>> {
        if part.rw_volumes.is_empty() && part.role != PartRole::System {
            return Ok(None);
        }

        let mount_point = tempfile::Builder::new()
            .prefix(&format!("elemental_{}", part.role))
            .tempdir()
            .context("creating temporary mount directory")?
            .into_path();
        let removed = mount_point.clone();
        cleanup.push_success_only(move || {
            std::fs::remove_dir_all(&removed)?;
            Ok(())
        });

        let uuid = part
            .uuid
            .as_deref()
            .with_context(|| format!("partition '{}' has no UUID", part.label))?;
        let device = block::wait_device_by_uuid(self.hal, &self.token, uuid, DEVICE_WAIT_ATTEMPTS)
            .with_context(|| format!("resolving partition '{}'", part.label))?;

        self.hal
            .mount(&device.path, &mount_point, None, &[])
            .with_context(|| format!("mounting '{}'", device.path.display()))?;
        let hal = self.hal;
        let unmounted = mount_point.clone();
        cleanup.push(move || {
            hal.unmount(&unmounted)?;
            Ok(())
        });

        btrfs::setup_top_subvolume(self.hal, &self.token, &mount_point)
            .context("setting up btrfs top subvolume")?;

        let top = mount_point.join(btrfs::TOP_SUBVOL);
        for volume in &part.rw_volumes {
            if volume.snapshotted {
                continue;
            }
            let rel = volume.path.to_string_lossy();
            let subvolume = top.join(rel.trim_start_matches('/'));
            btrfs::create_subvolume(self.hal, &self.token, &subvolume, volume.no_copy_on_write)
                .with_context(|| format!("creating subvolume '{}'", subvolume.display()))?;
        }

        Ok(Some(top))
    }
}
