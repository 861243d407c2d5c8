//! Disk provisioning: partition table creation, labeling and formatting.
//!
//! Provisioning is destructive. Callers must set the `confirmed` flag
//! explicitly; without it no disk is touched.

pub mod gpt;
pub mod mkfs;

use anyhow::{Context, Result};
use elemental_hal::{CancelToken, HalError, ProcessOps};

use crate::deployment::Disk;
use mkfs::MkfsCall;

/// Wipes, partitions and formats the given disk.
///
/// Filesystem UUIDs are generated when not provided and written back into
/// the partition records so later steps can resolve device nodes by UUID.
pub fn partition_and_format_disk(
    hal: &dyn ProcessOps,
    token: &CancelToken,
    disk: &mut Disk,
    confirmed: bool,
) -> Result<()> {
    if !confirmed {
        return Err(HalError::NotConfirmed).context("partitioning is destructive");
    }

    log::info!("partitioning '{}'", disk.device.display());
    gpt::wipe_table(hal, token, &disk.device)?;
    gpt::write_table(hal, token, disk)?;

    let info = gpt::read_table(hal, token, &disk.device)?;
    if info.partition_count != disk.partitions.len() {
        log::warn!(
            "expected {} partitions on '{}', table reports {}",
            disk.partitions.len(),
            disk.device.display(),
            info.partition_count
        );
    }
    log::debug!(
        "'{}' uses {}-byte sectors",
        disk.device.display(),
        info.sector_size
    );

    for (index, part) in disk.partitions.iter_mut().enumerate() {
        let device = gpt::partition_device(&disk.device, index + 1);
        let uuid = match &part.uuid {
            Some(uuid) => uuid.clone(),
            None => {
                let uuid = uuid::Uuid::new_v4().to_string();
                part.uuid = Some(uuid.clone());
                uuid
            }
        };
        log::info!(
            "formatting '{}' as {} (label '{}')",
            device.display(),
            part.fs(),
            part.label
        );
        MkfsCall::new(device, part.fs(), part.label.clone(), uuid).apply(hal, token)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use elemental_hal::FakeHal;

    use super::*;
    use crate::deployment::Deployment;

    fn sgdisk_print() -> &'static str {
        "Sector size (logical/physical): 512/512 bytes\n\
         Number  Start (sector)    End (sector)  Size       Code  Name\n\
            1            2048         2099199   1024.0 MiB  EF00  EFI\n\
            2         2099200        20971486   9.0 GiB     8300  SYSTEM\n"
    }

    #[test]
    fn provisioning_requires_confirmation() {
        let hal = FakeHal::new();
        let mut deployment = Deployment::default_deployment();
        deployment.disks[0].device = PathBuf::from("/dev/loop0");
        let err = partition_and_format_disk(
            &hal,
            &CancelToken::new(),
            &mut deployment.disks[0],
            false,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("not confirmed"));
        assert!(hal.commands().is_empty());
    }

    #[test]
    fn provisioning_wipes_partitions_and_formats() {
        let hal = FakeHal::new();
        hal.push_command_output("sgdisk", ""); // --zap-all
        hal.push_command_output("sgdisk", ""); // table write
        hal.push_command_output("sgdisk", sgdisk_print()); // --print

        let mut deployment = Deployment::default_deployment();
        deployment.disks[0].device = PathBuf::from("/dev/loop0");
        partition_and_format_disk(&hal, &CancelToken::new(), &mut deployment.disks[0], true)
            .unwrap();

        let commands = hal.commands();
        assert_eq!(commands[0].0, "sgdisk");
        assert!(commands[0].1.contains(&"--zap-all".to_string()));
        let programs: Vec<&str> = commands.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(
            programs,
            vec!["sgdisk", "sgdisk", "sgdisk", "mkfs.vfat", "mkfs.btrfs"]
        );
        // mkfs targets the partition device nodes.
        assert!(commands[3].1.contains(&"/dev/loop0p1".to_string()));
        assert!(commands[4].1.contains(&"/dev/loop0p2".to_string()));
        // UUIDs were generated and recorded.
        for part in &deployment.disks[0].partitions {
            assert!(part.uuid.is_some());
        }
    }

    #[test]
    fn mkfs_labels_match_the_deployment() {
        let hal = FakeHal::new();
        hal.push_command_output("sgdisk", "");
        hal.push_command_output("sgdisk", "");
        hal.push_command_output("sgdisk", sgdisk_print());

        let mut deployment = Deployment::default_deployment();
        deployment.disks[0].device = PathBuf::from("/dev/loop0");
        partition_and_format_disk(&hal, &CancelToken::new(), &mut deployment.disks[0], true)
            .unwrap();

        let commands = hal.commands();
        let vfat = &commands[3].1;
        assert_eq!(vfat[0], "-n");
        assert_eq!(vfat[1], "EFI");
        let btrfs = &commands[4].1;
        assert_eq!(btrfs[0], "-L");
        assert_eq!(btrfs[1], "SYSTEM");
        assert!(btrfs.contains(&"-f".to_string()));
    }
}
