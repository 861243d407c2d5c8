//! GPT manipulation through `sgdisk`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use elemental_hal::{CancelToken, CommandOptions, ProcessOps};

use crate::deployment::{Disk, PartRole, PartSize};

/// Partitions are aligned to 2048 sectors.
pub const SECTOR_ALIGNMENT: u64 = 2048;

/// GPT attribute bit marking a partition as hidden.
const HIDDEN_ATTRIBUTE: u8 = 62;

fn opts() -> CommandOptions {
    CommandOptions::with_timeout(Duration::from_secs(120))
}

fn sgdisk_type_code(role: PartRole) -> &'static str {
    match role {
        PartRole::Efi => "EF00",
        _ => "8300",
    }
}

/// Wipes the whole GPT of the disk. Destructive.
pub fn wipe_table(hal: &dyn ProcessOps, token: &CancelToken, device: &Path) -> Result<()> {
    let device_str = device.to_string_lossy();
    hal.command_status(token, "sgdisk", &["--zap-all", &device_str], &opts())
        .with_context(|| format!("wiping partition table of '{}'", device.display()))
}

/// Builds the sgdisk arguments creating all partitions of the disk.
pub fn creation_args(disk: &Disk) -> Result<Vec<String>> {
    let mut args = vec!["--set-alignment".to_string(), SECTOR_ALIGNMENT.to_string()];
    let start_sector = disk.start_sector.unwrap_or(SECTOR_ALIGNMENT);

    for (index, part) in disk.partitions.iter().enumerate() {
        let number = index + 1;
        let start = if index == 0 {
            start_sector.to_string()
        } else {
            // Next aligned free sector.
            "0".to_string()
        };
        let end = match part.size {
            PartSize::MiB(size) => format!("+{size}M"),
            PartSize::All => "0".to_string(),
            PartSize::Unset => bail!("partition '{}' has no size", part.label),
        };
        args.push("-n".to_string());
        args.push(format!("{number}:{start}:{end}"));
        args.push("-t".to_string());
        args.push(format!("{number}:{}", sgdisk_type_code(part.role)));
        args.push("-c".to_string());
        args.push(format!("{number}:{}", part.label));
        if part.hidden {
            args.push("-A".to_string());
            args.push(format!("{number}:set:{HIDDEN_ATTRIBUTE}"));
        }
    }
    Ok(args)
}

/// Writes the GPT with all partitions of the disk in order.
pub fn write_table(hal: &dyn ProcessOps, token: &CancelToken, disk: &Disk) -> Result<()> {
    let mut args = creation_args(disk)?;
    args.push(disk.device.to_string_lossy().to_string());
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    hal.command_status(token, "sgdisk", &arg_refs, &opts())
        .with_context(|| format!("partitioning '{}'", disk.device.display()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub sector_size: u64,
    pub partition_count: usize,
}

/// Reads the table back and returns sector size and final geometry.
pub fn read_table(hal: &dyn ProcessOps, token: &CancelToken, device: &Path) -> Result<TableInfo> {
    let device_str = device.to_string_lossy();
    let output = hal
        .command_output(token, "sgdisk", &["--print", &device_str], &opts())
        .with_context(|| format!("reading partition table of '{}'", device.display()))?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_print_output(&stdout)
}

/// Parses `sgdisk --print` output.
fn parse_print_output(output: &str) -> Result<TableInfo> {
    let mut sector_size = None;
    let mut partition_count = 0;
    let mut in_table = false;

    for line in output.lines() {
        if let Some(rest) = line.strip_prefix("Sector size (logical/physical):") {
            let logical = rest.trim().split('/').next().unwrap_or_default();
            sector_size = Some(
                logical
                    .trim()
                    .trim_end_matches(" bytes")
                    .parse::<u64>()
                    .with_context(|| format!("parsing sector size from '{line}'"))?,
            );
        }
        if line.trim_start().starts_with("Number") {
            in_table = true;
            continue;
        }
        if in_table && line.split_whitespace().next().is_some_and(|f| f.parse::<u32>().is_ok()) {
            partition_count += 1;
        }
    }

    Ok(TableInfo {
        sector_size: sector_size.context("sector size not found in sgdisk output")?,
        partition_count,
    })
}

/// Device node of the n-th partition (1-based) of a disk.
///
/// Disks whose name ends in a digit (nvme0n1, mmcblk0, loop0) get a `p`
/// infix.
pub fn partition_device(device: &Path, number: usize) -> PathBuf {
    let device = device.to_string_lossy();
    if device.chars().last().is_some_and(|c| c.is_ascii_digit()) {
        PathBuf::from(format!("{device}p{number}"))
    } else {
        PathBuf::from(format!("{device}{number}"))
    }
}

#[cfg(test)]
mod tests {
    use elemental_hal::FakeHal;

    use super::*;
    use crate::deployment::Deployment;

    #[test]
    fn creation_args_cover_roles_labels_and_sizes() {
        let disk = &Deployment::default_deployment().disks[0];
        let args = creation_args(disk).unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-n 1:2048:+1024M"));
        assert!(joined.contains("-t 1:EF00"));
        assert!(joined.contains("-c 1:EFI"));
        assert!(joined.contains("-n 2:0:0"));
        assert!(joined.contains("-t 2:8300"));
        assert!(joined.contains("-c 2:SYSTEM"));
    }

    #[test]
    fn hidden_partitions_get_the_attribute_flag() {
        let mut deployment = Deployment::default_deployment();
        deployment.disks[0].partitions[0].hidden = true;
        let args = creation_args(&deployment.disks[0]).unwrap();
        assert!(args.join(" ").contains("-A 1:set:62"));
    }

    #[test]
    fn wipe_issues_zap_all() {
        let hal = FakeHal::new();
        wipe_table(&hal, &CancelToken::new(), Path::new("/dev/loop0")).unwrap();
        let (program, args) = &hal.commands()[0];
        assert_eq!(program, "sgdisk");
        assert_eq!(args, &vec!["--zap-all".to_string(), "/dev/loop0".to_string()]);
    }

    #[test]
    fn parses_sgdisk_print_output() {
        let output = "\
Disk /dev/loop0: 20971520 sectors, 10.0 GiB
Sector size (logical/physical): 512/512 bytes
Disk identifier (GUID): 11111111-2222-3333-4444-555555555555
First usable sector is 34, last usable sector is 20971486

Number  Start (sector)    End (sector)  Size       Code  Name
   1            2048         2099199   1024.0 MiB  EF00  EFI
   2         2099200        20971486   9.0 GiB     8300  SYSTEM
";
        let info = parse_print_output(output).unwrap();
        assert_eq!(info.sector_size, 512);
        assert_eq!(info.partition_count, 2);
    }

    #[test]
    fn partition_device_nodes() {
        assert_eq!(
            partition_device(Path::new("/dev/sda"), 2),
            PathBuf::from("/dev/sda2")
        );
        assert_eq!(
            partition_device(Path::new("/dev/nvme0n1"), 1),
            PathBuf::from("/dev/nvme0n1p1")
        );
        assert_eq!(
            partition_device(Path::new("/dev/loop0"), 1),
            PathBuf::from("/dev/loop0p1")
        );
    }
}
