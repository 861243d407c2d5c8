//! Thin CLI wrapper over the elemental deployment engine.

mod cli;
mod signal;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use elemental_core::deployment::{
    BootloaderKind, Deployment, EfiBootEntry, FileSystem, FirmwareConfig, ImageSource, PartRole,
};
use elemental_core::install::Installer;
use elemental_core::upgrade::Upgrader;
use elemental_hal::{CancelToken, LinuxHal, Platform};

use cli::{Cli, Command};

fn main() {
    let args = Cli::parse();
    init_logging(args.verbose);

    if let Err(err) = run(args) {
        log::error!("{err:#}");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}

fn run(args: Cli) -> Result<()> {
    let hal = LinuxHal::new();
    let token = CancelToken::new();
    let platform = Platform::host()?;

    // Ctrl-C requests cooperative cancellation; the engine rolls the
    // in-flight transaction back.
    signal::cancel_on_interrupt(token.clone());

    match args.command {
        Command::Install {
            description,
            target,
            os_image,
            overlay,
            config_script,
            bootloader,
            create_boot_entry,
            cmdline,
            confirm,
        } => {
            let mut deployment = load_deployment(description.as_deref())?;
            if let Some(target) = target {
                if let Some(disk) = deployment.disks.first_mut() {
                    disk.device = target;
                }
            }
            apply_common_flags(&mut deployment, os_image, overlay, config_script)?;
            if let Some(name) = bootloader {
                deployment.boot_config.bootloader = parse_bootloader(&name)?;
            }
            if let Some(cmdline) = cmdline {
                deployment.boot_config.kernel_cmdline = cmdline;
            }
            deployment.sanitize().context("invalid deployment")?;
            if create_boot_entry {
                deployment.firmware = Some(firmware_config(&deployment, platform)?);
            }
            preflight(&deployment, true)?;

            Installer::new(&hal, token, platform, confirm)
                .install(&mut deployment)
                .context("installing system")
        }
        Command::Upgrade {
            os_image,
            overlay,
            config_script,
        } => {
            // The record was sanitized when it was persisted; it carries
            // no device path, which only installs need.
            let mut deployment =
                Deployment::parse(Path::new("/")).context("reading deployment record")?;
            apply_common_flags(&mut deployment, os_image, overlay, config_script)?;
            preflight(&deployment, false)?;

            Upgrader::new(&hal, token, platform)
                .upgrade(&mut deployment)
                .context("upgrading system")
        }
        Command::Version => {
            println!("elemental {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn load_deployment(description: Option<&Path>) -> Result<Deployment> {
    let mut deployment = Deployment::default_deployment();
    if let Some(path) = description {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading '{}'", path.display()))?;
        let overrides: Deployment = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing '{}'", path.display()))?;
        deployment.merge(overrides);
    }
    Ok(deployment)
}

fn apply_common_flags(
    deployment: &mut Deployment,
    os_image: Option<String>,
    overlay: Option<String>,
    config_script: Option<PathBuf>,
) -> Result<()> {
    if let Some(uri) = os_image {
        deployment.source_os = ImageSource::from_uri(&uri).context("invalid --os-image")?;
    }
    if let Some(uri) = overlay {
        deployment.overlay_tree = Some(ImageSource::from_uri(&uri).context("invalid --overlay")?);
    }
    if let Some(script) = config_script {
        deployment.cfg_script = Some(script);
    }
    Ok(())
}

/// Verifies the external tools the operation will invoke are on PATH.
fn preflight(deployment: &Deployment, install: bool) -> Result<()> {
    let mut required = vec!["btrfs", "snapper", "rsync"];
    if install {
        required.extend(["sgdisk", "lsblk"]);
        for part in deployment.partitions() {
            required.push(match part.fs() {
                FileSystem::Btrfs => "mkfs.btrfs",
                FileSystem::Xfs => "mkfs.xfs",
                FileSystem::Ext2 => "mkfs.ext2",
                FileSystem::Ext4 => "mkfs.ext4",
                FileSystem::VFat => "mkfs.vfat",
            });
        }
    }
    if deployment.boot_config.bootloader == BootloaderKind::Grub {
        required.push("grub2-editenv");
    }
    if deployment.firmware.is_some() {
        required.push("efibootmgr");
    }

    required.sort_unstable();
    required.dedup();
    let missing: Vec<&str> = required
        .into_iter()
        .filter(|tool| !elemental_hal::command_exists(tool))
        .collect();
    if !missing.is_empty() {
        anyhow::bail!("required tools not found on PATH: {}", missing.join(", "));
    }
    Ok(())
}

/// Builds the firmware boot entry pointing at the installed shim.
fn firmware_config(deployment: &Deployment, platform: Platform) -> Result<FirmwareConfig> {
    for disk in &deployment.disks {
        if let Some(index) = disk
            .partitions
            .iter()
            .position(|p| p.role == PartRole::Efi)
        {
            return Ok(FirmwareConfig {
                boot_entries: vec![EfiBootEntry {
                    label: "elemental".to_string(),
                    disk: disk.device.clone(),
                    partition: (index + 1) as u32,
                    loader: PathBuf::from(format!(
                        "/EFI/ELEMENTAL/{}",
                        platform.default_efi_file()
                    )),
                }],
            });
        }
    }
    anyhow::bail!("ESP not present in deployment");
}

fn parse_bootloader(name: &str) -> Result<BootloaderKind> {
    match name {
        "none" => Ok(BootloaderKind::None),
        "grub" => Ok(BootloaderKind::Grub),
        other => anyhow::bail!("bootloader '{other}' is not supported"),
    }
}
