//! Bootloader installation.
//!
//! Bootloaders are tagged variants dispatched over the deployment's boot
//! configuration; only GRUB is implemented today, `none` skips the step.

pub mod grub;

use std::path::Path;

use anyhow::{bail, Result};
use elemental_hal::{CancelToken, Platform, SystemHal};

use crate::deployment::{BootloaderKind, Deployment};
use grub::Grub;

pub enum Bootloader<'a> {
    None,
    Grub(Grub<'a>),
}

impl<'a> Bootloader<'a> {
    pub fn new(
        kind: BootloaderKind,
        hal: &'a dyn SystemHal,
        token: CancelToken,
        platform: Platform,
    ) -> Result<Self> {
        match kind {
            BootloaderKind::None => Ok(Bootloader::None),
            BootloaderKind::Grub => Ok(Bootloader::Grub(Grub::new(hal, token, platform))),
            BootloaderKind::Unset => bail!("bootloader '{kind}' is not supported"),
        }
    }

    /// Installs kernel, initrd, EFI applications and boot entries so the
    /// given snapshot is selectable at the next boot.
    pub fn install(
        &self,
        root_path: &Path,
        snapshot_id: u32,
        kernel_cmdline: &str,
        deployment: &Deployment,
    ) -> Result<()> {
        match self {
            Bootloader::None => {
                log::info!("bootloader installation disabled");
                Ok(())
            }
            Bootloader::Grub(grub) => {
                grub.install(root_path, snapshot_id, kernel_cmdline, deployment)
            }
        }
    }

    /// Installs the live-media bootloader layout.
    pub fn install_live(&self, root_path: &Path, target: &Path, kernel_cmdline: &str) -> Result<()> {
        match self {
            Bootloader::None => Ok(()),
            Bootloader::Grub(grub) => grub.install_live(root_path, target, kernel_cmdline),
        }
    }
}
