//! EFI boot-manager entries.

use std::time::Duration;

use anyhow::{Context, Result};
use elemental_hal::{CancelToken, CommandOptions, ProcessOps};

use crate::deployment::EfiBootEntry;

pub struct EfiBootManager<'a> {
    hal: &'a dyn ProcessOps,
    token: CancelToken,
}

impl<'a> EfiBootManager<'a> {
    pub fn new(hal: &'a dyn ProcessOps, token: CancelToken) -> Self {
        Self { hal, token }
    }

    /// Registers the given boot entries with the platform firmware.
    pub fn create_boot_entries(&self, entries: &[EfiBootEntry]) -> Result<()> {
        for entry in entries {
            log::info!("creating EFI boot entry '{}'", entry.label);
            let disk = entry.disk.to_string_lossy();
            let part = entry.partition.to_string();
            // efibootmgr expects backslash-separated loader paths.
            let loader = entry.loader.to_string_lossy().replace('/', "\\");
            self.hal
                .command_status(
                    &self.token,
                    "efibootmgr",
                    &[
                        "--create",
                        "--disk",
                        &disk,
                        "--part",
                        &part,
                        "--label",
                        &entry.label,
                        "--loader",
                        &loader,
                    ],
                    &CommandOptions::with_timeout(Duration::from_secs(60)),
                )
                .with_context(|| format!("creating boot entry '{}'", entry.label))?;
        }
        Ok(())
    }
}
