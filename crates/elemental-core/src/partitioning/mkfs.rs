//! Filesystem creation command construction.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use elemental_hal::{CancelToken, CommandOptions, ProcessOps};

use crate::deployment::FileSystem;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MkfsCall {
    pub device: PathBuf,
    pub filesystem: FileSystem,
    pub label: String,
    pub uuid: String,
    pub custom_opts: Vec<String>,
}

impl MkfsCall {
    pub fn new(
        device: impl Into<PathBuf>,
        filesystem: FileSystem,
        label: impl Into<String>,
        uuid: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            filesystem,
            label: label.into(),
            uuid: uuid.into(),
            custom_opts: Vec::new(),
        }
    }

    /// Builds the `mkfs.<fs>` invocation for this call.
    ///
    /// Linux filesystems take `-L`/`-U` (xfs uses `-m uuid=`), FAT takes
    /// `-n` and a volume ID derived from the first UUID group. Btrfs gets
    /// `-f` to allow overwriting a previous filesystem.
    pub fn command_spec(&self) -> Result<CommandSpec> {
        if !self.uuid.is_empty() {
            uuid::Uuid::parse_str(&self.uuid)
                .with_context(|| format!("provided UUID '{}' is not valid", self.uuid))?;
        }

        let mut args = Vec::new();
        match self.filesystem {
            FileSystem::Btrfs | FileSystem::Xfs | FileSystem::Ext2 | FileSystem::Ext4 => {
                if !self.label.is_empty() {
                    args.push("-L".to_string());
                    args.push(self.label.clone());
                }
                if !self.uuid.is_empty() {
                    if self.filesystem == FileSystem::Xfs {
                        args.push("-m".to_string());
                        args.push(format!("uuid={}", self.uuid));
                    } else {
                        args.push("-U".to_string());
                        args.push(self.uuid.clone());
                    }
                }
                args.extend(self.custom_opts.iter().cloned());
                if self.filesystem == FileSystem::Btrfs {
                    args.push("-f".to_string());
                }
            }
            FileSystem::VFat => {
                if !self.label.is_empty() {
                    args.push("-n".to_string());
                    args.push(self.label.clone());
                }
                if !self.uuid.is_empty() {
                    let volume_id = self.uuid.split('-').next().unwrap_or_default();
                    args.push("-i".to_string());
                    args.push(volume_id.to_string());
                }
                args.extend(self.custom_opts.iter().cloned());
            }
        }
        args.push(self.device.to_string_lossy().to_string());

        Ok(CommandSpec {
            program: format!("mkfs.{}", self.filesystem),
            args,
        })
    }

    pub fn apply(&self, hal: &dyn ProcessOps, token: &CancelToken) -> Result<()> {
        let spec = self.command_spec()?;
        let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
        hal.command_status(
            token,
            &spec.program,
            &args,
            &CommandOptions::with_timeout(Duration::from_secs(600)),
        )
        .with_context(|| format!("formatting '{}'", self.device.display()))
    }
}
