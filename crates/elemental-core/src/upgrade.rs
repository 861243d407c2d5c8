//! End-to-end upgrade: stage a new snapshot, populate and customize it,
//! install the bootloader and commit.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use elemental_hal::{
    CancelToken, CommandOptions, MountGuard, MountOps, Platform, ProcessOps, SystemHal,
};

use crate::block;
use crate::bootloader::Bootloader;
use crate::chroot;
use crate::deployment::{BootloaderKind, Deployment, PartRole};
use crate::firmware::EfiBootManager;
use crate::selinux;
use crate::transaction::{SnapperTransaction, Transaction};
use crate::unpack::Unpacker;

/// Path the configuration hook is bound to inside the staged snapshot.
pub const CONFIG_HOOK_PATH: &str = "/etc/elemental/config.sh";

pub struct Upgrader<'a> {
    hal: &'a dyn SystemHal,
    token: CancelToken,
    platform: Platform,
    system_root: Option<PathBuf>,
}

impl<'a> Upgrader<'a> {
    pub fn new(hal: &'a dyn SystemHal, token: CancelToken, platform: Platform) -> Self {
        Self {
            hal,
            token,
            platform,
            system_root: None,
        }
    }

    /// Binds the upgrade to an already known top subvolume directory
    /// instead of discovering it from the running system.
    pub fn with_system_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.system_root = Some(root.into());
        self
    }

    /// Runs the full transactional upgrade sequence against the given
    /// deployment. Any failure rolls the staged snapshot back.
    pub fn upgrade(&self, deployment: &mut Deployment) -> Result<()> {
        let mut engine = SnapperTransaction::new(self.hal, self.token.clone());
        if let Some(root) = &self.system_root {
            engine = engine.with_root(root.clone());
        }
        engine
            .init(deployment)
            .context("initializing transaction")?;
        let mut transaction = engine.start().context("starting transaction")?;

        match self.run_staged(&mut engine, &mut transaction, deployment) {
            Ok(()) => engine.commit(&mut transaction),
            Err(err) => Err(engine.rollback(&mut transaction, err)),
        }
    }

    fn run_staged(
        &self,
        engine: &mut SnapperTransaction<'a>,
        transaction: &mut Transaction,
        deployment: &mut Deployment,
    ) -> Result<()> {
        engine
            .sync_image_content(&mut deployment.source_os, transaction)
            .context("dumping OS image")?;

        engine.merge(transaction).context("merging rw volumes")?;

        engine
            .update_fstab(transaction)
            .context("updating fstab")?;

        selinux::chrooted_relabel(self.hal, &self.token, &transaction.path)
            .context("relabelling snapshot")?;

        deployment
            .write_deployment_file(&transaction.path)
            .context("writing deployment record")?;

        engine.lock(transaction).context("locking snapshot")?;

        if let Some(overlay) = deployment.overlay_tree.as_mut() {
            if !overlay.is_empty() {
                let digest = Unpacker::new(self.hal, self.token.clone(), overlay)
                    .unpack(&transaction.path)
                    .context("unpacking overlay tree")?;
                overlay.set_digest(digest);
            }
        }

        if let Some(script) = deployment.cfg_script.clone() {
            self.config_hook(&script, &transaction.path)
                .context("running configuration hook")?;
        }

        self.install_bootloader(engine, transaction, deployment)
            .context("installing bootloader")?;

        if let Some(firmware) = &deployment.firmware {
            EfiBootManager::new(self.hal, self.token.clone())
                .create_boot_entries(&firmware.boot_entries)
                .context("creating firmware boot entries")?;
        }

        Ok(())
    }

    /// Runs the host-supplied configuration script inside the chrooted
    /// staged snapshot.
    fn config_hook(&self, script: &Path, root: &Path) -> Result<()> {
        log::info!("running transaction hook");

        let hal = self.hal;
        let token = self.token.clone();
        let mut binds = BTreeMap::new();
        binds.insert(script.to_path_buf(), PathBuf::from(CONFIG_HOOK_PATH));

        let mut stdout_log = String::new();
        let mut stderr_log = String::new();
        let result = chroot::chrooted_callback(self.hal, self.token.clone(), root, binds, || {
            hal.command_stream(
                &token,
                CONFIG_HOOK_PATH,
                &[],
                &CommandOptions::default(),
                &mut |line| {
                    stdout_log.push_str(line);
                    stdout_log.push('\n');
                },
                &mut |line| {
                    stderr_log.push_str(line);
                    stderr_log.push('\n');
                },
            )?;
            Ok(())
        });
        log::debug!(
            "config hook output:\n------- stdout -------\n{stdout_log}------- stderr -------\n{stderr_log}----------------------"
        );
        result
    }

    /// Mounts the ESP inside the staged snapshot and installs the
    /// configured bootloader.
    fn install_bootloader(
        &self,
        engine: &SnapperTransaction<'a>,
        transaction: &Transaction,
        deployment: &Deployment,
    ) -> Result<()> {
        if deployment.boot_config.bootloader == BootloaderKind::None {
            log::info!("bootloader installation disabled");
            return Ok(());
        }

        let esp = deployment
            .partitions()
            .find(|p| p.role == PartRole::Efi)
            .context("ESP not present in deployment")?;
        let mount_point = esp.mount_point.as_ref().context("ESP has no mount point")?;
        let rel = mount_point.to_string_lossy();
        let target = transaction.path.join(rel.trim_start_matches('/'));
        std::fs::create_dir_all(&target)
            .with_context(|| format!("creating '{}'", target.display()))?;

        let mut guard = None;
        if !self.hal.is_mounted(&target)? {
            let uuid = esp.uuid.as_deref().context("ESP has no UUID")?;
            let device = block::wait_device_by_uuid(self.hal, &self.token, uuid, 4)
                .context("resolving ESP device")?;
            self.hal
                .mount(&device.path, &target, None, &[])
                .with_context(|| format!("mounting ESP at '{}'", target.display()))?;
            guard = Some(MountGuard::new(self.hal, target));
        }

        let cmdline = full_kernel_cmdline(
            &deployment.boot_config.kernel_cmdline,
            &engine.generate_kernel_cmdline(transaction),
        );
        let bootloader = Bootloader::new(
            deployment.boot_config.bootloader,
            self.hal,
            self.token.clone(),
            self.platform,
        )?;
        bootloader.install(&transaction.path, transaction.id, &cmdline, deployment)?;
        drop(guard);
        Ok(())
    }
}

fn full_kernel_cmdline(base: &str, snapshot_part: &str) -> String {
    if base.is_empty() {
        snapshot_part.to_string()
    } else {
        format!("{base} {snapshot_part}")
    }
}
