//! GRUB bootloader installation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use elemental_hal::{envfile, CancelToken, CommandOptions, Platform, ProcessOps, SystemHal};
use rand::RngCore;

use crate::deployment::{Deployment, PartRole, Partition};
use crate::rsync::Rsync;

pub const OS_RELEASE_PATH: &str = "etc/os-release";
pub const INITRD: &str = "initrd";

/// ID of the default boot entry.
pub const DEFAULT_BOOT_ID: &str = "active";

const LIVE_BOOT_PATH: &str = "boot";

/// EFI entry configuration chaining into the ESP grub directory.
const GRUB_EFI_CFG: &str = "\
search --no-floppy --label {Label} --set=root
set prefix=($root)/grub2
configfile ($root)/grub2/grub.cfg
";

/// EFI entry configuration for live media, located through the identifier
/// file.
const GRUB_LIVE_EFI_CFG: &str = "\
search --no-floppy --file /{IDFile} --set=root
set prefix=($root)/boot/grub2
configfile ($root)/boot/grub2/grub.cfg
";

/// Main live-media grub configuration.
const GRUB_LIVE_CFG: &str = "\
set timeout=5
set default=0

menuentry \"{DisplayName}\" {
    echo Loading kernel...
    linux {Linux} {CmdLine}
    echo Loading initrd...
    initrd {Initrd}
}
";

/// Renders `{Name}` placeholders. Unknown placeholders are left untouched.
fn render_template(template: &str, fields: &[(&str, &str)]) -> String {
    let mut rendered = template.to_string();
    for (key, value) in fields {
        rendered = rendered.replace(&format!("{{{key}}}"), value);
    }
    rendered
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct GrubBootEntry {
    linux: String,
    initrd: String,
    cmdline: String,
    display_name: String,
    id: String,
}

pub struct Grub<'a> {
    hal: &'a dyn SystemHal,
    token: CancelToken,
    platform: Platform,
}

impl<'a> Grub<'a> {
    pub fn new(hal: &'a dyn SystemHal, token: CancelToken, platform: Platform) -> Self {
        Self {
            hal,
            token,
            platform,
        }
    }

    /// Installs the bootloader into the deployment's EFI system partition.
    pub fn install(
        &self,
        root_path: &Path,
        snapshot_id: u32,
        kernel_cmdline: &str,
        deployment: &Deployment,
    ) -> Result<()> {
        let esp = deployment
            .get_efi_system_partition()
            .context("ESP not found")?;
        if esp.role != PartRole::Efi {
            bail!("installing bootloader to partition role '{}' is unsupported", esp.role);
        }
        log::info!("installing GRUB bootloader to partition '{}'", esp.label);

        let esp_dir = esp_dir(root_path, esp)?;

        self.install_esp_entries(root_path, &esp_dir, &esp.label)
            .context("installing EFI applications")?;
        self.install_grub(root_path, &esp_dir)
            .context("installing grub config")?;
        let entries = self
            .install_kernel_initrd(root_path, &esp_dir, "", &snapshot_id.to_string(), kernel_cmdline)
            .context("installing kernel and initrd")?;
        self.update_boot_entries(&esp_dir, &entries)
            .context("updating boot entries")?;
        Ok(())
    }

    /// Installs the live-media bootloader layout under `target`.
    pub fn install_live(&self, root_path: &Path, target: &Path, kernel_cmdline: &str) -> Result<()> {
        log::info!("preparing GRUB bootloader for live media");

        let boot_dir = target.join(LIVE_BOOT_PATH);
        self.install_grub(root_path, &boot_dir)
            .context("installing grub config")?;

        let entries = self
            .install_kernel_initrd(root_path, target, LIVE_BOOT_PATH, "", kernel_cmdline)
            .context("installing kernel and initrd")?;
        self.write_grub_config(
            &boot_dir.join("grub2"),
            GRUB_LIVE_CFG,
            &[
                ("DisplayName", entries[0].display_name.as_str()),
                ("Linux", entries[0].linux.as_str()),
                ("Initrd", entries[0].initrd.as_str()),
                ("CmdLine", entries[0].cmdline.as_str()),
            ],
        )
        .context("writing live grub config")?;

        let random_id = self
            .generate_id_file(&boot_dir)
            .context("creating identifier file for the bootloader")?;
        let id_file = format!("{LIVE_BOOT_PATH}/{random_id}");
        self.install_efi_entry(
            root_path,
            &target.join("EFI").join("BOOT"),
            GRUB_LIVE_EFI_CFG,
            &[("IDFile", id_file.as_str())],
        )
        .context("installing live EFI entry")?;
        Ok(())
    }

    /// Creates a random 4-byte identifier file used to recognize the live
    /// media at boot.
    fn generate_id_file(&self, target_dir: &Path) -> Result<String> {
        let mut bytes = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut bytes);
        let random_id: String = bytes.iter().map(|b| format!("{b:02x}")).collect();

        let id_file = target_dir.join(&random_id);
        std::fs::write(&id_file, &random_id)
            .with_context(|| format!("writing '{}'", id_file.display()))?;
        Ok(random_id)
    }

    fn write_grub_config(
        &self,
        target_dir: &Path,
        template: &str,
        fields: &[(&str, &str)],
    ) -> Result<()> {
        std::fs::create_dir_all(target_dir)
            .with_context(|| format!("creating grub target directory '{}'", target_dir.display()))?;
        let config = target_dir.join("grub.cfg");
        std::fs::write(&config, render_template(template, fields))
            .with_context(|| format!("writing bootloader config '{}'", config.display()))?;
        Ok(())
    }

    /// Writes both the removable-media and the distribution EFI entries.
    fn install_esp_entries(&self, root_path: &Path, esp_dir: &Path, label: &str) -> Result<()> {
        for entry in ["BOOT", "ELEMENTAL"] {
            let target_dir = esp_dir.join("EFI").join(entry);
            self.install_efi_entry(root_path, &target_dir, GRUB_EFI_CFG, &[("Label", label)])
                .with_context(|| format!("setting '{entry}' EFI entry"))?;
        }
        Ok(())
    }

    /// Copies the EFI applications (shim, MokManager, grub.efi) and writes
    /// the entry's grub.cfg.
    fn install_efi_entry(
        &self,
        root_path: &Path,
        target_dir: &Path,
        template: &str,
        fields: &[(&str, &str)],
    ) -> Result<()> {
        log::info!("copying EFI artifacts to '{}'", target_dir.display());
        std::fs::create_dir_all(target_dir)
            .with_context(|| format!("creating '{}'", target_dir.display()))?;

        let src_dir = root_path
            .join("usr/share/efi")
            .join(self.platform.arch.as_str());
        for name in ["grub.efi", "MokManager.efi"] {
            copy_file(&src_dir.join(name), &target_dir.join(name))?;
        }

        // The shim is renamed to the architecture's default boot file name
        // and must be materialized as a real file, vfat has no symlinks.
        copy_file(
            &src_dir.join("shim.efi"),
            &target_dir.join(self.platform.default_efi_file()),
        )?;

        self.write_grub_config(target_dir, template, fields)
            .context("writing EFI grub config")
    }

    /// Syncs the grub2 data directory (modules, themes, fonts) to the ESP.
    fn install_grub(&self, root_path: &Path, esp_dir: &Path) -> Result<()> {
        log::info!("syncing grub2 directory to ESP");
        std::fs::create_dir_all(esp_dir.join("grub2"))
            .with_context(|| format!("creating '{}'", esp_dir.join("grub2").display()))?;

        // The destination is vfat, symlinks cannot be preserved.
        let flags = ["--archive", "--recursive", "--no-links"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Rsync::with_flags(self.hal, self.token.clone(), flags)
            .sync_data(&root_path.join("usr/share/grub2"), &esp_dir.join("grub2"), &[])
            .context("syncing grub files")
    }

    /// Parses OS ID and display name from the os-release file. The ID is
    /// required; the display name falls back to the ID when no candidate
    /// is present.
    fn read_id_and_name(&self, root_path: &Path) -> Result<(String, String)> {
        let path = root_path.join(OS_RELEASE_PATH);
        let vars = envfile::load_env_file(&path)
            .with_context(|| format!("loading '{}' vars", path.display()))?;

        let os_id = vars
            .get("ID")
            .filter(|id| !id.is_empty())
            .with_context(|| format!("'{}' ID not set", path.display()))?
            .clone();

        let display_name = ["PRETTY_NAME", "VARIANT", "NAME"]
            .iter()
            .find_map(|key| vars.get(*key).filter(|v| !v.is_empty()))
            .cloned()
            .unwrap_or_else(|| os_id.clone());
        Ok((os_id, display_name))
    }

    /// Copies kernel, initrd and the optional FIPS hmac into
    /// `<esp>/<subfolder>/<os_id>/<kernel_version>/` and returns the boot
    /// entry pair (default entry plus the snapshot-identified one).
    fn install_kernel_initrd(
        &self,
        root_path: &Path,
        esp_dir: &Path,
        subfolder: &str,
        snapshot_id: &str,
        kernel_cmdline: &str,
    ) -> Result<Vec<GrubBootEntry>> {
        log::info!("installing kernel/initrd");

        let (os_id, display_name) = self
            .read_id_and_name(root_path)
            .context("parsing OS release")?;
        let (kernel, kernel_version) = find_kernel(root_path).context("finding kernel")?;

        let target_dir = esp_dir.join(subfolder).join(&os_id).join(&kernel_version);
        std::fs::create_dir_all(&target_dir)
            .with_context(|| format!("creating kernel dir '{}'", target_dir.display()))?;

        let kernel_name = kernel
            .file_name()
            .context("kernel path has no file name")?
            .to_string_lossy()
            .to_string();
        copy_file(&kernel, &target_dir.join(&kernel_name))?;

        // The kernel hmac enables FIPS setups; optional.
        let kernel_dir = kernel.parent().unwrap_or(root_path);
        let hmac = kernel_dir.join(".vmlinuz.hmac");
        if hmac.is_file() {
            copy_file(&hmac, &target_dir.join(".vmlinuz.hmac"))?;
        }

        let initrd = kernel_dir.join(INITRD);
        if !initrd.is_file() {
            bail!("initrd not found");
        }
        copy_file(&initrd, &target_dir.join(INITRD))?;

        let entry_dir = Path::new("/").join(subfolder).join(&os_id).join(&kernel_version);
        let linux = entry_dir.join(&kernel_name).to_string_lossy().to_string();
        let initrd = entry_dir.join(INITRD).to_string_lossy().to_string();
        let snapshot_name = format!("{display_name} ({snapshot_id})");

        Ok(vec![
            GrubBootEntry {
                linux: linux.clone(),
                initrd: initrd.clone(),
                cmdline: kernel_cmdline.to_string(),
                display_name,
                id: DEFAULT_BOOT_ID.to_string(),
            },
            GrubBootEntry {
                linux,
                initrd,
                cmdline: kernel_cmdline.to_string(),
                display_name: snapshot_name,
                id: snapshot_id.to_string(),
            },
        ])
    }

    /// Writes the per-entry loader files and refreshes the `entries`
    /// variable in the ESP grubenv: `active` first, then the non-default
    /// IDs in most-recent-first order.
    fn update_boot_entries(&self, esp_dir: &Path, entries: &[GrubBootEntry]) -> Result<()> {
        let grubenv = esp_dir.join("grubenv");
        let grubenv_str = grubenv.to_string_lossy().to_string();
        let opts = CommandOptions::with_timeout(Duration::from_secs(60));

        let mut previous_ids = Vec::new();
        if grubenv.exists() {
            let output = self
                .hal
                .command_output(&self.token, "grub2-editenv", &[&grubenv_str, "list"], &opts)
                .context("reading current boot entries")?;
            let stdout = String::from_utf8_lossy(&output.stdout);
            for line in stdout.lines() {
                if let Some(tail) = line.strip_prefix(&format!("entries={DEFAULT_BOOT_ID}")) {
                    previous_ids.extend(tail.split_whitespace().map(String::from));
                }
            }
        }

        let loader_dir = esp_dir.join("loader").join("entries");
        std::fs::create_dir_all(&loader_dir)
            .with_context(|| format!("creating '{}'", loader_dir.display()))?;

        let mut new_ids = Vec::new();
        for entry in entries {
            let entry_path = loader_dir.join(&entry.id);
            let entry_str = entry_path.to_string_lossy().to_string();
            let display_name = format!("display_name={}", entry.display_name);
            let linux = format!("linux={}", entry.linux);
            let initrd = format!("initrd={}", entry.initrd);
            let cmdline = format!("cmdline={}", entry.cmdline);
            self.hal
                .command_status(
                    &self.token,
                    "grub2-editenv",
                    &[&entry_str, "set", &display_name, &linux, &initrd, &cmdline],
                    &opts,
                )
                .with_context(|| format!("writing boot entry '{}'", entry.id))?;

            if entry.id != DEFAULT_BOOT_ID {
                new_ids.push(entry.id.clone());
            }
        }

        // Most recent first: this run's IDs, then the surviving tail.
        let mut all_ids = vec![DEFAULT_BOOT_ID.to_string()];
        all_ids.extend(new_ids);
        all_ids.extend(previous_ids);
        let entries_var = format!("entries={}", all_ids.join(" "));
        self.hal
            .command_status(
                &self.token,
                "grub2-editenv",
                &[&grubenv_str, "set", &entries_var],
                &opts,
            )
            .context("updating grubenv entries")?;
        Ok(())
    }
}

fn esp_dir(root_path: &Path, esp: &Partition) -> Result<PathBuf> {
    let mount_point = esp
        .mount_point
        .as_ref()
        .context("ESP has no mount point")?;
    let rel = mount_point.to_string_lossy();
    Ok(root_path.join(rel.trim_start_matches('/')))
}

/// Copies a file, materializing symlink sources and replacing any
/// pre-existing destination.
fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if dst.exists() {
        std::fs::remove_file(dst).with_context(|| format!("removing '{}'", dst.display()))?;
    }
    std::fs::copy(src, dst)
        .with_context(|| format!("copying '{}' to '{}'", src.display(), dst.display()))?;
    Ok(())
}

/// Locates the kernel under `usr/lib/modules/*/vmlinuz` and returns its
/// path together with the kernel version.
fn find_kernel(root_path: &Path) -> Result<(PathBuf, String)> {
    let modules_dir = root_path.join("usr/lib/modules");
    let mut versions: Vec<PathBuf> = std::fs::read_dir(&modules_dir)
        .with_context(|| format!("reading '{}'", modules_dir.display()))?
        .flatten()
        .map(|e| e.path())
        .collect();
    versions.sort();

    for version_dir in versions {
        let kernel = version_dir.join("vmlinuz");
        if kernel.is_file() {
            let version = version_dir
                .file_name()
                .context("kernel directory has no name")?
                .to_string_lossy()
                .to_string();
            return Ok((kernel, version));
        }
    }
    bail!("no kernel found under '{}'", modules_dir.display());
}
