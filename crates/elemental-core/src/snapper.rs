//! Wrapper around the external `snapper` tool.
//!
//! All invocations use `--no-dbus` so they work against not-yet-booted
//! roots. Per-volume configurations are addressed with the `-c` flag; the
//! configuration name is derived from the volume path.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use elemental_hal::{CancelToken, CommandOptions, ProcessOps};

pub use crate::btrfs::SNAPSHOTS_PATH;

/// Configuration name of the root volume.
pub const ROOT_CONFIG: &str = "root";

fn opts() -> CommandOptions {
    CommandOptions::with_timeout(Duration::from_secs(300))
}

/// Derives the snapper configuration name for a volume path.
///
/// `/` maps to `root`, nested paths flatten their separators.
pub fn config_name(vol_path: &Path) -> String {
    let trimmed = vol_path
        .to_string_lossy()
        .trim_matches('/')
        .replace('/', "_");
    if trimmed.is_empty() {
        ROOT_CONFIG.to_string()
    } else {
        trimmed
    }
}

pub struct Snapper<'a> {
    hal: &'a dyn ProcessOps,
    token: CancelToken,
}

impl<'a> Snapper<'a> {
    pub fn new(hal: &'a dyn ProcessOps, token: CancelToken) -> Self {
        Self { hal, token }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = self
            .hal
            .command_output(&self.token, "snapper", args, &opts())?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Creates the root configuration for `root` if missing and applies the
    /// snapshot retention limits.
    pub fn configure_root(&self, root: &Path, max_snapshots: u32) -> Result<()> {
        let root_str = root.to_string_lossy();
        let config_path = root.join("etc/snapper/configs").join(ROOT_CONFIG);
        if !config_path.exists() {
            self.run(&[
                "--no-dbus",
                "--root",
                &root_str,
                "create-config",
                "--fstype",
                "btrfs",
                "/",
            ])
            .context("creating root snapper configuration")?;
        }
        update_config_limits(&config_path, max_snapshots)
            .context("applying snapshot retention limits")
    }

    /// Creates a snapper configuration for the given volume, relative to
    /// `root`.
    pub fn create_config(&self, root: &Path, vol_path: &Path) -> Result<()> {
        let root_str = root.to_string_lossy();
        let vol_str = vol_path.to_string_lossy();
        let name = config_name(vol_path);
        self.run(&[
            "--no-dbus",
            "--root",
            &root_str,
            "-c",
            &name,
            "create-config",
            "--fstype",
            "btrfs",
            &vol_str,
        ])
        .with_context(|| format!("creating snapper configuration for '{vol_str}'"))?;
        Ok(())
    }

    /// Creates a snapshot and returns its number.
    pub fn create_snapshot(
        &self,
        root: &Path,
        config: &str,
        base_id: u32,
        read_write: bool,
        description: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<u32> {
        let root_str = root.to_string_lossy();
        let base = base_id.to_string();
        let userdata = metadata
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");

        let mut args: Vec<&str> = vec![
            "--no-dbus",
            "--root",
            &root_str,
            "-c",
            config,
            "create",
            "--print-number",
            "--description",
            description,
        ];
        if base_id > 0 {
            args.extend(["--from", base.as_str()]);
        }
        if read_write {
            args.push("--read-write");
        }
        if !userdata.is_empty() {
            args.extend(["--userdata", userdata.as_str()]);
        }
        let stdout = self
            .run(&args)
            .with_context(|| format!("creating snapshot for config '{config}'"))?;
        stdout
            .trim()
            .parse::<u32>()
            .with_context(|| format!("parsing snapshot number from '{}'", stdout.trim()))
    }

    /// Toggles the read-only property of the given snapshot.
    ///
    /// `snapshot_path` is the snapshot root (`<root>/.snapshots/<id>/snapshot`).
    pub fn set_permissions(&self, snapshot_path: &Path, id: u32, read_only: bool) -> Result<()> {
        let root = snapper_root_of(snapshot_path)
            .with_context(|| format!("deriving snapper root from '{}'", snapshot_path.display()))?;
        let root_str = root.to_string_lossy();
        let id_str = id.to_string();
        let flag = if read_only {
            "--read-only"
        } else {
            "--read-write"
        };
        self.run(&["--no-dbus", "--root", &root_str, "modify", flag, &id_str])
            .with_context(|| format!("changing permissions of snapshot {id}"))?;
        Ok(())
    }

    /// Writes the status diff between two snapshots of `config` to
    /// `output`.
    pub fn status(
        &self,
        root: &Path,
        config: &str,
        output: &Path,
        old_id: u32,
        new_id: u32,
    ) -> Result<()> {
        let root_str = root.to_string_lossy();
        let output_str = output.to_string_lossy();
        let range = format!("{old_id}..{new_id}");
        self.run(&[
            "--no-dbus",
            "--root",
            &root_str,
            "-c",
            config,
            "status",
            "--output",
            &output_str,
            &range,
        ])
        .with_context(|| format!("diffing snapshots {range} of config '{config}'"))?;
        // snapper omits the output file when the snapshots are identical.
        if !output.exists() {
            std::fs::write(output, "")
                .with_context(|| format!("creating empty status file '{}'", output.display()))?;
        }
        Ok(())
    }

    /// Deletes the given snapshot.
    pub fn delete_snapshot(&self, root: &Path, id: u32) -> Result<()> {
        let root_str = root.to_string_lossy();
        let id_str = id.to_string();
        self.run(&["--no-dbus", "--root", &root_str, "delete", &id_str])
            .with_context(|| format!("deleting snapshot {id}"))?;
        Ok(())
    }
}

/// The snapper root is three levels above the snapshot directory
/// (`<root>/.snapshots/<id>/snapshot`).
fn snapper_root_of(snapshot_path: &Path) -> Option<PathBuf> {
    snapshot_path
        .parent()
        .and_then(Path::parent)
        .and_then(Path::parent)
        .map(Path::to_path_buf)
}

/// Updates the retention keys of a snapper configuration file in place,
/// appending missing keys.
fn update_config_limits(config_path: &Path, max_snapshots: u32) -> Result<()> {
    let keys = [
        ("NUMBER_CLEANUP", "yes".to_string()),
        ("NUMBER_LIMIT", max_snapshots.to_string()),
        ("NUMBER_LIMIT_IMPORTANT", max_snapshots.to_string()),
    ];

    let content = match std::fs::read_to_string(config_path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("reading '{}'", config_path.display()))
        }
    };

    let mut lines: Vec<String> = content.lines().map(String::from).collect();
    for (key, value) in keys {
        let rendered = format!("{key}=\"{value}\"");
        match lines.iter_mut().find(|l| l.starts_with(&format!("{key}="))) {
            Some(line) => *line = rendered,
            None => lines.push(rendered),
        }
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating '{}'", parent.display()))?;
    }
    let mut content = lines.join("\n");
    content.push('\n');
    std::fs::write(config_path, content)
        .with_context(|| format!("writing '{}'", config_path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use elemental_hal::FakeHal;

    use super::*;

    #[test]
    fn config_names_flatten_paths() {
        assert_eq!(config_name(Path::new("/")), "root");
        assert_eq!(config_name(Path::new("/etc")), "etc");
        assert_eq!(config_name(Path::new("/usr/local")), "usr_local");
    }

    #[test]
    fn create_snapshot_parses_printed_number() {
        let hal = FakeHal::new();
        hal.push_command_output("snapper", "4\n");
        let snapper = Snapper::new(&hal, CancelToken::new());
        let id = snapper
            .create_snapshot(
                Path::new("/"),
                ROOT_CONFIG,
                3,
                true,
                "upgrade",
                &BTreeMap::new(),
            )
            .unwrap();
        assert_eq!(id, 4);

        let (_, args) = &hal.commands()[0];
        assert!(args.contains(&"--no-dbus".to_string()));
        assert!(args.contains(&"--print-number".to_string()));
        assert!(args.contains(&"--from".to_string()));
        assert!(args.contains(&"--read-write".to_string()));
    }

    #[test]
    fn metadata_is_passed_as_userdata() {
        let hal = FakeHal::new();
        hal.push_command_output("snapper", "2\n");
        let snapper = Snapper::new(&hal, CancelToken::new());
        let mut metadata = BTreeMap::new();
        metadata.insert("stock".to_string(), "true".to_string());
        snapper
            .create_snapshot(Path::new("/"), "etc", 0, false, "stock /etc contents", &metadata)
            .unwrap();

        let (_, args) = &hal.commands()[0];
        assert!(args.contains(&"--userdata".to_string()));
        assert!(args.contains(&"stock=true".to_string()));
        assert!(!args.contains(&"--from".to_string()));
    }

    #[test]
    fn set_permissions_derives_the_snapper_root() {
        let hal = FakeHal::new();
        let snapper = Snapper::new(&hal, CancelToken::new());
        snapper
            .set_permissions(Path::new("/mnt/@/.snapshots/4/snapshot"), 4, true)
            .unwrap();

        let (_, args) = &hal.commands()[0];
        assert!(args.contains(&"/mnt/@".to_string()));
        assert!(args.contains(&"--read-only".to_string()));
        assert!(args.contains(&"4".to_string()));
    }

    #[test]
    fn retention_limits_are_written_to_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("configs/root");
        std::fs::create_dir_all(config.parent().unwrap()).unwrap();
        std::fs::write(&config, "FSTYPE=\"btrfs\"\nNUMBER_LIMIT=\"10\"\n").unwrap();

        update_config_limits(&config, 4).unwrap();
        let content = std::fs::read_to_string(&config).unwrap();
        assert!(content.contains("FSTYPE=\"btrfs\""));
        assert!(content.contains("NUMBER_LIMIT=\"4\""));
        assert!(content.contains("NUMBER_CLEANUP=\"yes\""));
        assert!(content.contains("NUMBER_LIMIT_IMPORTANT=\"4\""));
    }
}
