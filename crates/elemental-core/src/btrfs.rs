//! Btrfs subvolume management.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use elemental_hal::{CancelToken, CommandOptions, ProcessOps};

/// Name of the top subvolume holding snapshots and rw volumes.
pub const TOP_SUBVOL: &str = "@";

/// Snapshots directory relative to the top subvolume.
pub const SNAPSHOTS_PATH: &str = ".snapshots";

fn opts() -> CommandOptions {
    CommandOptions::with_timeout(Duration::from_secs(120))
}

/// Creates a subvolume at `path`, with copy-on-write optionally disabled.
pub fn create_subvolume(
    hal: &dyn ProcessOps,
    token: &CancelToken,
    path: &Path,
    no_copy_on_write: bool,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating '{}'", parent.display()))?;
    }
    let path_str = path.to_string_lossy();
    hal.command_status(token, "btrfs", &["subvolume", "create", &path_str], &opts())
        .with_context(|| format!("creating subvolume '{}'", path.display()))?;
    // The tool creates the directory; this is a no-op outside of tests.
    std::fs::create_dir_all(path)
        .with_context(|| format!("creating '{}'", path.display()))?;
    if no_copy_on_write {
        hal.command_status(token, "chattr", &["+C", &path_str], &opts())
            .with_context(|| format!("disabling copy-on-write on '{}'", path.display()))?;
    }
    Ok(())
}

pub fn delete_subvolume(hal: &dyn ProcessOps, token: &CancelToken, path: &Path) -> Result<()> {
    let path_str = path.to_string_lossy();
    hal.command_status(token, "btrfs", &["subvolume", "delete", &path_str], &opts())
        .with_context(|| format!("deleting subvolume '{}'", path.display()))
}

/// Prepares a freshly formatted system partition mounted at `mount_point`:
/// creates the top subvolume `@` with its `.snapshots` directory and makes
/// `@` the default subvolume.
pub fn setup_top_subvolume(
    hal: &dyn ProcessOps,
    token: &CancelToken,
    mount_point: &Path,
) -> Result<()> {
    let top = mount_point.join(TOP_SUBVOL);
    create_subvolume(hal, token, &top, false)?;
    create_subvolume(hal, token, &top.join(SNAPSHOTS_PATH), false)?;
    set_default(hal, token, mount_point, TOP_SUBVOL)
}

/// Makes the subvolume at `rel_path` (relative to the filesystem top level)
/// the default subvolume.
pub fn set_default(
    hal: &dyn ProcessOps,
    token: &CancelToken,
    mount_point: &Path,
    rel_path: &str,
) -> Result<()> {
    let id = subvolume_id(hal, token, mount_point, rel_path)?;
    let mount_str = mount_point.to_string_lossy();
    hal.command_status(
        token,
        "btrfs",
        &["subvolume", "set-default", &id.to_string(), &mount_str],
        &opts(),
    )
    .with_context(|| format!("setting default subvolume '{rel_path}'"))
}

/// Looks up the numeric subvolume ID of `rel_path`.
pub fn subvolume_id(
    hal: &dyn ProcessOps,
    token: &CancelToken,
    mount_point: &Path,
    rel_path: &str,
) -> Result<u64> {
    let mount_str = mount_point.to_string_lossy();
    let output = hal
        .command_output(token, "btrfs", &["subvolume", "list", &mount_str], &opts())
        .context("listing subvolumes")?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_subvolume_id(&stdout, rel_path)
        .with_context(|| format!("resolving subvolume '{rel_path}'"))
}

/// Returns the path of the current default subvolume, if one is set.
pub fn get_default(
    hal: &dyn ProcessOps,
    token: &CancelToken,
    mount_point: &Path,
) -> Result<Option<String>> {
    let mount_str = mount_point.to_string_lossy();
    let output = hal
        .command_output(token, "btrfs", &["subvolume", "get-default", &mount_str], &opts())
        .context("reading default subvolume")?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_default_path(&stdout))
}

/// Parses `btrfs subvolume list` output lines of the form
/// `ID 259 gen 10 top level 5 path @/.snapshots/1/snapshot`.
fn parse_subvolume_id(listing: &str, rel_path: &str) -> Result<u64> {
    for line in listing.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let id = fields.iter().position(|f| *f == "ID").map(|i| i + 1);
        let path = fields.iter().position(|f| *f == "path").map(|i| i + 1);
        if let (Some(id_idx), Some(path_idx)) = (id, path) {
            if fields.get(path_idx) == Some(&rel_path) {
                return fields[id_idx]
                    .parse::<u64>()
                    .context("parsing subvolume ID");
            }
        }
    }
    bail!("subvolume '{rel_path}' not found");
}

fn parse_default_path(output: &str) -> Option<String> {
    let fields: Vec<&str> = output.split_whitespace().collect();
    fields
        .iter()
        .position(|f| *f == "path")
        .and_then(|i| fields.get(i + 1))
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use elemental_hal::{FakeHal, Operation};

    use super::*;

    #[test]
    fn parses_subvolume_listing() {
        let listing = "ID 256 gen 7 top level 5 path @\n\
                       ID 259 gen 10 top level 256 path @/.snapshots/1/snapshot\n";
        assert_eq!(parse_subvolume_id(listing, "@").unwrap(), 256);
        assert_eq!(
            parse_subvolume_id(listing, "@/.snapshots/1/snapshot").unwrap(),
            259
        );
        assert!(parse_subvolume_id(listing, "@/home").is_err());
    }

    #[test]
    fn parses_default_subvolume_path() {
        let output = "ID 259 gen 10 top level 5 path @/.snapshots/2/snapshot\n";
        assert_eq!(
            parse_default_path(output).as_deref(),
            Some("@/.snapshots/2/snapshot")
        );
        assert_eq!(parse_default_path("ID 5 (FS_TREE)"), None);
    }

    #[test]
    fn no_copy_on_write_subvolume_runs_chattr() {
        let dir = tempfile::tempdir().unwrap();
        let hal = FakeHal::new();
        let token = CancelToken::new();
        create_subvolume(&hal, &token, &dir.path().join("@/var"), true).unwrap();

        let commands = hal.commands();
        assert_eq!(commands[0].0, "btrfs");
        assert_eq!(commands[1].0, "chattr");
        assert_eq!(commands[1].1[0], "+C");
    }

    #[test]
    fn setup_creates_top_and_snapshots_subvolumes() {
        let dir = tempfile::tempdir().unwrap();
        let hal = FakeHal::new();
        hal.push_command_output("btrfs", ""); // create @
        hal.push_command_output("btrfs", ""); // create @/.snapshots
        hal.push_command_output("btrfs", "ID 256 gen 5 top level 5 path @\n"); // list
        let token = CancelToken::new();
        setup_top_subvolume(&hal, &token, dir.path()).unwrap();

        assert!(hal.has_operation(|op| matches!(
            op,
            Operation::Command { program, args }
                if program == "btrfs" && args.iter().any(|a| a == "set-default")
        )));
    }
}
