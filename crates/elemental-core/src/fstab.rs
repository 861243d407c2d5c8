//! `/etc/fstab` creation and in-place updates.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

/// Location of the fstab file relative to a snapshot root.
pub const FSTAB_FILE: &str = "etc/fstab";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FstabLine {
    pub device: String,
    pub mount_point: PathBuf,
    pub filesystem: String,
    pub options: Vec<String>,
    pub fsck_order: u8,
}

impl FstabLine {
    fn render(&self) -> String {
        let options = if self.options.is_empty() {
            "defaults".to_string()
        } else {
            self.options.join(",")
        };
        format!(
            "{} {} {} {} 0 {}",
            self.device,
            self.mount_point.display(),
            self.filesystem,
            options,
            self.fsck_order
        )
    }
}

/// Writes a new fstab file with the given lines.
pub fn write_fstab(path: &Path, lines: &[FstabLine]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating '{}'", parent.display()))?;
    }
    let mut content = String::new();
    for line in lines {
        content.push_str(&line.render());
        content.push('\n');
    }
    std::fs::write(path, content).with_context(|| format!("writing '{}'", path.display()))?;
    Ok(())
}

/// Replaces the fstab lines matching the mount points of `old` with the
/// corresponding entries of `new`.
pub fn update_fstab(path: &Path, old: &[FstabLine], new: &[FstabLine]) -> Result<()> {
    if old.len() != new.len() {
        bail!("old and new fstab line lists differ in length");
    }
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading '{}'", path.display()))?;

    let mut updated = Vec::new();
    for line in content.lines() {
        let mount_point = line.split_whitespace().nth(1);
        let replacement = mount_point.and_then(|mnt| {
            old.iter()
                .position(|o| o.mount_point == Path::new(mnt))
                .map(|i| &new[i])
        });
        match replacement {
            Some(new_line) => updated.push(new_line.render()),
            None => updated.push(line.to_string()),
        }
    }
    let mut content = updated.join("\n");
    content.push('\n');
    std::fs::write(path, content).with_context(|| format!("writing '{}'", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(device: &str, mnt: &str, fs: &str, opts: &[&str], fsck: u8) -> FstabLine {
        FstabLine {
            device: device.to_string(),
            mount_point: PathBuf::from(mnt),
            filesystem: fs.to_string(),
            options: opts.iter().map(|s| s.to_string()).collect(),
            fsck_order: fsck,
        }
    }

    #[test]
    fn writes_lines_with_default_options() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fstab");
        write_fstab(
            &path,
            &[
                line("UUID=aaaa", "/", "btrfs", &["ro"], 1),
                line("UUID=bbbb", "/boot", "vfat", &[], 2),
            ],
        )
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "UUID=aaaa / btrfs ro 0 1\nUUID=bbbb /boot vfat defaults 0 2\n"
        );
    }

    #[test]
    fn updates_matching_mount_points_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fstab");
        write_fstab(
            &path,
            &[
                line("UUID=aaaa", "/", "btrfs", &["ro"], 1),
                line("UUID=aaaa", "/etc", "btrfs", &["subvol=@/.snapshots/1/snapshot/etc"], 0),
            ],
        )
        .unwrap();

        update_fstab(
            &path,
            &[line("", "/etc", "", &[], 0)],
            &[line("UUID=aaaa", "/etc", "btrfs", &["subvol=@/.snapshots/2/snapshot/etc"], 0)],
        )
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("subvol=@/.snapshots/2/snapshot/etc"));
        assert!(content.contains("UUID=aaaa / btrfs ro 0 1"));
        assert!(!content.contains("snapshots/1/snapshot/etc"));
    }

    #[test]
    fn update_rejects_mismatched_lists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fstab");
        write_fstab(&path, &[]).unwrap();
        assert!(update_fstab(&path, &[line("", "/etc", "", &[], 0)], &[]).is_err());
    }
}
