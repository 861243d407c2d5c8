//! rsync invocations for tree synchronization.

use std::path::Path;

use anyhow::{Context, Result};
use elemental_hal::{CancelToken, CommandOptions, ProcessOps};

/// Default flag set used for data syncs.
pub fn default_flags() -> Vec<String> {
    [
        "--info=progress2",
        "--human-readable",
        "--archive",
        "--xattrs",
        "--acls",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub struct Rsync<'a> {
    hal: &'a dyn ProcessOps,
    token: CancelToken,
    flags: Vec<String>,
}

impl<'a> Rsync<'a> {
    pub fn new(hal: &'a dyn ProcessOps, token: CancelToken) -> Self {
        Self {
            hal,
            token,
            flags: default_flags(),
        }
    }

    pub fn with_flags(hal: &'a dyn ProcessOps, token: CancelToken, flags: Vec<String>) -> Self {
        Self { hal, token, flags }
    }

    /// Sync the contents of `src` into `dst`. Paths listed in `protected`
    /// are never deleted at the destination.
    pub fn sync_data(&self, src: &Path, dst: &Path, protected: &[&str]) -> Result<()> {
        let mut args: Vec<String> = self.flags.clone();
        for path in protected {
            args.push(format!("--filter=P {path}"));
        }
        // Trailing slashes make rsync sync directory contents rather than
        // the directory itself.
        args.push(format!("{}/", src.display()));
        args.push(format!("{}/", dst.display()));
        self.run(args)
            .with_context(|| format!("syncing '{}' to '{}'", src.display(), dst.display()))
    }

    /// Make `dst` equal to `src`, except that `excludes` are not written
    /// and `delete_excludes` are protected from deletion.
    pub fn mirror_data(
        &self,
        src: &Path,
        dst: &Path,
        excludes: &[&Path],
        delete_excludes: &[&Path],
    ) -> Result<()> {
        let mut args: Vec<String> = self.flags.clone();
        args.push("--delete".to_string());
        for path in excludes {
            args.push(format!("--exclude={}", path.display()));
        }
        for path in delete_excludes {
            args.push(format!("--filter=P {}", path.display()));
        }
        args.push(format!("{}/", src.display()));
        args.push(format!("{}/", dst.display()));
        self.run(args)
            .with_context(|| format!("mirroring '{}' to '{}'", src.display(), dst.display()))
    }

    fn run(&self, args: Vec<String>) -> Result<()> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.hal.command_stream(
            &self.token,
            "rsync",
            &args,
            &CommandOptions::default(),
            &mut |line| log::debug!("rsync: {line}"),
            &mut |line| log::warn!("rsync: {line}"),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use elemental_hal::FakeHal;

    use super::*;

    #[test]
    fn sync_appends_trailing_slashes_and_protections() {
        let hal = FakeHal::new();
        let rsync = Rsync::new(&hal, CancelToken::new());
        rsync
            .sync_data(Path::new("/src"), Path::new("/dst"), &["/.snapshots"])
            .unwrap();

        let commands = hal.commands();
        assert_eq!(commands.len(), 1);
        let (program, args) = &commands[0];
        assert_eq!(program, "rsync");
        assert!(args.contains(&"--info=progress2".to_string()));
        assert!(args.contains(&"--filter=P /.snapshots".to_string()));
        assert!(args.contains(&"/src/".to_string()));
        assert!(args.contains(&"/dst/".to_string()));
    }

    #[test]
    fn mirror_adds_delete_and_excludes() {
        let hal = FakeHal::new();
        let rsync = Rsync::new(&hal, CancelToken::new());
        let excludes = [PathBuf::from("/.snapshots"), PathBuf::from("/var")];
        let protect = [PathBuf::from("/home")];
        rsync
            .mirror_data(
                Path::new("/store"),
                Path::new("/mnt/@/.snapshots/1/snapshot"),
                &excludes.iter().map(PathBuf::as_path).collect::<Vec<_>>(),
                &protect.iter().map(PathBuf::as_path).collect::<Vec<_>>(),
            )
            .unwrap();

        let (_, args) = &hal.commands()[0];
        assert!(args.contains(&"--delete".to_string()));
        assert!(args.contains(&"--exclude=/.snapshots".to_string()));
        assert!(args.contains(&"--exclude=/var".to_string()));
        assert!(args.contains(&"--filter=P /home".to_string()));
    }

    #[test]
    fn cancellation_aborts_the_sync() {
        let hal = FakeHal::new();
        let token = CancelToken::new();
        hal.cancel_on_command("rsync", &token);
        let rsync = Rsync::new(&hal, token);
        let err = rsync
            .sync_data(Path::new("/src"), Path::new("/dst"), &[])
            .unwrap_err();
        assert!(format!("{err:#}").contains("cancelled"));
    }
}
