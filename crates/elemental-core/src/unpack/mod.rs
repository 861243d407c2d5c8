//! Image source unpacking.
//!
//! Every source variant materializes to a file tree and is then synced into
//! the destination; a successful unpack returns a stable content digest
//! witnessing what was deployed. Unpacking is restartable: identical inputs
//! converge to identical output.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use elemental_hal::{CancelToken, CommandOptions, ProcessOps, SystemHal};
use sha2::{Digest, Sha256};

use crate::deployment::{ImageKind, ImageSource};
use crate::rsync::Rsync;

pub struct Unpacker<'a> {
    hal: &'a dyn SystemHal,
    token: CancelToken,
    source: ImageSource,
}

enum Store {
    Borrowed(PathBuf),
    Temp(tempfile::TempDir),
}

impl Store {
    fn path(&self) -> &Path {
        match self {
            Store::Borrowed(path) => path,
            Store::Temp(dir) => dir.path(),
        }
    }
}

impl<'a> Unpacker<'a> {
    pub fn new(hal: &'a dyn SystemHal, token: CancelToken, source: &ImageSource) -> Self {
        Self {
            hal,
            token,
            source: source.clone(),
        }
    }

    /// Unpacks the source onto `dest` without deleting anything already
    /// present. Used for overlay trees.
    pub fn unpack(&self, dest: &Path) -> Result<String> {
        self.token.err_if_cancelled()?;
        if self.source.is_empty() {
            return Ok(String::new());
        }
        let (store, digest) = self.materialize()?;
        Rsync::new(self.hal, self.token.clone())
            .sync_data(store.path(), dest, &[])
            .with_context(|| format!("unpacking image to '{}'", dest.display()))?;
        Ok(digest)
    }

    /// Makes `dest` equal to the source tree, except that `excludes` are
    /// not written and `delete_excludes` are protected from deletion.
    pub fn synched_unpack(
        &self,
        dest: &Path,
        excludes: &[PathBuf],
        delete_excludes: &[PathBuf],
    ) -> Result<String> {
        self.token.err_if_cancelled()?;
        if self.source.is_empty() {
            return Ok(String::new());
        }
        let (store, digest) = self.materialize()?;
        let excludes: Vec<&Path> = excludes.iter().map(PathBuf::as_path).collect();
        let protect: Vec<&Path> = delete_excludes.iter().map(PathBuf::as_path).collect();
        Rsync::new(self.hal, self.token.clone())
            .mirror_data(store.path(), dest, &excludes, &protect)
            .with_context(|| format!("unpacking image to '{}'", dest.display()))?;
        Ok(digest)
    }

    /// Materializes the source into a local tree and computes its digest.
    fn materialize(&self) -> Result<(Store, String)> {
        match self.source.kind() {
            ImageKind::Empty => Ok((Store::Borrowed(PathBuf::new()), String::new())),
            ImageKind::Dir(path) => {
                if !path.is_dir() {
                    bail!("image source directory '{}' not found", path.display());
                }
                let digest = digest_tree(path)
                    .with_context(|| format!("hashing tree '{}'", path.display()))?;
                Ok((Store::Borrowed(path.clone()), digest))
            }
            ImageKind::Tar(path) => {
                if !path.is_file() {
                    bail!("image source tarball '{}' not found", path.display());
                }
                let digest = digest_file(path)
                    .with_context(|| format!("hashing tarball '{}'", path.display()))?;
                let store = tempfile::tempdir().context("creating unpack store")?;
                extract_tarball(path, store.path())
                    .with_context(|| format!("extracting '{}'", path.display()))?;
                Ok((Store::Temp(store), digest))
            }
            ImageKind::Oci(reference) => {
                let store = tempfile::tempdir().context("creating unpack store")?;
                let digest = self
                    .materialize_oci(reference, store.path())
                    .with_context(|| format!("materializing OCI image '{reference}'"))?;
                Ok((Store::Temp(store), digest))
            }
        }
    }

    /// Exports the flattened image filesystem with podman and extracts it
    /// into `store`. The returned digest is the image manifest digest.
    fn materialize_oci(&self, reference: &str, store: &Path) -> Result<String> {
        let opts = CommandOptions::default();
        self.hal
            .command_status(&self.token, "podman", &["pull", reference], &opts)
            .context("pulling image")?;

        let output = self
            .hal
            .command_output(
                &self.token,
                "podman",
                &["image", "inspect", "--format", "{{.Digest}}", reference],
                &opts,
            )
            .context("reading image digest")?;
        let digest = String::from_utf8_lossy(&output.stdout).trim().to_string();

        let output = self
            .hal
            .command_output(&self.token, "podman", &["create", reference], &opts)
            .context("creating container")?;
        let container = String::from_utf8_lossy(&output.stdout).trim().to_string();

        let export = store.join("image.tar");
        let export_str = export.to_string_lossy().to_string();
        let result = self
            .hal
            .command_status(
                &self.token,
                "podman",
                &["export", "-o", &export_str, &container],
                &opts,
            )
            .context("exporting container filesystem");
        let remove = self.hal.command_status(
            &self.token,
            "podman",
            &["rm", &container],
            &CommandOptions::with_timeout(Duration::from_secs(60)),
        );
        result?;
        if let Err(err) = remove {
            log::warn!("failed removing work container {container}: {err}");
        }

        extract_tarball(&export, store).context("extracting exported filesystem")?;
        std::fs::remove_file(&export).context("removing export tarball")?;
        Ok(digest)
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// sha256 of a single file.
fn digest_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("sha256:{}", to_hex(&hasher.finalize())))
}

/// Aggregate sha256 over relative paths and file contents, walked in
/// sorted order so the digest is stable.
fn digest_tree(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path());
        hasher.update(rel.to_string_lossy().as_bytes());
        if entry.file_type().is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            hasher.update(target.to_string_lossy().as_bytes());
        } else if entry.file_type().is_file() {
            let mut file = std::fs::File::open(entry.path())?;
            std::io::copy(&mut file, &mut hasher)?;
        }
    }
    Ok(format!("sha256:{}", to_hex(&hasher.finalize())))
}

/// Extracts a (possibly gzip-compressed) tarball into `dest`.
fn extract_tarball(path: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(path)?;
    let gzipped = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("gz") | Some("tgz")
    );
    let reader: Box<dyn Read> = if gzipped {
        Box::new(flate2::read::GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.unpack(dest)?;
    Ok(())
}
