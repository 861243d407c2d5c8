//! Mount operations.

use std::path::Path;

use crate::HalResult;

/// Mounting and unmounting filesystems.
///
/// `mount` either mounts and leaves the target observable through
/// `is_mounted`, or fails without state change.
pub trait MountOps {
    /// Mount a device or source tree onto `target`.
    ///
    /// `options` are plain mount options (e.g. `ro`, `subvol=@`); the `bind`
    /// option selects a bind mount.
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fstype: Option<&str>,
        options: &[String],
    ) -> HalResult<()>;

    /// Bind-mount `source` onto `target`.
    fn bind_mount(&self, source: &Path, target: &Path) -> HalResult<()> {
        self.mount(source, target, None, &["bind".to_string()])
    }

    fn unmount(&self, target: &Path) -> HalResult<()>;

    fn is_mounted(&self, target: &Path) -> HalResult<bool>;
}
