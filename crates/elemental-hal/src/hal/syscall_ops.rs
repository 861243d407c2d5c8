//! Process-wide syscalls used by the chroot runner.

use std::fs::File;
use std::path::Path;

use crate::HalResult;

pub trait SyscallOps {
    fn chroot(&self, path: &Path) -> HalResult<()>;

    fn chdir(&self, path: &Path) -> HalResult<()>;

    /// Change directory to the directory referenced by an open descriptor.
    ///
    /// Used to restore the pre-chroot root: `fchdir(saved)` followed by
    /// `chroot(".")`.
    fn fchdir(&self, dir: &File) -> HalResult<()>;
}
