//! Loop device operations (losetup).

use std::path::Path;

use crate::HalResult;

pub trait LoopOps {
    /// Attach a loop device for the given image, returning the loop path
    /// (e.g. `/dev/loop7`).
    ///
    /// If `scan_partitions` is true the device is created with partition
    /// scanning (`losetup -P`).
    fn losetup_attach(&self, image: &Path, scan_partitions: bool) -> HalResult<String>;

    /// Detach a loop device.
    fn losetup_detach(&self, loop_device: &str) -> HalResult<()>;
}
