use std::path::{Path, PathBuf};

use super::loop_ops::LoopOps;
use super::mount_ops::MountOps;

/// RAII guard that unmounts a target path when dropped.
#[derive(Debug)]
pub struct MountGuard<'a, H: MountOps + ?Sized> {
    hal: &'a H,
    target: PathBuf,
    active: bool,
}

impl<'a, H: MountOps + ?Sized> MountGuard<'a, H> {
    pub fn new(hal: &'a H, target: impl Into<PathBuf>) -> Self {
        Self {
            hal,
            target: target.into(),
            active: true,
        }
    }

    /// Prevent automatic unmounting and return the target path.
    pub fn release(mut self) -> PathBuf {
        self.active = false;
        self.target.clone()
    }

    pub fn target(&self) -> &Path {
        &self.target
    }
}

impl<'a, H: MountOps + ?Sized> Drop for MountGuard<'a, H> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(err) = self.hal.unmount(&self.target) {
            log::warn!(
                "mount guard failed to unmount {}: {}",
                self.target.display(),
                err
            );
        }
    }
}

/// RAII guard that detaches a loop device when dropped.
#[derive(Debug)]
pub struct LoopGuard<'a, H: LoopOps + ?Sized> {
    hal: &'a H,
    loop_device: String,
    active: bool,
}

impl<'a, H: LoopOps + ?Sized> LoopGuard<'a, H> {
    pub fn new(hal: &'a H, loop_device: impl Into<String>) -> Self {
        Self {
            hal,
            loop_device: loop_device.into(),
            active: true,
        }
    }

    /// Prevent automatic detach and return the loop device path.
    pub fn release(mut self) -> String {
        self.active = false;
        self.loop_device.clone()
    }

    pub fn device(&self) -> &str {
        &self.loop_device
    }
}

impl<'a, H: LoopOps + ?Sized> Drop for LoopGuard<'a, H> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(err) = self.hal.losetup_detach(&self.loop_device) {
            log::warn!("loop guard failed to detach {}: {}", self.loop_device, err);
        }
    }
}
