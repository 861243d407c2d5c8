//! System seam for elemental.
//!
//! Everything that touches the world outside the process tree (mounting,
//! formatting tools, loop devices, chroot syscalls, external commands) goes
//! through the traits defined here so the deployment engine can be exercised
//! in CI without root privileges or real block devices.

mod cancel;
pub mod envfile;
mod error;
pub mod hal;
mod platform;

pub use cancel::CancelToken;
pub use error::{HalError, HalResult};
pub use hal::fake_hal::{FakeHal, Operation};
pub use hal::guards::{LoopGuard, MountGuard};
pub use hal::linux_hal::LinuxHal;
pub use hal::loop_ops::LoopOps;
pub use hal::mount_ops::MountOps;
pub use hal::process_ops::{CommandOptions, ProcessOps};
pub use hal::syscall_ops::SyscallOps;
pub use hal::SystemHal;
pub use platform::{Arch, Platform};

/// Checks whether an external tool is reachable through `PATH`.
pub fn command_exists(command: &str) -> bool {
    which::which(command).is_ok()
}
