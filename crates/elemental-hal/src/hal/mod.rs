//! HAL trait definitions and implementations.
//!
//! This module defines the per-concern traits for system operations and
//! provides both real (`LinuxHal`) and fake (`FakeHal`) implementations.

pub mod fake_hal;
pub mod guards;
pub mod linux_hal;
pub mod loop_ops;
pub mod mount_ops;
pub mod process_ops;
pub mod syscall_ops;

use loop_ops::LoopOps;
use mount_ops::MountOps;
use process_ops::ProcessOps;
use syscall_ops::SyscallOps;

/// Complete HAL combining all system operation traits.
pub trait SystemHal: ProcessOps + MountOps + LoopOps + SyscallOps + Send + Sync {}

impl<T> SystemHal for T where T: ProcessOps + MountOps + LoopOps + SyscallOps + Send + Sync {}
