//! Target platform descriptor.

use std::fmt;

use crate::{HalError, HalResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
    Riscv64,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
            Arch::Riscv64 => "riscv64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: &'static str,
    pub arch: Arch,
}

impl Platform {
    /// Platform of the running binary.
    pub fn host() -> HalResult<Self> {
        Self::from_arch(std::env::consts::ARCH)
    }

    pub fn from_arch(arch: &str) -> HalResult<Self> {
        let arch = match arch {
            "x86_64" | "amd64" => Arch::X86_64,
            "aarch64" | "arm64" => Arch::Aarch64,
            "riscv64" => Arch::Riscv64,
            other => return Err(HalError::Parse(format!("unsupported architecture: {other}"))),
        };
        Ok(Self { os: "linux", arch })
    }

    /// Default removable-media EFI application name for this platform.
    pub fn default_efi_file(&self) -> &'static str {
        match self.arch {
            Arch::X86_64 => "bootx64.efi",
            Arch::Aarch64 => "bootaa64.efi",
            Arch::Riscv64 => "bootriscv64.efi",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_arch_aliases() {
        assert_eq!(Platform::from_arch("amd64").unwrap().arch, Arch::X86_64);
        assert_eq!(Platform::from_arch("arm64").unwrap().arch, Arch::Aarch64);
        assert!(Platform::from_arch("m68k").is_err());
    }

    #[test]
    fn efi_file_names_per_arch() {
        assert_eq!(
            Platform::from_arch("x86_64").unwrap().default_efi_file(),
            "bootx64.efi"
        );
        assert_eq!(
            Platform::from_arch("riscv64").unwrap().default_efi_file(),
            "bootriscv64.efi"
        );
    }
}
