//! CLI argument parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "elemental")]
#[command(about = "Transactional Btrfs OS installer and upgrader")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Install the OS onto a target disk. Destructive!
    Install {
        /// Deployment description YAML, merged over the built-in default
        #[arg(long)]
        description: Option<PathBuf>,

        /// Target block device (e.g. /dev/vda)
        #[arg(long)]
        target: Option<PathBuf>,

        /// OS image source URI (oci://, tar:// or dir://)
        #[arg(long)]
        os_image: Option<String>,

        /// Overlay tree source URI applied on top of the OS image
        #[arg(long)]
        overlay: Option<String>,

        /// Host-side script run inside the staged snapshot
        #[arg(long)]
        config_script: Option<PathBuf>,

        /// Bootloader to install (none, grub)
        #[arg(long)]
        bootloader: Option<String>,

        /// Register an EFI boot-manager entry for the installed system
        #[arg(long)]
        create_boot_entry: bool,

        /// Kernel command line appended to the snapshot flags
        #[arg(long)]
        cmdline: Option<String>,

        /// Confirm that the target disk may be wiped
        #[arg(long)]
        confirm: bool,
    },

    /// Upgrade the running system to a new OS image
    Upgrade {
        /// OS image source URI (oci://, tar:// or dir://)
        #[arg(long)]
        os_image: Option<String>,

        /// Overlay tree source URI applied on top of the OS image
        #[arg(long)]
        overlay: Option<String>,

        /// Host-side script run inside the staged snapshot
        #[arg(long)]
        config_script: Option<PathBuf>,
    },

    /// Print version information
    Version,
}
