//! Typed deployment description: disks, partitions, rw volumes, image
//! sources and boot configuration.
//!
//! A deployment is created by configuration, sanitized before use and
//! persisted into the active snapshot on each committed transaction. The
//! persisted record deliberately omits the disk device path so it stays
//! portable across machines.

pub mod merge;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Relative location of the persisted deployment record inside a snapshot.
pub const DEPLOYMENT_FILE: &str = "etc/elemental/deployment.yaml";

pub const EFI_LABEL: &str = "EFI";
pub const SYSTEM_LABEL: &str = "SYSTEM";
pub const RECOVERY_LABEL: &str = "RECOVERY";
pub const CONFIG_LABEL: &str = "CONFIG";

pub const EFI_MNT: &str = "/boot";
pub const SYSTEM_MNT: &str = "/";

/// Minimum size of the optional configuration partition.
pub const CONFIG_MIN_SIZE: u64 = 256;

const DEFAULT_EFI_SIZE: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartRole {
    /// Zero value of a partial description; rejected by sanitize.
    #[default]
    #[serde(skip)]
    Unset,
    Efi,
    System,
    Recovery,
    Data,
}

impl PartRole {
    pub fn default_label(&self) -> &'static str {
        match self {
            PartRole::Efi => EFI_LABEL,
            PartRole::System => SYSTEM_LABEL,
            PartRole::Recovery => RECOVERY_LABEL,
            PartRole::Unset | PartRole::Data => "",
        }
    }
}

impl fmt::Display for PartRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartRole::Unset => "unset",
            PartRole::Efi => "efi",
            PartRole::System => "system",
            PartRole::Recovery => "recovery",
            PartRole::Data => "data",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileSystem {
    Btrfs,
    Xfs,
    Ext2,
    Ext4,
    VFat,
}

impl FileSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileSystem::Btrfs => "btrfs",
            FileSystem::Xfs => "xfs",
            FileSystem::Ext2 => "ext2",
            FileSystem::Ext4 => "ext4",
            FileSystem::VFat => "vfat",
        }
    }
}

impl fmt::Display for FileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partition size in MiB, or the all-available sentinel.
///
/// `All` may only be used by the last partition of its disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartSize {
    /// Zero value of a partial description; rejected by sanitize.
    #[default]
    Unset,
    MiB(u64),
    All,
}

impl Serialize for PartSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            PartSize::Unset => serializer.serialize_u64(0),
            PartSize::MiB(size) => serializer.serialize_u64(*size),
            PartSize::All => serializer.serialize_str("all"),
        }
    }
}

impl<'de> Deserialize<'de> for PartSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct SizeVisitor;

        impl serde::de::Visitor<'_> for SizeVisitor {
            type Value = PartSize;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a size in MiB or the string \"all\"")
            }

            fn visit_u64<E: serde::de::Error>(self, value: u64) -> std::result::Result<PartSize, E> {
                if value == 0 {
                    Ok(PartSize::Unset)
                } else {
                    Ok(PartSize::MiB(value))
                }
            }

            fn visit_i64<E: serde::de::Error>(self, value: i64) -> std::result::Result<PartSize, E> {
                if value < 0 {
                    return Err(E::custom("partition size cannot be negative"));
                }
                self.visit_u64(value as u64)
            }

            fn visit_str<E: serde::de::Error>(self, value: &str) -> std::result::Result<PartSize, E> {
                match value {
                    "all" => Ok(PartSize::All),
                    other => Err(E::custom(format!("unknown partition size '{other}'"))),
                }
            }
        }

        deserializer.deserialize_any(SizeVisitor)
    }
}

/// Human-readable disk size (e.g. `10G`, `500M`) used for image-file targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiskSize(pub String);

impl DiskSize {
    pub fn is_valid(&self) -> bool {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let re = PATTERN.get_or_init(|| Regex::new(r"^[1-9]\d*[KMGT]$").unwrap());
        re.is_match(&self.0)
    }
}

impl fmt::Display for DiskSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A Btrfs subvolume carved inside a partition that keeps user-writable
/// data across snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RWVolume {
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mount_opts: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub no_copy_on_write: bool,
    /// Snapshotted volumes participate in the three-way merge on upgrade.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub snapshotted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Partition {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub label: String,
    pub role: PartRole,
    pub size: PartSize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FileSystem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mount_opts: Vec<String>,
    /// Filesystem UUID, populated when the partition is formatted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// GPT hidden attribute flag.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub hidden: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rw_volumes: Vec<RWVolume>,
}

impl Partition {
    /// Effective filesystem, falling back to the role default.
    pub fn fs(&self) -> FileSystem {
        self.filesystem.unwrap_or(match self.role {
            PartRole::Efi => FileSystem::VFat,
            _ => FileSystem::Btrfs,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Disk {
    /// Block device to install to. Deliberately not persisted so the
    /// deployment record stays portable.
    #[serde(rename = "target", skip_serializing)]
    pub device: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<DiskSize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_sector: Option<u64>,
    pub partitions: Vec<Partition>,
}

/// Location an OS image is taken from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ImageKind {
    #[default]
    Empty,
    Oci(String),
    Tar(PathBuf),
    Dir(PathBuf),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ImageSourceRepr", into = "ImageSourceRepr")]
pub struct ImageSource {
    kind: ImageKind,
    digest: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct ImageSourceRepr {
    #[serde(skip_serializing_if = "String::is_empty")]
    uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    digest: Option<String>,
}

impl TryFrom<ImageSourceRepr> for ImageSource {
    type Error = String;

    fn try_from(repr: ImageSourceRepr) -> std::result::Result<Self, Self::Error> {
        let mut src = ImageSource::from_uri(&repr.uri).map_err(|e| e.to_string())?;
        src.digest = repr.digest;
        Ok(src)
    }
}

impl From<ImageSource> for ImageSourceRepr {
    fn from(src: ImageSource) -> Self {
        ImageSourceRepr {
            uri: src.uri(),
            digest: src.digest,
        }
    }
}

impl ImageSource {
    pub fn oci(reference: impl Into<String>) -> Self {
        Self {
            kind: ImageKind::Oci(reference.into()),
            digest: None,
        }
    }

    pub fn tar(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: ImageKind::Tar(path.into()),
            digest: None,
        }
    }

    pub fn dir(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: ImageKind::Dir(path.into()),
            digest: None,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Parses the `oci://`, `tar://` or `dir://` URI form. An empty string
    /// yields the empty source.
    pub fn from_uri(uri: &str) -> Result<Self> {
        if uri.is_empty() {
            return Ok(Self::empty());
        }
        let (scheme, rest) = uri
            .split_once("://")
            .with_context(|| format!("invalid image source URI '{uri}'"))?;
        let kind = match scheme {
            "oci" | "docker" => ImageKind::Oci(rest.to_string()),
            "tar" => ImageKind::Tar(PathBuf::from(rest)),
            "dir" => ImageKind::Dir(PathBuf::from(rest)),
            other => bail!("unknown image source scheme '{other}'"),
        };
        Ok(Self { kind, digest: None })
    }

    pub fn uri(&self) -> String {
        match &self.kind {
            ImageKind::Empty => String::new(),
            ImageKind::Oci(reference) => format!("oci://{reference}"),
            ImageKind::Tar(path) => format!("tar://{}", path.display()),
            ImageKind::Dir(path) => format!("dir://{}", path.display()),
        }
    }

    pub fn kind(&self) -> &ImageKind {
        &self.kind
    }

    pub fn is_empty(&self) -> bool {
        self.kind == ImageKind::Empty
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Records the content digest witnessed by a successful unpack.
    pub fn set_digest(&mut self, digest: impl Into<String>) {
        self.digest = Some(digest.into());
    }
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("empty")
        } else {
            f.write_str(&self.uri())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootloaderKind {
    #[default]
    #[serde(skip)]
    Unset,
    None,
    Grub,
}

impl fmt::Display for BootloaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootloaderKind::Unset => "unset",
            BootloaderKind::None => "none",
            BootloaderKind::Grub => "grub",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BootConfig {
    pub bootloader: BootloaderKind,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kernel_cmdline: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotterKind {
    #[default]
    Snapper,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Snapshotter {
    pub name: SnapshotterKind,
}

/// EFI boot-manager entry registered with the platform firmware.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EfiBootEntry {
    pub label: String,
    pub disk: PathBuf,
    pub partition: u32,
    pub loader: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FirmwareConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub boot_entries: Vec<EfiBootEntry>,
}

/// Top-level deployment record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Deployment {
    pub disks: Vec<Disk>,
    pub source_os: ImageSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay_tree: Option<ImageSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cfg_script: Option<PathBuf>,
    pub boot_config: BootConfig,
    pub snapshotter: Snapshotter,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware: Option<FirmwareConfig>,
}

fn default_rw_volumes() -> Vec<RWVolume> {
    vec![
        RWVolume {
            path: PathBuf::from("/etc"),
            snapshotted: true,
            ..Default::default()
        },
        RWVolume {
            path: PathBuf::from("/var"),
            no_copy_on_write: true,
            ..Default::default()
        },
        RWVolume {
            path: PathBuf::from("/home"),
            ..Default::default()
        },
        RWVolume {
            path: PathBuf::from("/root"),
            ..Default::default()
        },
        RWVolume {
            path: PathBuf::from("/opt"),
            ..Default::default()
        },
        RWVolume {
            path: PathBuf::from("/srv"),
            ..Default::default()
        },
    ]
}

impl Deployment {
    /// Single-disk EFI + system layout with the stock rw volume set.
    pub fn default_deployment() -> Self {
        Deployment {
            disks: vec![Disk {
                device: PathBuf::new(),
                size: None,
                start_sector: None,
                partitions: vec![
                    Partition {
                        label: EFI_LABEL.to_string(),
                        role: PartRole::Efi,
                        size: PartSize::MiB(DEFAULT_EFI_SIZE),
                        filesystem: Some(FileSystem::VFat),
                        mount_point: Some(PathBuf::from(EFI_MNT)),
                        ..Default::default()
                    },
                    Partition {
                        label: SYSTEM_LABEL.to_string(),
                        role: PartRole::System,
                        size: PartSize::All,
                        filesystem: Some(FileSystem::Btrfs),
                        mount_point: Some(PathBuf::from(SYSTEM_MNT)),
                        rw_volumes: default_rw_volumes(),
                        ..Default::default()
                    },
                ],
            }],
            boot_config: BootConfig {
                bootloader: BootloaderKind::Grub,
                kernel_cmdline: String::new(),
            },
            ..Default::default()
        }
    }

    /// Adds a vfat configuration partition right after the EFI partition.
    ///
    /// Sizes below the minimum are bumped to it.
    pub fn with_config_partition(mut self, size_mib: u64) -> Self {
        let partition = Partition {
            label: CONFIG_LABEL.to_string(),
            role: PartRole::Data,
            size: PartSize::MiB(size_mib.max(CONFIG_MIN_SIZE)),
            filesystem: Some(FileSystem::VFat),
            ..Default::default()
        };
        if let Some(disk) = self.disks.first_mut() {
            let index = disk
                .partitions
                .iter()
                .position(|p| p.role == PartRole::Efi)
                .map(|i| i + 1)
                .unwrap_or(0);
            disk.partitions.insert(index, partition);
        }
        self
    }

    /// Adds a partition to the disk at `disk_index`; out of range indexes
    /// are ignored with a warning.
    pub fn add_partition(&mut self, disk_index: usize, partition: Partition) {
        match self.disks.get_mut(disk_index) {
            Some(disk) => disk.partitions.push(partition),
            None => log::warn!("ignoring partition for out of range disk index {disk_index}"),
        }
    }

    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.disks.iter().flat_map(|d| d.partitions.iter())
    }

    pub fn partitions_mut(&mut self) -> impl Iterator<Item = &mut Partition> {
        self.disks.iter_mut().flat_map(|d| d.partitions.iter_mut())
    }

    pub fn get_system_partition(&self) -> Option<&Partition> {
        self.partitions().find(|p| p.role == PartRole::System)
    }

    pub fn get_efi_system_partition(&self) -> Option<&Partition> {
        self.partitions().find(|p| p.role == PartRole::Efi)
    }

    pub fn snapshotted_volumes(&self) -> impl Iterator<Item = &RWVolume> {
        self.partitions()
            .flat_map(|p| p.rw_volumes.iter())
            .filter(|v| v.snapshotted)
    }

    /// Checks the deployment invariants and fills role-derived defaults.
    pub fn sanitize(&mut self) -> Result<()> {
        if self.disks.is_empty() {
            bail!("deployment has no disks");
        }

        let mut efi = 0;
        let mut system = 0;
        let mut recovery = 0;

        for disk in &self.disks {
            if disk.device.as_os_str().is_empty() {
                bail!("disk device cannot be empty");
            }
            if let Some(size) = &disk.size {
                if !size.is_valid() {
                    bail!("invalid disk size '{size}'");
                }
            }
            for part in &disk.partitions {
                match part.role {
                    PartRole::Unset => bail!("partition '{}' has no role", part.label),
                    PartRole::Efi => efi += 1,
                    PartRole::System => system += 1,
                    PartRole::Recovery => recovery += 1,
                    PartRole::Data => {}
                }
            }
        }

        if efi == 0 {
            bail!("no 'efi' partition found");
        }
        if efi > 1 {
            bail!("multiple 'efi' partitions found");
        }
        if system == 0 {
            bail!("no 'system' partition found");
        }
        if system > 1 {
            bail!("multiple 'system' partitions found");
        }
        if recovery > 1 {
            bail!("multiple 'recovery' partitions found");
        }

        for disk in &self.disks {
            let last = disk.partitions.len().saturating_sub(1);
            for (index, part) in disk.partitions.iter().enumerate() {
                if part.size == PartSize::All && index != last {
                    bail!("only last partition can be set to use all available space");
                }
                if part.size == PartSize::Unset {
                    bail!("partition '{}' has no size", part.label);
                }
                if let Some(uuid) = &part.uuid {
                    uuid::Uuid::parse_str(uuid)
                        .with_context(|| format!("provided UUID '{uuid}' is not valid"))?;
                }
            }
        }

        for part in self.partitions_mut() {
            if part.label.is_empty() {
                part.label = part.role.default_label().to_string();
            }
            if part.filesystem.is_none() {
                part.filesystem = Some(part.fs());
            }
            if part.mount_point.is_none() {
                match part.role {
                    PartRole::Efi => part.mount_point = Some(PathBuf::from(EFI_MNT)),
                    PartRole::System => part.mount_point = Some(PathBuf::from(SYSTEM_MNT)),
                    _ => {}
                }
            }
            if !part.rw_volumes.is_empty() && part.fs() != FileSystem::Btrfs {
                log::warn!(
                    "dropping rw volumes of non btrfs partition '{}'",
                    part.label
                );
                part.rw_volumes.clear();
            }
        }

        self.sanitize_rw_volumes()?;

        if self.boot_config.bootloader == BootloaderKind::Unset {
            self.boot_config.bootloader = BootloaderKind::Grub;
        }

        Ok(())
    }

    fn sanitize_rw_volumes(&self) -> Result<()> {
        let mut paths: Vec<&Path> = Vec::new();
        for part in self.partitions() {
            for vol in &part.rw_volumes {
                if !vol.path.is_absolute() {
                    bail!("rw volume path must be absolute: '{}'", vol.path.display());
                }
                if vol.path == Path::new("/") {
                    bail!("root '/' cannot be a rw volume");
                }
                paths.push(&vol.path);
            }
        }
        paths.sort();
        for pair in paths.windows(2) {
            if pair[1] == pair[0] || pair[1].starts_with(pair[0]) {
                bail!(
                    "overlapping rw volume paths: '{}' and '{}'",
                    pair[0].display(),
                    pair[1].display()
                );
            }
        }
        Ok(())
    }

    /// Persists the deployment record into `root`.
    pub fn write_deployment_file(&self, root: &Path) -> Result<()> {
        let path = root.join(DEPLOYMENT_FILE);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating '{}'", parent.display()))?;
        }
        let content = serde_yaml::to_string(self).context("serializing deployment")?;
        std::fs::write(&path, content)
            .with_context(|| format!("writing deployment file '{}'", path.display()))?;
        Ok(())
    }

    /// Reads the deployment record persisted under `root`.
    ///
    /// A missing record degrades to a warning and an empty deployment;
    /// unknown fields are rejected.
    pub fn parse(root: &Path) -> Result<Deployment> {
        let path = root.join(DEPLOYMENT_FILE);
        if !path.exists() {
            log::warn!("deployment file not found at '{}'", path.display());
            return Ok(Deployment::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading deployment file '{}'", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("parsing deployment file '{}'", path.display()))
    }
}
