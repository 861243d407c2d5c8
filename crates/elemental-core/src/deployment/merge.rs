//! Structural merge of a partial deployment override onto a base.
//!
//! Scalars override when the source carries a non-zero value. Disks are
//! merged by index with extra source disks appended. Partitions are merged
//! by label: labels present in the base keep their original positions,
//! unlabeled source partitions are appended first, then source partitions
//! whose label is unknown to the base, in source order. Duplicate source
//! labels collapse to the last occurrence. All other sequences are replaced
//! wholesale.

use std::collections::HashMap;

use super::{
    BootloaderKind, Deployment, Disk, PartRole, PartSize, Partition,
};

impl Deployment {
    /// Applies non-zero fields of `src` onto `self`.
    pub fn merge(&mut self, src: Deployment) {
        merge_disks(&mut self.disks, src.disks);
        if !src.source_os.is_empty() {
            self.source_os = src.source_os;
        }
        if src.overlay_tree.is_some() {
            self.overlay_tree = src.overlay_tree;
        }
        if src.cfg_script.is_some() {
            self.cfg_script = src.cfg_script;
        }
        if src.boot_config.bootloader != BootloaderKind::Unset {
            self.boot_config.bootloader = src.boot_config.bootloader;
        }
        if !src.boot_config.kernel_cmdline.is_empty() {
            self.boot_config.kernel_cmdline = src.boot_config.kernel_cmdline;
        }
        self.snapshotter = src.snapshotter;
        if src.firmware.is_some() {
            self.firmware = src.firmware;
        }
    }
}

/// Disks merge by index; extra source disks are appended.
fn merge_disks(dst: &mut Vec<Disk>, src: Vec<Disk>) {
    if src.is_empty() {
        return;
    }
    let mut src = src.into_iter();
    for disk in dst.iter_mut() {
        match src.next() {
            Some(overlay) => merge_disk(disk, overlay),
            None => break,
        }
    }
    dst.extend(src);
}

fn merge_disk(dst: &mut Disk, src: Disk) {
    if !src.device.as_os_str().is_empty() {
        dst.device = src.device;
    }
    if src.size.is_some() {
        dst.size = src.size;
    }
    if src.start_sector.is_some() {
        dst.start_sector = src.start_sector;
    }
    merge_partitions(&mut dst.partitions, src.partitions);
}

/// Partitions merge by label.
fn merge_partitions(dst: &mut Vec<Partition>, src: Vec<Partition>) {
    if src.is_empty() {
        return;
    }

    let mut unlabeled: Vec<Partition> = Vec::new();
    let mut order: Vec<String> = Vec::new();
    let mut keyed: HashMap<String, Partition> = HashMap::new();
    for part in src {
        if part.label.is_empty() {
            unlabeled.push(part);
            continue;
        }
        if !keyed.contains_key(&part.label) {
            order.push(part.label.clone());
        }
        // Last duplicate of a label wins.
        keyed.insert(part.label.clone(), part);
    }

    for part in dst.iter_mut() {
        if let Some(overlay) = keyed.remove(&part.label) {
            merge_partition(part, overlay);
        }
    }

    dst.extend(unlabeled);
    for label in order {
        if let Some(part) = keyed.remove(&label) {
            dst.push(part);
        }
    }
}

fn merge_partition(dst: &mut Partition, src: Partition) {
    if src.role != PartRole::Unset {
        dst.role = src.role;
    }
    if src.size != PartSize::Unset {
        dst.size = src.size;
    }
    if src.filesystem.is_some() {
        dst.filesystem = src.filesystem;
    }
    if src.mount_point.is_some() {
        dst.mount_point = src.mount_point;
    }
    if !src.mount_opts.is_empty() {
        dst.mount_opts = src.mount_opts;
    }
    if src.uuid.is_some() {
        dst.uuid = src.uuid;
    }
    if src.hidden {
        dst.hidden = true;
    }
    if !src.rw_volumes.is_empty() {
        dst.rw_volumes = src.rw_volumes;
    }
}
