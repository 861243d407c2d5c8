use std::path::{Path, PathBuf};

use anyhow::anyhow;
use elemental_hal::{CancelToken, FakeHal, MountOps, Operation};

use super::*;
use crate::deployment::Deployment;
use crate::fstab::FSTAB_FILE;

const SYSTEM_UUID: &str = "6ba7b810-9dad-11d1-80b4-00c04fd430c8";
const EFI_UUID: &str = "11111111-2222-4333-8444-555555555555";

/// Deployment with formatted partitions, as the provisioner leaves it.
fn provisioned_deployment(device: &str) -> Deployment {
    let mut d = Deployment::default_deployment();
    d.disks[0].device = PathBuf::from(device);
    d.sanitize().unwrap();
    d.disks[0].partitions[0].uuid = Some(EFI_UUID.to_string());
    d.disks[0].partitions[1].uuid = Some(SYSTEM_UUID.to_string());
    d
}

fn lsblk_json(mount: &Path) -> String {
    format!(
        r#"{{"blockdevices": [
            {{"path": "/dev/vda", "uuid": null, "mountpoints": [null], "children": [
                {{"path": "/dev/vda1", "uuid": "{EFI_UUID}", "mountpoints": [null]}},
                {{"path": "/dev/vda2", "uuid": "{SYSTEM_UUID}", "mountpoints": ["{}"]}}
            ]}}
        ]}}"#,
        mount.display()
    )
}

/// Lays out `<mount>/@/.snapshots` like a freshly provisioned partition.
fn fresh_layout() -> tempfile::TempDir {
    let mount = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(mount.path().join("@/.snapshots")).unwrap();
    mount
}

#[test]
fn install_transaction_starts_with_snapshot_one() {
    let mount = fresh_layout();
    let hal = FakeHal::new();
    hal.push_command_output("lsblk", &lsblk_json(mount.path()));

    let token = CancelToken::new();
    let mut engine = SnapperTransaction::new(&hal, token);
    let deployment = provisioned_deployment("/dev/vda");
    engine.init(&deployment).unwrap();
    // init is idempotent
    engine.init(&deployment).unwrap();

    let transaction = engine.start().unwrap();
    assert_eq!(transaction.id, FIRST_SNAPSHOT_ID);
    assert_eq!(transaction.status, TxStatus::Started);
    assert_eq!(
        transaction.path,
        mount.path().join("@/.snapshots/1/snapshot")
    );
    assert!(transaction.merges.is_empty());

    // The snapshots directory is bound into the new snapshot.
    assert!(hal
        .is_mounted(&transaction.path.join(SNAPSHOTS_PATH))
        .unwrap());
    // The snapshot subvolume was created.
    assert!(hal.has_operation(|op| matches!(
        op,
        Operation::Command { program, args }
            if program == "btrfs" && args.iter().any(|a| a == "create")
    )));
}

#[test]
fn kernel_cmdline_references_the_snapshot_subvolume() {
    let hal = FakeHal::new();
    let engine = SnapperTransaction::new(&hal, CancelToken::new());
    let transaction = Transaction {
        id: 4,
        path: PathBuf::from("/mnt/@/.snapshots/4/snapshot"),
        status: TxStatus::Started,
        merges: Default::default(),
    };
    assert_eq!(
        engine.generate_kernel_cmdline(&transaction),
        "rootfstype=btrfs rootflags=subvol=@/.snapshots/4/snapshot"
    );
}

#[test]
fn commit_sets_the_default_subvolume_and_unmounts() {
    let mount = fresh_layout();
    let hal = FakeHal::new();
    hal.push_command_output("lsblk", &lsblk_json(mount.path()));
    // btrfs conversation: get-default, create, list, set-default
    hal.push_command_output("btrfs", "");
    hal.push_command_output("btrfs", "");
    hal.push_command_output(
        "btrfs",
        "ID 256 gen 5 top level 5 path @\n\
         ID 260 gen 9 top level 256 path @/.snapshots/1/snapshot\n",
    );

    let mut engine = SnapperTransaction::new(&hal, CancelToken::new());
    engine.init(&provisioned_deployment("/dev/vda")).unwrap();
    let mut transaction = engine.start().unwrap();
    let bind = transaction.path.join(SNAPSHOTS_PATH);

    engine.commit(&mut transaction).unwrap();
    assert_eq!(transaction.status, TxStatus::Committed);
    assert!(!hal.is_mounted(&bind).unwrap());
    assert!(hal.has_operation(|op| matches!(
        op,
        Operation::Command { program, args }
            if program == "btrfs"
                && args.iter().any(|a| a == "set-default")
                && args.iter().any(|a| a == "260")
    )));
}

#[test]
fn rollback_deletes_the_snapshot_and_reports_the_cause() {
    let mount = fresh_layout();
    let hal = FakeHal::new();
    hal.push_command_output("lsblk", &lsblk_json(mount.path()));

    let mut engine = SnapperTransaction::new(&hal, CancelToken::new());
    engine.init(&provisioned_deployment("/dev/vda")).unwrap();
    let mut transaction = engine.start().unwrap();
    let snapshot_dir = mount.path().join("@/.snapshots/1");
    let bind = transaction.path.join(SNAPSHOTS_PATH);
    assert!(snapshot_dir.is_dir());

    let err = engine.rollback(&mut transaction, anyhow!("sync exploded"));
    assert_eq!(transaction.status, TxStatus::RolledBack);
    assert!(format!("{err:#}").contains("sync exploded"));

    // Snapshot gone, bind unmounted, nothing set as default.
    assert!(!snapshot_dir.exists());
    assert!(!hal.is_mounted(&bind).unwrap());
    assert!(hal.has_operation(|op| matches!(
        op,
        Operation::Command { program, args }
            if program == "btrfs" && args.iter().any(|a| a == "delete")
    )));
    assert!(!hal.has_operation(|op| matches!(
        op,
        Operation::Command { program, args }
            if program == "btrfs" && args.iter().any(|a| a == "set-default")
    )));
}

#[test]
fn upgrade_transaction_prepares_merges_from_the_active_snapshot() {
    let mount = fresh_layout();
    // Active snapshot 3 with a stock snapshot of /etc.
    let active = mount.path().join("@/.snapshots/3/snapshot");
    std::fs::create_dir_all(active.join("etc/.snapshots/1/snapshot")).unwrap();

    let hal = FakeHal::new();
    hal.push_command_output("lsblk", &lsblk_json(mount.path()));
    hal.push_command_output(
        "btrfs",
        "ID 259 gen 12 top level 256 path @/.snapshots/3/snapshot\n",
    );
    hal.push_command_output("snapper", "4\n"); // new root snapshot
    hal.push_command_output("snapper", "7\n"); // pre-upgrade state of /etc

    let mut engine = SnapperTransaction::new(&hal, CancelToken::new());
    engine.init(&provisioned_deployment("/dev/vda")).unwrap();
    let transaction = engine.start().unwrap();

    assert_eq!(transaction.id, 4);
    let merge = &transaction.merges[Path::new("/etc")];
    assert_eq!(merge.old, active.join("etc/.snapshots/1/snapshot"));
    assert_eq!(merge.modified, active.join("etc/.snapshots/7/snapshot"));
    assert!(merge.new.as_os_str().is_empty());

    // The update snapshot was created from the active one.
    let snapper_calls = hal
        .commands()
        .into_iter()
        .filter(|(p, _)| p == "snapper")
        .collect::<Vec<_>>();
    assert!(snapper_calls[0].1.contains(&"--from".to_string()));
    assert!(snapper_calls[0].1.contains(&"3".to_string()));
}

#[test]
fn helper_operations_require_a_started_transaction() {
    let hal = FakeHal::new();
    let mut engine = SnapperTransaction::new(&hal, CancelToken::new());
    let mut transaction = Transaction {
        id: 2,
        path: PathBuf::from("/mnt/@/.snapshots/2/snapshot"),
        status: TxStatus::Committed,
        merges: Default::default(),
    };
    let mut source = crate::deployment::ImageSource::dir("/fixtures");

    let err = engine
        .sync_image_content(&mut source, &transaction)
        .unwrap_err();
    assert!(err.to_string().contains("is not started"));
    let err = engine.merge(&mut transaction).unwrap_err();
    assert!(err.to_string().contains("is not started"));
    let err = engine.update_fstab(&transaction).unwrap_err();
    assert!(err.to_string().contains("is not started"));
    let err = engine.lock(&transaction).unwrap_err();
    assert!(err.to_string().contains("is not started"));
}

#[test]
fn cancelled_sync_rolls_the_transaction_back() {
    let mount = fresh_layout();
    let source_tree = tempfile::tempdir().unwrap();
    std::fs::write(source_tree.path().join("file"), "payload").unwrap();

    let hal = FakeHal::new();
    hal.push_command_output("lsblk", &lsblk_json(mount.path()));
    let token = CancelToken::new();
    hal.cancel_on_command("rsync", &token);

    let mut engine = SnapperTransaction::new(&hal, token);
    engine.init(&provisioned_deployment("/dev/vda")).unwrap();
    let mut transaction = engine.start().unwrap();

    let mut source = crate::deployment::ImageSource::dir(source_tree.path());
    let err = engine
        .sync_image_content(&mut source, &transaction)
        .unwrap_err();
    assert!(format!("{err:#}").contains("cancelled"));
    // The digest was never set.
    assert!(source.digest().is_none());

    let err = engine.rollback(&mut transaction, err);
    assert_eq!(transaction.status, TxStatus::RolledBack);
    assert!(format!("{err:#}").contains("cancelled"));
    assert!(!mount.path().join("@/.snapshots/1").exists());
}

#[test]
fn sync_excludes_differ_between_install_and_upgrade() {
    let hal = FakeHal::new();
    let mut engine = SnapperTransaction::new(&hal, CancelToken::new());
    engine.partitions = provisioned_deployment("/dev/vda")
        .partitions()
        .cloned()
        .collect();

    let install = engine.sync_excludes(true);
    // Install populates persistent paths: only the snapshots directories
    // are excluded.
    assert!(install.contains(&PathBuf::from("/.snapshots")));
    assert!(install.contains(&PathBuf::from("/etc/.snapshots")));
    assert!(!install.contains(&PathBuf::from("/var")));
    assert!(!install.contains(&PathBuf::from("/boot")));

    let upgrade = engine.sync_excludes(false);
    assert!(upgrade.contains(&PathBuf::from("/.snapshots")));
    assert!(upgrade.contains(&PathBuf::from("/etc/.snapshots")));
    // Non snapshotted volumes and foreign mount points keep their data.
    assert!(upgrade.contains(&PathBuf::from("/var")));
    assert!(upgrade.contains(&PathBuf::from("/home")));
    assert!(upgrade.contains(&PathBuf::from("/boot")));
    // The snapshotted volume itself is still synced.
    assert!(!upgrade.contains(&PathBuf::from("/etc")));

    let delete = engine.sync_delete_excludes();
    for path in ["/.snapshots", "/boot", "/etc", "/var", "/home", "/root", "/opt", "/srv"] {
        assert!(delete.contains(&PathBuf::from(path)), "{path} missing");
    }
}

#[test]
fn fstab_is_created_with_snapshot_references() {
    let snapshot = tempfile::tempdir().unwrap();
    let hal = FakeHal::new();
    let mut engine = SnapperTransaction::new(&hal, CancelToken::new());
    engine.partitions = provisioned_deployment("/dev/vda")
        .partitions()
        .cloned()
        .collect();

    let transaction = Transaction {
        id: 1,
        path: snapshot.path().to_path_buf(),
        status: TxStatus::Started,
        merges: Default::default(),
    };
    engine.update_fstab(&transaction).unwrap();

    let content = std::fs::read_to_string(snapshot.path().join(FSTAB_FILE)).unwrap();
    // System partition is mounted read-only and checked first.
    assert!(content.contains(&format!("UUID={SYSTEM_UUID} / btrfs ro 0 1")));
    // The EFI partition gets a second-pass check.
    assert!(content.contains(&format!("UUID={EFI_UUID} /boot vfat defaults 0 2")));
    // Snapshotted volume references the snapshot subvolume.
    assert!(content.contains("subvol=@/.snapshots/1/snapshot/etc"));
    // Non snapshotted volumes reference the shared subvolume.
    assert!(content.contains("subvol=@/var"));
    // The snapshots directory has its own mount line.
    assert!(content.contains(&format!(
        "UUID={SYSTEM_UUID} /.snapshots btrfs subvol=@/.snapshots 0 0"
    )));
}

#[test]
fn existing_fstab_is_updated_to_the_new_snapshot() {
    let snapshot = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(snapshot.path().join("etc")).unwrap();
    std::fs::write(
        snapshot.path().join(FSTAB_FILE),
        format!(
            "UUID={SYSTEM_UUID} / btrfs ro 0 1\n\
             UUID={SYSTEM_UUID} /etc btrfs subvol=@/.snapshots/3/snapshot/etc 0 0\n"
        ),
    )
    .unwrap();

    let hal = FakeHal::new();
    let mut engine = SnapperTransaction::new(&hal, CancelToken::new());
    engine.partitions = provisioned_deployment("/dev/vda")
        .partitions()
        .cloned()
        .collect();

    let transaction = Transaction {
        id: 4,
        path: snapshot.path().to_path_buf(),
        status: TxStatus::Started,
        merges: Default::default(),
    };
    engine.update_fstab(&transaction).unwrap();

    let content = std::fs::read_to_string(snapshot.path().join(FSTAB_FILE)).unwrap();
    assert!(content.contains("subvol=@/.snapshots/4/snapshot/etc"));
    assert!(!content.contains("subvol=@/.snapshots/3/snapshot/etc"));
    // Unrelated lines are preserved.
    assert!(content.contains(&format!("UUID={SYSTEM_UUID} / btrfs ro 0 1")));
}

#[test]
fn lock_marks_the_snapshot_read_only() {
    let hal = FakeHal::new();
    let engine = SnapperTransaction::new(&hal, CancelToken::new());
    let transaction = Transaction {
        id: 4,
        path: PathBuf::from("/mnt/@/.snapshots/4/snapshot"),
        status: TxStatus::Started,
        merges: Default::default(),
    };
    engine.lock(&transaction).unwrap();

    let (program, args) = &hal.commands()[0];
    assert_eq!(program, "snapper");
    assert!(args.contains(&"modify".to_string()));
    assert!(args.contains(&"--read-only".to_string()));
    assert!(args.contains(&"4".to_string()));
}
