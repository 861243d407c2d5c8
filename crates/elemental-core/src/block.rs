//! Block device discovery via `lsblk`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use elemental_hal::{CancelToken, CommandOptions, ProcessOps};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct LsblkReport {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    path: String,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    mountpoints: Vec<Option<String>>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    pub path: PathBuf,
    pub mount_points: Vec<PathBuf>,
}

fn opts() -> CommandOptions {
    CommandOptions::with_timeout(Duration::from_secs(30))
}

fn find_by_uuid(devices: &[LsblkDevice], uuid: &str) -> Option<BlockDevice> {
    for device in devices {
        if device.uuid.as_deref() == Some(uuid) {
            return Some(BlockDevice {
                path: PathBuf::from(&device.path),
                mount_points: device
                    .mountpoints
                    .iter()
                    .flatten()
                    .map(PathBuf::from)
                    .collect(),
            });
        }
        if let Some(found) = find_by_uuid(&device.children, uuid) {
            return Some(found);
        }
    }
    None
}

/// Looks up a block device by filesystem UUID.
pub fn get_device_by_uuid(
    hal: &dyn ProcessOps,
    token: &CancelToken,
    uuid: &str,
) -> Result<Option<BlockDevice>> {
    let output = hal
        .command_output(
            token,
            "lsblk",
            &["--json", "-o", "PATH,UUID,MOUNTPOINTS"],
            &opts(),
        )
        .context("listing block devices")?;
    let report: LsblkReport =
        serde_json::from_slice(&output.stdout).context("parsing lsblk output")?;
    Ok(find_by_uuid(&report.blockdevices, uuid))
}

/// Waits for the device node carrying the given filesystem UUID to appear.
///
/// The node may not exist immediately after mkfs, so the lookup retries a
/// bounded number of times with a short pause.
pub fn wait_device_by_uuid(
    hal: &dyn ProcessOps,
    token: &CancelToken,
    uuid: &str,
    attempts: u32,
) -> Result<BlockDevice> {
    for attempt in 0..attempts {
        token.err_if_cancelled()?;
        if let Some(device) = get_device_by_uuid(hal, token, uuid)? {
            return Ok(device);
        }
        log::debug!("device with UUID {uuid} not present yet (attempt {})", attempt + 1);
        std::thread::sleep(Duration::from_secs(1));
    }
    bail!("no device with UUID {uuid} found after {attempts} attempts");
}

#[cfg(test)]
mod tests {
    use elemental_hal::FakeHal;

    use super::*;

    const LSBLK_JSON: &str = r#"{
        "blockdevices": [
            {
                "path": "/dev/vda",
                "uuid": null,
                "mountpoints": [null],
                "children": [
                    {"path": "/dev/vda1", "uuid": "AAAA-BBBB", "mountpoints": [null]},
                    {"path": "/dev/vda2", "uuid": "0123ab", "mountpoints": ["/mnt", null]}
                ]
            }
        ]
    }"#;

    #[test]
    fn finds_nested_device_by_uuid() {
        let hal = FakeHal::new();
        hal.push_command_output("lsblk", LSBLK_JSON);
        let device = get_device_by_uuid(&hal, &CancelToken::new(), "0123ab")
            .unwrap()
            .unwrap();
        assert_eq!(device.path, PathBuf::from("/dev/vda2"));
        assert_eq!(device.mount_points, vec![PathBuf::from("/mnt")]);
    }

    #[test]
    fn missing_uuid_yields_none() {
        let hal = FakeHal::new();
        hal.push_command_output("lsblk", LSBLK_JSON);
        assert!(get_device_by_uuid(&hal, &CancelToken::new(), "nope")
            .unwrap()
            .is_none());
    }

    #[test]
    fn wait_retries_until_the_device_appears() {
        let hal = FakeHal::new();
        hal.push_command_output("lsblk", r#"{"blockdevices": []}"#);
        hal.push_command_output("lsblk", LSBLK_JSON);
        let device = wait_device_by_uuid(&hal, &CancelToken::new(), "AAAA-BBBB", 3).unwrap();
        assert_eq!(device.path, PathBuf::from("/dev/vda1"));
        assert_eq!(hal.commands().len(), 2);
    }

    #[test]
    fn wait_gives_up_after_the_attempt_budget() {
        let hal = FakeHal::new();
        let err = wait_device_by_uuid(&hal, &CancelToken::new(), "nope", 2).unwrap_err();
        assert!(err.to_string().contains("after 2 attempts"));
    }
}
