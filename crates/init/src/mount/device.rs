//! SCSI LUN -> device-node resolution, partition enumeration, filesystem
//! detection, and detach. Ports `main.cpp`'s `GetLunDeviceName`,
//! `ListDiskPartitions`, `GetDiskPartitionIndex`, `DetectFilesystem`, and
//! `DetachScsiDisk`.

use std::collections::BTreeSet;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::Duration;

use tokio::process::Command;

use crate::mount::mountinfo::MountEnum;
use crate::retry::{self, retry_with_timeout};

const SCSI_DEVICE_PREFIX: &str = "/sys/bus/scsi/devices/0:0:0:";
const DEVFS_PATH: &str = "/dev";

/// The step at which a mount/detach operation failed, reported back to the
/// host so it can tell the difference between "disk never showed up" and
/// "mount(2) itself failed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MountStep {
    FindDevice = 0,
    FindPartition = 1,
    DetectFilesystem = 2,
    Mount = 3,
    Unmount = 4,
    RemoveDirectory = 5,
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("failed at step {step:?}: {source}")]
    AtStep {
        step: MountStep,
        #[source]
        source: io::Error,
    },
}

impl DeviceError {
    pub fn step(&self) -> MountStep {
        let DeviceError::AtStep { step, .. } = self;
        *step
    }

    pub fn errno(&self) -> i32 {
        let DeviceError::AtStep { source, .. } = self;
        source.raw_os_error().unwrap_or(libc::EIO)
    }
}

fn at_step(step: MountStep, err: io::Error) -> DeviceError {
    DeviceError::AtStep { step, source: err }
}

/// Resolves a SCSI LUN to its kernel device short name (e.g. `sda`) by
/// retrying the sysfs "block" subdirectory listing until an entry appears.
/// Hot-add is asynchronous with respect to guest enumeration, hence the
/// retry loop rather than a single `readdir`.
pub async fn lun_device_name(lun: u32) -> Result<String, DeviceError> {
    let path = format!("{SCSI_DEVICE_PREFIX}{lun}/block");
    retry_with_timeout(
        || async {
            let mut entries = tokio::fs::read_dir(&path).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if !name.starts_with('.') {
                    return Ok(name.into_owned());
                }
            }

            Err(io::Error::from_raw_os_error(libc::ENXIO))
        },
        retry::DEFAULT_RETRY_PERIOD,
        retry::DEFAULT_RETRY_TIMEOUT,
        |e: &io::Error| retry::is_retryable_device_error(e.raw_os_error().unwrap_or(0)),
    )
    .await
    .map_err(|e| at_step(MountStep::FindDevice, e))
}

pub fn lun_device_path(device_name: &str) -> String {
    format!("{DEVFS_PATH}/{device_name}")
}

/// Reads the `partition` index file sysfs exposes for a partition device
/// directory, matching `GetDiskPartitionIndex`.
fn read_partition_index(disk_path: &str, partition_name: &str) -> io::Result<u64> {
    let path = format!("{disk_path}/{partition_name}/partition");
    std::fs::read_to_string(path)?
        .trim()
        .parse()
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

/// Enumerates the partitions of `device_name`, returning a map of partition
/// index -> kernel short name (e.g. `1 -> "sda1"`). If `wait_for_index` is
/// set, the whole enumeration is retried until that index appears (the
/// caller asked for a specific partition that may not have been scanned
/// yet) or the retry budget expires.
pub async fn list_disk_partitions(
    device_name: &str,
    wait_for_index: Option<u64>,
) -> Result<std::collections::BTreeMap<u64, String>, DeviceError> {
    let disk_path = format!("/sys/block/{device_name}");

    let enumerate = || async {
        let mut partitions = std::collections::BTreeMap::new();
        let mut entries = tokio::fs::read_dir(&disk_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }

            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(device_name) {
                continue;
            }

            if let Ok(index) = read_partition_index(&disk_path, &name) {
                partitions.insert(index, name.into_owned());
            }
        }

        match wait_for_index {
            Some(index) if !partitions.contains_key(&index) => {
                Err(io::Error::from_raw_os_error(libc::ENOENT))
            }
            _ => Ok(partitions),
        }
    };

    if wait_for_index.is_some() {
        retry_with_timeout(
            enumerate,
            retry::DEFAULT_RETRY_PERIOD,
            retry::DEFAULT_RETRY_TIMEOUT,
            |e: &io::Error| retry::is_retryable_device_error(e.raw_os_error().unwrap_or(0)),
        )
        .await
        .map_err(|e| at_step(MountStep::FindPartition, e))
    } else {
        enumerate().await.map_err(|e| at_step(MountStep::FindPartition, e))
    }
}

/// Runs the configured filesystem-probe binary (`blkid`) against a block
/// device and returns its detected type, retrying while the device node is
/// not yet openable (mirrors `DetectFilesystem`'s `RetryWithTimeout` on
/// `open()` before invoking the probe).
pub async fn detect_filesystem(block_device: &str) -> Result<String, DeviceError> {
    retry_with_timeout(
        || async {
            tokio::fs::File::open(block_device)
                .await
                .map(|_| ())
        },
        retry::DEFAULT_RETRY_PERIOD,
        retry::DEFAULT_RETRY_TIMEOUT,
        |e: &io::Error| retry::is_retryable_device_error(e.raw_os_error().unwrap_or(0)),
    )
    .await
    .map_err(|e| at_step(MountStep::DetectFilesystem, e))?;

    let output = Command::new("/usr/sbin/blkid")
        .args([block_device, "-p", "-s", "TYPE", "-o", "value", "-u", "filesystem"])
        .output()
        .await
        .map_err(|e| at_step(MountStep::DetectFilesystem, e))?;

    let detected = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if detected.is_empty() {
        return Err(at_step(
            MountStep::DetectFilesystem,
            io::Error::from_raw_os_error(libc::ENODATA),
        ));
    }

    tracing::info!(device = block_device, filesystem = %detected, "detected filesystem");
    Ok(detected)
}

fn block_device_number(path: &str) -> io::Result<u64> {
    Ok(std::fs::metadata(path)?.rdev())
}

/// Resolves the LUN's own device-number and the device-numbers of all of its
/// partitions, used by detach to find every `mountinfo` entry that needs
/// unmounting.
async fn device_numbers_for_lun(device_name: &str) -> Result<BTreeSet<u64>, DeviceError> {
    let mut numbers = BTreeSet::new();
    numbers.insert(
        block_device_number(&lun_device_path(device_name))
            .map_err(|e| at_step(MountStep::FindDevice, e))?,
    );

    for (_, partition) in list_disk_partitions(device_name, None).await? {
        let path = format!("{DEVFS_PATH}/{partition}");
        if let Ok(number) = block_device_number(&path) {
            numbers.insert(number);
        }
    }

    Ok(numbers)
}

/// Detaches the VHD at `lun`: unmounts every live mount whose device-number
/// belongs to it (best-effort), flushes the block device, then asks the
/// kernel to remove it via the sysfs `device/delete` node.
pub async fn detach_scsi_disk(lun: u32) -> Result<(), DeviceError> {
    let device_name = lun_device_name(lun).await?;

    if let Ok(numbers) = device_numbers_for_lun(&device_name).await {
        if let Ok(mounts) = MountEnum::new() {
            for entry in mounts {
                if numbers.contains(&entry.device) {
                    if let Err(e) = nix::mount::umount(Path::new(&entry.mount_point)) {
                        tracing::error!(
                            mount_point = entry.mount_point,
                            error = %e,
                            "failed to unmount during detach"
                        );
                    }
                }
            }
        }
    }

    let device_path = lun_device_path(&device_name);
    let block_device = std::fs::File::open(&device_path)
        .map_err(|e| at_step(MountStep::Unmount, e))?;

    // BLKFLSBUF: flush the block device's buffer cache before removal.
    const BLKFLSBUF: u64 = 0x1261;
    let result = unsafe {
        libc::ioctl(
            std::os::unix::io::AsRawFd::as_raw_fd(&block_device),
            BLKFLSBUF,
        )
    };
    if result < 0 {
        return Err(at_step(MountStep::Unmount, io::Error::last_os_error()));
    }

    drop(block_device);

    let delete_path = format!("/sys/block/{device_name}/device/delete");
    tokio::fs::write(&delete_path, b"1")
        .await
        .map_err(|e| at_step(MountStep::Unmount, e))
}

/// Lists every SCSI LUN with a hot-added disk, by scanning
/// `/sys/bus/scsi/devices` for the `0:0:0:<lun>` naming convention
/// (`ListScsiDisks`).
pub async fn list_scsi_disks() -> io::Result<Vec<u32>> {
    let mut disks = Vec::new();
    let mut entries = tokio::fs::read_dir("/sys/bus/scsi/devices").await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(lun) = name.strip_prefix("0:0:0:") {
            if let Ok(lun) = lun.parse() {
                disks.push(lun);
            }
        }
    }

    Ok(disks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_step_errno_comes_from_underlying_io_error() {
        let err = at_step(MountStep::FindDevice, io::Error::from_raw_os_error(libc::ENXIO));
        assert_eq!(err.errno(), libc::ENXIO);
        assert_eq!(err.step(), MountStep::FindDevice);
    }

    #[tokio::test]
    async fn list_disk_partitions_without_wait_returns_empty_map_for_missing_disk() {
        // A disk with no sysfs entry at all yields an io error, not a panic.
        let result = list_disk_partitions("nonexistent-disk-xyz", None).await;
        assert!(result.is_err());
    }
}
