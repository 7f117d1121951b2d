//! Handlers for the full-init personality's host-facing message set: mount
//! staging (with overlay), unmount, detach, plan-9 shared folders, pmem
//! wait, and the terminal "launch the real distribution init" request.
//! Grounded on `main.cpp`'s mount/detach routines and `LSWInit.cpp`'s
//! `LSW_MOUNT` overlay/chroot handling, generalized to the richer
//! `MOUNT`/`UNMOUNT`/`DETACH` tag set spec.md §6 names for the full
//! personality.

use std::io;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use shared::message::{MessageHeader, MessageType};
use shared::messages::{
    DetachMessage, EarlyConfigMessage, FullMountMessage, InitialConfigMessage,
    LaunchProcessMessage, MountFolderMessage, MountStatusResult, UnmountMessage,
    WaitForPmemMessage,
};
use shared::vm_config::GuestConfig;
use shared::Channel;
use tokio::sync::Mutex;

use crate::dispatcher::{DispatchError, HandlerEntry};
use crate::mount::{device, flags, overlay, MountStep};
use crate::reclaim::{self, ReclaimConfig, ReclaimMode};
use crate::retry::{self, retry_with_timeout};

pub const TABLE: &[HandlerEntry] = &[
    HandlerEntry {
        message_type: MessageType::EarlyConfig,
        min_payload: MessageHeader::SIZE + 4,
    },
    HandlerEntry {
        message_type: MessageType::InitialConfig,
        min_payload: MessageHeader::SIZE + 12,
    },
    HandlerEntry {
        message_type: MessageType::Mount,
        min_payload: MessageHeader::SIZE + 28,
    },
    HandlerEntry {
        message_type: MessageType::Unmount,
        min_payload: MessageHeader::SIZE + 4,
    },
    HandlerEntry {
        message_type: MessageType::Detach,
        min_payload: MessageHeader::SIZE + 4,
    },
    HandlerEntry {
        message_type: MessageType::MountFolder,
        min_payload: MessageHeader::SIZE + 16,
    },
    HandlerEntry {
        message_type: MessageType::WaitForPmemDevice,
        min_payload: MessageHeader::SIZE + 8,
    },
    HandlerEntry {
        message_type: MessageType::LaunchProcess,
        min_payload: MessageHeader::SIZE + 12,
    },
];

/// Shared, mutable accumulation point for the two config messages; `Arc`'d
/// into the dispatch closure so both handlers (and boot-time crash-dump
/// wiring) see the same value.
pub type SharedConfig = Arc<Mutex<GuestConfig>>;

pub async fn dispatch(
    config: SharedConfig,
    channel: Arc<Channel>,
    tag: MessageType,
    frame: Vec<u8>,
) -> Result<(), DispatchError> {
    match tag {
        MessageType::EarlyConfig => handle_early_config(&config, &frame).await,
        MessageType::InitialConfig => handle_initial_config(&config, &frame).await,
        MessageType::Mount => handle_mount(&channel, &frame).await,
        MessageType::Unmount => handle_unmount(&channel, &frame).await,
        MessageType::Detach => handle_detach(&channel, &frame).await,
        MessageType::MountFolder => handle_mount_folder(&channel, &frame).await,
        MessageType::WaitForPmemDevice => handle_wait_for_pmem(&channel, &frame).await,
        MessageType::LaunchProcess => handle_launch_process(&frame).await,
        _ => Ok(()),
    }
}

async fn handle_early_config(config: &SharedConfig, frame: &[u8]) -> Result<(), DispatchError> {
    let message = EarlyConfigMessage::parse(frame);
    config
        .lock()
        .await
        .apply_early_config(message.enable_crash_dump_collection);
    Ok(())
}

async fn handle_initial_config(config: &SharedConfig, frame: &[u8]) -> Result<(), DispatchError> {
    let message = InitialConfigMessage::parse(frame);
    let mut guard = config.lock().await;
    guard.apply_initial_config(
        message.enable_kernel_perf_tuning,
        message.page_reporting_order,
        message.reclaim_mode == 2,
    );

    let mode = match message.reclaim_mode {
        1 => ReclaimMode::DropCache,
        2 => ReclaimMode::Gradual,
        _ => ReclaimMode::Disabled,
    };
    reclaim::configure(ReclaimConfig::new(
        message.page_reporting_order as i32,
        mode,
    ));

    crate::network::apply_perf_tuning_late(&*guard);
    drop(guard);

    if let Err(e) = crate::network::enable_loopback() {
        tracing::warn!(error = %e, "failed to bring up the loopback interface");
    }
    if let Err(e) = crate::network::mount_cross_distro_share().await {
        tracing::warn!(error = %e, "failed to create the cross-distribution share");
    }
    if let Err(e) = crate::network::symlink_resolv_conf() {
        tracing::warn!(error = %e, "failed to symlink /etc/resolv.conf");
    }
    if let Err(e) = crate::network::register_binfmt_interop().await {
        tracing::warn!(error = %e, "failed to register the interop binfmt_misc entry");
    }

    Ok(())
}

async fn handle_mount(channel: &Arc<Channel>, frame: &[u8]) -> Result<(), DispatchError> {
    let message = FullMountMessage::parse(frame);
    let (error, step) = match mount_impl(&message).await {
        Ok(()) => (0, MountStep::Mount),
        Err(e) => (-e.errno(), e.step()),
    };

    channel
        .send_frame(MountStatusResult::build(error, step as u32))
        .await?;
    Ok(())
}

async fn mount_impl(message: &FullMountMessage) -> Result<(), device::DeviceError> {
    let device_name = device::lun_device_name(message.lun).await?;

    let (block_device, whole_disk_target) = match message.partition_index {
        Some(index) => {
            let partitions = device::list_disk_partitions(&device_name, Some(index)).await?;
            let name = partitions
                .get(&index)
                .cloned()
                .unwrap_or_else(|| device_name.clone());
            (device::lun_device_path(&name), false)
        }
        None => (device::lun_device_path(&device_name), true),
    };
    let _ = whole_disk_target;

    let fstype = match &message.fstype {
        Some(t) => t.clone(),
        None => device::detect_filesystem(&block_device).await?,
    };

    let parsed = message
        .options
        .as_deref()
        .map(flags::parse_flags)
        .unwrap_or_default();

    let mut mount_flags = parsed.mount_flags;
    if message.read_only {
        mount_flags.insert(nix::mount::MsFlags::MS_RDONLY);
    }

    let target = message.target.as_deref().unwrap_or("");
    crate::util::mkdir_p(target).map_err(|e| device_error(MountStep::Mount, e))?;

    if message.overlay {
        overlay::mount_overlay(target, &block_device, mount_flags, &parsed.string_options)
            .await
            .map_err(|e| device_error(MountStep::Mount, e))?;

        // `FullMountMessage` carries no chroot option (only the thin
        // personality's `LSW_MOUNT` does), so this overlay is always the
        // "otherwise" case of spec.md §4.4's overlay construction: moved
        // onto its real target with the scratch tree removed, never kept
        // as a new root.
        if let Err(e) = overlay::cleanup_overlay_scratch(target).await {
            tracing::warn!(target, error = %e, "failed to remove overlay scratch tree");
        }
    } else {
        crate::util::mount_with_nofail(
            Some(block_device.as_str()),
            target,
            Some(fstype.as_str()),
            mount_flags,
            if parsed.string_options.is_empty() {
                None
            } else {
                Some(parsed.string_options.as_str())
            },
            parsed.no_fail,
        )
        .map_err(|e| device_error(MountStep::Mount, e))?;
    }

    Ok(())
}

fn device_error(step: MountStep, err: io::Error) -> device::DeviceError {
    // Mount/overlay failures raised outside `device.rs` are folded into the
    // same `DeviceError` shape so the `MountStatus` response path stays
    // uniform regardless of which step produced the failure.
    device::DeviceError::AtStep { step, source: err }
}

async fn handle_unmount(channel: &Arc<Channel>, frame: &[u8]) -> Result<(), DispatchError> {
    let message = UnmountMessage::parse(frame);
    let (error, step) = match unmount_impl(&message).await {
        Ok(()) => (0, MountStep::RemoveDirectory),
        Err(e) => (-e.errno(), e.step()),
    };

    channel
        .send_frame(MountStatusResult::build(error, step as u32))
        .await?;
    Ok(())
}

async fn unmount_impl(message: &UnmountMessage) -> Result<(), device::DeviceError> {
    let Some(target) = &message.target else {
        return Err(device_error(
            MountStep::Unmount,
            io::Error::from_raw_os_error(libc::EINVAL),
        ));
    };

    nix::mount::umount(target.as_str())
        .map_err(|e| device_error(MountStep::Unmount, io::Error::from_raw_os_error(e as i32)))?;

    tokio::fs::remove_dir(target)
        .await
        .map_err(|e| device_error(MountStep::RemoveDirectory, e))
}

async fn handle_detach(channel: &Arc<Channel>, frame: &[u8]) -> Result<(), DispatchError> {
    let message = DetachMessage::parse(frame);
    let (error, step) = match device::detach_scsi_disk(message.lun).await {
        Ok(()) => (0, MountStep::Unmount),
        Err(e) => (-e.errno(), e.step()),
    };

    channel
        .send_frame(MountStatusResult::build(error, step as u32))
        .await?;
    Ok(())
}

/// Connects out to the host's already-listening plan-9 vsock port and hands
/// the fd straight to the kernel's `9p` driver via `trans=fd`, matching how
/// the original wires a shared folder without a userspace 9p client.
async fn handle_mount_folder(channel: &Arc<Channel>, frame: &[u8]) -> Result<(), DispatchError> {
    let message = MountFolderMessage::parse(frame);
    let errno = match mount_folder_impl(&message).await {
        Ok(()) => 0,
        Err(e) => e.raw_os_error().unwrap_or(libc::EIO),
    };

    channel.send_result(-errno).await?;
    Ok(())
}

/// `linux/vm_sockets.h`'s well-known host CID; see `session.rs`'s identical
/// note on `VMADDR_CID_ANY` about why this is pinned locally.
const VMADDR_CID_HOST: u32 = 2;

async fn mount_folder_impl(message: &MountFolderMessage) -> io::Result<()> {
    let addr = tokio_vsock::VsockAddr::new(VMADDR_CID_HOST, message.plan9_port);
    let stream = tokio_vsock::VsockStream::connect(addr).await?;
    let std_stream = stream.into_std()?;
    let fd = std_stream.as_raw_fd();
    // Leaked deliberately: the 9p driver keeps using this fd for the life of
    // the mount; closing it here would sever the transport out from under
    // the kernel.
    std::mem::forget(std_stream);

    let target = message.target.as_deref().unwrap_or("");
    crate::util::mkdir_p(target)?;

    let aname = message.aname.as_deref().unwrap_or("");
    let mut options = format!("trans=fd,rfdno={fd},wfdno={fd},aname={aname},version=9p2000.L");
    if message.read_only {
        options.push_str(",access=client");
    }

    nix::mount::mount(
        Option::<&str>::None,
        target,
        Some("9p"),
        if message.read_only {
            nix::mount::MsFlags::MS_RDONLY
        } else {
            nix::mount::MsFlags::empty()
        },
        Some(options.as_str()),
    )
    .map_err(|e| io::Error::from_raw_os_error(e as i32))
}

async fn handle_wait_for_pmem(channel: &Arc<Channel>, frame: &[u8]) -> Result<(), DispatchError> {
    let message = WaitForPmemMessage::parse(frame);
    let path = format!("/dev/pmem{}", message.device_index);
    let result = retry_with_timeout(
        || async { tokio::fs::File::open(&path).await.map(|_| ()) },
        retry::DEFAULT_RETRY_PERIOD,
        std::time::Duration::from_millis(message.timeout_ms.max(0) as u64),
        |e: &io::Error| retry::is_retryable_device_error(e.raw_os_error().unwrap_or(0)),
    )
    .await;

    let errno = match result {
        Ok(()) => 0,
        Err(e) => e.raw_os_error().unwrap_or(libc::EIO),
    };

    channel.send_result(-errno).await?;
    Ok(())
}

/// The terminal request: on success this never returns (the process image is
/// replaced), matching spec.md §1's "the core exits by exec'ing ... the real
/// distribution init and does not supervise it past that point."
async fn handle_launch_process(frame: &[u8]) -> Result<(), DispatchError> {
    let message = LaunchProcessMessage::parse(frame);
    if let Err(e) = launch_impl(&message) {
        tracing::error!(error = %e, "failed to launch distribution init");
    }
    Ok(())
}

fn launch_impl(message: &LaunchProcessMessage) -> io::Result<std::convert::Infallible> {
    if let Some(target) = &message.chroot_target {
        overlay::chroot_into(target)?;
    }

    let Some(executable) = message.argv.first() else {
        return Err(io::Error::from_raw_os_error(libc::EINVAL));
    };

    let executable_c = std::ffi::CString::new(executable.as_str())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    let argv = to_cstrings(&message.argv)?;
    let envp = to_cstrings(&message.envp)?;

    Err(io::Error::from_raw_os_error(
        nix::unistd::execve(&executable_c, &argv, &envp).unwrap_err() as i32,
    ))
}

fn to_cstrings(values: &[String]) -> io::Result<Vec<std::ffi::CString>> {
    values
        .iter()
        .map(|s| std::ffi::CString::new(s.as_str()).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_requires_full_fixed_mount_payload() {
        let entry = TABLE
            .iter()
            .find(|e| matches!(e.message_type, MessageType::Mount))
            .unwrap();
        assert_eq!(entry.min_payload, MessageHeader::SIZE + 28);
    }
}
