//! Concrete payload types for each [`MessageType`](crate::message::MessageType)
//! tag the dispatcher understands. Fixed fields are read directly out of the
//! frame at known byte offsets (after the header); variable-length fields are
//! addressed by a `u32` offset field using
//! [`read_string_at`](crate::message::read_string_at) /
//! [`read_array_at`](crate::message::read_array_at).
//!
//! Field layouts follow `LSWInit.cpp`'s `LSW_*` message structs.

use crate::message::{MessageBuilder, MessageHeader, MessageType, read_array_at, read_string_at};

const H: usize = MessageHeader::SIZE;

fn u32_at(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn i32_at(buf: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

/// `LSW_GET_DISK` — resolve a SCSI LUN to a guest device path.
#[derive(Debug, Clone, Copy)]
pub struct GetDiskMessage {
    pub lun: u32,
}

impl GetDiskMessage {
    pub fn parse(buf: &[u8]) -> Self {
        Self {
            lun: u32_at(buf, H),
        }
    }
}

pub struct GetDiskResult;

impl GetDiskResult {
    pub fn build(result: i32, device_path: &str) -> Vec<u8> {
        let mut builder = MessageBuilder::new(MessageType::LswGetDiskResult, &[0u8; 8]);
        let offset = builder.write_string(device_path);
        let mut bytes = builder.finish();
        bytes[H..H + 4].copy_from_slice(&result.to_le_bytes());
        bytes[H + 4..H + 8].copy_from_slice(&offset.to_le_bytes());
        bytes
    }

    pub fn parse(buf: &[u8]) -> (i32, Option<String>) {
        let result = i32_at(buf, H);
        let offset = u32_at(buf, H + 4);
        (result, read_string_at(buf, offset))
    }
}

/// `LSW_MOUNT` — mount a filesystem, optionally `chroot`ing into it after.
#[derive(Debug, Clone)]
pub struct MountMessage {
    pub chroot: bool,
    pub source: Option<String>,
    pub target: Option<String>,
    pub fstype: Option<String>,
    pub options: Option<String>,
}

impl MountMessage {
    pub fn parse(buf: &[u8]) -> Self {
        let chroot = u32_at(buf, H) != 0;
        let source_index = u32_at(buf, H + 4);
        let target_index = u32_at(buf, H + 8);
        let type_index = u32_at(buf, H + 12);
        let options_index = u32_at(buf, H + 16);
        Self {
            chroot,
            source: read_string_at(buf, source_index),
            target: read_string_at(buf, target_index),
            fstype: read_string_at(buf, type_index),
            options: read_string_at(buf, options_index),
        }
    }
}

/// `LSW_EXEC` — replace the current process image.
#[derive(Debug, Clone)]
pub struct ExecMessage {
    pub argv: Vec<String>,
    pub envp: Vec<String>,
}

impl ExecMessage {
    pub fn parse(buf: &[u8]) -> Self {
        let argv_index = u32_at(buf, H);
        let envp_index = u32_at(buf, H + 4);
        Self {
            argv: read_array_at(buf, argv_index),
            envp: read_array_at(buf, envp_index),
        }
    }
}

/// `LSW_FORK` — create a new listen socket and spawn a child session leader
/// bound to it, as a process, thread, or pty-attached session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkFlavor {
    Process,
    Thread,
    Pty,
}

#[derive(Debug, Clone, Copy)]
pub struct ForkMessage {
    pub flavor: ForkFlavor,
}

impl ForkMessage {
    pub fn parse(buf: &[u8]) -> Self {
        let flavor = match u32_at(buf, H) {
            1 => ForkFlavor::Thread,
            2 => ForkFlavor::Pty,
            _ => ForkFlavor::Process,
        };
        Self { flavor }
    }
}

pub struct ForkResult;

/// Sentinel pid reported for the thread fork flavor, since a cooperative
/// Tokio task has no pid of its own. See DESIGN.md Open Question 1.
pub const THREAD_FLAVOR_SENTINEL_PID: u32 = u32::MAX;

impl ForkResult {
    /// `tty_port` is 0 unless the fork flavor was pty-attached, in which case
    /// it names the ephemeral vsock port a dedicated relay task is accepting
    /// on to bridge the pty master, per spec.md §4.3's "the parent records
    /// the pty master as part of the response".
    pub fn build(port: u32, pid: u32, tty_port: u32) -> Vec<u8> {
        let builder = MessageBuilder::new(MessageType::LswForkResult, &[0u8; 12]);
        let mut bytes = builder.finish();
        bytes[H..H + 4].copy_from_slice(&port.to_le_bytes());
        bytes[H + 4..H + 8].copy_from_slice(&pid.to_le_bytes());
        bytes[H + 8..H + 12].copy_from_slice(&tty_port.to_le_bytes());
        bytes
    }

    pub fn parse(buf: &[u8]) -> (u32, u32, u32) {
        (u32_at(buf, H), u32_at(buf, H + 4), u32_at(buf, H + 8))
    }
}

/// `LSW_CONNECT` — open a fresh listen socket, report its port, then accept
/// and `dup2` the incoming connection onto a target fd.
#[derive(Debug, Clone, Copy)]
pub struct ConnectMessage {
    pub target_fd: i32,
}

impl ConnectMessage {
    pub fn parse(buf: &[u8]) -> Self {
        Self {
            target_fd: i32_at(buf, H),
        }
    }
}

/// `LSW_WAITPID` — wait for a child with a timeout.
#[derive(Debug, Clone, Copy)]
pub struct WaitPidMessage {
    pub pid: u32,
    pub timeout_ms: i32,
}

impl WaitPidMessage {
    pub fn parse(buf: &[u8]) -> Self {
        Self {
            pid: u32_at(buf, H),
            timeout_ms: i32_at(buf, H + 4),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running = 0,
    Exited = 1,
    Signaled = 2,
    Unknown = 3,
}

pub struct WaitPidResult;

impl WaitPidResult {
    pub fn build(state: ProcessState, code: i32, errno: i32) -> Vec<u8> {
        let builder = MessageBuilder::new(MessageType::LswWaitPidResult, &[0u8; 12]);
        let mut bytes = builder.finish();
        bytes[H..H + 4].copy_from_slice(&(state as u32).to_le_bytes());
        bytes[H + 4..H + 8].copy_from_slice(&code.to_le_bytes());
        bytes[H + 8..H + 12].copy_from_slice(&errno.to_le_bytes());
        bytes
    }

    pub fn parse(buf: &[u8]) -> (ProcessState, i32, i32) {
        let state = match u32_at(buf, H) {
            0 => ProcessState::Running,
            1 => ProcessState::Exited,
            2 => ProcessState::Signaled,
            _ => ProcessState::Unknown,
        };
        (state, i32_at(buf, H + 4), i32_at(buf, H + 8))
    }
}

/// `LSW_SIGNAL` — send a signal to a guest-local pid.
#[derive(Debug, Clone, Copy)]
pub struct SignalMessage {
    pub pid: u32,
    pub signal: i32,
}

impl SignalMessage {
    pub fn parse(buf: &[u8]) -> Self {
        Self {
            pid: u32_at(buf, H),
            signal: i32_at(buf, H + 4),
        }
    }
}

/// `EARLY_CONFIG` — sent by the host before any mount traffic, carrying just
/// enough to decide whether crash-dump collection gets wired up during boot.
#[derive(Debug, Clone, Copy)]
pub struct EarlyConfigMessage {
    pub enable_crash_dump_collection: bool,
}

impl EarlyConfigMessage {
    pub fn parse(buf: &[u8]) -> Self {
        Self {
            enable_crash_dump_collection: u32_at(buf, H) != 0,
        }
    }
}

/// `INITIAL_CONFIG` — sent once the guest is otherwise ready; carries the
/// remaining feature flags `GuestConfig` accumulates.
#[derive(Debug, Clone, Copy)]
pub struct InitialConfigMessage {
    pub enable_kernel_perf_tuning: bool,
    pub page_reporting_order: u8,
    pub reclaim_mode: u32,
}

impl InitialConfigMessage {
    pub fn parse(buf: &[u8]) -> Self {
        Self {
            enable_kernel_perf_tuning: u32_at(buf, H) != 0,
            page_reporting_order: u32_at(buf, H + 4).min(9) as u8,
            reclaim_mode: u32_at(buf, H + 8),
        }
    }
}

/// `MOUNT` — attach a SCSI LUN as a live filesystem, optionally through an
/// overlay, at a fixed partition index.
#[derive(Debug, Clone)]
pub struct FullMountMessage {
    pub lun: u32,
    pub read_only: bool,
    pub overlay: bool,
    pub partition_index: Option<u64>,
    pub target: Option<String>,
    pub fstype: Option<String>,
    pub options: Option<String>,
}

impl FullMountMessage {
    pub fn parse(buf: &[u8]) -> Self {
        let lun = u32_at(buf, H);
        let read_only = u32_at(buf, H + 4) != 0;
        let overlay = u32_at(buf, H + 8) != 0;
        let raw_index = i32_at(buf, H + 12);
        let target_index = u32_at(buf, H + 16);
        let fstype_index = u32_at(buf, H + 20);
        let options_index = u32_at(buf, H + 24);
        Self {
            lun,
            read_only,
            overlay,
            partition_index: if raw_index < 0 { None } else { Some(raw_index as u64) },
            target: read_string_at(buf, target_index),
            fstype: read_string_at(buf, fstype_index),
            options: read_string_at(buf, options_index),
        }
    }
}

pub struct MountStatusResult;

impl MountStatusResult {
    /// `step` is one of `crate::mount::MountStep`'s discriminants (owned by
    /// the `init` crate; this module only knows it is a `u32`).
    pub fn build(error: i32, step: u32) -> Vec<u8> {
        let builder = MessageBuilder::new(MessageType::MountStatus, &[0u8; 8]);
        let mut bytes = builder.finish();
        bytes[H..H + 4].copy_from_slice(&error.to_le_bytes());
        bytes[H + 4..H + 8].copy_from_slice(&step.to_le_bytes());
        bytes
    }

    pub fn parse(buf: &[u8]) -> (i32, u32) {
        (i32_at(buf, H), u32_at(buf, H + 4))
    }
}

/// `UNMOUNT` — unmount a single target path (no LUN resolution involved).
#[derive(Debug, Clone)]
pub struct UnmountMessage {
    pub target: Option<String>,
}

impl UnmountMessage {
    pub fn parse(buf: &[u8]) -> Self {
        Self {
            target: read_string_at(buf, u32_at(buf, H)),
        }
    }
}

/// `DETACH` — flush and remove the SCSI disk at `lun`.
#[derive(Debug, Clone, Copy)]
pub struct DetachMessage {
    pub lun: u32,
}

impl DetachMessage {
    pub fn parse(buf: &[u8]) -> Self {
        Self { lun: u32_at(buf, H) }
    }
}

/// `MOUNT_FOLDER` — a 9P-over-vsock shared-folder mount. `plan9_port` is a
/// vsock port the host already has a listener bound to; the guest connects
/// out to it and hands the resulting fd to the kernel's `9p` driver via
/// `trans=fd`.
#[derive(Debug, Clone)]
pub struct MountFolderMessage {
    pub plan9_port: u32,
    pub read_only: bool,
    pub target: Option<String>,
    pub aname: Option<String>,
}

impl MountFolderMessage {
    pub fn parse(buf: &[u8]) -> Self {
        Self {
            plan9_port: u32_at(buf, H),
            read_only: u32_at(buf, H + 4) != 0,
            target: read_string_at(buf, u32_at(buf, H + 8)),
            aname: read_string_at(buf, u32_at(buf, H + 12)),
        }
    }
}

/// `WAIT_FOR_PMEM_DEVICE` — block (with timeout) until `/dev/pmem<index>`
/// is openable, for callers staging a pmem-backed read-only layer.
#[derive(Debug, Clone, Copy)]
pub struct WaitForPmemMessage {
    pub device_index: u32,
    pub timeout_ms: i32,
}

impl WaitForPmemMessage {
    pub fn parse(buf: &[u8]) -> Self {
        Self {
            device_index: u32_at(buf, H),
            timeout_ms: i32_at(buf, H + 4),
        }
    }
}

/// `GUEST_CAPABILITIES` — sent once by the guest itself during boot, never
/// parsed back from a host frame in this process.
pub struct GuestCapabilitiesMessage;

impl GuestCapabilitiesMessage {
    pub fn build(kernel_release: &str, seccomp_available: bool) -> Vec<u8> {
        let mut builder = MessageBuilder::new(MessageType::GuestCapabilities, &[0u8; 8]);
        let offset = builder.write_string(kernel_release);
        let mut bytes = builder.finish();
        bytes[H..H + 4].copy_from_slice(&offset.to_le_bytes());
        bytes[H + 4..H + 8].copy_from_slice(&(seccomp_available as u32).to_le_bytes());
        bytes
    }
}

/// `CHILD_EXIT` — out-of-band notification sent on the secondary channel
/// each time the signalfd-driven reap loop collects an exited pid.
pub struct ChildExitMessage;

impl ChildExitMessage {
    pub fn build(pid: u32, exit_code: i32) -> Vec<u8> {
        let builder = MessageBuilder::new(MessageType::ChildExit, &[0u8; 8]);
        let mut bytes = builder.finish();
        bytes[H..H + 4].copy_from_slice(&pid.to_le_bytes());
        bytes[H + 4..H + 8].copy_from_slice(&exit_code.to_le_bytes());
        bytes
    }
}

/// `LAUNCH_INIT` — the terminal request: replace this process's image with
/// the real distribution init, optionally `chroot`ing first. The core does
/// not respond on success (the process image is gone); on failure it reports
/// an errno and the channel continues.
#[derive(Debug, Clone)]
pub struct LaunchProcessMessage {
    pub chroot_target: Option<String>,
    pub argv: Vec<String>,
    pub envp: Vec<String>,
}

impl LaunchProcessMessage {
    pub fn parse(buf: &[u8]) -> Self {
        Self {
            chroot_target: read_string_at(buf, u32_at(buf, H)),
            argv: read_array_at(buf, u32_at(buf, H + 4)),
            envp: read_array_at(buf, u32_at(buf, H + 8)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_disk_result_round_trips() {
        let bytes = GetDiskResult::build(0, "/dev/sdb");
        let (result, device) = GetDiskResult::parse(&bytes);
        assert_eq!(result, 0);
        assert_eq!(device.as_deref(), Some("/dev/sdb"));
    }

    #[test]
    fn fork_result_round_trips_sentinel_pid() {
        let bytes = ForkResult::build(5555, THREAD_FLAVOR_SENTINEL_PID, 0);
        let (port, pid, tty_port) = ForkResult::parse(&bytes);
        assert_eq!(port, 5555);
        assert_eq!(pid, u32::MAX);
        assert_eq!(tty_port, 0);
    }

    #[test]
    fn fork_result_round_trips_tty_port() {
        let bytes = ForkResult::build(5555, 42, 6001);
        let (_, _, tty_port) = ForkResult::parse(&bytes);
        assert_eq!(tty_port, 6001);
    }

    #[test]
    fn waitpid_result_round_trips_each_state() {
        for (state, code, errno) in [
            (ProcessState::Running, 0, 0),
            (ProcessState::Exited, 42, 0),
            (ProcessState::Signaled, 9, 0),
            (ProcessState::Unknown, 0, libc::ESRCH),
        ] {
            let bytes = WaitPidResult::build(state, code, errno);
            let (parsed_state, parsed_code, parsed_errno) = WaitPidResult::parse(&bytes);
            assert_eq!(parsed_state, state);
            assert_eq!(parsed_code, code);
            assert_eq!(parsed_errno, errno);
        }
    }

    #[test]
    fn mount_status_result_round_trips() {
        let bytes = MountStatusResult::build(-libc::ENXIO, 0);
        let (error, step) = MountStatusResult::parse(&bytes);
        assert_eq!(error, -libc::ENXIO);
        assert_eq!(step, 0);
    }

    #[test]
    fn full_mount_message_reads_absent_partition_index_as_none() {
        let mut buf = vec![0u8; H + 28];
        buf[H + 12..H + 16].copy_from_slice(&(-1i32).to_le_bytes());
        let message = FullMountMessage::parse(&buf);
        assert_eq!(message.partition_index, None);
    }

    #[test]
    fn full_mount_message_reads_present_partition_index() {
        let mut buf = vec![0u8; H + 28];
        buf[H + 12..H + 16].copy_from_slice(&2i32.to_le_bytes());
        let message = FullMountMessage::parse(&buf);
        assert_eq!(message.partition_index, Some(2));
    }

    #[test]
    fn guest_capabilities_message_embeds_kernel_release_string() {
        let bytes = GuestCapabilitiesMessage::build("6.6.87.0-microsoft-standard-WSL2", true);
        let offset = u32_at(&bytes, H);
        assert_eq!(
            read_string_at(&bytes, offset).as_deref(),
            Some("6.6.87.0-microsoft-standard-WSL2")
        );
    }
}
