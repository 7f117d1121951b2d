//! The first-process bring-up: the ordered sequence in spec.md §4.9, the
//! main dispatch loop that follows it, and the teardown path every exit
//! route funnels through. Ports `LSWInit.cpp`'s `LswEntryPoint` plus
//! `util.cpp`'s `InitializeLogging`.

use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use nix::mount::MsFlags;
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use shared::message::MessageType;
use shared::vm_config::GuestConfig;
use shared::Channel;
use tokio::io::unix::AsyncFd;
use tokio::sync::Mutex;

use crate::handlers::full;
use crate::{mount, network, retry};

/// Well-known vsock port the host always listens on for the primary
/// channel. Not part of the retrieved source (the header defining it was
/// filtered out of the pack); pinned here as an implementer decision, noted
/// in DESIGN.md.
const WELL_KNOWN_INIT_PORT: u32 = 0x3F3F;
const NOTIFICATION_PORT_OFFSET: u32 = 1;
const VMADDR_CID_HOST: u32 = 2;

const TARGET_NOFILE_SOFT: u64 = 1 << 20;
const TARGET_NOFILE_HARD: u64 = 1 << 20;
const TARGET_MEMLOCK: u64 = u64::MAX;

const CONSOLE_OPEN_RETRY_PERIOD: Duration = Duration::from_millis(100);
const CONSOLE_OPEN_RETRY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("fatal boot step failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("fatal boot step failed: {0}")]
    Nix(#[from] nix::Error),
    #[error("channel error during boot: {0}")]
    Channel(#[from] shared::ChannelError),
}

fn nix_to_io(err: nix::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error(err as i32)
}

/// Step 1: the three pseudo-filesystems every later step assumes exist.
fn mount_pseudo_filesystems() -> Result<(), BootError> {
    nix::mount::mount(
        Option::<&str>::None,
        "/dev",
        Some("devtmpfs"),
        MsFlags::empty(),
        Option::<&str>::None,
    )
    .map_err(nix_to_io)?;
    nix::mount::mount(
        Option::<&str>::None,
        "/proc",
        Some("proc"),
        MsFlags::empty(),
        Option::<&str>::None,
    )
    .map_err(nix_to_io)?;
    nix::mount::mount(
        Option::<&str>::None,
        "/sys",
        Some("sysfs"),
        MsFlags::empty(),
        Option::<&str>::None,
    )
    .map_err(nix_to_io)?;
    Ok(())
}

/// Step 2: open `/dev/kmsg`, ducking it off of fds 0-2 if something (a rare
/// race where the controlling tty was never attached) already claimed one of
/// them.
fn open_kmsg() -> Result<crate::util::KmsgWriter, BootError> {
    let writer = crate::util::KmsgWriter::open()?;
    Ok(writer)
}

/// Step 3: raise the open-file and memlock limits. Soft `NOFILE` is kept
/// well below `RLIM_INFINITY` because some user code iterates the entire
/// descriptor table up to the soft limit on startup.
fn raise_resource_limits() -> Result<(), BootError> {
    use nix::sys::resource::{Resource, setrlimit};
    setrlimit(Resource::RLIMIT_NOFILE, TARGET_NOFILE_SOFT, TARGET_NOFILE_HARD)?;
    setrlimit(Resource::RLIMIT_MEMLOCK, TARGET_MEMLOCK, TARGET_MEMLOCK)?;
    Ok(())
}

/// Step 4: crash-visibility sysctls.
fn configure_crash_visibility_sysctls() -> Result<(), BootError> {
    std::fs::write("/proc/sys/kernel/print-fatal-signals", "1")?;
    std::fs::write("/proc/sys/kernel/printk_devkmsg", "on")?;
    Ok(())
}

/// Step 5/6: open `/dev/console` (with retry) as the controlling tty,
/// falling back to redirecting stdout/stderr at the kmsg fd; then `/dev/null`
/// as stdin.
async fn attach_console(kmsg: &crate::util::KmsgWriter) -> Result<(), BootError> {
    let console = retry::retry_with_timeout(
        || async {
            tokio::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open("/dev/console")
                .await
        },
        CONSOLE_OPEN_RETRY_PERIOD,
        CONSOLE_OPEN_RETRY_TIMEOUT,
        |e: &std::io::Error| retry::is_retryable_device_error(e.raw_os_error().unwrap_or(0)),
    )
    .await;

    match console {
        Ok(file) => {
            let fd = file.into_std().await;
            dup2_onto(fd.as_raw_fd(), 0)?;
            dup2_onto(fd.as_raw_fd(), 1)?;
            dup2_onto(fd.as_raw_fd(), 2)?;
            nix::unistd::setsid().ok();
            if unsafe { libc::ioctl(0, libc::TIOCSCTTY, 0) } < 0 {
                tracing::warn!(
                    error = %std::io::Error::last_os_error(),
                    "failed to make /dev/console the controlling tty"
                );
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "no /dev/console, redirecting stdio to kmsg");
            let fd = kmsg.as_raw_fd();
            dup2_onto(fd, 1)?;
            dup2_onto(fd, 2)?;
        }
    }

    let devnull = std::fs::File::open("/dev/null")?;
    dup2_onto(devnull.as_raw_fd(), 0)?;
    Ok(())
}

fn dup2_onto(source: RawFd, target: RawFd) -> std::io::Result<()> {
    if unsafe { libc::dup2(source, target) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Step 7: connect the primary channel and announce guest capabilities.
async fn connect_primary_channel() -> Result<Arc<Channel>, BootError> {
    let addr = tokio_vsock::VsockAddr::new(VMADDR_CID_HOST, WELL_KNOWN_INIT_PORT);
    let stream = tokio_vsock::VsockStream::connect(addr).await?;
    let channel = Arc::new(Channel::new(stream, "Primary"));

    let release = kernel_release();
    let seccomp_available = probe_seccomp_available();
    channel
        .send_frame(shared::messages::GuestCapabilitiesMessage::build(
            &release,
            seccomp_available,
        ))
        .await?;

    Ok(channel)
}

fn kernel_release() -> String {
    nix::sys::utsname::uname()
        .map(|u| u.release().to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// A minimal probe: attempt a syscall that fails distinctly under
/// `seccomp(2)` filtering versus genuine unsupport. `prctl(PR_GET_SECCOMP)`
/// returning a valid mode (rather than `EINVAL`) is the original's signal.
fn probe_seccomp_available() -> bool {
    let result = unsafe { libc::prctl(libc::PR_GET_SECCOMP, 0, 0, 0, 0) };
    result >= 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::EINVAL)
}

/// Step 8: a second channel used only for out-of-band notifications
/// (currently just `ChildExit`).
async fn connect_notification_channel() -> Result<Arc<Channel>, BootError> {
    let addr = tokio_vsock::VsockAddr::new(
        VMADDR_CID_HOST,
        WELL_KNOWN_INIT_PORT + NOTIFICATION_PORT_OFFSET,
    );
    let stream = tokio_vsock::VsockStream::connect(addr).await?;
    let channel = Arc::new(Channel::new(stream, "Notification"));
    channel.ignore_sequence_numbers();
    Ok(channel)
}

/// Step 9: re-enter this binary on a core dump with a sentinel argv[0] so
/// the kernel's core-pattern pipe target is this same executable.
fn enable_crash_dump_collection() -> Result<(), BootError> {
    let self_path = std::env::current_exe()?;
    let pattern = format!("|{} --core-dump-handler %P", self_path.display());
    std::fs::write("/proc/sys/kernel/core_pattern", pattern)?;
    Ok(())
}

/// Step 10: block SIGCHLD and install a signalfd so the main loop can poll
/// it alongside the primary channel instead of handling it in an async
/// signal handler context.
fn install_sigchld_signalfd() -> Result<SignalFd, BootError> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.thread_block()?;
    Ok(SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK)?)
}

/// Runs the full boot sequence through to the main dispatch loop; the first
/// failure at any step is fatal, matching spec.md §4.9.
pub async fn run() -> Result<(), BootError> {
    mount_pseudo_filesystems()?;
    let kmsg = open_kmsg()?;
    install_kmsg_logging(kmsg.clone());

    raise_resource_limits()?;
    configure_crash_visibility_sysctls()?;
    attach_console(&kmsg).await?;

    network::apply_perf_tuning_early();

    let primary = connect_primary_channel().await?;
    let notifications = connect_notification_channel().await?;

    let config: full::SharedConfig = Arc::new(Mutex::new(GuestConfig::default()));

    let debug_log_payloads = config.lock().await.debug_log_payloads;
    primary.set_log_payloads(debug_log_payloads);
    notifications.set_log_payloads(debug_log_payloads);

    if config.lock().await.enable_crash_dump_collection {
        if let Err(e) = enable_crash_dump_collection() {
            tracing::warn!(error = %e, "failed to wire up crash dump collection");
        }
    }

    let signalfd = install_sigchld_signalfd()?;

    main_loop(primary, notifications, config, signalfd).await;
    teardown().await;
    Ok(())
}

fn install_kmsg_logging(kmsg: crate::util::KmsgWriter) {
    use tracing_subscriber::EnvFilter;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(kmsg)
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Polls the primary channel and the SIGCHLD signalfd together: a readable
/// channel dispatches one frame through the full-init handler table, a
/// readable signalfd drains and reaps in a tight loop, forwarding each
/// reaped pid to the host over the notification channel.
async fn main_loop(
    primary: Arc<Channel>,
    notifications: Arc<Channel>,
    config: full::SharedConfig,
    signalfd: SignalFd,
) {
    let async_signalfd = match AsyncFd::with_interest(signalfd, tokio::io::Interest::READABLE) {
        Ok(fd) => fd,
        Err(e) => {
            tracing::error!(error = %e, "failed to register signalfd with the async reactor");
            return;
        }
    };

    loop {
        tokio::select! {
            frame = primary.receive_or_closed(MessageType::Any) => {
                match frame {
                    Ok(Some(bytes)) => {
                        if let Err(e) = dispatch_one_full_frame(&primary, &config, bytes).await {
                            tracing::error!(error = %e, "full-init dispatch failed");
                        }
                    }
                    Ok(None) => {
                        tracing::info!("primary channel closed, tearing down");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "primary channel fatal error, tearing down");
                        break;
                    }
                }
            }

            guard = async_signalfd.readable() => {
                match guard {
                    Ok(mut guard) => {
                        drain_and_reap(guard.get_inner(), &notifications).await;
                        guard.clear_ready();
                    }
                    Err(e) => tracing::error!(error = %e, "signalfd poll failed"),
                }
            }
        }
    }
}

async fn dispatch_one_full_frame(
    channel: &Arc<Channel>,
    config: &full::SharedConfig,
    frame: Vec<u8>,
) -> Result<(), crate::dispatcher::DispatchError> {
    use shared::message::MessageHeader;

    let Some(header) = MessageHeader::from_bytes(&frame) else {
        return Ok(());
    };
    let Some(tag) = MessageType::from_u32(header.message_type) else {
        return Ok(());
    };
    if matches!(tag, MessageType::Teardown) {
        return Ok(());
    }

    crate::dispatcher::validate(full::TABLE, tag, frame.len())?;
    full::dispatch(config.clone(), channel.clone(), tag, frame).await
}

async fn drain_and_reap(signalfd: &SignalFd, notifications: &Arc<Channel>) {
    while signalfd.read_signal().ok().flatten().is_some() {
        loop {
            match nix::sys::wait::waitpid(
                nix::unistd::Pid::from_raw(-1),
                Some(nix::sys::wait::WaitPidFlag::WNOHANG),
            ) {
                Ok(nix::sys::wait::WaitStatus::StillAlive) => break,
                Ok(status) => {
                    if let Some(pid) = status.pid() {
                        let exit_code = match status {
                            nix::sys::wait::WaitStatus::Exited(_, code) => code,
                            nix::sys::wait::WaitStatus::Signaled(_, sig, _) => -(sig as i32),
                            _ => 0,
                        };

                        tracing::info!(pid = pid.as_raw(), exit_code, "reaped child");
                        let frame = shared::messages::ChildExitMessage::build(
                            pid.as_raw() as u32,
                            exit_code,
                        );
                        if let Err(e) = notifications.send_frame(frame).await {
                            tracing::warn!(error = %e, "failed to send child-exit notification");
                        }
                    }
                }
                Err(nix::Error::ECHILD) => break,
                Err(e) => {
                    tracing::error!(error = %e, "waitpid failed in signalfd reap loop");
                    break;
                }
            }
        }
    }
}

/// Teardown: reap every orphan, sync, detach every attached disk, power off.
/// Every exit route (clean channel close, fatal boot error once a channel
/// exists) funnels through this.
pub async fn teardown() {
    crate::lifecycle::reap_all_children();
    nix::unistd::sync();

    if let Ok(luns) = mount::device::list_scsi_disks().await {
        for lun in luns {
            if let Err(e) = mount::device::detach_scsi_disk(lun).await {
                tracing::warn!(lun, error = %e, "failed to detach disk during teardown");
            }
        }
    }

    if let Err(e) = nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_POWER_OFF) {
        tracing::error!(error = %e, "reboot(RB_POWER_OFF) failed");
    }
}
