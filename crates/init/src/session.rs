//! Child-session fabric: the "fork" family of messages. Each request binds
//! a fresh ephemeral vsock listen socket, returns its port to the host, then
//! spawns a new unit of concurrency (OS process, cooperative task, or
//! pty-attached session leader) that accepts exactly one connection on that
//! port and recurses into the dispatcher. Grounded on `LSWInit.cpp` /
//! `WSLAInit.cpp`'s `HandleMessageImpl(..., const LSW_FORK&, ...)` /
//! `WSLA_FORK` handlers.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use nix::sys::termios::Termios;
use nix::unistd::ForkResult;
use shared::Channel;
use shared::messages::{ForkFlavor, THREAD_FLAVOR_SENTINEL_PID};

/// Vsock wildcard constants (`linux/vm_sockets.h`); not re-exported from a
/// crate in a way that is safe to assume, so pinned here directly.
const VMADDR_CID_ANY: u32 = 0xFFFF_FFFF;
const VMADDR_PORT_ANY: u32 = 0xFFFF_FFFF;

/// How long a forked child waits for the host to connect to the port it was
/// just handed. The original's `SESSION_LEADER_ACCEPT_TIMEOUT_MS` constant
/// lives in a header that was not part of the retrieved source; this value
/// is this implementation's own choice.
pub const ACCEPT_TIMEOUT_MS: i32 = 30_000;

/// Entry point a forked/spawned child runs once it has accepted its
/// sub-channel connection: build the appropriate dispatcher (full or thin
/// handler table) and run it to completion.
pub type ChildEntry = fn(Arc<Channel>) -> BoxFuture<'static, ()>;

#[derive(Debug, Clone, Copy)]
pub struct SessionResult {
    pub port: u32,
    pub pid: u32,
    pub pty_master_fd: Option<RawFd>,
    /// Ephemeral vsock port a relay task is accepting on to bridge
    /// `pty_master_fd`; `None` for the process/thread flavors.
    pub tty_port: Option<u32>,
}

fn nix_to_io(err: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

fn bind_ephemeral() -> io::Result<vsock::VsockListener> {
    let listener = vsock::VsockListener::bind_with_cid_port(VMADDR_CID_ANY, VMADDR_PORT_ANY)?;
    Ok(listener)
}

fn listener_port(listener: &vsock::VsockListener) -> io::Result<u32> {
    Ok(listener.local_addr()?.port())
}

/// Blocks (via `poll`) until `listener`'s fd is readable or the timeout
/// elapses, then accepts. Matches `UtilAcceptVsock`'s timeout handling.
fn accept_with_timeout(
    listener: &vsock::VsockListener,
    timeout_ms: i32,
) -> io::Result<vsock::VsockStream> {
    let mut fds = [libc::pollfd {
        fd: listener.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    }];

    let result = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout_ms) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }

    if result == 0 || fds[0].revents & libc::POLLIN == 0 {
        return Err(io::Error::from_raw_os_error(libc::ETIMEDOUT));
    }

    let (stream, _addr) = listener.accept()?;
    Ok(stream)
}

/// Runs after a successful `fork()`/`forkpty()`, entirely inside the child:
/// accept the one connection the host will make, build a fresh
/// single-threaded Tokio runtime (the parent's reactor is not valid here),
/// and dispatch. Never returns — the child always exits via
/// `std::process::exit`, matching "on any failure after the fork, the child
/// exits with a non-zero code".
fn run_child_after_fork(
    listener: vsock::VsockListener,
    original_channel: Option<Arc<Channel>>,
    child_entry: ChildEntry,
) -> ! {
    // The child's copy of the parent's original channel fd is closed here
    // (by dropping it) for process/pty flavors, matching the original's
    // `Channel.Close()` inside `childLogic`.
    drop(original_channel);

    let outcome = (|| -> io::Result<()> {
        let stream = accept_with_timeout(&listener, ACCEPT_TIMEOUT_MS)?;
        drop(listener);

        stream.set_nonblocking(true)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        runtime.block_on(async move {
            let async_stream = tokio_vsock::VsockStream::from_std(stream)?;
            let channel = Arc::new(Channel::new(async_stream, "ForkedChannel"));
            child_entry(channel).await;
            Ok::<(), io::Error>(())
        })
    })();

    match outcome {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!(error = %e, "forked session child failed");
            std::process::exit(1);
        }
    }
}

/// Spawns a process-flavor child session. The parent returns immediately
/// with the child's pid; the child never returns (see
/// [`run_child_after_fork`]).
fn spawn_process(
    listener: vsock::VsockListener,
    original_channel: Arc<Channel>,
    child_entry: ChildEntry,
) -> io::Result<u32> {
    // Safety: the child touches only async-signal-safe state (raw fds, a
    // fresh Tokio runtime built before any prior async machinery is used)
    // before calling `std::process::exit`.
    match unsafe { nix::unistd::fork() }.map_err(nix_to_io)? {
        ForkResult::Parent { child } => Ok(child.as_raw() as u32),
        ForkResult::Child => run_child_after_fork(listener, Some(original_channel), child_entry),
    }
}

/// Spawns a pty-flavor child session: sets the child-subreaper attribute on
/// the current process first (so grandchildren of the pty session reparent
/// here rather than escaping to real PID 1), then `forkpty`s a new session
/// leader attached to the pty.
fn spawn_pty(
    listener: vsock::VsockListener,
    original_channel: Arc<Channel>,
    child_entry: ChildEntry,
    columns: u16,
    rows: u16,
) -> io::Result<(u32, RawFd)> {
    nix::sys::prctl::set_child_subreaper(true).map_err(nix_to_io)?;

    let winsize = nix::pty::Winsize {
        ws_row: rows,
        ws_col: columns,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    // Safety: see `spawn_process`.
    let result = unsafe { nix::pty::forkpty(Some(&winsize), None::<&Termios>) }.map_err(nix_to_io)?;
    match result.fork_result {
        ForkResult::Parent { child } => {
            use std::os::fd::IntoRawFd;
            Ok((child.as_raw() as u32, result.master.into_raw_fd()))
        }
        ForkResult::Child => {
            // The pty-session child starts with a cleared signal mask and it
            // is not restored; see DESIGN.md Open Question 2.
            let _ = nix::sys::signal::sigprocmask(
                nix::sys::signal::SigmaskHow::SIG_SETMASK,
                Some(&nix::sys::signal::SigSet::empty()),
                None,
            );
            run_child_after_fork(listener, Some(original_channel), child_entry)
        }
    }
}

/// Handles a full "fork" request end-to-end: binds the listen socket,
/// reports the port back to the caller via `report_port` *before* any child
/// blocks in accept (the ordering guarantee spec.md §4.3 requires), then
/// spawns the requested flavor.
pub async fn fork_session<F, Fut>(
    flavor: ForkFlavor,
    original_channel: Arc<Channel>,
    child_entry: ChildEntry,
    tty_size: Option<(u16, u16)>,
    report_port: F,
) -> io::Result<SessionResult>
where
    F: FnOnce(u32) -> Fut,
    Fut: std::future::Future<Output = io::Result<()>>,
{
    let listener = bind_ephemeral()?;
    let port = listener_port(&listener)?;
    report_port(port).await?;

    match flavor {
        ForkFlavor::Thread => {
            let std_listener = listener;
            tokio::spawn(async move {
                let result: io::Result<()> = async {
                    std_listener.set_nonblocking(true)?;
                    let async_listener = tokio_vsock::VsockListener::from_std(std_listener)?;
                    let (stream, _addr) = tokio::time::timeout(
                        Duration::from_millis(ACCEPT_TIMEOUT_MS as u64),
                        async_listener.accept(),
                    )
                    .await
                    .map_err(|_| io::Error::from_raw_os_error(libc::ETIMEDOUT))??;

                    let channel = Arc::new(Channel::new(stream, "ForkedChannel"));
                    child_entry(channel).await;
                    Ok(())
                }
                .await;

                if let Err(e) = result {
                    tracing::error!(error = %e, "thread-flavor session failed");
                }
            });

            Ok(SessionResult {
                port,
                pid: THREAD_FLAVOR_SENTINEL_PID,
                pty_master_fd: None,
                tty_port: None,
            })
        }
        ForkFlavor::Process => {
            let pid = spawn_process(listener, original_channel, child_entry)?;
            Ok(SessionResult {
                port,
                pid,
                pty_master_fd: None,
                tty_port: None,
            })
        }
        ForkFlavor::Pty => {
            let (columns, rows) = tty_size.unwrap_or((80, 24));
            let (pid, master_fd) =
                spawn_pty(listener, original_channel, child_entry, columns, rows)?;
            let tty_port = spawn_tty_relay(master_fd).await?;
            Ok(SessionResult {
                port,
                pid,
                pty_master_fd: Some(master_fd),
                tty_port: Some(tty_port),
            })
        }
    }
}

/// Binds a second ephemeral vsock listener for the pty flavor's TTY data
/// stream (separate from the control channel the session leader's
/// dispatcher runs on), and spawns a task that accepts one connection and
/// bridges it to `master_fd` via [`crate::relay::tty::relay`]. Returns the
/// port the caller should report to the host.
async fn spawn_tty_relay(master_fd: RawFd) -> io::Result<u32> {
    use std::os::fd::FromRawFd;

    let listener = tokio_vsock::VsockListener::bind(tokio_vsock::VsockAddr::new(
        VMADDR_CID_ANY,
        VMADDR_PORT_ANY,
    ))?;
    let port = listener.local_addr()?.port();

    tokio::spawn(async move {
        let result: io::Result<()> = async {
            let (stream, _addr) = tokio::time::timeout(
                Duration::from_millis(ACCEPT_TIMEOUT_MS as u64),
                listener.accept(),
            )
            .await
            .map_err(|_| io::Error::from_raw_os_error(libc::ETIMEDOUT))??;

            let owned_master = unsafe { std::os::fd::OwnedFd::from_raw_fd(master_fd) };
            let pty_master = crate::relay::tty::PtyMaster::new(owned_master)?;
            let (read_half, write_half) = tokio::io::split(stream);
            crate::relay::tty::relay(read_half, write_half, pty_master).await
        }
        .await;

        if let Err(e) = result {
            tracing::error!(error = %e, "tty relay session failed");
        }
    });

    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vmaddr_wildcards_match_linux_vm_sockets_values() {
        assert_eq!(VMADDR_CID_ANY, 0xFFFF_FFFF);
        assert_eq!(VMADDR_PORT_ANY, 0xFFFF_FFFF);
    }
}
