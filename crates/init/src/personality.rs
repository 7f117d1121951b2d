//! Selects which of the two entry-point personalities this process binary
//! runs as: full init (PID 1, rich filesystem staging) or the thin
//! session-leader init (runs the reduced `LSW_*` handler set). Grounded on
//! `main.cpp`'s dispatch to `LswEntryPoint` when built as the thin init;
//! here both personalities are one binary, switched at runtime rather than
//! at link time, per SPEC_FULL.md §2.

use std::os::fd::{FromRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use shared::Channel;

const PERSONALITY_ENV: &str = "LINUX_INIT_PERSONALITY";
const SESSION_LEADER_SUFFIX: &str = "-session-leader";
const SESSION_FD_ENV: &str = "LINUX_INIT_SESSION_FD";
const SESSION_ACCEPT_TIMEOUT_MS: i32 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Personality {
    Full,
    SessionLeader,
}

/// Reads `argv[0]` and the environment to decide which personality to run,
/// matching the original's argv0-suffix convention for the thin-init build
/// (`LswEntryPoint` is only reached when the binary was built/invoked that
/// way) translated to a single-binary runtime switch.
pub fn detect(argv0: &str) -> Personality {
    if std::env::var(PERSONALITY_ENV).as_deref() == Ok("session-leader") {
        return Personality::SessionLeader;
    }

    if argv0.ends_with(SESSION_LEADER_SUFFIX) {
        return Personality::SessionLeader;
    }

    Personality::Full
}

/// Entry point for [`Personality::SessionLeader`]: accepts the single
/// connection expected on the listen socket this process inherited (its fd
/// number passed via `LINUX_INIT_SESSION_FD` by whatever forked and exec'd
/// this binary), then runs the thin handler table to completion. This is
/// the exec-based counterpart to `session.rs`'s in-process `child_entry`
/// path — used when a caller wants the session leader to be a fresh process
/// image rather than a forked copy of the full-init binary's own memory.
pub async fn run_session_leader() -> std::io::Result<()> {
    let fd = session_listen_fd()?;
    let stream = accept_one_with_timeout(fd, SESSION_ACCEPT_TIMEOUT_MS)?;
    stream.set_nonblocking(true)?;
    let async_stream = tokio_vsock::VsockStream::from_std(stream)?;
    let channel = Arc::new(Channel::new(async_stream, "SessionLeader"));

    crate::dispatcher::run(channel, crate::handlers::thin::TABLE, |channel, tag, frame| {
        Box::pin(crate::handlers::thin::dispatch(channel, tag, frame))
    })
    .await;

    Ok(())
}

fn session_listen_fd() -> std::io::Result<RawFd> {
    std::env::var(SESSION_FD_ENV)
        .ok()
        .and_then(|v| v.parse::<RawFd>().ok())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{SESSION_FD_ENV} not set for session-leader personality"),
            )
        })
}

fn accept_one_with_timeout(listen_fd: RawFd, timeout_ms: i32) -> std::io::Result<vsock::VsockStream> {
    let mut fds = [libc::pollfd {
        fd: listen_fd,
        events: libc::POLLIN,
        revents: 0,
    }];

    let result = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout_ms) };
    if result < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if result == 0 || fds[0].revents & libc::POLLIN == 0 {
        return Err(std::io::Error::from_raw_os_error(libc::ETIMEDOUT));
    }

    let listener = unsafe { vsock::VsockListener::from_raw_fd(listen_fd) };
    let (stream, _addr) = listener.accept()?;
    std::mem::forget(listener);
    Ok(stream)
}

/// Retry-free helper kept for parity with `session.rs`'s accept timeout
/// default; exposed so tests can assert the two stay in sync.
pub const fn session_accept_timeout() -> Duration {
    Duration::from_millis(SESSION_ACCEPT_TIMEOUT_MS as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_session_leader_from_argv0_suffix() {
        assert_eq!(
            detect("/sbin/init-session-leader"),
            Personality::SessionLeader
        );
    }

    #[test]
    fn defaults_to_full_personality() {
        // SAFETY: test-only env var manipulation, single-threaded test.
        unsafe { std::env::remove_var(PERSONALITY_ENV) };
        assert_eq!(detect("/sbin/init"), Personality::Full);
    }
}
