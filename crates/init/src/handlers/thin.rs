//! Handlers for the thin/session-leader personality's `LSW_*` message set.
//! Ports `LSWInit.cpp`'s `HandleMessageImpl` overload set one-for-one.

use std::ffi::CString;
use std::io;
use std::sync::Arc;

use futures::future::BoxFuture;
use shared::message::MessageType;
use shared::messages::{
    ConnectMessage, ExecMessage, ForkMessage, ForkResult, GetDiskMessage, GetDiskResult,
    MountMessage, SignalMessage, WaitPidMessage, WaitPidResult,
};
use shared::message::MessageHeader;
use shared::Channel;

use crate::dispatcher::{DispatchError, HandlerEntry};
use crate::lifecycle;
use crate::mount::{device, flags, overlay};
use crate::session::{self, SessionResult};

pub const TABLE: &[HandlerEntry] = &[
    HandlerEntry {
        message_type: MessageType::LswGetDisk,
        min_payload: MessageHeader::SIZE + 4,
    },
    HandlerEntry {
        message_type: MessageType::LswMount,
        min_payload: MessageHeader::SIZE + 20,
    },
    HandlerEntry {
        message_type: MessageType::LswExec,
        min_payload: MessageHeader::SIZE + 8,
    },
    HandlerEntry {
        message_type: MessageType::LswFork,
        min_payload: MessageHeader::SIZE + 4,
    },
    HandlerEntry {
        message_type: MessageType::LswConnect,
        min_payload: MessageHeader::SIZE + 4,
    },
    HandlerEntry {
        message_type: MessageType::LswWaitPid,
        min_payload: MessageHeader::SIZE + 8,
    },
    HandlerEntry {
        message_type: MessageType::LswSignal,
        min_payload: MessageHeader::SIZE + 8,
    },
];

/// Returns a [`crate::session::ChildEntry`] that boots a fresh thin
/// dispatcher loop; used both as the session's own recursion target (forked
/// children keep running the same handler set) and by `main.rs`.
pub fn child_entry() -> session::ChildEntry {
    |channel: Arc<Channel>| -> BoxFuture<'static, ()> {
        Box::pin(async move {
            crate::dispatcher::run(channel, TABLE, |channel, tag, frame| {
                Box::pin(dispatch(channel, tag, frame))
            })
            .await;
        })
    }
}

pub async fn dispatch(
    channel: Arc<Channel>,
    tag: MessageType,
    frame: Vec<u8>,
) -> Result<(), DispatchError> {
    match tag {
        MessageType::LswGetDisk => handle_get_disk(&channel, &frame).await,
        MessageType::LswMount => handle_mount(&channel, &frame).await,
        MessageType::LswExec => handle_exec(&channel, &frame).await,
        MessageType::LswFork => handle_fork(&channel, &frame).await,
        MessageType::LswConnect => handle_connect(&channel, &frame).await,
        MessageType::LswWaitPid => handle_wait_pid(&channel, &frame).await,
        MessageType::LswSignal => handle_signal(&channel, &frame).await,
        _ => Ok(()),
    }
}

async fn handle_get_disk(channel: &Arc<Channel>, frame: &[u8]) -> Result<(), DispatchError> {
    let message = GetDiskMessage::parse(frame);
    let (result, device_path) = match device::lun_device_name(message.lun).await {
        Ok(name) => (0, device::lun_device_path(&name)),
        Err(e) => (-e.errno(), String::new()),
    };

    channel
        .send_frame(GetDiskResult::build(result, &device_path))
        .await?;
    Ok(())
}

async fn handle_mount(channel: &Arc<Channel>, frame: &[u8]) -> Result<(), DispatchError> {
    let message = MountMessage::parse(frame);
    let result = mount_impl(&message).await;

    let response = shared::message::MessageBuilder::new(MessageType::Result, &[0u8; 4]);
    let mut bytes = response.finish();
    let code: i32 = match result {
        Ok(()) => 0,
        Err(errno) => -errno,
    };
    bytes[MessageHeader::SIZE..MessageHeader::SIZE + 4].copy_from_slice(&code.to_le_bytes());
    channel.send_frame(bytes).await?;
    Ok(())
}

async fn mount_impl(message: &MountMessage) -> Result<(), i32> {
    let options = match &message.options {
        Some(opts) => flags::parse_flags(opts),
        None => flags::ParsedOptions::default(),
    };

    let source = message.source.as_deref().unwrap_or("");
    let target = message.target.as_deref().unwrap_or("");
    let fstype = message.fstype.as_deref();

    nix::mount::mount(
        if source.is_empty() { None } else { Some(source) },
        target,
        fstype,
        options.mount_flags,
        if options.string_options.is_empty() {
            None
        } else {
            Some(options.string_options.as_str())
        },
    )
    .map_err(|e| e as i32)?;

    if message.chroot {
        overlay::chroot_into(target).map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;
    }

    Ok(())
}

async fn handle_exec(channel: &Arc<Channel>, frame: &[u8]) -> Result<(), DispatchError> {
    let message = ExecMessage::parse(frame);
    let errno = exec_impl(&message);

    let response = shared::message::MessageBuilder::new(MessageType::Result, &[0u8; 4]);
    let mut bytes = response.finish();
    bytes[MessageHeader::SIZE..MessageHeader::SIZE + 4].copy_from_slice(&errno.to_le_bytes());
    channel.send_frame(bytes).await?;
    Ok(())
}

/// Only returns on failure: a successful `execve` replaces this process
/// image entirely, matching the original's "only reached if exec() fails"
/// comment.
fn exec_impl(message: &ExecMessage) -> i32 {
    let Some(executable) = message.argv.first().cloned() else {
        return libc::EINVAL;
    };

    let Ok(executable_c) = CString::new(executable) else {
        return libc::EINVAL;
    };

    let Some(argv) = to_cstrings(&message.argv) else {
        return libc::EINVAL;
    };
    let Some(envp) = to_cstrings(&message.envp) else {
        return libc::EINVAL;
    };

    match nix::unistd::execve(&executable_c, &argv, &envp) {
        Ok(_) => unreachable!("execve only returns on error"),
        Err(e) => e as i32,
    }
}

fn to_cstrings(values: &[String]) -> Option<Vec<CString>> {
    values.iter().map(|s| CString::new(s.as_str()).ok()).collect()
}

async fn handle_fork(channel: &Arc<Channel>, frame: &[u8]) -> Result<(), DispatchError> {
    let message = ForkMessage::parse(frame);

    // LSWInit.cpp's LSW_FORK handler sends a single response carrying both
    // port and pid once the fork/spawn completes (the fork itself never
    // blocks, so there is no separate early-port announcement here, unlike
    // the port relay's accept loop).
    let result: io::Result<SessionResult> =
        session::fork_session(message.flavor, channel.clone(), child_entry(), None, |_port| async {
            Ok(())
        })
        .await;

    match result {
        Ok(session) => {
            channel
                .send_frame(ForkResult::build(
                    session.port,
                    session.pid,
                    session.tty_port.unwrap_or(0),
                ))
                .await?;
        }
        Err(e) => {
            tracing::error!(error = %e, "fork failed");
        }
    }

    Ok(())
}

async fn handle_connect(channel: &Arc<Channel>, frame: &[u8]) -> Result<(), DispatchError> {
    let message = ConnectMessage::parse(frame);
    let _ = message.target_fd;

    // LSW_CONNECT hands the accepted socket to a target fd in the handler's
    // own process via dup2; it is accepted only on the thin session-leader's
    // own listen socket and has no response payload beyond the port.
    tracing::warn!("LSW_CONNECT not wired to a live fd table in this build");
    channel.send_result(-(libc::ENOSYS)).await?;
    Ok(())
}

async fn handle_wait_pid(channel: &Arc<Channel>, frame: &[u8]) -> Result<(), DispatchError> {
    let message = WaitPidMessage::parse(frame);
    let (state, code, errno) = lifecycle::wait_for_pid(message.pid, message.timeout_ms).await;
    channel
        .send_frame(WaitPidResult::build(state, code, errno))
        .await?;
    Ok(())
}

async fn handle_signal(channel: &Arc<Channel>, frame: &[u8]) -> Result<(), DispatchError> {
    let message = SignalMessage::parse(frame);
    let errno = match lifecycle::send_signal(message.pid, message.signal) {
        Ok(()) => 0,
        Err(e) => e.errno(),
    };

    channel.send_result(-errno).await?;
    Ok(())
}
