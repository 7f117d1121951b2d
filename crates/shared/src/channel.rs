//! Async message channel over a vsock stream.
//!
//! Mirrors `SocketChannel`: one mutex guards sends, one guards receives,
//! both acquired with `try_lock` rather than a blocking lock. A caller that
//! races itself on the same direction is a protocol bug, not contention to
//! wait out, so a failed `try_lock` becomes `EINVAL` immediately.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_vsock::VsockStream;

use crate::message::{MessageBuilder, MessageHeader, MessageType};
use crate::vm_config;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("incorrect channel usage detected on channel: {0}")]
    ConcurrentUse(&'static str),
    #[error("io error on channel {0}: {1}")]
    Io(&'static str, #[source] io::Error),
    #[error("message too short to contain a header on channel {0}")]
    ShortHeader(&'static str),
    #[error("unexpected message type {actual} (expected {expected}) on channel {name}")]
    UnexpectedType {
        name: &'static str,
        expected: u32,
        actual: u32,
    },
    #[error("sequence mismatch on channel {name}: expected {expected}, got {actual}")]
    SequenceMismatch {
        name: &'static str,
        expected: u32,
        actual: u32,
    },
    #[error("channel {0} closed unexpectedly")]
    ClosedUnexpectedly(&'static str),
}

impl ChannelError {
    /// The errno a caller across the wire should see for this failure.
    pub fn as_errno(&self) -> i32 {
        match self {
            ChannelError::Io(_, e) => e.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EINVAL,
        }
    }
}

/// An async, sequence-checked request/response channel over a single vsock
/// stream. Not `Clone`; shared access goes through an `Arc<Channel>` so the
/// try-lock send/receive mutexes are meaningful.
pub struct Channel {
    socket: Mutex<VsockStream>,
    send_lock: Mutex<()>,
    receive_lock: Mutex<()>,
    name: &'static str,
    sent_sequence: std::sync::atomic::AtomicU32,
    received_sequence: std::sync::atomic::AtomicU32,
    ignore_sequence: std::sync::atomic::AtomicBool,
    log_payloads: std::sync::atomic::AtomicBool,
}

impl Channel {
    pub fn new(socket: VsockStream, name: &'static str) -> Self {
        Self {
            socket: Mutex::new(socket),
            send_lock: Mutex::new(()),
            receive_lock: Mutex::new(()),
            name,
            sent_sequence: std::sync::atomic::AtomicU32::new(0),
            received_sequence: std::sync::atomic::AtomicU32::new(0),
            ignore_sequence: std::sync::atomic::AtomicBool::new(false),
            log_payloads: std::sync::atomic::AtomicBool::new(vm_config::socket_logging_enabled()),
        }
    }

    /// Overrides whether full frame payloads are logged at `debug!`, once
    /// the accumulated `GuestConfig` is available (it may refine the
    /// kernel-cmdline-derived default this channel started with).
    pub fn set_log_payloads(&self, enabled: bool) {
        self.log_payloads
            .store(enabled, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn sent_sequence(&self) -> u32 {
        self.sent_sequence.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn received_sequence(&self) -> u32 {
        self.received_sequence
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Disables sequence-number validation on receive. Used once a channel
    /// has been handed off to a flow that does not track sequencing (e.g.
    /// after an `execve`-bound fd has been duplicated elsewhere).
    pub fn ignore_sequence_numbers(&self) {
        self.ignore_sequence
            .store(true, std::sync::atomic::Ordering::Relaxed);
    }

    /// Sends a pre-built frame (its header's `size` must already equal
    /// `frame.len()`). Assigns the next outgoing sequence number.
    pub async fn send_frame(&self, mut frame: Vec<u8>) -> Result<(), ChannelError> {
        let _permit = self
            .send_lock
            .try_lock()
            .map_err(|_| ChannelError::ConcurrentUse(self.name))?;

        let sequence = self
            .sent_sequence
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        if frame.len() >= MessageHeader::SIZE {
            frame[8..12].copy_from_slice(&sequence.to_le_bytes());
        }

        tracing::debug!(channel = self.name, sequence, len = frame.len(), "send");
        if self.log_payloads.load(std::sync::atomic::Ordering::Relaxed) {
            tracing::debug!(channel = self.name, sequence, payload = ?frame, "send payload");
        }

        let mut socket = self.socket.lock().await;
        socket
            .write_all(&frame)
            .await
            .map_err(|e| ChannelError::Io(self.name, e))
    }

    /// Builds and sends a message from a [`MessageBuilder`].
    pub async fn send(&self, builder: MessageBuilder) -> Result<(), ChannelError> {
        self.send_frame(builder.finish()).await
    }

    /// Sends a bare result code as a [`MessageType::Result`] message (the
    /// `SendResultMessage<TResult>` equivalent).
    pub async fn send_result(&self, value: i32) -> Result<(), ChannelError> {
        let mut builder = MessageBuilder::new(MessageType::Result, &value.to_le_bytes());
        let _ = &mut builder;
        self.send(builder).await
    }

    /// Receives one frame, or `Ok(None)` if the peer closed the connection
    /// cleanly (matches `ReceiveMessageOrClosed`).
    pub async fn receive_or_closed(
        &self,
        expected: MessageType,
    ) -> Result<Option<Vec<u8>>, ChannelError> {
        let _permit = self
            .receive_lock
            .try_lock()
            .map_err(|_| ChannelError::ConcurrentUse(self.name))?;

        let mut header_bytes = [0u8; MessageHeader::SIZE];
        let mut socket = self.socket.lock().await;
        match socket.read_exact(&mut header_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(ChannelError::Io(self.name, e)),
        }

        let header =
            MessageHeader::from_bytes(&header_bytes).ok_or(ChannelError::ShortHeader(self.name))?;
        if (header.size as usize) < MessageHeader::SIZE {
            return Err(ChannelError::ShortHeader(self.name));
        }

        let mut buffer = vec![0u8; header.size as usize];
        buffer[..MessageHeader::SIZE].copy_from_slice(&header_bytes);
        socket
            .read_exact(&mut buffer[MessageHeader::SIZE..])
            .await
            .map_err(|e| ChannelError::Io(self.name, e))?;
        drop(socket);

        self.validate_header(&header, expected)?;
        if self.log_payloads.load(std::sync::atomic::Ordering::Relaxed) {
            tracing::debug!(
                channel = self.name,
                sequence = header.sequence,
                payload = ?buffer,
                "receive payload"
            );
        }
        Ok(Some(buffer))
    }

    /// Like [`Channel::receive_or_closed`] but treats a clean close as an
    /// error (matches `ReceiveMessage<TMessage>`).
    pub async fn receive(&self, expected: MessageType) -> Result<Vec<u8>, ChannelError> {
        self.receive_or_closed(expected)
            .await?
            .ok_or(ChannelError::ClosedUnexpectedly(self.name))
    }

    fn validate_header(
        &self,
        header: &MessageHeader,
        expected: MessageType,
    ) -> Result<(), ChannelError> {
        let expected_tag = expected as u32;
        if expected_tag != MessageType::Any as u32 && header.message_type != expected_tag {
            return Err(ChannelError::UnexpectedType {
                name: self.name,
                expected: expected_tag,
                actual: header.message_type,
            });
        }

        if !self.ignore_sequence.load(std::sync::atomic::Ordering::Relaxed) {
            let expected_sequence = self
                .received_sequence
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                + 1;
            if header.sequence != expected_sequence {
                return Err(ChannelError::SequenceMismatch {
                    name: self.name,
                    expected: expected_sequence,
                    actual: header.sequence,
                });
            }
        } else {
            self.received_sequence
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        Ok(())
    }

    /// Sends `builder` and waits for the matching response (`Transaction`).
    pub async fn transaction(
        &self,
        builder: MessageBuilder,
        response_type: MessageType,
    ) -> Result<Vec<u8>, ChannelError> {
        self.send(builder).await?;
        self.receive(response_type).await
    }

    pub async fn close(self) {
        drop(self.socket.into_inner());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_defaults_to_einval() {
        let err = ChannelError::ConcurrentUse("primary");
        assert_eq!(err.as_errno(), libc::EINVAL);
    }

    #[test]
    fn errno_mapping_prefers_underlying_os_error() {
        let io_err = io::Error::from_raw_os_error(libc::ENOENT);
        let err = ChannelError::Io("primary", io_err);
        assert_eq!(err.as_errno(), libc::ENOENT);
    }
}
