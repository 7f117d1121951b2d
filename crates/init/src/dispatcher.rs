//! Table-driven tagged-message dispatcher. Three personalities (full init,
//! thin/session-leader init, forked sub-channel) share this machinery but
//! declare their own handler lists, matching `ProcessMessage`'s
//! `HandleMessage<TMessage, Args...>` variadic recursion — reimplemented
//! here as a match over [`MessageType`] per spec.md §9's "Design Notes".

use std::future::Future;
use std::sync::Arc;

use shared::message::MessageHeader;
use shared::{Channel, ChannelError, MessageType};

/// One entry of the compile-time `(tag, min_size, handler)` table: the
/// dispatcher rejects any frame whose declared size is smaller than
/// `min_payload` before the handler ever sees the buffer.
#[derive(Debug, Clone, Copy)]
pub struct HandlerEntry {
    pub message_type: MessageType,
    pub min_payload: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown message type {0}")]
    UnknownTag(u32),
    #[error("message {tag:?} payload too short: got {actual}, need {expected}")]
    ShortPayload {
        tag: MessageType,
        expected: usize,
        actual: usize,
    },
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}

impl DispatchError {
    pub fn as_errno(&self) -> i32 {
        match self {
            DispatchError::Channel(e) => e.as_errno(),
            _ => libc::EINVAL,
        }
    }
}

/// Validates a frame's declared size against the handler table before any
/// handler reinterprets the payload, preserving the invariant that the
/// minimum-size check always precedes any cast.
pub fn validate(
    table: &[HandlerEntry],
    message_type: MessageType,
    payload_len: usize,
) -> Result<(), DispatchError> {
    let entry = table
        .iter()
        .find(|e| e.message_type as u32 == message_type as u32)
        .ok_or(DispatchError::UnknownTag(message_type as u32))?;

    if payload_len < entry.min_payload {
        return Err(DispatchError::ShortPayload {
            tag: message_type,
            expected: entry.min_payload,
            actual: payload_len,
        });
    }

    Ok(())
}

/// Runs a dispatch loop on `channel`: reads frames until the peer closes or
/// a [`MessageType::LswShutdown`]/[`MessageType::Teardown`] sentinel tag
/// arrives, validating each against `table` and handing matched frames to
/// `handle`. A handler error is logged with (tag, channel name) context and
/// dispatch continues — matching `ProcessMessage`'s catch-log-and-continue
/// behavior; it does not close the channel itself (an unanswered request is
/// how the host is expected to detect the fault, per spec.md §9).
pub async fn run<F, Fut>(channel: Arc<Channel>, table: &'static [HandlerEntry], mut handle: F)
where
    F: FnMut(Arc<Channel>, MessageType, Vec<u8>) -> Fut,
    Fut: Future<Output = Result<(), DispatchError>>,
{
    loop {
        let frame = match channel.receive_or_closed(MessageType::Any).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::info!(channel = channel.name(), "channel closed cleanly");
                break;
            }
            Err(e) => {
                tracing::error!(channel = channel.name(), error = %e, "fatal channel error");
                break;
            }
        };

        let Some(header) = MessageHeader::from_bytes(&frame) else {
            tracing::error!(channel = channel.name(), "frame too short to contain a header");
            break;
        };

        let Some(tag) = MessageType::from_u32(header.message_type) else {
            tracing::error!(channel = channel.name(), tag = header.message_type, "unknown tag");
            continue;
        };

        if matches!(tag, MessageType::LswShutdown | MessageType::Teardown) {
            tracing::info!(channel = channel.name(), "shutdown tag received");
            break;
        }

        if let Err(e) = validate(table, tag, frame.len()) {
            tracing::error!(channel = channel.name(), tag = ?tag, error = %e, "frame failed validation");
            continue;
        }

        if let Err(e) = handle(channel.clone(), tag, frame).await {
            tracing::error!(channel = channel.name(), tag = ?tag, error = %e, "handler failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &[HandlerEntry] = &[
        HandlerEntry {
            message_type: MessageType::LswSignal,
            min_payload: MessageHeader::SIZE + 8,
        },
    ];

    #[test]
    fn rejects_payload_shorter_than_minimum() {
        let err = validate(TABLE, MessageType::LswSignal, MessageHeader::SIZE + 4).unwrap_err();
        assert!(matches!(err, DispatchError::ShortPayload { .. }));
        assert_eq!(err.as_errno(), libc::EINVAL);
    }

    #[test]
    fn accepts_payload_at_or_above_minimum() {
        assert!(validate(TABLE, MessageType::LswSignal, MessageHeader::SIZE + 8).is_ok());
        assert!(validate(TABLE, MessageType::LswSignal, MessageHeader::SIZE + 100).is_ok());
    }

    #[test]
    fn rejects_tag_absent_from_table() {
        let err = validate(TABLE, MessageType::Mount, 64).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownTag(_)));
    }
}
