//! Wire message header and the closed tag enumeration.
//!
//! The wire format is a fixed-size header followed by the message's own
//! fixed fields, followed by offset-addressed variable-length fields (each a
//! NUL-terminated string, or a back-to-back NUL-terminated array terminated
//! by an empty string). This mirrors `message.h`'s `MessageWriter` layout
//! exactly so a single header shape can address every message on the wire.

use std::mem::size_of;

/// Every message starts with this header. `size` is the total length of the
/// frame (header included); `sequence` is assigned by the sender and checked
/// by the receiver unless the channel has `ignore_sequence` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct MessageHeader {
    pub size: u32,
    pub message_type: u32,
    pub sequence: u32,
}

impl MessageHeader {
    pub const SIZE: usize = size_of::<u32>() * 3;

    pub fn new(message_type: MessageType, size: u32) -> Self {
        Self {
            size,
            message_type: message_type as u32,
            sequence: 0,
        }
    }

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.message_type.to_le_bytes());
        buf[8..12].copy_from_slice(&self.sequence.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }

        Some(Self {
            size: u32::from_le_bytes(buf[0..4].try_into().ok()?),
            message_type: u32::from_le_bytes(buf[4..8].try_into().ok()?),
            sequence: u32::from_le_bytes(buf[8..12].try_into().ok()?),
        })
    }
}

/// The closed set of message tags the guest core understands. Names follow
/// the `LxMiniInit*` tags grepped out of `main.cpp`, collapsed to the subset
/// this crate dispatches on plus the `LSW_*` tags used by the thin-init
/// personality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    /// Matches any expected type during header validation (used internally
    /// by peek-style reads; never sent on the wire).
    Any = 0,
    EarlyConfig = 1,
    InitialConfig = 2,
    Mount = 3,
    Unmount = 4,
    Detach = 5,
    MountFolder = 6,
    WaitForPmemDevice = 7,
    GuestCapabilities = 8,
    ChildExit = 9,
    MountStatus = 10,
    LaunchProcess = 11,
    Teardown = 12,
    Result = 13,
    LswGetDisk = 20,
    LswGetDiskResult = 21,
    LswMount = 22,
    LswExec = 23,
    LswFork = 24,
    LswForkResult = 25,
    LswConnect = 26,
    LswWaitPid = 27,
    LswWaitPidResult = 28,
    LswSignal = 29,
    LswShutdown = 30,
}

impl MessageType {
    pub fn from_u32(value: u32) -> Option<Self> {
        use MessageType::*;
        let tag = match value {
            0 => Any,
            1 => EarlyConfig,
            2 => InitialConfig,
            3 => Mount,
            4 => Unmount,
            5 => Detach,
            6 => MountFolder,
            7 => WaitForPmemDevice,
            8 => GuestCapabilities,
            9 => ChildExit,
            10 => MountStatus,
            11 => LaunchProcess,
            12 => Teardown,
            13 => Result,
            20 => LswGetDisk,
            21 => LswGetDiskResult,
            22 => LswMount,
            23 => LswExec,
            24 => LswFork,
            25 => LswForkResult,
            26 => LswConnect,
            27 => LswWaitPid,
            28 => LswWaitPidResult,
            29 => LswSignal,
            30 => LswShutdown,
            _ => return None,
        };

        Some(tag)
    }
}

/// Incrementally builds a message frame: header, then the message's fixed
/// fields (written directly by the caller before construction), then
/// offset-addressed trailing strings.
///
/// Mirrors `MessageWriter<TMessage>`: `write_string` appends a NUL-terminated
/// string and returns the byte offset it was written at (the caller stores
/// that offset in one of the message's own fixed `u32` index fields).
pub struct MessageBuilder {
    buffer: Vec<u8>,
}

impl MessageBuilder {
    /// `fixed` is the pre-encoded fixed-size portion of the message
    /// (header-sized region reserved, followed by the message's typed
    /// fields). The header's `size` field is patched in at `finish`.
    pub fn new(message_type: MessageType, fixed: &[u8]) -> Self {
        let mut buffer = vec![0u8; MessageHeader::SIZE];
        buffer.extend_from_slice(fixed);
        let header = MessageHeader::new(message_type, buffer.len() as u32);
        buffer[..MessageHeader::SIZE].copy_from_slice(&header.to_bytes());
        Self { buffer }
    }

    /// Appends a NUL-terminated string, returning its byte offset within the
    /// frame (to be stored in the owning message's index field). Also
    /// updates the header's `size` field.
    pub fn write_string(&mut self, value: &str) -> u32 {
        let offset = self.buffer.len() as u32;
        self.buffer.extend_from_slice(value.as_bytes());
        self.buffer.push(0);
        self.patch_size();
        offset
    }

    /// Appends a back-to-back NUL-terminated array terminated by an empty
    /// string, returning the offset of the first element.
    pub fn write_array<'a>(&mut self, values: impl IntoIterator<Item = &'a str>) -> u32 {
        let offset = self.buffer.len() as u32;
        for value in values {
            self.buffer.extend_from_slice(value.as_bytes());
            self.buffer.push(0);
        }
        self.buffer.push(0);
        self.patch_size();
        offset
    }

    fn patch_size(&mut self) {
        let size = self.buffer.len() as u32;
        self.buffer[0..4].copy_from_slice(&size.to_le_bytes());
    }

    pub fn set_sequence(&mut self, sequence: u32) {
        self.buffer[8..12].copy_from_slice(&sequence.to_le_bytes());
    }

    pub fn finish(self) -> Vec<u8> {
        self.buffer
    }
}

/// Reads a NUL-terminated string starting at `offset` within `buffer`.
/// Offset `0` conventionally means "absent"; returns `None` in that case.
pub fn read_string_at(buffer: &[u8], offset: u32) -> Option<String> {
    if offset == 0 {
        return None;
    }

    let start = offset as usize;
    let end = buffer[start..].iter().position(|&b| b == 0)? + start;
    Some(String::from_utf8_lossy(&buffer[start..end]).into_owned())
}

/// Reads a back-to-back NUL-terminated array starting at `offset`,
/// terminated by an empty string.
pub fn read_array_at(buffer: &[u8], offset: u32) -> Vec<String> {
    let mut values = Vec::new();
    let mut cursor = offset as usize;
    while cursor < buffer.len() {
        let end = match buffer[cursor..].iter().position(|&b| b == 0) {
            Some(pos) => pos + cursor,
            None => break,
        };

        if end == cursor {
            break;
        }

        values.push(String::from_utf8_lossy(&buffer[cursor..end]).into_owned());
        cursor = end + 1;
    }

    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_bytes() {
        let header = MessageHeader::new(MessageType::LswMount, 64);
        let bytes = header.to_bytes();
        let parsed = MessageHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header, parsed);
    }

    #[test]
    fn builder_patches_size_as_strings_are_appended() {
        let mut builder = MessageBuilder::new(MessageType::LswMount, &[0u8; 16]);
        let offset = builder.write_string("/mnt/data");
        let buffer = builder.finish();
        let header = MessageHeader::from_bytes(&buffer).unwrap();
        assert_eq!(header.size as usize, buffer.len());
        assert_eq!(
            read_string_at(&buffer, offset).as_deref(),
            Some("/mnt/data")
        );
    }

    #[test]
    fn offset_zero_means_absent() {
        let buffer = vec![0u8; 32];
        assert_eq!(read_string_at(&buffer, 0), None);
    }

    #[test]
    fn array_reads_back_to_back_strings_until_empty_terminator() {
        let mut builder = MessageBuilder::new(MessageType::LswExec, &[0u8; 8]);
        let offset = builder.write_array(["/bin/ls", "-la", "/tmp"]);
        let buffer = builder.finish();
        let values = read_array_at(&buffer, offset);
        assert_eq!(values, vec!["/bin/ls", "-la", "/tmp"]);
    }
}
