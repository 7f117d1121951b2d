pub mod channel;
pub mod message;
pub mod messages;
pub mod vm_config;

pub use channel::{Channel, ChannelError};
pub use message::{MessageHeader, MessageType};
