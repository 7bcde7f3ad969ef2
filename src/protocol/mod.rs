pub mod codec;
pub mod message;

pub use codec::{Header, MessageKind, HEADER_SIZE};
pub use message::TreeMessage;
