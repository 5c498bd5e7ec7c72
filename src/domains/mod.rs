pub mod message;

pub use message::{Envelope, MessageType, Payload, TabId};
