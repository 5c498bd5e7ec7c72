pub mod channels;
pub mod config;
pub mod contexts;
pub mod domains;
pub mod error;
pub mod interfaces;
pub mod services;

pub use crate::channels::{Channel, ChannelState};
pub use crate::config::BusConfig;
pub use crate::domains::message::{Envelope, MessageType, Payload};
pub use crate::error::{BusError, Result};
pub use crate::services::endpoint::{ChannelEvent, Endpoint, ResponseCallback, Role, WeakEndpoint};
pub use crate::services::reconnect::{LinkState, ReconnectHandle};
pub use crate::services::transport::LocalRuntime;
