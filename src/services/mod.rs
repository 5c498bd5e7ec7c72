pub mod dispatcher;
pub mod endpoint;
pub mod reconnect;
pub mod transport;
