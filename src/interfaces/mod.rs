pub mod diagnostics;
pub mod transport;
