pub mod api;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod protocol;
pub mod signaling;

pub use error::{Result, SignalError};
