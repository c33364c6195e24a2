pub mod config;
pub mod error;
pub mod network;
pub mod service;
pub mod transfer;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use error::{Result, TransferEngineError};
