pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod player;
pub mod queue;
pub mod reader;
pub mod session;
pub mod source;
pub mod status;

#[cfg(test)]
pub(crate) mod testutil;
