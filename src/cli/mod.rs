//! Command handlers for the `spv-wallet` binary

pub mod commands;

pub use commands::*;
