//! Command-line interface for the `awh` binary

pub mod commands;
pub mod error;
