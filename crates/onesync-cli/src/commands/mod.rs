//! CLI subcommands

pub mod login;
pub mod monitor;
pub mod status;
pub mod sync;
