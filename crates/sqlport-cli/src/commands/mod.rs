//! Command handlers

pub mod config;
pub mod reset;
pub mod sql;
pub mod status;
pub mod watch;
