//! tagflash library
//!
//! Core modules for the webhook-driven firmware deployment daemon.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod intake;
pub mod logs;
pub mod server;
pub mod utils;
pub mod workers;
