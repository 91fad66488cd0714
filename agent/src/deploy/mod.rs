//! Deployment module

pub mod command;
pub mod devices;
pub mod flash;
pub mod fsm;
pub mod git;
pub mod pipeline;
pub mod report;
pub mod workspace;
