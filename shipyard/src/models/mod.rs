//! Domain models

pub mod deployment;
pub mod log_event;
pub mod project;
