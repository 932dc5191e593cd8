//! Background workers

pub mod ingester;
pub mod watcher;
