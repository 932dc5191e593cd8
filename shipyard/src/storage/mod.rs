//! Persistence: relational store, SQLite backend, blob storage and settings

pub mod blob;
pub mod db;
pub mod settings;
pub mod store;
