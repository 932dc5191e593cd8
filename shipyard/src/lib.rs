//! Shipyard Library
//!
//! Deployment pipeline: admission and orchestration, the build executor,
//! log transport and artifact serving.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod launch;
pub mod logs;
pub mod models;
pub mod server;
pub mod storage;
pub mod tail;
pub mod transport;
pub mod utils;
pub mod workers;

