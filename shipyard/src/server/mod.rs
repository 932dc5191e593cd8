//! HTTP surfaces: admission API, live log relay and reverse proxy

pub mod handlers;
pub mod live;
pub mod proxy;
pub mod serve;
pub mod state;
