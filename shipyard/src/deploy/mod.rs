//! Deployment pipeline: orchestration, build execution and publishing

pub mod config;
pub mod executor;
pub mod fsm;
pub mod orchestrator;
pub mod publisher;
