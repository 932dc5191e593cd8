//! Process entry points: the control plane and build mode

pub mod build;
pub mod options;
pub mod run;
pub mod state;
