//! Log transport: the emitter facade and its durable and live backends

pub mod durable;
pub mod emitter;
pub mod live;
pub mod mqtt;
pub mod topics;

use serde::{Deserialize, Serialize};

/// Which backends a build executor writes to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Durable,
    Live,
    Both,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Durable => "durable",
            TransportMode::Live => "live",
            TransportMode::Both => "both",
        }
    }

    pub fn uses_durable(&self) -> bool {
        matches!(self, TransportMode::Durable | TransportMode::Both)
    }

    pub fn uses_live(&self) -> bool {
        matches!(self, TransportMode::Live | TransportMode::Both)
    }
}

impl std::str::FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "durable" => Ok(TransportMode::Durable),
            "live" => Ok(TransportMode::Live),
            "both" => Ok(TransportMode::Both),
            _ => Err(format!("Invalid log transport: {}", s)),
        }
    }
}
