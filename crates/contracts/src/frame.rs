//! WireFrame - message framing between the distribution service and viewers
//!
//! Each frame is one JSON text message:
//!
//! | Frame | Shape |
//! |-------|-------|
//! | hello | `{"ride": {"start_time": 1.7e9, "duration_limit": 1800.0, "time_base": "elapsed"}}` |
//! | sample | `{"timestamp": 12.0, "power": 210.0}` |
//! | end of replay | `{"replay_end": 42}` |

use serde::{Deserialize, Serialize};

use crate::{ContractError, MetricSample, RideInfo};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireFrame {
    /// First frame of every subscription.
    Hello { ride: RideInfo },
    /// Sentinel after the replay burst; carries the replayed sample count.
    ReplayEnd { replay_end: usize },
    Sample(MetricSample),
}

impl WireFrame {
    pub fn to_json(&self) -> Result<String, ContractError> {
        serde_json::to_string(self).map_err(|e| ContractError::frame(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, ContractError> {
        serde_json::from_str(text).map_err(|e| ContractError::frame(e.to_string()))
    }

    pub fn is_replay_end(&self) -> bool {
        matches!(self, WireFrame::ReplayEnd { .. })
    }
}
