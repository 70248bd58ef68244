use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::session::{AwaitedInput, ScenarioFrame, SuspendedPosition};
pub use crate::domain::turn::ExecutionState;

/// Where the interpreter is: a block of a node of a scenario.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub scenario_slug: String,
    pub node_id: String,
    pub block_index: usize,
}

impl Position {
    pub fn new(
        scenario_slug: impl Into<String>,
        node_id: impl Into<String>,
        block_index: usize,
    ) -> Self {
        Self { scenario_slug: scenario_slug.into(), node_id: node_id.into(), block_index }
    }

    pub fn node_start(scenario_slug: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self::new(scenario_slug, node_id, 0)
    }
}

impl From<ScenarioFrame> for Position {
    fn from(frame: ScenarioFrame) -> Self {
        Self::new(frame.scenario_slug, frame.node_id, frame.block_index)
    }
}

impl From<&SuspendedPosition> for Position {
    fn from(suspended: &SuspendedPosition) -> Self {
        Self::new(suspended.scenario_slug.clone(), suspended.node_id.clone(), suspended.block_index)
    }
}

/// What a single block asks the interpreter to do next.
#[derive(Clone, Debug, PartialEq)]
pub enum BlockOutcome {
    Continue,
    Suspend(AwaitedInput),
    Branch(String),
    Extend { scenario_slug: String, node_id: String, return_back: bool },
    Close,
    Handoff(Map<String, Value>),
}

impl BlockOutcome {
    pub fn state(&self) -> ExecutionState {
        match self {
            Self::Continue | Self::Branch(_) => ExecutionState::Running,
            Self::Suspend(_) => ExecutionState::Suspended,
            Self::Extend { .. } => ExecutionState::Extending,
            Self::Close | Self::Handoff(_) => ExecutionState::Closed,
        }
    }
}
