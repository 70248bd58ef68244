pub mod block;
pub mod edge;
pub mod session;
pub mod solution;
pub mod turn;

pub use block::{Block, WritableScope};
pub use edge::{EntryEdge, EventName};
pub use session::{AwaitedInput, ScenarioFrame, Scopes, SessionState, SuspendedPosition};
pub use solution::{Node, PreprocessingMode, Scenario, Solution};
pub use turn::{
    DialogStatus, FailureKind, InboundTurn, NluResult, OutboundMessage, TurnFailure, TurnInput,
    TurnOutput,
};
