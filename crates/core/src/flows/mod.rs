pub mod agent_loop;
pub mod engine;
pub mod executor;
pub mod gateway;
pub mod retry;
pub mod states;

pub use engine::{Interpreter, RunMode, RunOutcome, RunResult};
pub use executor::{BlockExecutor, ExecutionEnv};
pub use gateway::{
    ChatMessage, ChatRequest, ChatResponse, ChatRole, Gateways, HttpCall, HttpReply, HttpTransport,
    LlmClient, NluClassifier, ToolCall, ToolProvider, ToolSpec,
};
pub use retry::RetryPolicy;
pub use states::{BlockOutcome, ExecutionState, Position};
