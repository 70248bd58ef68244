pub mod activation;
pub mod audit;
pub mod config;
pub mod context;
pub mod domain;
pub mod errors;
pub mod expression;
pub mod flows;
pub mod runtime;
pub mod session;
pub mod solution;

pub use activation::{ActivationResolver, EntryPoint, Resolution, Signal};
pub use audit::{
    AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink,
};
pub use config::{AppConfig, ConfigError, ConfigOverrides, EngineConfig, LoadOptions};
pub use context::{ScopeName, VariableContext};
pub use domain::session::SessionState;
pub use domain::solution::Solution;
pub use domain::turn::{DialogStatus, InboundTurn, OutboundMessage, TurnInput, TurnOutput};
pub use errors::{EngineError, ExternalCallError, InterfaceError, RuntimeError, StoreError};
pub use runtime::DialogRuntime;
pub use session::{SessionGuard, SessionLocks, SessionStore};
pub use solution::{
    CoverageReport, CoverageTracker, ReferenceViolation, SolutionError, SolutionSummary,
};
