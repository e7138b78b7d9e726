pub mod boundary;
pub mod config;
pub mod context;
pub mod event;
pub mod execution;
pub mod graph;
pub mod notice;
pub mod replay;
pub mod runner;
pub mod scheduler;
pub mod session;
pub mod token;

pub use config::{EngineConfig, RetryPolicy};
pub use event::{EventKind, ProcessEvent};
pub use graph::ProcessGraph;
pub use session::{EngineError, ExecutionSession, SessionHandle, SessionReport, SessionStatus};
