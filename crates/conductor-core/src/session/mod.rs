//! Session execution: per-session state, workers, registry and switching

pub mod registry;
pub mod state;
pub mod switch;
pub mod types;
pub mod worker;

pub use registry::{Lookup, OpenFuture, SessionHandle, SessionRegistry};
pub use state::{ExecutionStatus, MetricsSnapshot, SessionExecutionState};
pub use switch::{ConfirmStep, SwitchCoordinator, SwitchPhase, SwitchStep};
pub use types::{EventReceiver, SessionEvent, SessionId, Severity};
pub use worker::{ExecutionWorker, WorkerMessage, WorkerSender, WorkerUpdate, engine_call};
