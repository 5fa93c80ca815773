pub mod conflict;
pub mod events;
pub mod executor;
pub mod gate;
pub mod hook;
pub mod notify;
pub mod orchestrator;
pub mod progress;

pub use conflict::{apply_local_action, ConflictResolver, Resolution};
pub use events::EventSink;
pub use executor::{ExecutorConfig, UploadExecutor};
pub use gate::{
    ConditionsProvider, DeviceConditions, Gate, GateDecision, PauseSwitch, StaticConditions,
};
pub use hook::{CollectionHook, PostTransferHook};
pub use notify::result_notification;
pub use orchestrator::{
    BatchError, BatchSummary, OrchestratorConfig, StopReason, UploadOrchestrator,
};
pub use progress::{ProgressReporter, DEFAULT_PROGRESS_INTERVAL};
