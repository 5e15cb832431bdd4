pub mod estimator;
pub mod executor;
pub mod orchestrator;
pub mod progress;
pub mod runner;
pub mod session;
pub mod status;
pub mod strategy;
pub mod transcript;

pub use estimator::{SizeEstimate, SizeEstimator};
pub use executor::{ExecutorSettings, JobState, TransferJob};
pub use orchestrator::{validate_request, BatchSummary, JobResult, Orchestrator};
pub use progress::{format_eta, format_size, ProgressTracker};
pub use runner::{CommandOutput, CommandRunner, ProcessRunner};
pub use session::SyncSessionManager;
pub use status::{render_status_lines, SlotId, StatusBoard, SyncEvent, DESTINATION_SLOTS};
pub use strategy::{
    select_strategy, Platform, PriorityProbe, ToolDetector, ToolVersion, TransferPreferences,
    TransferStrategy, VersionDetection,
};
pub use transcript::{DestinationLog, GlobalLog};
