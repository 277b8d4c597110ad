//! Atelier: generation task orchestration core
//!
//! Turns image-generation requests (an optional primary image, up to ten
//! references, a prompt and an output policy) into calls against a hosted
//! image model. Requests are queued and dispatched with bounded concurrency and
//! retries. Results land in a content-addressed cache and every finished task
//! is recorded in a browsable history.

pub mod artifact;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod logging;
pub mod orchestrator;
pub mod provider;
pub mod queue;
pub mod request;
pub mod types;

pub use artifact::{ArtifactRecord, ArtifactStore, ImageFormat, MediaDescriptor};
pub use config::{AtelierConfig, ConfigLoader};
pub use error::{ApiError, FailureReason, ProviderError, StorageError, ValidationError};
pub use events::{EventBus, Subscription, TaskEvent};
pub use history::{HistoryEntry, HistoryFilter, HistoryIter, HistoryLedger, PurgeReport};
pub use orchestrator::Orchestrator;
pub use provider::{ApiCredentials, ImageProvider, ProviderConfig, ProviderType};
pub use queue::{
    CancelOutcome, ModelTimings, QueueStats, SchedulerConfig, Task, TaskProgress, TaskState,
};
pub use request::{AspectRatio, DimensionPolicy, GenerationRequest, ResolutionTier};
pub use types::{ArtifactRef, TaskId};
