#![forbid(unsafe_code)]

//! # council-harness
//!
//! Ask several language models the same question, have them rank each
//! other's answers without knowing who wrote what, and let a chairman model
//! write the final answer.
//!
//! Each question runs as a job: `pending`, then `processing`, then one of
//! `completed`, `failed` or `cancelled`. Cancellation is cooperative and is
//! checked between stages. Costs are estimated from token counts as soon as a
//! call returns and replaced with the provider's billed amounts shortly after
//! the job completes.

pub mod config;
pub mod conversation;
pub mod council;
pub mod gateway;
pub mod jobs;
pub mod store;

pub use config::{ConfigProvider, CouncilConfig, JsonFileConfigProvider, StaticConfigProvider};
pub use conversation::{ConversationStore, MemoryConversationStore};
pub use council::{CouncilResult, PipelineError, StagePipeline};
pub use gateway::{Attribution, ModelGateway, ProviderGateway, UsageSink};
pub use jobs::{
    CancelOutcome, CancelRejection, CouncilEngine, Job, JobStatus, MemoryJobStore,
};
pub use store::SqliteStore;
