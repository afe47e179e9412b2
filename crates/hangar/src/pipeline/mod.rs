//! Asynchronous build-and-deploy pipeline.

mod orchestrator;
mod workers;

pub use orchestrator::{PipelineDeps, PipelineOrchestrator, PollSchedule};
pub use workers::PipelineWorkers;
