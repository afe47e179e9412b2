/*
 * Hangar - Build-and-Deploy Control Plane
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Hangar core library
//!
//! Turns a pushed commit into a running Kubernetes workload: stages the
//! source archive, builds an image through a vendor backend, polls the build
//! and reconciles the runtime resources.

pub mod config;
pub mod error;
pub mod github;
pub mod kubernetes;
pub mod pipeline;
pub mod providers;
pub mod service;
pub mod source;
pub mod storage;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use config::HangarConfig;
pub use error::{PipelineError, Result};
pub use pipeline::{PipelineDeps, PipelineOrchestrator, PipelineWorkers, PollSchedule};
pub use service::DeploymentService;
pub use types::{
    CloudVendor, Deployment, DeploymentConfig, DeploymentId, DeploymentStatus, RepositoryId,
    SourceRepository,
};
