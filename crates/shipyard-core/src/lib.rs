//! # Shipyard Core
//!
//! Core domain types for the Shipyard pipeline orchestration engine.
//!
//! This crate defines pipeline definitions, their validation, the external
//! action registry, dependency graph resolution, run records and release
//! versioning. It performs no I/O beyond reading a definition file.
//!
//! ## Architecture
//!
//! - `pipeline`: `PipelineDefinition`, `Job`, `Step` and YAML loading
//! - `action`: the closed set of external actions and their registry
//! - `graph`: dependency graph resolution and cycle detection
//! - `environment`: deployment environments and variable interpolation
//! - `run`: run records and the job status state machine
//! - `approval`: approval requests for gated environments
//! - `release` / `rollout`: versions, releases and rollout plans
//! - `validation` / `error`: configuration errors and engine error kinds
//!
//! ## Example
//!
//! ```rust
//! use shipyard_core::pipeline::{Job, PipelineDefinition, Step};
//! use shipyard_core::environment::EnvironmentSpec;
//!
//! let pipeline = PipelineDefinition::new("web")
//!     .with_environment(EnvironmentSpec::new("production").with_approver("alice"))
//!     .with_job(Job::new("build").with_step(Step::run("cargo build --release")))
//!     .with_job(
//!         Job::new("deploy")
//!             .needs("build")
//!             .in_environment("production")
//!             .with_step(Step::run("./deploy.sh")),
//!     )
//!     .resolve()
//!     .unwrap();
//!
//! assert_eq!(pipeline.graph().ordered_names(), vec!["build", "deploy"]);
//! ```

#![warn(missing_docs)]
#![warn(unused)]
#![warn(clippy::pedantic)]

pub mod action;
pub mod approval;
pub mod environment;
pub mod error;
pub mod graph;
pub mod options;
pub mod pipeline;
pub mod prelude;
pub mod release;
pub mod rollout;
pub mod run;
pub mod validation;

// Re-exports for common use
pub use action::{Action, ActionKind, ActionRegistry, DeployTarget};
pub use approval::{ApprovalRequest, ApprovalState};
pub use environment::{EnvironmentSpec, VariableResolver, Variables};
pub use error::{PipelineError, PipelineResult};
pub use graph::DependencyGraph;
pub use options::{PipelineOptions, Trigger, TriggerEvent};
pub use pipeline::{Job, PipelineDefinition, ResolvedPipeline, Step, StepKind};
pub use release::{BumpPolicy, Release, Version};
pub use rollout::{ProbeCheck, ProbeSpec, RolloutPlan, RolloutStrategy};
pub use run::{FailureKind, FailureReport, JobRecord, JobStatus, PipelineOutcome, RunId, RunRecord};
pub use validation::{Validate, ValidationError, ValidationResult};

// Version
/// Shipyard Core version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
