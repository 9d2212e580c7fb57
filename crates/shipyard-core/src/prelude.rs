//! prelude - Common imports for Shipyard
//!
//! ```rust
//! use shipyard_core::prelude::*;
//!
//! let job = Job::new("test").with_step(Step::run("cargo test"));
//! assert_eq!(job.steps.len(), 1);
//! ```

pub use crate::action::{Action, ActionRegistry};
pub use crate::environment::{EnvironmentSpec, Variables};
pub use crate::error::{PipelineError, PipelineResult};
pub use crate::options::{PipelineOptions, Trigger, TriggerEvent};
pub use crate::pipeline::{Job, PipelineDefinition, ResolvedPipeline, Step, StepKind};
pub use crate::release::{BumpPolicy, Version};
pub use crate::rollout::{RolloutPlan, RolloutStrategy};
pub use crate::run::{JobStatus, PipelineOutcome, RunId, RunRecord};
pub use crate::validation::{Validate, ValidationError};
