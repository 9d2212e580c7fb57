//! `validate` and `plan`.

use anyhow::Result;
use std::fmt::Write as _;
use std::path::Path;

use shipyard_core::ResolvedPipeline;

use super::run::load_pipeline;

/// Loads and resolves the pipeline, reporting the first problem
pub fn validate(path: &Path) -> Result<()> {
    let pipeline = load_pipeline(path)?;
    let definition = pipeline.definition();
    println!(
        "Pipeline '{}' is valid: {} job(s), {} environment(s)",
        definition.name,
        definition.jobs.len(),
        definition.environments.len()
    );
    Ok(())
}

/// Prints the jobs in dispatch order
pub fn plan(path: &Path) -> Result<()> {
    let pipeline = load_pipeline(path)?;
    print!("{}", render_plan(&pipeline));
    Ok(())
}

/// Dispatch order with prerequisites, environments and gates
#[must_use]
pub fn render_plan(pipeline: &ResolvedPipeline) -> String {
    let graph = pipeline.graph();
    let mut out = format!("Pipeline '{}'\n", pipeline.definition().name);
    for (position, &index) in graph.order().iter().enumerate() {
        let job = pipeline.job_at(index);
        let _ = write!(out, "{:>3}. {}", position + 1, job.name);

        let needs: Vec<&str> = graph.prerequisites(index).iter().map(|&p| graph.name(p)).collect();
        if !needs.is_empty() {
            let _ = write!(out, "  needs: {}", needs.join(", "));
        }
        if let Some(environment) = pipeline.environment_of(job) {
            let _ = write!(out, "  env: {}", environment.name);
            if environment.is_gated() {
                let approvers: Vec<&str> = environment.required_approvers.iter().map(String::as_str).collect();
                let _ = write!(out, " (approval: {})", approvers.join(", "));
            }
        }
        if let Some(group) = &job.concurrency_group {
            let _ = write!(out, "  group: {group}");
        }
        out.push('\n');
    }
    out
}
