use std::path::PathBuf;

use tracing::{debug, error, info};

use crate::error::PipelineError;
use crate::node::{NodeInput, NodeOutcome, NodeSummary, StageRunner};
use crate::params::Params;

/// One wired Node plus the parameters the workflow gives it.
pub struct Step {
    runner: Box<dyn StageRunner>,
    params: Params,
    /// Command-line flags this step consumes.
    accepts: &'static [&'static str],
}

impl Step {
    pub fn new(
        runner: impl StageRunner + 'static,
        params: Params,
        accepts: &'static [&'static str],
    ) -> Self {
        Self {
            runner: Box::new(runner),
            params,
            accepts,
        }
    }

    /// Workflow defaults overlaid with the flags this step declares.
    fn params_for(&self, flags: &Params) -> Params {
        self.params.clone().merged(&flags.select(self.accepts))
    }
}

/// Fixed linear sequence of Nodes. Each Node's output directory is the next
/// Node's input; the first failure aborts the run.
pub struct Pipeline {
    name: String,
    steps: Vec<Step>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn then(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> Vec<NodeSummary> {
        self.steps.iter().map(|s| s.runner.summary()).collect()
    }

    /// Flags every step together accepts.
    pub fn accepted_flags(&self) -> Vec<&'static str> {
        let mut flags: Vec<&'static str> =
            self.steps.iter().flat_map(|s| s.accepts.iter().copied()).collect();
        flags.sort_unstable();
        flags.dedup();
        flags
    }

    pub fn execute(&mut self, input: NodeInput, flags: &Params) -> Result<PathBuf, PipelineError> {
        if self.steps.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "pipeline '{}' has no stages",
                self.name
            )));
        }
        info!(pipeline = %self.name, stages = self.steps.len(), "starting pipeline");

        let mut current = input;
        for step in &mut self.steps {
            let NodeSummary {
                project,
                stage,
                base_path,
                cache_duration,
            } = step.runner.summary();
            debug!(
                project = %project,
                stage = %stage,
                base = %base_path.display(),
                cache_secs = cache_duration.as_secs(),
                "running stage"
            );
            let params = step.params_for(flags);
            let report = step.runner.run(&current, &params).map_err(|e| {
                error!(stage = %stage, params = %params.canonical(), error = %e, "stage failed");
                PipelineError::StageFailed {
                    stage: stage.clone(),
                    params: params.canonical(),
                    source: Box::new(e),
                }
            })?;
            match report.outcome {
                NodeOutcome::Cached => info!(stage = %stage, "reused cached output"),
                NodeOutcome::Populated { written, dropped } => {
                    info!(stage = %stage, written, dropped, "populated output")
                }
            }
            current = NodeInput::Directory(report.output_dir);
        }

        match current {
            NodeInput::Directory(dir) => Ok(dir),
            NodeInput::Seeds(_) => Err(PipelineError::Configuration(format!(
                "pipeline '{}' produced no output directory",
                self.name
            ))),
        }
    }
}

// ── Tests ──
