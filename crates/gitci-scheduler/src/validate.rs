//! Structural validation of pipelines.

use gitci_core::pipeline::{Job, Pipeline};
use gitci_core::{Error, Result};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("pipeline name is empty")]
    EmptyName,
    #[error("no jobs defined in pipeline")]
    NoJobs,
    #[error("job '{job}' has no steps or trigger")]
    NoSteps { job: String },
    #[error("job '{job}' references undefined stage '{stage}'")]
    UndefinedStage { job: String, stage: String },
    #[error("job '{job}' depends on non-existent job '{need}'")]
    UnknownNeed { job: String, need: String },
    #[error("circular dependency detected: {}", .chain.join(" -> "))]
    Cycle { chain: Vec<String> },

    // Strict mode
    #[error("job '{job}' has no runner specified")]
    NoRunner { job: String },
    #[error("job '{job}' step {index} is empty")]
    EmptyStep { job: String, index: usize },
    #[error("job '{job}' step {index} has invalid timeout")]
    InvalidStepTimeout { job: String, index: usize },
    #[error("job '{job}' has invalid timeout")]
    InvalidJobTimeout { job: String },
    #[error("job '{job}' has empty environment variable key")]
    EmptyEnvKey { job: String },
    #[error("job '{job}' has artifacts defined but no paths")]
    ArtifactsWithoutPaths { job: String },
    #[error("job '{job}' has cache defined but no paths")]
    CacheWithoutPaths { job: String },
}

/// Collects every problem in a pipeline instead of stopping at the first.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    strict: bool,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also check execution targets, empty steps, timeouts, env keys and
    /// artifact/cache paths.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn validate(&self, pipeline: &Pipeline) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if pipeline.name.trim().is_empty() {
            errors.push(ValidationError::EmptyName);
        }
        if pipeline.jobs.is_empty() {
            errors.push(ValidationError::NoJobs);
        }

        for job in &pipeline.jobs {
            if job.steps.is_empty() && job.trigger.is_none() {
                errors.push(ValidationError::NoSteps {
                    job: job.name.clone(),
                });
            }

            if let Some(stage) = &job.stage {
                if !pipeline.stages.is_empty() && !pipeline.stages.contains(stage) {
                    errors.push(ValidationError::UndefinedStage {
                        job: job.name.clone(),
                        stage: stage.clone(),
                    });
                }
            }

            let mut reported = HashSet::new();
            for need in &job.needs {
                if !pipeline.jobs.contains(need) && reported.insert(need.as_str()) {
                    errors.push(ValidationError::UnknownNeed {
                        job: job.name.clone(),
                        need: need.clone(),
                    });
                }
            }

            if self.strict {
                self.validate_strict(job, &mut errors);
            }
        }

        errors.extend(
            find_cycles(pipeline)
                .into_iter()
                .map(|chain| ValidationError::Cycle { chain }),
        );

        errors
    }

    /// `Err(Error::Validation)` carrying every message when anything is wrong.
    pub fn check(&self, pipeline: &Pipeline) -> Result<()> {
        let errors = self.validate(pipeline);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(
                errors.iter().map(ToString::to_string).collect(),
            ))
        }
    }

    fn validate_strict(&self, job: &Job, errors: &mut Vec<ValidationError>) {
        let name = || job.name.clone();

        if !job.has_execution_target() {
            errors.push(ValidationError::NoRunner { job: name() });
        }
        if job.timeout_minutes < 0 {
            errors.push(ValidationError::InvalidJobTimeout { job: name() });
        }

        for (i, step) in job.steps.iter().enumerate() {
            if step.name.trim().is_empty() && step.action.is_empty() {
                errors.push(ValidationError::EmptyStep {
                    job: name(),
                    index: i + 1,
                });
            }
            if step.timeout_minutes < 0 {
                errors.push(ValidationError::InvalidStepTimeout {
                    job: name(),
                    index: i + 1,
                });
            }
        }

        if job.env.keys().any(|k| k.trim().is_empty()) {
            errors.push(ValidationError::EmptyEnvKey { job: name() });
        }
        if job.artifacts.as_ref().is_some_and(|a| a.paths.is_empty()) {
            errors.push(ValidationError::ArtifactsWithoutPaths { job: name() });
        }
        if job.cache.as_ref().is_some_and(|c| c.paths.is_empty()) {
            errors.push(ValidationError::CacheWithoutPaths { job: name() });
        }
    }
}

/// `needs` cycles, each as the chain `a -> b -> ... -> a` in traversal order
/// from the first job (in declaration order) that reaches it.
///
/// Every job is expanded at most once, so each cyclic component yields at
/// least one chain.
pub fn find_cycles(pipeline: &Pipeline) -> Vec<Vec<String>> {
    let mut search = CycleSearch {
        pipeline,
        done: HashSet::new(),
        seen: HashSet::new(),
        cycles: Vec::new(),
    };

    for job in &pipeline.jobs {
        let mut path = Vec::new();
        search.walk(&job.name, &mut path);
    }
    search.cycles
}

struct CycleSearch<'a> {
    pipeline: &'a Pipeline,
    /// Jobs whose dependencies are fully explored.
    done: HashSet<&'a str>,
    seen: HashSet<Vec<String>>,
    cycles: Vec<Vec<String>>,
}

impl<'a> CycleSearch<'a> {
    fn walk(&mut self, name: &'a str, path: &mut Vec<&'a str>) {
        if let Some(start) = path.iter().position(|n| *n == name) {
            let cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
            if self.seen.insert(canonical(&cycle)) {
                let mut chain = cycle;
                chain.push(name.to_string());
                self.cycles.push(chain);
            }
            return;
        }
        if self.done.contains(name) {
            return;
        }

        let pipeline = self.pipeline;
        let Some(job) = pipeline.jobs.get(name) else {
            return;
        };

        path.push(name);
        for need in &job.needs {
            self.walk(need, path);
        }
        path.pop();
        self.done.insert(name);
    }
}
/// Rotation of a cycle starting at its smallest member.
fn canonical(cycle: &[String]) -> Vec<String> {
    let start = cycle
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    cycle[start..]
        .iter()
        .chain(cycle[..start].iter())
        .cloned()
        .collect()
}
