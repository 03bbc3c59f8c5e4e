//! Choosing which jobs of a pipeline to run.

use gitci_core::pipeline::{Job, Pipeline};
use gitci_core::{Error, Result};
use tracing::debug;

/// Match a job name against a filter pattern.
///
/// `foo*` matches by prefix, `*foo` by suffix, `*foo*` by substring and `*`
/// matches everything. Anything else must match exactly.
pub fn matches_pattern(name: &str, pattern: &str) -> bool {
    if pattern == name || pattern == "*" {
        return true;
    }
    let starts = pattern.starts_with('*');
    let ends = pattern.len() > 1 && pattern.ends_with('*');
    match (starts, ends) {
        (true, true) => name.contains(&pattern[1..pattern.len() - 1]),
        (true, false) => name.ends_with(&pattern[1..]),
        (false, true) => name.starts_with(&pattern[..pattern.len() - 1]),
        (false, false) => false,
    }
}

/// Job filters given on the command line.
#[derive(Debug, Clone, Default)]
pub struct JobSelector {
    job: Option<String>,
    stage: Option<String>,
    only: Vec<String>,
    except: Vec<String>,
}

impl JobSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select one job by name, or every job matching a pattern. Takes
    /// precedence over every other filter.
    pub fn job(mut self, job: impl Into<String>) -> Self {
        self.job = Some(job.into()).filter(|j: &String| !j.is_empty());
        self
    }

    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into()).filter(|s: &String| !s.is_empty());
        self
    }

    pub fn only(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.only = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn except(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.except = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Jobs to run, in declaration order.
    pub fn select<'a>(&self, pipeline: &'a Pipeline) -> Result<Vec<&'a Job>> {
        if let Some(filter) = &self.job {
            if let Some(job) = pipeline.jobs.get(filter) {
                return Ok(vec![job]);
            }
            let matched: Vec<&Job> = pipeline
                .jobs
                .iter()
                .filter(|j| matches_pattern(&j.name, filter))
                .collect();
            if matched.is_empty() {
                return Err(Error::NoJobsSelected(format!("job '{}' not found", filter)));
            }
            debug!(pattern = %filter, count = matched.len(), "Jobs matched by pattern");
            return Ok(matched);
        }

        let mut jobs: Vec<&Job> = pipeline.jobs.iter().collect();

        if let Some(stage) = &self.stage {
            jobs.retain(|j| j.stage.as_deref() == Some(stage.as_str()));
            if jobs.is_empty() {
                return Err(Error::NoJobsSelected(format!(
                    "no jobs found for stage '{}'",
                    stage
                )));
            }
        }

        if !self.only.is_empty() {
            jobs.retain(|j| self.only.iter().any(|p| matches_pattern(&j.name, p)));
        }
        if !self.except.is_empty() {
            jobs.retain(|j| !self.except.iter().any(|p| matches_pattern(&j.name, p)));
        }

        if jobs.is_empty() {
            return Err(Error::NoJobsSelected("no jobs to run".to_string()));
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gitci_core::pipeline::Step;

    fn pipeline() -> Pipeline {
        let job = |name: &str, stage: &str| {
            Job::new(name)
                .in_stage(stage)
                .with_step(Step::run("s", "true"))
        };
        Pipeline::new("ci")
            .with_job(job("build", "build"))
            .with_job(job("test-unit", "test"))
            .with_job(job("test-e2e", "test"))
            .with_job(job("deploy-staging", "deploy"))
    }

    fn names(jobs: &[&Job]) -> Vec<String> {
        jobs.iter().map(|j| j.name.clone()).collect()
    }

    #[test]
    fn test_wildcards() {
        assert!(matches_pattern("test-unit", "test*"));
        assert!(matches_pattern("test-unit", "*unit"));
        assert!(matches_pattern("test-unit", "*t-u*"));
        assert!(matches_pattern("anything", "*"));
        assert!(matches_pattern("exact", "exact"));
        assert!(!matches_pattern("test-unit", "unit*"));
        assert!(!matches_pattern("test-unit", "*test"));
        assert!(!matches_pattern("test-unit", "te?t-unit"));
    }

    #[test]
    fn test_everything_by_default() {
        let p = pipeline();
        let jobs = JobSelector::new().select(&p).unwrap();
        assert_eq!(names(&jobs), vec!["build", "test-unit", "test-e2e", "deploy-staging"]);
    }

    #[test]
    fn test_job_filter_exact_then_pattern() {
        let p = pipeline();
        let jobs = JobSelector::new().job("build").select(&p).unwrap();
        assert_eq!(names(&jobs), vec!["build"]);

        let jobs = JobSelector::new().job("test*").select(&p).unwrap();
        assert_eq!(names(&jobs), vec!["test-unit", "test-e2e"]);

        let err = JobSelector::new().job("release").select(&p).unwrap_err();
        assert!(matches!(err, Error::NoJobsSelected(_)));
    }

    #[test]
    fn test_job_filter_ignores_only_and_except() {
        let p = pipeline();
        let jobs = JobSelector::new()
            .job("build")
            .except(["build"])
            .select(&p)
            .unwrap();
        assert_eq!(names(&jobs), vec!["build"]);
    }

    #[test]
    fn test_stage_then_only_except() {
        let p = pipeline();
        let jobs = JobSelector::new().stage("test").select(&p).unwrap();
        assert_eq!(names(&jobs), vec!["test-unit", "test-e2e"]);

        let jobs = JobSelector::new()
            .stage("test")
            .except(["*e2e"])
            .select(&p)
            .unwrap();
        assert_eq!(names(&jobs), vec!["test-unit"]);

        let jobs = JobSelector::new().only(["deploy*", "build"]).select(&p).unwrap();
        assert_eq!(names(&jobs), vec!["build", "deploy-staging"]);

        assert!(JobSelector::new().stage("release").select(&p).is_err());
        assert!(JobSelector::new().except(["*"]).select(&p).is_err());
    }
}
