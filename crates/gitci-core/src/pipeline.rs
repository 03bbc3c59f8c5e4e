//! Pipeline definition types.
//!
//! These types are the normalized, provider-agnostic form of a CI
//! configuration. Provider front ends produce them; the validator,
//! scheduler and runners only ever read them.

use crate::duration::parse_duration;
use crate::error::Error;
use schemars::JsonSchema;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

/// Environment variables, ordered by key.
pub type EnvVars = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Pipeline {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Provider the pipeline was parsed from (`github`, `gitlab`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Declared stage order. Empty when the provider has no stages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<String>,
    #[serde(default)]
    pub jobs: Jobs,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: EnvVars,
    #[serde(default)]
    pub defaults: Defaults,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a job, replacing any job with the same name.
    pub fn with_job(mut self, job: Job) -> Self {
        self.jobs.insert(job);
        self
    }

    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.get(name)
    }

    /// Parse a normalized pipeline from YAML. JSON input parses as well.
    pub fn from_yaml(content: &str) -> crate::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}

/// Pipeline-wide defaults inherited by jobs and steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Defaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

/// Jobs keyed by name, in declaration order.
///
/// Deserializes from a mapping and rejects duplicate keys. A job whose
/// `name` is empty takes its key as name.
#[derive(Debug, Clone, Default)]
pub struct Jobs(Vec<Job>);

impl Jobs {
    pub fn insert(&mut self, job: Job) {
        match self.0.iter_mut().find(|j| j.name == job.name) {
            Some(existing) => *existing = job,
            None => self.0.push(job),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Job> {
        self.0.iter().find(|j| j.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Job> {
        self.0.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|j| j.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a Jobs {
    type Item = &'a Job;
    type IntoIter = std::slice::Iter<'a, Job>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<Job> for Jobs {
    fn from_iter<I: IntoIterator<Item = Job>>(iter: I) -> Self {
        let mut jobs = Jobs::default();
        for job in iter {
            jobs.insert(job);
        }
        jobs
    }
}

impl Serialize for Jobs {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for job in &self.0 {
            map.serialize_entry(&job.name, job)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Jobs {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct JobsVisitor;

        impl<'de> Visitor<'de> for JobsVisitor {
            type Value = Jobs;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of job names to jobs")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Jobs, A::Error> {
                let mut seen = HashSet::new();
                let mut jobs = Vec::new();
                while let Some((key, mut job)) = access.next_entry::<String, Job>()? {
                    if !seen.insert(key.clone()) {
                        return Err(serde::de::Error::custom(format!(
                            "duplicate job name: {}",
                            key
                        )));
                    }
                    if job.name.is_empty() {
                        job.name = key;
                    }
                    jobs.push(job);
                }
                Ok(Jobs(jobs))
            }
        }

        deserializer.deserialize_map(JobsVisitor)
    }
}

impl JsonSchema for Jobs {
    fn schema_name() -> String {
        "Jobs".to_string()
    }

    fn json_schema(generator: &mut schemars::r#gen::SchemaGenerator) -> schemars::schema::Schema {
        <BTreeMap<String, Job>>::json_schema(generator)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Jobs this job depends on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runs_on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerSpec>,
    /// Service containers by name. Listed, never started.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, ServiceSpec>,
    /// Runner tags (GitLab style execution target).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: EnvVars,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// 0 means unbounded.
    #[serde(default)]
    pub timeout_minutes: i64,
    /// Downstream pipeline triggered by this job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheSpec>,
}

impl Job {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_needs(mut self, needs: &[&str]) -> Self {
        self.needs = needs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn in_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Whether the job names anything to run on.
    pub fn has_execution_target(&self) -> bool {
        self.runs_on.as_deref().is_some_and(|s| !s.is_empty())
            || self.image.as_deref().is_some_and(|s| !s.is_empty())
            || self.container.is_some()
            || !self.tags.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: EnvVars,
    /// `src:dst` or `src:dst:ro` bind specifications.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ServiceSpec {
    pub image: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: EnvVars,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CacheSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub paths: Vec<String>,
}

/// What a step executes. Exactly one directive per step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Shell command text.
    Run(String),
    /// Reference to an external action such as `actions/checkout@v4`.
    Uses { reference: String, with: EnvVars },
    /// Script lines run as one shell script.
    Script(Vec<String>),
}

impl StepAction {
    /// Shell text for `Run` and `Script` directives.
    pub fn command(&self) -> Option<String> {
        match self {
            StepAction::Run(command) => Some(command.clone()),
            StepAction::Script(lines) => Some(lines.join("\n")),
            StepAction::Uses { .. } => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            StepAction::Run(command) => command.trim().is_empty(),
            StepAction::Script(lines) => lines.iter().all(|l| l.trim().is_empty()),
            StepAction::Uses { reference, .. } => reference.trim().is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStep", into = "RawStep")]
pub struct Step {
    pub name: String,
    pub id: Option<String>,
    pub action: StepAction,
    pub env: EnvVars,
    pub working_directory: Option<String>,
    pub shell: Option<String>,
    /// `if` guard.
    pub condition: Option<String>,
    pub continue_on_error: bool,
    pub retry: Option<RetryPolicy>,
    /// 0 means unbounded.
    pub timeout_minutes: i64,
}

impl Step {
    pub fn new(name: impl Into<String>, action: StepAction) -> Self {
        Self {
            name: name.into(),
            id: None,
            action,
            env: EnvVars::new(),
            working_directory: None,
            shell: None,
            condition: None,
            continue_on_error: false,
            retry: None,
            timeout_minutes: 0,
        }
    }

    pub fn run(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(name, StepAction::Run(command.into()))
    }

    pub fn uses(name: impl Into<String>, reference: impl Into<String>) -> Self {
        Self::new(
            name,
            StepAction::Uses {
                reference: reference.into(),
                with: EnvVars::new(),
            },
        )
    }

    pub fn script(name: impl Into<String>, lines: &[&str]) -> Self {
        Self::new(
            name,
            StepAction::Script(lines.iter().map(|l| l.to_string()).collect()),
        )
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn continuing_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    /// Step name, falling back to the directive for anonymous steps.
    pub fn display_name(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        match &self.action {
            StepAction::Uses { reference, .. } => reference.clone(),
            other => other
                .command()
                .and_then(|c| c.lines().next().map(str::to_string))
                .unwrap_or_default(),
        }
    }
}

/// Wire form of a step, with the directive spread over optional fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
struct RawStep {
    #[serde(default)]
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    run: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uses: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    with: EnvVars,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    script: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    env: EnvVars,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    working_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    shell: Option<String>,
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    condition: Option<String>,
    #[serde(default)]
    continue_on_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry: Option<RetryPolicy>,
    #[serde(default)]
    timeout_minutes: i64,
}

impl TryFrom<RawStep> for Step {
    type Error = Error;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        let action = match (raw.run, raw.uses, raw.script) {
            (Some(run), None, None) => StepAction::Run(run),
            (None, Some(reference), None) => StepAction::Uses {
                reference,
                with: raw.with,
            },
            (None, None, Some(lines)) => StepAction::Script(lines),
            (None, None, None) => {
                return Err(Error::InvalidPipeline(format!(
                    "step '{}' has no run, uses or script directive",
                    raw.name
                )));
            }
            _ => {
                return Err(Error::InvalidPipeline(format!(
                    "step '{}' declares more than one of run, uses and script",
                    raw.name
                )));
            }
        };

        Ok(Step {
            name: raw.name,
            id: raw.id,
            action,
            env: raw.env,
            working_directory: raw.working_directory,
            shell: raw.shell,
            condition: raw.condition,
            continue_on_error: raw.continue_on_error,
            retry: raw.retry,
            timeout_minutes: raw.timeout_minutes,
        })
    }
}

impl From<Step> for RawStep {
    fn from(step: Step) -> Self {
        let mut raw = RawStep {
            name: step.name,
            id: step.id,
            env: step.env,
            working_directory: step.working_directory,
            shell: step.shell,
            condition: step.condition,
            continue_on_error: step.continue_on_error,
            retry: step.retry,
            timeout_minutes: step.timeout_minutes,
            ..Default::default()
        };
        match step.action {
            StepAction::Run(command) => raw.run = Some(command),
            StepAction::Uses { reference, with } => {
                raw.uses = Some(reference);
                raw.with = with;
            }
            StepAction::Script(lines) => raw.script = Some(lines),
        }
        raw
    }
}

impl JsonSchema for Step {
    fn schema_name() -> String {
        "Step".to_string()
    }

    fn json_schema(generator: &mut schemars::r#gen::SchemaGenerator) -> schemars::schema::Schema {
        RawStep::json_schema(generator)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Wait before each retry, e.g. `2s` or `1m30s`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<String>,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Failure kinds that are retried. Empty retries any failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<String>,
    /// Exit codes that are retried in addition to `conditions`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exit_codes: Vec<i32>,
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay: None,
            backoff: BackoffStrategy::default(),
            conditions: Vec::new(),
            exit_codes: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: impl Into<String>) -> Self {
        self.delay = Some(delay.into());
        self
    }

    /// Total tries, never less than one.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Parsed base delay. Unparseable delays mean no wait.
    pub fn delay(&self) -> Duration {
        self.delay
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Constant,
    Linear,
    Exponential,
}
