//! Runner construction.

use gitci_core::Result;
use gitci_runner::{ContainerRunner, Runner, RunnerConfig, RunnerType, ShellRunner};

/// Builds a fresh runner for every job.
pub trait RunnerFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Runner>>;

    fn runner_type(&self) -> RunnerType;
}

/// Factory for the built-in backends, sharing one immutable config.
#[derive(Debug, Clone)]
pub struct DefaultRunnerFactory {
    kind: RunnerType,
    config: RunnerConfig,
}

impl DefaultRunnerFactory {
    pub fn new(kind: RunnerType, config: RunnerConfig) -> Self {
        Self { kind, config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }
}

impl RunnerFactory for DefaultRunnerFactory {
    fn create(&self) -> Result<Box<dyn Runner>> {
        match self.kind {
            RunnerType::Process => Ok(Box::new(ShellRunner::new(self.config.clone()))),
            RunnerType::Container => Ok(Box::new(ContainerRunner::new(self.config.clone())?)),
        }
    }

    fn runner_type(&self) -> RunnerType {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creates_requested_backend() {
        let factory = DefaultRunnerFactory::new(RunnerType::Process, RunnerConfig::default());
        assert_eq!(factory.create().unwrap().runner_type(), RunnerType::Process);

        let dry = RunnerConfig {
            dry_run: true,
            ..Default::default()
        };
        let factory = DefaultRunnerFactory::new(RunnerType::Container, dry);
        assert_eq!(factory.create().unwrap().runner_type(), RunnerType::Container);
        assert_eq!(factory.runner_type(), RunnerType::Container);
    }
}
