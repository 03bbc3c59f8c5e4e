//! Step `if` guard evaluation.

use gitci_core::pipeline::EnvVars;

/// Decides whether a guarded step runs.
pub trait ConditionEvaluator: Send + Sync {
    fn should_run(&self, condition: Option<&str>, env: &EnvVars) -> bool;
}

/// Recognizes only the status-function literals.
///
/// `always()` and `success()` run, `failure()` and `cancelled()` never do,
/// and any other guard (including none) runs. Steps only execute while the
/// job is still succeeding, so `success()` is always true here.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiteralConditions;

impl ConditionEvaluator for LiteralConditions {
    fn should_run(&self, condition: Option<&str>, _env: &EnvVars) -> bool {
        let Some(condition) = condition else {
            return true;
        };
        !matches!(condition.trim(), "failure()" | "cancelled()")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(condition: Option<&str>) -> bool {
        LiteralConditions.should_run(condition, &EnvVars::new())
    }

    #[test]
    fn test_literal_vocabulary() {
        assert!(eval(Some("always()")));
        assert!(eval(Some("success()")));
        assert!(!eval(Some("failure()")));
        assert!(!eval(Some("cancelled()")));
    }

    #[test]
    fn test_unknown_and_empty_guards_run() {
        assert!(eval(None));
        assert!(eval(Some("")));
        assert!(eval(Some("github.ref == 'refs/heads/main'")));
        assert!(eval(Some("${{ matrix.os == 'linux' }}")));
    }
}
