//! POSIX script generation for container jobs.
//!
//! A container job runs as a single `/bin/sh` script. Each step is wrapped
//! in a subshell so its exports and `cd` do not leak into later steps.

use gitci_core::pipeline::{Job, Step, StepAction};
use std::fmt::Write;

const RULE_WIDTH: usize = 60;

/// Quote `value` for a POSIX shell using single quotes.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Render the script for `job`.
///
/// `should_run` decides each step's `if` guard; steps it rejects are
/// replaced by a skip marker.
pub fn job_script(job: &Job, verbose: bool, should_run: impl Fn(&Step) -> bool) -> String {
    let mut script = String::new();
    let total = job.steps.len();

    script.push_str("#!/bin/sh\n");
    script.push_str("set -e\n");
    if verbose {
        script.push_str("set -x\n");
    }
    script.push('\n');
    script.push_str("echo 'Setting up environment...'\n");

    for (i, step) in job.steps.iter().enumerate() {
        let name = step.display_name();
        script.push('\n');
        script.push_str("echo ''\n");
        let _ = writeln!(
            script,
            "echo {}",
            shell_quote(&format!("[{}/{}] {}", i + 1, total, name))
        );
        let _ = writeln!(script, "echo '{}'", "-".repeat(RULE_WIDTH));

        if !should_run(step) {
            let _ = writeln!(
                script,
                "echo {}",
                shell_quote(&format!("Skipping step: {} (condition not met)", name))
            );
            continue;
        }

        let command = match &step.action {
            StepAction::Uses { reference, .. } => {
                let _ = writeln!(
                    script,
                    "echo {}",
                    shell_quote(&format!(
                        "Skipping action: {} (not supported in container runner)",
                        reference
                    ))
                );
                continue;
            }
            action => match action.command() {
                Some(command) if !command.trim().is_empty() => command,
                _ => continue,
            },
        };

        if step.continue_on_error {
            script.push_str("set +e\n");
        }

        script.push_str("(\n");
        script.push_str("set -e\n");
        if let Some(dir) = step.working_directory.as_deref().filter(|d| !d.is_empty()) {
            let _ = writeln!(script, "cd {}", shell_quote(dir));
        }
        for (key, value) in &step.env {
            let _ = writeln!(script, "export {}={}", key, shell_quote(value));
        }
        script.push_str(&command);
        if !command.ends_with('\n') {
            script.push('\n');
        }
        script.push_str(")\n");

        if step.continue_on_error {
            script.push_str("status=$?\n");
            script.push_str("set -e\n");
            let _ = writeln!(
                script,
                "if [ \"$status\" -ne 0 ]; then echo {}\"$status\"{}; fi",
                shell_quote(&format!("Step '{}' failed with exit code ", name)),
                shell_quote(" (continuing)")
            );
        }

        script.push_str("echo 'Step completed'\n");
    }

    script.push('\n');
    script.push_str("echo ''\n");
    script.push_str("echo 'All steps completed successfully!'\n");
    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{ConditionEvaluator, LiteralConditions};
    use gitci_core::pipeline::EnvVars;

    fn render(job: &Job) -> String {
        job_script(job, false, |step| {
            LiteralConditions.should_run(step.condition.as_deref(), &EnvVars::new())
        })
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_header_and_markers() {
        let job = Job::new("build")
            .with_step(Step::run("compile", "make"))
            .with_step(Step::run("test", "make test"));
        let script = render(&job);

        assert!(script.starts_with("#!/bin/sh\nset -e\n"));
        assert!(!script.contains("set -x"));
        assert!(script.contains("echo '[1/2] compile'"));
        assert!(script.contains("echo '[2/2] test'"));
        assert!(script.contains(&"-".repeat(60)));
        assert!(script.trim_end().ends_with("echo 'All steps completed successfully!'"));

        let verbose = job_script(&job, true, |_| true);
        assert!(verbose.contains("set -x\n"));
    }

    #[test]
    fn test_step_scope_is_a_subshell() {
        let mut step = Step::run("deploy", "./deploy.sh").with_env("TARGET", "prod's");
        step.working_directory = Some("infra".to_string());
        let script = render(&Job::new("deploy").with_step(step));

        let expected = "(\nset -e\ncd 'infra'\nexport TARGET='prod'\\''s'\n./deploy.sh\n)\necho 'Step completed'\n";
        assert!(script.contains(expected), "script was:\n{}", script);
    }

    #[test]
    fn test_continue_on_error_tolerates_whole_step() {
        let job = Job::new("lint").with_step(Step::run("lint", "false\necho never").continuing_on_error());
        let script = render(&job);

        assert!(script.contains("set +e\n(\nset -e\nfalse\necho never\n)\nstatus=$?\nset -e\n"));
        assert!(script.contains("(continuing)"));
    }

    #[test]
    fn test_actions_and_guards_are_skipped() {
        let job = Job::new("build")
            .with_step(Step::uses("checkout", "actions/checkout@v4"))
            .with_step(Step::run("notify", "curl hook").with_condition("failure()"))
            .with_step(Step::script("lines", &["echo a", "echo b"]));
        let script = render(&job);

        assert!(script.contains("Skipping action: actions/checkout@v4"));
        assert!(script.contains("Skipping step: notify (condition not met)"));
        assert!(!script.contains("curl hook"));
        assert!(script.contains("echo a\necho b\n)"));
    }
}
