//! Command runner: executes one step's actions and accumulates its report.

use std::fmt;

use tracing::{error, info, warn};

use crate::command::{CommandFailure, CommandOutput, Invocation, OutputMode};
use crate::errors::SetupResult;
use crate::host::Host;
use crate::steps::StepKind;

/// What a step does after one of its actions fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Report the failure and keep going.
    BestEffort,
    /// Report the failure and skip the rest of the step.
    FailFast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Partial,
    Failed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Success => "ok",
            Outcome::Partial => "partial",
            Outcome::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone)]
pub struct StepReport {
    pub step: StepKind,
    pub policy: FailurePolicy,
    pub completed: Vec<String>,
    pub failures: Vec<CommandFailure>,
    pub aborted: bool,
}

impl StepReport {
    pub fn outcome(&self) -> Outcome {
        if self.aborted {
            Outcome::Failed
        } else if self.failures.is_empty() {
            Outcome::Success
        } else {
            Outcome::Partial
        }
    }

    pub fn summary(&self) -> String {
        match self.outcome() {
            Outcome::Success => format!("{}: ok ({} action(s))", self.step, self.completed.len()),
            Outcome::Partial => format!(
                "{}: partial ({} action(s) completed, {} failure(s))",
                self.step,
                self.completed.len(),
                self.failures.len()
            ),
            Outcome::Failed => format!(
                "{}: failed, aborted after {} action(s)",
                self.step,
                self.completed.len()
            ),
        }
    }
}

/// One step in progress. Holds the host for the step's duration.
pub struct StepRun<'h> {
    host: &'h mut dyn Host,
    report: StepReport,
}

impl<'h> StepRun<'h> {
    pub fn new(host: &'h mut dyn Host, step: StepKind, policy: FailurePolicy) -> Self {
        info!(target = "story_setup::runner", %step, ?policy, "starting step");
        Self {
            host,
            report: StepReport {
                step,
                policy,
                completed: Vec::new(),
                failures: Vec::new(),
                aborted: false,
            },
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.host.is_dry_run()
    }

    /// Run an invocation. Failures are printed and recorded, never returned.
    pub fn run(&mut self, invocation: impl Into<Invocation>) -> Option<CommandOutput> {
        if self.report.aborted {
            return None;
        }
        let invocation = invocation.into();
        let rendered = self.host.render(&invocation);
        match self.host.run(&invocation) {
            Ok(output) => {
                if invocation.output_mode() == OutputMode::Capture && !output.stdout.is_empty() {
                    print!("{}", output.stdout);
                    if !output.stdout.ends_with('\n') {
                        println!();
                    }
                }
                self.report.completed.push(rendered);
                Some(output)
            }
            Err(failure) => {
                self.fail(failure);
                None
            }
        }
    }

    /// Run an informational command whose failure never aborts the step.
    pub fn run_advisory(&mut self, invocation: impl Into<Invocation>) -> Option<CommandOutput> {
        let policy = self.report.policy;
        self.report.policy = FailurePolicy::BestEffort;
        let output = self.run(invocation);
        self.report.policy = policy;
        output
    }

    /// Run a compensating action. It runs even after the step aborted, and
    /// its own failure is recorded without changing the abort state.
    pub fn run_recovery(&mut self, invocation: impl Into<Invocation>) -> Option<CommandOutput> {
        let aborted = self.report.aborted;
        let policy = self.report.policy;
        self.report.aborted = false;
        self.report.policy = FailurePolicy::BestEffort;
        let output = self.run(invocation);
        self.report.aborted = aborted;
        self.report.policy = policy;
        output
    }

    /// Run a filesystem action described by `description`.
    pub fn perform<T>(
        &mut self,
        description: impl Into<String>,
        action: impl FnOnce(&mut dyn Host) -> SetupResult<T>,
    ) -> Option<T> {
        if self.report.aborted {
            return None;
        }
        let description = description.into();
        match action(&mut *self.host) {
            Ok(value) => {
                self.report.completed.push(description);
                Some(value)
            }
            Err(err) => {
                self.fail(CommandFailure::new(description, err.to_string()));
                None
            }
        }
    }

    /// Record a failure detected by the step itself.
    pub fn fail(&mut self, failure: CommandFailure) {
        error!(
            target = "story_setup::runner",
            step = %self.report.step,
            command = %failure.command,
            reason = %failure.reason,
            "action failed"
        );
        println!("Error executing command: {}", failure.command);
        println!("{}", failure.reason);
        if !failure.output.trim().is_empty() {
            println!("{}", failure.output.trim_end());
        }
        if self.report.policy == FailurePolicy::FailFast {
            warn!(
                target = "story_setup::runner",
                step = %self.report.step,
                "fail-fast step aborted"
            );
            self.report.aborted = true;
        }
        self.report.failures.push(failure);
    }

    pub fn finish(self) -> StepReport {
        info!(
            target = "story_setup::runner",
            step = %self.report.step,
            outcome = %self.report.outcome(),
            completed = self.report.completed.len(),
            failures = self.report.failures.len(),
            "step finished"
        );
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandSpec;
    use crate::host::testing::RecordingHost;

    fn three_commands(step: &mut StepRun<'_>) {
        step.run(CommandSpec::new("ufw").args(["allow", "to", "any", "port", "26656"]));
        step.run(CommandSpec::new("ufw").args(["allow", "to", "any", "port", "30303"]));
        step.run(CommandSpec::new("ufw").arg("reload"));
    }

    #[test]
    fn best_effort_continues_past_a_failing_command() {
        let mut host = RecordingHost::new().fail_on("26656");
        let mut step = StepRun::new(
            &mut host,
            StepKind::InstallDependencies,
            FailurePolicy::BestEffort,
        );
        three_commands(&mut step);
        let report = step.finish();

        assert_eq!(report.outcome(), Outcome::Partial);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.completed.len(), 2);
        assert_eq!(
            host.commands(),
            vec![
                "ufw allow to any port 26656",
                "ufw allow to any port 30303",
                "ufw reload",
            ]
        );
    }

    #[test]
    fn fail_fast_skips_remaining_actions() {
        let mut host = RecordingHost::new().fail_on("26656");
        let mut step = StepRun::new(&mut host, StepKind::SetupSnapshot, FailurePolicy::FailFast);
        three_commands(&mut step);
        let created = step.perform("create directory /tmp/x", |host| {
            host.create_dir_all(std::path::Path::new("/tmp/x"))
        });
        let report = step.finish();

        assert!(created.is_none());
        assert_eq!(report.outcome(), Outcome::Failed);
        assert!(report.completed.is_empty());
        assert_eq!(host.commands(), vec!["ufw allow to any port 26656"]);
        assert!(host.dirs.is_empty());
    }

    #[test]
    fn recovery_runs_after_an_abort_without_clearing_it() {
        let mut host = RecordingHost::new().fail_on("stop story");
        let mut step = StepRun::new(&mut host, StepKind::SetupSnapshot, FailurePolicy::FailFast);
        step.run(CommandSpec::new("systemctl").args(["stop", "story"]));
        step.run(CommandSpec::new("systemctl").args(["stop", "geth"]));
        let recovered = step.run_recovery(CommandSpec::new("systemctl").args(["start", "geth"]));
        let report = step.finish();

        assert!(recovered.is_some());
        assert_eq!(report.outcome(), Outcome::Failed);
        assert_eq!(report.completed, vec!["systemctl start geth"]);
        assert_eq!(
            host.commands(),
            vec!["systemctl stop story", "systemctl start geth"]
        );
    }

    #[test]
    fn clean_step_reports_success() {
        let mut host = RecordingHost::new();
        let mut step = StepRun::new(&mut host, StepKind::StartNode, FailurePolicy::BestEffort);
        three_commands(&mut step);
        let report = step.finish();
        assert_eq!(report.outcome(), Outcome::Success);
        assert_eq!(report.summary(), "start_node: ok (3 action(s))");
    }
}
