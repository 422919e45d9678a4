//! Service controller for the execution (`geth`) and consensus (`story`) units.
//!
//! Operations on both services are issued one after the other. Whether a
//! failure on the first service stops the attempt on the second is decided
//! by the policy of the step the controller runs in.

use crate::command::{CommandSpec, OutputMode};
use crate::config::ServicesConfig;
use crate::runner::StepRun;

pub struct ServiceController<'c> {
    services: &'c ServicesConfig,
}

impl<'c> ServiceController<'c> {
    pub fn new(services: &'c ServicesConfig) -> Self {
        Self { services }
    }

    pub fn geth(&self) -> &'c str {
        &self.services.geth_unit
    }

    pub fn story(&self) -> &'c str {
        &self.services.story_unit
    }

    /// Units in the order they are started and stopped.
    pub fn units(&self) -> [&'c str; 2] {
        [self.geth(), self.story()]
    }

    pub fn start(&self, step: &mut StepRun<'_>, unit: &str) {
        step.run(systemctl("start", unit));
    }

    /// Returns whether the unit was stopped.
    pub fn stop(&self, step: &mut StepRun<'_>, unit: &str) -> bool {
        step.run(systemctl("stop", unit)).is_some()
    }

    /// Start a unit this step stopped, even after the step aborted.
    pub fn recover(&self, step: &mut StepRun<'_>, unit: &str) {
        step.run_recovery(systemctl("start", unit));
    }

    pub fn restart(&self, step: &mut StepRun<'_>, unit: &str) {
        step.run(systemctl("restart", unit));
    }

    pub fn enable(&self, step: &mut StepRun<'_>, unit: &str) {
        step.run(systemctl("enable", unit));
    }

    pub fn status(&self, step: &mut StepRun<'_>, unit: &str) {
        step.run(systemctl("status", unit));
    }

    pub fn daemon_reload(&self, step: &mut StepRun<'_>) {
        step.run(CommandSpec::new("systemctl").arg("daemon-reload").elevated());
    }

    pub fn start_all(&self, step: &mut StepRun<'_>) {
        for unit in self.units() {
            self.start(step, unit);
        }
    }

    pub fn stop_all(&self, step: &mut StepRun<'_>) {
        for unit in self.units() {
            self.stop(step, unit);
        }
    }

    pub fn status_all(&self, step: &mut StepRun<'_>) {
        for unit in self.units() {
            self.status(step, unit);
        }
    }

    /// Stream the unit's journal to the terminal until interrupted.
    pub fn follow_logs(&self, step: &mut StepRun<'_>, unit: &str) {
        step.run(
            CommandSpec::new("journalctl")
                .args(["-u", unit, "-f", "--no-hostname", "-o", "cat"])
                .elevated()
                .output(OutputMode::Inherit),
        );
    }
}

fn systemctl(verb: &str, unit: &str) -> CommandSpec {
    CommandSpec::new("systemctl").args([verb, unit]).elevated()
}
