//! Action dispatcher: one CLI action token to one step or a fixed sequence.

use std::fmt;

use clap::ValueEnum;
use tracing::{info, warn};

use crate::runner::{Outcome, StepReport};
use crate::steps::{Provisioner, StepKind};

/// Steps a complete setup needs that `full_install` does not run.
pub const FULL_INSTALL_OMITS: [StepKind; 2] =
    [StepKind::DownloadGenesis, StepKind::ConfigurePeers];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum Action {
    InstallDependencies,
    InstallGo,
    CloneAndBuild,
    CreateDataDirectories,
    InitializeNode,
    DownloadGenesis,
    ConfigurePeers,
    ConfigureGasAndPrometheus,
    CreateService,
    SetupSnapshot,
    VerifyLogs,
    FullInstall,
    StartNode,
    StopNode,
    NodeStatus,
    UpdateNode,
    SyncStatus,
}

impl Action {
    /// Ordered steps this action runs.
    pub fn plan(self) -> Vec<StepKind> {
        match self {
            Action::InstallDependencies => vec![StepKind::InstallDependencies],
            Action::InstallGo => vec![StepKind::InstallGo],
            Action::CloneAndBuild => vec![StepKind::CloneAndBuild],
            Action::CreateDataDirectories => vec![StepKind::CreateDataDirectories],
            Action::InitializeNode => vec![StepKind::InitializeNode],
            Action::DownloadGenesis => vec![StepKind::DownloadGenesis],
            Action::ConfigurePeers => vec![StepKind::ConfigurePeers],
            Action::ConfigureGasAndPrometheus => vec![StepKind::ConfigureGasAndPrometheus],
            Action::CreateService => vec![StepKind::CreateService],
            Action::SetupSnapshot => vec![StepKind::SetupSnapshot],
            Action::VerifyLogs => vec![StepKind::VerifyLogs],
            Action::FullInstall => vec![
                StepKind::InstallDependencies,
                StepKind::InstallGo,
                StepKind::CloneAndBuild,
                StepKind::CreateDataDirectories,
                StepKind::InitializeNode,
                StepKind::ConfigureGasAndPrometheus,
                StepKind::CreateService,
                StepKind::SetupSnapshot,
            ],
            Action::StartNode => vec![StepKind::StartNode],
            Action::StopNode => vec![StepKind::StopNode],
            Action::NodeStatus => vec![StepKind::NodeStatus],
            Action::UpdateNode => vec![StepKind::UpdateNode],
            Action::SyncStatus => vec![StepKind::SyncStatus],
        }
    }

    pub fn name(self) -> String {
        self.to_possible_value()
            .map(|value| value.get_name().to_string())
            .unwrap_or_else(|| format!("{self:?}"))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[derive(Debug, Clone)]
pub struct ActionReport {
    pub action: Action,
    pub steps: Vec<StepReport>,
}

impl ActionReport {
    pub fn aborted(&self) -> bool {
        self.steps
            .iter()
            .any(|report| report.outcome() == Outcome::Failed)
    }

    pub fn outcome(&self) -> Outcome {
        if self.aborted() {
            Outcome::Failed
        } else if self
            .steps
            .iter()
            .any(|report| report.outcome() == Outcome::Partial)
        {
            Outcome::Partial
        } else {
            Outcome::Success
        }
    }

    pub fn summary_lines(&self) -> Vec<String> {
        self.steps.iter().map(StepReport::summary).collect()
    }
}

/// Run `action`. Composite actions stop early only when a step aborts.
pub fn dispatch(action: Action, provisioner: &mut Provisioner<'_>) -> ActionReport {
    let plan = action.plan();
    info!(
        target = "story_setup::dispatch",
        %action,
        steps = plan.len(),
        tcp_port = %provisioner.params().tcp_port,
        "dispatching action"
    );
    if action == Action::FullInstall {
        let omitted: Vec<&str> = FULL_INSTALL_OMITS.iter().map(|step| step.name()).collect();
        warn!(
            target = "story_setup::dispatch",
            omitted = %omitted.join(", "),
            "full_install does not download genesis/addrbook or configure peers; \
             run those actions separately"
        );
    }

    let mut steps = Vec::with_capacity(plan.len());
    for kind in plan {
        let report = provisioner.run_step(kind);
        let aborted = report.outcome() == Outcome::Failed;
        steps.push(report);
        if aborted && action == Action::FullInstall {
            warn!(
                target = "story_setup::dispatch",
                step = %kind,
                "stopping full_install after aborted step"
            );
            break;
        }
    }
    ActionReport { action, steps }
}
