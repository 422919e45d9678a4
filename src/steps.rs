//! Provisioning step catalog.
//!
//! Each step issues a fixed sequence of actions through a [`StepRun`]. Steps
//! do not check that earlier lifecycle stages were reached; running a step
//! out of order fails at the first action that needs a missing path or
//! binary.

use std::fmt;
use std::path::Path;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::command::{CommandFailure, CommandSpec, Invocation, OutputMode};
use crate::config::{Layout, SetupConfig};
use crate::errors::{SetupError, SetupResult};
use crate::host::Host;
use crate::patch::{self, Substitution};
use crate::runner::{FailurePolicy, Outcome, StepReport, StepRun};
use crate::service::ServiceController;
use crate::units;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
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
    StartNode,
    StopNode,
    NodeStatus,
    UpdateNode,
    SyncStatus,
}

impl StepKind {
    pub fn name(self) -> &'static str {
        match self {
            StepKind::InstallDependencies => "install_dependencies",
            StepKind::InstallGo => "install_go",
            StepKind::CloneAndBuild => "clone_and_build",
            StepKind::CreateDataDirectories => "create_data_directories",
            StepKind::InitializeNode => "initialize_node",
            StepKind::DownloadGenesis => "download_genesis",
            StepKind::ConfigurePeers => "configure_peers",
            StepKind::ConfigureGasAndPrometheus => "configure_gas_and_prometheus",
            StepKind::CreateService => "create_service",
            StepKind::SetupSnapshot => "setup_snapshot",
            StepKind::VerifyLogs => "verify_logs",
            StepKind::StartNode => "start_node",
            StepKind::StopNode => "stop_node",
            StepKind::NodeStatus => "node_status",
            StepKind::UpdateNode => "update_node",
            StepKind::SyncStatus => "sync_status",
        }
    }

    /// Steps that destroy or replace node state stop at their first failure.
    pub fn default_policy(self) -> FailurePolicy {
        match self {
            StepKind::SetupSnapshot | StepKind::UpdateNode => FailurePolicy::FailFast,
            _ => FailurePolicy::BestEffort,
        }
    }

    /// Lifecycle stage a successful run of this step establishes.
    pub fn produces(self) -> Option<LifecycleStage> {
        match self {
            StepKind::InstallDependencies => Some(LifecycleStage::DependenciesInstalled),
            StepKind::InstallGo => Some(LifecycleStage::ToolchainReady),
            StepKind::CloneAndBuild => Some(LifecycleStage::BinariesBuilt),
            StepKind::CreateDataDirectories => Some(LifecycleStage::DirectoriesReady),
            StepKind::InitializeNode => Some(LifecycleStage::NodeInitialized),
            StepKind::DownloadGenesis
            | StepKind::ConfigurePeers
            | StepKind::ConfigureGasAndPrometheus => Some(LifecycleStage::Configured),
            StepKind::CreateService | StepKind::StartNode | StepKind::UpdateNode => {
                Some(LifecycleStage::ServiceRunning)
            }
            StepKind::SetupSnapshot => Some(LifecycleStage::Synced),
            StepKind::VerifyLogs
            | StepKind::StopNode
            | StepKind::NodeStatus
            | StepKind::SyncStatus => None,
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The implicit node lifecycle. Informational only; never enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleStage {
    Absent,
    DependenciesInstalled,
    ToolchainReady,
    BinariesBuilt,
    DirectoriesReady,
    NodeInitialized,
    Configured,
    ServiceRunning,
    Synced,
}

/// Operator-supplied parameters of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionParams {
    pub moniker: String,
    /// Accepted for compatibility; no step reads it.
    pub tcp_port: String,
    pub story_version: String,
    pub geth_version: String,
    pub go_version: String,
}

impl Default for ActionParams {
    fn default() -> Self {
        use crate::config::{
            DEFAULT_GETH_VERSION, DEFAULT_GO_VERSION, DEFAULT_MONIKER, DEFAULT_STORY_VERSION,
            DEFAULT_TCP_PORT,
        };
        Self {
            moniker: DEFAULT_MONIKER.to_string(),
            tcp_port: DEFAULT_TCP_PORT.to_string(),
            story_version: DEFAULT_STORY_VERSION.to_string(),
            geth_version: DEFAULT_GETH_VERSION.to_string(),
            go_version: DEFAULT_GO_VERSION.to_string(),
        }
    }
}

struct StepEnv {
    config: SetupConfig,
    layout: Layout,
    params: ActionParams,
}

pub struct Provisioner<'h> {
    host: &'h mut dyn Host,
    env: StepEnv,
    fail_fast: bool,
}

impl<'h> Provisioner<'h> {
    pub fn new(
        host: &'h mut dyn Host,
        config: SetupConfig,
        layout: Layout,
        params: ActionParams,
    ) -> Self {
        Self {
            host,
            env: StepEnv {
                config,
                layout,
                params,
            },
            fail_fast: false,
        }
    }

    /// Force fail-fast on every step, not only the destructive ones.
    pub fn fail_fast(mut self, enabled: bool) -> Self {
        self.fail_fast = enabled;
        self
    }

    pub fn params(&self) -> &ActionParams {
        &self.env.params
    }

    pub fn run_step(&mut self, kind: StepKind) -> StepReport {
        let policy = if self.fail_fast {
            FailurePolicy::FailFast
        } else {
            kind.default_policy()
        };
        let env = &self.env;
        let mut step = StepRun::new(&mut *self.host, kind, policy);
        match kind {
            StepKind::InstallDependencies => install_dependencies(&mut step, env),
            StepKind::InstallGo => install_go(&mut step, env),
            StepKind::CloneAndBuild => clone_and_build(&mut step, env),
            StepKind::CreateDataDirectories => create_data_directories(&mut step, env),
            StepKind::InitializeNode => initialize_node(&mut step, env),
            StepKind::DownloadGenesis => download_genesis(&mut step, env),
            StepKind::ConfigurePeers => configure_peers(&mut step, env),
            StepKind::ConfigureGasAndPrometheus => configure_gas_and_prometheus(&mut step, env),
            StepKind::CreateService => create_service(&mut step, env),
            StepKind::SetupSnapshot => setup_snapshot(&mut step, env),
            StepKind::VerifyLogs => verify_logs(&mut step, env),
            StepKind::StartNode => controller(env).start_all(&mut step),
            StepKind::StopNode => controller(env).stop_all(&mut step),
            StepKind::NodeStatus => controller(env).status_all(&mut step),
            StepKind::UpdateNode => update_node(&mut step, env),
            StepKind::SyncStatus => sync_status(&mut step),
        }
        let report = step.finish();
        if report.outcome() == Outcome::Success {
            if let Some(stage) = kind.produces() {
                debug!(
                    target = "story_setup::steps",
                    step = %kind,
                    ?stage,
                    "lifecycle stage reached"
                );
            }
        }
        report
    }
}

fn controller(env: &StepEnv) -> ServiceController<'_> {
    ServiceController::new(&env.config.services)
}

fn install_dependencies(step: &mut StepRun<'_>, env: &StepEnv) {
    println!("Installing dependencies...");
    step.run(CommandSpec::new("apt").arg("update").elevated());
    step.run(
        CommandSpec::new("apt")
            .arg("install")
            .args(&env.config.packages)
            .arg("-y")
            .elevated(),
    );

    println!("Configuring firewall for the consensus and execution client ports...");
    for port in &env.config.firewall_ports {
        step.run(
            CommandSpec::new("ufw")
                .args(["allow", "to", "any", "port"])
                .arg(port.to_string())
                .elevated(),
        );
    }
    step.run(CommandSpec::new("ufw").arg("reload").elevated());
}

fn install_go(step: &mut StepRun<'_>, env: &StepEnv) {
    let StepEnv {
        config,
        layout,
        params,
    } = env;
    println!("Installing Go {}...", params.go_version);
    let archive = format!("go{}.linux-amd64.tar.gz", params.go_version);
    let archive_path = layout.workdir.join(&archive);
    let url = format!(
        "{}/{archive}",
        config.sources.go_download_base.trim_end_matches('/')
    );

    step.run(CommandSpec::new("wget").arg("-O").path_arg(&archive_path).arg(url));
    let removed = step
        .run(
            CommandSpec::new("rm")
                .arg("-rf")
                .path_arg(&layout.go_root)
                .elevated(),
        )
        .is_some();
    if removed {
        step.run(
            CommandSpec::new("tar")
                .arg("-C")
                .path_arg(&config.paths.go_install_root)
                .arg("-xzf")
                .path_arg(&archive_path)
                .elevated(),
        );
    } else {
        warn!(
            target = "story_setup::steps",
            go_root = %layout.go_root.display(),
            "old Go toolchain not removed; skipping extraction"
        );
    }

    println!("Adding Go binary to PATH...");
    let export = format!("export PATH=$PATH:{}", layout.go_bin.display());
    ensure_profile_line(step, &layout.profile, &export);
    let go_bin = layout.go_bin.clone();
    step.perform(format!("prepend {} to PATH", go_bin.display()), |host| {
        host.prepend_search_path(&go_bin);
        Ok(())
    });
}

/// Append `line` to the profile unless an identical line is already there.
fn ensure_profile_line(step: &mut StepRun<'_>, profile: &Path, line: &str) {
    let Some(existing) = step.perform(format!("read {}", profile.display()), |host| {
        host.read_to_string(profile)
    }) else {
        return;
    };
    let present = existing
        .as_deref()
        .map(|contents| contents.lines().any(|candidate| candidate.trim() == line))
        .unwrap_or(false);
    if present {
        info!(
            target = "story_setup::steps",
            profile = %profile.display(),
            "PATH export already present"
        );
        return;
    }
    step.perform(format!("append `{line}` to {}", profile.display()), |host| {
        host.append_line(profile, line)
    });
}

struct SourceBuild<'a> {
    label: &'a str,
    repo: &'a str,
    checkout: &'a Path,
    version: &'a str,
    build: CommandSpec,
    artifact: &'a Path,
}

fn clone_and_build(step: &mut StepRun<'_>, env: &StepEnv) {
    let StepEnv {
        config,
        layout,
        params,
    } = env;

    let story = SourceBuild {
        label: "Story",
        repo: &config.sources.story_repo,
        checkout: &layout.story_checkout,
        version: &params.story_version,
        build: CommandSpec::new("go").args(["build", "-o", "story", "./client"]),
        artifact: Path::new("story"),
    };
    build_from_source(step, story, &layout.bin_dir);

    let geth = SourceBuild {
        label: "Story Geth",
        repo: &config.sources.geth_repo,
        checkout: &layout.geth_checkout,
        version: &params.geth_version,
        build: CommandSpec::new("make").arg("geth"),
        artifact: Path::new("build/bin/geth"),
    };
    build_from_source(step, geth, &layout.bin_dir);
}

fn build_from_source(step: &mut StepRun<'_>, source: SourceBuild<'_>, bin_dir: &Path) {
    println!(
        "Cloning {} repository and building binaries...",
        source.label
    );
    fresh_checkout(step, source.repo, source.checkout, Some(source.version));
    step.run(
        source
            .build
            .current_dir(source.checkout)
            .output(OutputMode::Inherit),
    );
    install_binary(step, &source.checkout.join(source.artifact), bin_dir);
}

/// Delete any previous clone, clone again, and optionally check out `version`.
fn fresh_checkout(step: &mut StepRun<'_>, repo: &str, checkout: &Path, version: Option<&str>) {
    step.perform(format!("remove directory {}", checkout.display()), |host| {
        host.remove_dir_all(checkout)
    });
    step.run(CommandSpec::new("git").arg("clone").arg(repo).path_arg(checkout));
    if let Some(version) = version {
        step.run(
            CommandSpec::new("git")
                .args(["checkout", version])
                .current_dir(checkout),
        );
    }
}

fn install_binary(step: &mut StepRun<'_>, artifact: &Path, bin_dir: &Path) {
    step.run(
        CommandSpec::new("cp")
            .path_arg(artifact)
            .path_arg(bin_dir)
            .elevated(),
    );
}

fn create_data_directories(step: &mut StepRun<'_>, env: &StepEnv) {
    println!("Creating directories for Story and Story Geth data...");
    for (label, dir) in [
        ("Story", &env.layout.story_dir),
        ("Story Geth", &env.layout.geth_dir),
    ] {
        if step
            .perform(format!("create directory {}", dir.display()), |host| {
                host.create_dir_all(dir)
            })
            .is_some()
        {
            info!(
                target = "story_setup::steps",
                path = %dir.display(),
                "{label} data directory ready"
            );
        }
    }
}

fn initialize_node(step: &mut StepRun<'_>, env: &StepEnv) {
    let moniker = &env.params.moniker;
    println!("Initializing the Story node with moniker '{moniker}'...");
    step.run(init_command(moniker, &env.config.network));
}

pub(crate) fn init_command(moniker: &str, network: &str) -> CommandSpec {
    CommandSpec::new("story").args(["init", "--moniker", moniker, "--network", network])
}

fn download_genesis(step: &mut StepRun<'_>, env: &StepEnv) {
    println!("Downloading genesis file and addrbook...");
    let downloads = &env.config.downloads;
    for (target, url) in [
        (&env.layout.genesis, &downloads.genesis_url),
        (&env.layout.addrbook, &downloads.addrbook_url),
    ] {
        step.run(CommandSpec::new("wget").arg("-O").path_arg(target).arg(url));
    }
}

fn configure_peers(step: &mut StepRun<'_>, env: &StepEnv) {
    println!("Configuring persistent peers and seeds...");
    let peers = &env.config.peers;
    patch_config(
        step,
        &env.layout.config_toml,
        &[
            Substitution::quoted("seeds", &peers.seeds),
            Substitution::quoted("persistent_peers", &peers.persistent_peers),
        ],
    );
}

fn configure_gas_and_prometheus(step: &mut StepRun<'_>, env: &StepEnv) {
    println!("Enabling Prometheus...");
    patch_config(
        step,
        &env.layout.config_toml,
        &[Substitution::bare("prometheus", "true")],
    );
}

fn patch_config(step: &mut StepRun<'_>, path: &Path, substitutions: &[Substitution]) {
    let action = format!("patch {}", path.display());
    let Some(existing) = step.perform(format!("read {}", path.display()), |host| {
        host.read_to_string(path)
    }) else {
        return;
    };
    let Some(contents) = existing else {
        step.fail(CommandFailure::new(action, "file does not exist"));
        return;
    };

    let outcome = patch::apply(&contents, substitutions);
    for key in &outcome.missing {
        let missing = SetupError::MissingKey {
            key: key.clone(),
            path: path.to_path_buf(),
        };
        step.fail(CommandFailure::new(&action, missing.to_string()));
    }
    if outcome.replaced == 0 {
        return;
    }
    if outcome.contents == contents {
        info!(target = "story_setup::steps", path = %path.display(), "config already up to date");
        return;
    }
    step.perform(action, |host| host.write_file(path, &outcome.contents));
}

fn create_service(step: &mut StepRun<'_>, env: &StepEnv) {
    println!("Creating systemd service files for Story and Story Geth...");
    let controller = controller(env);
    let bin_dir = &env.layout.bin_dir;
    for unit in [
        units::geth_unit(&env.config, bin_dir),
        units::story_unit(&env.config, bin_dir),
    ] {
        let path = env.layout.unit_dir.join(unit.file_name());
        step.run(
            CommandSpec::new("tee")
                .path_arg(&path)
                .stdin(unit.contents)
                .output(OutputMode::Quiet)
                .elevated(),
        );
        controller.daemon_reload(step);
        controller.enable(step, &unit.name);
        controller.start(step, &unit.name);
    }
}

fn setup_snapshot(step: &mut StepRun<'_>, env: &StepEnv) {
    println!("Setting up snapshot...");
    let controller = controller(env);
    let layout = &env.layout;
    let downloads = &env.config.downloads;

    if !controller.stop(step, controller.geth()) {
        return;
    }
    if !controller.stop(step, controller.story()) {
        println!("Restarting {} after the aborted snapshot setup...", controller.geth());
        controller.recover(step, controller.geth());
        return;
    }

    restore_snapshot(
        step,
        &layout.geth_chaindata,
        &downloads.geth_snapshot_url,
        &layout.geth_dir,
    );
    controller.restart(step, controller.geth());

    restore_snapshot(
        step,
        &layout.story_data,
        &downloads.story_snapshot_url,
        &layout.story_dir,
    );
    controller.restart(step, controller.story());
}

/// Wipe `state`, then stream the lz4 archive at `url` into `target`.
fn restore_snapshot(step: &mut StepRun<'_>, state: &Path, url: &str, target: &Path) {
    step.perform(format!("remove directory {}", state.display()), |host| {
        host.remove_dir_all(state)
    });
    step.run(Invocation::pipe(
        CommandSpec::new("curl").args(["-L", url]),
        CommandSpec::new("tar")
            .args(["-Ilz4", "-xf", "-", "-C"])
            .path_arg(target),
    ));
}

fn verify_logs(step: &mut StepRun<'_>, env: &StepEnv) {
    println!("Verifying logs...");
    let controller = controller(env);
    controller.follow_logs(step, controller.story());
}

fn update_node(step: &mut StepRun<'_>, env: &StepEnv) {
    println!("Updating Story node...");
    let controller = controller(env);
    let layout = &env.layout;
    let checkout = &layout.story_checkout;

    controller.stop(step, controller.story());
    step.run_advisory(CommandSpec::new("story").arg("version"));
    println!("Cloning Story repository and building binaries...");
    fresh_checkout(step, &env.config.sources.story_repo, checkout, None);
    step.run(
        CommandSpec::new("make")
            .arg("build")
            .current_dir(checkout)
            .output(OutputMode::Inherit),
    );
    install_binary(step, &checkout.join("build").join("story"), &layout.bin_dir);
    step.run_advisory(CommandSpec::new("story").arg("version"));
    controller.start(step, controller.story());
}

fn sync_status(step: &mut StepRun<'_>) {
    println!("Checking Story node sync status...");
    let command = CommandSpec::new("story")
        .arg("status")
        .output(OutputMode::Quiet);
    let rendered = command.render(false);
    let Some(output) = step.run(command) else {
        return;
    };
    if step.is_dry_run() {
        return;
    }
    match extract_sync_info(&output.stdout).and_then(|info| {
        serde_json::to_string_pretty(&info).map_err(SetupError::from)
    }) {
        Ok(pretty) => println!("{pretty}"),
        Err(err) => step.fail(
            CommandFailure::new(rendered, err.to_string()).with_output(output.stdout),
        ),
    }
}

/// Pull the sync section out of `story status` JSON.
pub fn extract_sync_info(raw: &str) -> SetupResult<Value> {
    let status: Value = serde_json::from_str(raw.trim())?;
    ["/SyncInfo", "/sync_info", "/result/sync_info"]
        .iter()
        .find_map(|pointer| status.pointer(pointer))
        .cloned()
        .ok_or_else(|| SetupError::Status("no SyncInfo section in status output".to_string()))
}
