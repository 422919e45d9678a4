use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{SetupError, SetupResult};

pub const DEFAULT_MONIKER: &str = "StoryNode";
pub const DEFAULT_TCP_PORT: &str = "26657";
pub const DEFAULT_STORY_VERSION: &str = "v0.11.0";
pub const DEFAULT_GETH_VERSION: &str = "v0.9.3";
pub const DEFAULT_GO_VERSION: &str = "1.22.8";

const DEFAULT_SEED: &str =
    "3f472746f46493309650e5a033076689996c8881@story-testnet.rpc.kjnodes.com:26659";
const KJNODES_BASE: &str = "https://snapshots.kjnodes.com/story-testnet";

/// Host-level settings for provisioning. Every field has a default matching
/// the public Story testnet setup, so an empty file is a valid config.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SetupConfig {
    /// Home directory holding `.story` and `.profile`. Falls back to `$HOME`.
    pub home_dir: Option<PathBuf>,
    /// Directory receiving the source checkouts. Relative to the working directory.
    pub checkout_dir: PathBuf,
    pub network: String,
    /// Prefix elevated commands with `sudo`. Disable when already running as root.
    pub use_sudo: bool,
    pub packages: Vec<String>,
    pub firewall_ports: Vec<u16>,
    pub paths: PathsConfig,
    pub sources: SourcesConfig,
    pub downloads: DownloadsConfig,
    pub peers: PeersConfig,
    pub services: ServicesConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    /// Node state root, relative to the home directory.
    pub story_home: PathBuf,
    pub bin_dir: PathBuf,
    /// Parent of the `go` toolchain directory.
    pub go_install_root: PathBuf,
    /// Shell profile receiving the `PATH` export, relative to the home directory.
    pub profile: PathBuf,
    pub unit_dir: PathBuf,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourcesConfig {
    pub story_repo: String,
    pub geth_repo: String,
    pub go_download_base: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DownloadsConfig {
    pub genesis_url: String,
    pub addrbook_url: String,
    pub geth_snapshot_url: String,
    pub story_snapshot_url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PeersConfig {
    pub seeds: String,
    pub persistent_peers: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServicesConfig {
    pub geth_unit: String,
    pub story_unit: String,
    pub user: String,
    pub limit_nofile: u64,
    pub geth_syncmode: String,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            home_dir: None,
            checkout_dir: PathBuf::from("."),
            network: "iliad".to_string(),
            use_sudo: true,
            packages: [
                "curl",
                "build-essential",
                "git",
                "wget",
                "jq",
                "make",
                "gcc",
                "tmux",
                "chrony",
                "lz4",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            firewall_ports: vec![26656, 30303],
            paths: PathsConfig::default(),
            sources: SourcesConfig::default(),
            downloads: DownloadsConfig::default(),
            peers: PeersConfig::default(),
            services: ServicesConfig::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            story_home: PathBuf::from(".story"),
            bin_dir: PathBuf::from("/usr/local/bin"),
            go_install_root: PathBuf::from("/usr/local"),
            profile: PathBuf::from(".profile"),
            unit_dir: PathBuf::from("/etc/systemd/system"),
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            story_repo: "https://github.com/piplabs/story.git".to_string(),
            geth_repo: "https://github.com/piplabs/story-geth.git".to_string(),
            go_download_base: "https://golang.org/dl".to_string(),
        }
    }
}

impl Default for DownloadsConfig {
    fn default() -> Self {
        Self {
            genesis_url: format!("{KJNODES_BASE}/genesis.json"),
            addrbook_url: format!("{KJNODES_BASE}/addrbook.json"),
            geth_snapshot_url: format!("{KJNODES_BASE}/snapshot_latest_geth.tar.lz4"),
            story_snapshot_url: format!("{KJNODES_BASE}/snapshot_latest.tar.lz4"),
        }
    }
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            seeds: DEFAULT_SEED.to_string(),
            persistent_peers: String::new(),
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            geth_unit: "geth".to_string(),
            story_unit: "story".to_string(),
            user: "root".to_string(),
            limit_nofile: 65_535,
            geth_syncmode: "full".to_string(),
        }
    }
}

impl SetupConfig {
    pub fn load(path: &Path) -> SetupResult<Self> {
        let content = fs::read_to_string(path).map_err(|err| SetupError::io(path, err))?;
        let config: SetupConfig = toml::from_str(&content).map_err(|err| {
            SetupError::Config(format!("unable to parse {}: {err}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SetupResult<()> {
        if self.network.trim().is_empty() {
            return Err(SetupError::Config("network must not be empty".to_string()));
        }
        if self.services.geth_unit == self.services.story_unit {
            return Err(SetupError::Config(format!(
                "services.geth_unit and services.story_unit must differ (both `{}`)",
                self.services.geth_unit
            )));
        }
        if self.packages.is_empty() {
            return Err(SetupError::Config("packages must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn resolve_home(&self) -> SetupResult<PathBuf> {
        if let Some(home) = &self.home_dir {
            return Ok(home.clone());
        }
        env::var_os("HOME")
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .ok_or(SetupError::MissingHome)
    }

    /// Resolve every filesystem location the steps touch.
    pub fn layout(&self, cwd: &Path) -> SetupResult<Layout> {
        let home = self.resolve_home()?;
        Ok(Layout::new(self, &home, cwd))
    }
}

/// Concrete filesystem locations derived from a [`SetupConfig`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    pub story_dir: PathBuf,
    pub geth_dir: PathBuf,
    pub config_toml: PathBuf,
    pub genesis: PathBuf,
    pub addrbook: PathBuf,
    pub story_data: PathBuf,
    pub geth_chaindata: PathBuf,
    pub profile: PathBuf,
    pub go_root: PathBuf,
    pub go_bin: PathBuf,
    pub bin_dir: PathBuf,
    pub unit_dir: PathBuf,
    pub story_checkout: PathBuf,
    pub geth_checkout: PathBuf,
    pub workdir: PathBuf,
}

impl Layout {
    pub fn new(config: &SetupConfig, home: &Path, cwd: &Path) -> Self {
        let story_home = join_relative(home, &config.paths.story_home);
        let story_dir = story_home.join("story");
        let geth_dir = story_home.join("geth");
        let config_dir = story_dir.join("config");
        let go_root = config.paths.go_install_root.join("go");
        let checkouts = join_relative(cwd, &config.checkout_dir);
        Self {
            config_toml: config_dir.join("config.toml"),
            genesis: config_dir.join("genesis.json"),
            addrbook: config_dir.join("addrbook.json"),
            story_data: story_dir.join("data"),
            geth_chaindata: geth_dir.join(&config.network).join("geth").join("chaindata"),
            profile: join_relative(home, &config.paths.profile),
            go_bin: go_root.join("bin"),
            go_root,
            bin_dir: config.paths.bin_dir.clone(),
            unit_dir: config.paths.unit_dir.clone(),
            story_checkout: checkouts.join("story"),
            geth_checkout: checkouts.join("story-geth"),
            workdir: checkouts,
            story_dir,
            geth_dir,
        }
    }
}

/// Resolve `path` against `base`, treating `~` as `base` and dropping `.`
/// components so rendered commands show clean paths.
fn join_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    let rest = path.strip_prefix("~").unwrap_or(path);
    rest.components()
        .filter(|component| !matches!(component, Component::CurDir))
        .fold(base.to_path_buf(), |joined, component| joined.join(component))
}
