//! systemd unit files for the two node processes.

use std::path::Path;

use crate::config::SetupConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFile {
    pub name: String,
    pub contents: String,
}

impl UnitFile {
    pub fn file_name(&self) -> String {
        format!("{}.service", self.name)
    }
}

/// Execution client unit: `geth --<network> --syncmode <mode>`.
pub fn geth_unit(config: &SetupConfig, bin_dir: &Path) -> UnitFile {
    let exec_start = format!(
        "{} --{} --syncmode {}",
        bin_dir.join("geth").display(),
        config.network,
        config.services.geth_syncmode
    );
    UnitFile {
        name: config.services.geth_unit.clone(),
        contents: render("Geth Client", &exec_start, config),
    }
}

/// Consensus client unit: `story run`.
pub fn story_unit(config: &SetupConfig, bin_dir: &Path) -> UnitFile {
    let exec_start = format!("{} run", bin_dir.join("story").display());
    UnitFile {
        name: config.services.story_unit.clone(),
        contents: render("Story Validator", &exec_start, config),
    }
}

fn render(description: &str, exec_start: &str, config: &SetupConfig) -> String {
    format!(
        "[Unit]
Description={description}
After=network.target

[Service]
User={user}
Type=simple
ExecStart={exec_start}
Restart=on-failure
LimitNOFILE={limit}

[Install]
WantedBy=multi-user.target
",
        user = config.services.user,
        limit = config.services.limit_nofile,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geth_unit_runs_the_configured_network() {
        let config = SetupConfig::default();
        let unit = geth_unit(&config, Path::new("/usr/local/bin"));
        assert_eq!(unit.file_name(), "geth.service");
        assert!(unit
            .contents
            .contains("ExecStart=/usr/local/bin/geth --iliad --syncmode full\n"));
        assert!(unit.contents.contains("Description=Geth Client\n"));
        assert!(unit.contents.contains("LimitNOFILE=65535\n"));
    }

    #[test]
    fn story_unit_uses_run_subcommand_and_user() {
        let mut config = SetupConfig::default();
        config.services.user = "story".to_string();
        let unit = story_unit(&config, Path::new("/opt/bin"));
        assert_eq!(unit.file_name(), "story.service");
        assert!(unit.contents.starts_with("[Unit]\nDescription=Story Validator\n"));
        assert!(unit.contents.contains("ExecStart=/opt/bin/story run\n"));
        assert!(unit.contents.contains("User=story\n"));
        assert!(unit.contents.ends_with("WantedBy=multi-user.target\n"));
    }
}
