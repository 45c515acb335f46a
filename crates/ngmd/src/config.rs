//! ngmd.toml configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use ngm_cluster::NodeLabels;
use ngm_controller::{ControllerConfig, TaskSchedulerConfig};
use ngm_strategy::DEFAULT_TASK_LOOKAHEAD;

/// Top-level daemon settings. Every section is optional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    /// JSON snapshot seeding the in-memory cluster and resource broker.
    pub fixture: Option<PathBuf>,
    pub controller: ControllerConfig,
    pub task: TaskSchedulerConfig,
    pub strategy: StrategySection,
    pub labels: NodeLabels,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/ngm"),
            fixture: None,
            controller: ControllerConfig::default(),
            task: TaskSchedulerConfig::default(),
            strategy: StrategySection::default(),
            labels: NodeLabels::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StrategySection {
    /// How far ahead a pending drain task blocks hierarchical scale-up.
    pub task_lookahead_secs: u64,
}

impl Default for StrategySection {
    fn default() -> Self {
        Self {
            task_lookahead_secs: DEFAULT_TASK_LOOKAHEAD.num_seconds().unsigned_abs(),
        }
    }
}

impl StrategySection {
    pub fn task_lookahead(&self) -> chrono::Duration {
        i64::try_from(self.task_lookahead_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(DEFAULT_TASK_LOOKAHEAD)
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Resolve a relative fixture path against the config file's directory.
    pub fn resolve_paths(&mut self, config_path: &Path) {
        if let Some(fixture) = &self.fixture
            && fixture.is_relative()
            && let Some(dir) = config_path.parent()
        {
            self.fixture = Some(dir.join(fixture));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_yields_defaults() {
        let config: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.strategy.task_lookahead(), DEFAULT_TASK_LOOKAHEAD);
        assert_eq!(config.labels.task, "ngm.io/scale-down-task");
    }

    #[test]
    fn sections_override_defaults() {
        let toml_str = r#"
data_dir = "/tmp/ngm"
fixture = "fixture.json"

[controller]
interval_secs = 5
rng_seed = 42

[task]
concurrency = 4
report_consumed_ips = false

[strategy]
task_lookahead_secs = 600

[labels]
task = "example.com/drain-task"
"#;
        let config: DaemonConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/ngm"));
        assert_eq!(config.controller.interval_secs, 5);
        assert_eq!(config.controller.oscillation_slack, 3);
        assert_eq!(config.controller.rng_seed, Some(42));
        assert_eq!(config.task.concurrency, 4);
        assert!(!config.task.report_consumed_ips);
        assert_eq!(config.task.interval_secs, 30);
        assert_eq!(config.strategy.task_lookahead(), chrono::Duration::minutes(10));
        assert_eq!(config.labels.task, "example.com/drain-task");
        assert_eq!(config.labels.node_group, "ngm.io/node-group");
    }

    #[test]
    fn from_file_resolves_relative_fixture() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ngmd.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "fixture = \"snapshot.json\"").unwrap();

        let mut config = DaemonConfig::from_file(&path).unwrap();
        config.resolve_paths(&path);
        assert_eq!(config.fixture, Some(dir.path().join("snapshot.json")));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ngmd.toml");
        std::fs::write(&path, "[controller\ninterval_secs = ").unwrap();
        assert!(DaemonConfig::from_file(&path).is_err());
    }
}
