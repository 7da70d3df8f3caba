#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;

use batchrelay::config::{ConfigFile, RawConfigFile, StageConfig};
use batchrelay::errors::Result;
use batchrelay::types::StageId;

/// Builder for `ConfigFile` to simplify test setup.
///
/// Starts from a valid two-stage pipeline: node `collector` runs `true` for
/// the collect stage and node `processor` runs `true` for the process stage.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        let mut config = RawConfigFile::default();
        config.stage.insert(
            StageId::Collect.to_string(),
            StageConfigBuilder::new("collector", "true").build(),
        );
        config.stage.insert(
            StageId::Process.to_string(),
            StageConfigBuilder::new("processor", "true").build(),
        );
        Self { config }
    }

    /// Keep every file the pipeline touches (store, locks, logs, work dirs)
    /// under `dir`.
    pub fn in_dir(mut self, dir: &Path) -> Self {
        self.config.store.root = dir.join("store");
        for (name, stage) in self.config.stage.iter_mut() {
            stage.lock_path = Some(dir.join("locks").join(format!("{name}.lock")));
            stage.log_path = Some(dir.join("logs").join(format!("{name}.log")));
            stage.work_dir = Some(dir.join("work").join(name));
        }
        self
    }

    pub fn with_stage(mut self, stage: StageId, cfg: StageConfig) -> Self {
        self.config.stage.insert(stage.to_string(), cfg);
        self
    }

    pub fn without_stage(mut self, stage: StageId) -> Self {
        self.config.stage.remove(stage.as_str());
        self
    }

    pub fn with_raw_stage(mut self, name: &str, cfg: StageConfig) -> Self {
        self.config.stage.insert(name.to_string(), cfg);
        self
    }

    pub fn stage_cmd(self, stage: StageId, cmd: &str) -> Self {
        self.edit_stage(stage, |s| s.cmd = cmd.to_string())
    }

    pub fn node(self, stage: StageId, node: &str) -> Self {
        self.edit_stage(stage, |s| s.node = node.to_string())
    }

    pub fn code_prefix(self, stage: StageId, prefix: &str) -> Self {
        self.edit_stage(stage, |s| s.code_prefix = Some(prefix.to_string()))
    }

    pub fn tunable(self, stage: StageId, key: &str, value: impl Into<toml::Value>) -> Self {
        let value = value.into();
        self.edit_stage(stage, |s| {
            s.tunables.insert(key.to_string(), value);
        })
    }

    pub fn topics(mut self, collect: &str, process: &str) -> Self {
        self.config.topics.collect = collect.to_string();
        self.config.topics.process = process.to_string();
        self
    }

    pub fn schedule(mut self, at: &str, utc_offset_hours: i32) -> Self {
        self.config.pipeline.schedule = at.to_string();
        self.config.pipeline.utc_offset_hours = utc_offset_hours;
        self
    }

    pub fn watchdog(mut self, timeout: &str) -> Self {
        self.config.pipeline.watchdog_timeout = timeout.to_string();
        self
    }

    pub fn input_date(mut self, date: &str) -> Self {
        self.config.store.input_date = Some(date.to_string());
        self
    }

    pub fn node_cmds(mut self, start: &str, stop: &str) -> Self {
        self.config.node.start_cmd = Some(start.to_string());
        self.config.node.stop_cmd = Some(stop.to_string());
        self
    }

    pub fn bus_cmds(mut self, publish: Option<&str>, subscribe: Option<&str>) -> Self {
        self.config.bus.publish_cmd = publish.map(str::to_string);
        self.config.bus.subscribe_cmd = subscribe.map(str::to_string);
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn try_build(self) -> Result<ConfigFile> {
        ConfigFile::try_from(self.config)
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }

    fn edit_stage(mut self, stage: StageId, edit: impl FnOnce(&mut StageConfig)) -> Self {
        if let Some(s) = self.config.stage.get_mut(stage.as_str()) {
            edit(s);
        }
        self
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `StageConfig`.
pub struct StageConfigBuilder {
    stage: StageConfig,
}

impl StageConfigBuilder {
    pub fn new(node: &str, cmd: &str) -> Self {
        Self {
            stage: StageConfig {
                node: node.to_string(),
                cmd: cmd.to_string(),
                code_prefix: None,
                code_bucket: None,
                source_bucket: None,
                output_prefix: "outputs".to_string(),
                lock_path: None,
                log_path: None,
                work_dir: None,
                tunables: BTreeMap::new(),
            },
        }
    }

    pub fn output_prefix(mut self, prefix: &str) -> Self {
        self.stage.output_prefix = prefix.to_string();
        self
    }

    pub fn lock_path(mut self, path: &Path) -> Self {
        self.stage.lock_path = Some(path.to_path_buf());
        self
    }

    pub fn build(self) -> StageConfig {
        self.stage
    }
}
