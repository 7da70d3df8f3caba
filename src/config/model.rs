// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{FixedOffset, NaiveDate, NaiveTime};
use serde::Deserialize;

use crate::store::Bucket;
use crate::types::StageId;

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [pipeline]
/// name = "odds-report"
/// schedule = "06:00"
/// utc_offset_hours = -3
/// watchdog_timeout = "2h"
///
/// [topics]
/// collect = "collect-done"
/// process = "process-done"
///
/// [stage.collect]
/// node = "node-collect"
/// cmd = "python3 collect.py"
///
/// [stage.process]
/// node = "node-process"
/// cmd = "python3 process.py"
/// ```
///
/// This is the unvalidated form; turn it into a [`ConfigFile`] with
/// `ConfigFile::try_from`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub pipeline: PipelineSection,

    #[serde(default)]
    pub topics: TopicsSection,

    #[serde(default)]
    pub store: StoreSection,

    #[serde(default)]
    pub node: NodeSection,

    #[serde(default)]
    pub bus: BusSection,

    /// `[stage.collect]` and `[stage.process]`, keyed by stage name.
    #[serde(default)]
    pub stage: BTreeMap<String, StageConfig>,
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_pipeline_name")]
    pub name: String,

    /// Daily wall-clock time of the schedule tick, `"HH:MM"`.
    #[serde(default = "default_schedule")]
    pub schedule: String,

    /// Offset of the wall clock the schedule and run dates are expressed in.
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,

    /// How long a stage may stay active without a completion event.
    #[serde(default = "default_watchdog_timeout")]
    pub watchdog_timeout: String,

    #[serde(default = "default_region")]
    pub region: String,
}

fn default_pipeline_name() -> String {
    "batchrelay".to_string()
}

fn default_schedule() -> String {
    "06:00".to_string()
}

fn default_utc_offset_hours() -> i32 {
    -3
}

fn default_watchdog_timeout() -> String {
    "2h".to_string()
}

fn default_region() -> String {
    "sa-east-1".to_string()
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            name: default_pipeline_name(),
            schedule: default_schedule(),
            utc_offset_hours: default_utc_offset_hours(),
            watchdog_timeout: default_watchdog_timeout(),
            region: default_region(),
        }
    }
}

/// `[topics]` section: completion topic per stage.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicsSection {
    #[serde(default = "default_collect_topic")]
    pub collect: String,

    #[serde(default = "default_process_topic")]
    pub process: String,
}

fn default_collect_topic() -> String {
    "collect-done".to_string()
}

fn default_process_topic() -> String {
    "process-done".to_string()
}

impl Default for TopicsSection {
    fn default() -> Self {
        Self {
            collect: default_collect_topic(),
            process: default_process_topic(),
        }
    }
}

/// `[store]` section: where artifacts live and how keys are laid out.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    /// Root directory of the local versioned store.
    #[serde(default = "default_store_root")]
    pub root: PathBuf,

    /// Physical name of the raw bucket (inputs, collected data, collect code).
    #[serde(default = "default_raw_bucket")]
    pub raw_bucket: String,

    /// Physical name of the processed bucket (process code, cache, results, report).
    #[serde(default = "default_processed_bucket")]
    pub processed_bucket: String,

    #[serde(default = "default_input_config_key")]
    pub input_config_key: String,

    #[serde(default = "default_collected_name")]
    pub collected_name: String,

    #[serde(default = "default_results_name")]
    pub results_name: String,

    #[serde(default = "default_cache_key")]
    pub cache_key: String,

    #[serde(default = "default_report_prefix")]
    pub report_prefix: String,

    /// Re-run a past date instead of "today" (`YYYY-MM-DD`).
    #[serde(default)]
    pub input_date: Option<String>,
}

fn default_store_root() -> PathBuf {
    PathBuf::from(".batchrelay/store")
}

fn default_raw_bucket() -> String {
    "raw".to_string()
}

fn default_processed_bucket() -> String {
    "processed".to_string()
}

fn default_input_config_key() -> String {
    "config/sources.json".to_string()
}

fn default_collected_name() -> String {
    "collected.csv".to_string()
}

fn default_results_name() -> String {
    "results.csv".to_string()
}

fn default_cache_key() -> String {
    "cache/result-cache.csv".to_string()
}

fn default_report_prefix() -> String {
    "site".to_string()
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            root: default_store_root(),
            raw_bucket: default_raw_bucket(),
            processed_bucket: default_processed_bucket(),
            input_config_key: default_input_config_key(),
            collected_name: default_collected_name(),
            results_name: default_results_name(),
            cache_key: default_cache_key(),
            report_prefix: default_report_prefix(),
            input_date: None,
        }
    }
}

/// `[node]` section: shell templates for the command lifecycle backend.
///
/// Placeholders: `{node}`, `{stage}`, `{correlation_id}`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct NodeSection {
    #[serde(default)]
    pub start_cmd: Option<String>,

    #[serde(default)]
    pub stop_cmd: Option<String>,
}

/// `[bus]` section: how events leave a node and reach the orchestrator.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BusSection {
    /// Shell template used by a node to publish; `{topic}` is substituted and
    /// the JSON payload is passed in `BATCHRELAY_EVENT`.
    #[serde(default)]
    pub publish_cmd: Option<String>,

    /// Long-lived command printing one JSON event per stdout line.
    #[serde(default)]
    pub subscribe_cmd: Option<String>,
}

/// `[stage.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    /// Node identity (e.g. an instance id).
    pub node: String,

    /// Job body executed once per activation.
    pub cmd: String,

    /// Prefix of the job code objects synced to `work_dir` before running.
    #[serde(default)]
    pub code_prefix: Option<String>,

    /// Bucket holding the code; defaults to raw for collect, processed for process.
    #[serde(default)]
    pub code_bucket: Option<Bucket>,

    /// Bucket the job reads its inputs from; defaults to raw.
    #[serde(default)]
    pub source_bucket: Option<Bucket>,

    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,

    #[serde(default)]
    pub lock_path: Option<PathBuf>,

    #[serde(default)]
    pub log_path: Option<PathBuf>,

    #[serde(default)]
    pub work_dir: Option<PathBuf>,

    /// Stage-specific knobs, exported verbatim to the job environment.
    #[serde(default)]
    pub tunables: BTreeMap<String, toml::Value>,
}

fn default_output_prefix() -> String {
    "outputs".to_string()
}

impl StageConfig {
    pub fn effective_code_bucket(&self, stage: StageId) -> Bucket {
        self.code_bucket.unwrap_or(match stage {
            StageId::Collect => Bucket::Raw,
            StageId::Process => Bucket::Processed,
        })
    }

    pub fn effective_source_bucket(&self) -> Bucket {
        self.source_bucket.unwrap_or(Bucket::Raw)
    }

    pub fn effective_lock_path(&self, stage: StageId) -> PathBuf {
        self.lock_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!(".batchrelay/locks/{stage}.lock")))
    }

    pub fn effective_log_path(&self, stage: StageId) -> PathBuf {
        self.log_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!(".batchrelay/logs/{stage}.log")))
    }

    pub fn effective_work_dir(&self, stage: StageId) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!(".batchrelay/work/{stage}")))
    }

    /// Tunables rendered as plain strings (TOML strings unquoted).
    pub fn tunable_strings(&self) -> BTreeMap<String, String> {
        self.tunables
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect()
    }
}

/// Parsed values of the `[pipeline]` section.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub name: String,
    pub schedule: NaiveTime,
    pub utc_offset: FixedOffset,
    pub watchdog_timeout: Duration,
    pub region: String,
}

/// Validated configuration.
///
/// Only obtainable through `TryFrom<RawConfigFile>`, so every holder can rely
/// on both stages being present and their nodes being disjoint.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub pipeline: PipelineSettings,
    pub topics: TopicsSection,
    pub store: StoreSection,
    pub node: NodeSection,
    pub bus: BusSection,
    pub input_date: Option<NaiveDate>,
    collect: StageConfig,
    process: StageConfig,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        pipeline: PipelineSettings,
        raw: RawConfigFile,
        input_date: Option<NaiveDate>,
        collect: StageConfig,
        process: StageConfig,
    ) -> Self {
        Self {
            pipeline,
            topics: raw.topics,
            store: raw.store,
            node: raw.node,
            bus: raw.bus,
            input_date,
            collect,
            process,
        }
    }

    pub fn stage(&self, stage: StageId) -> &StageConfig {
        match stage {
            StageId::Collect => &self.collect,
            StageId::Process => &self.process,
        }
    }

    /// Completion topic of a stage.
    pub fn topic(&self, stage: StageId) -> &str {
        match stage {
            StageId::Collect => &self.topics.collect,
            StageId::Process => &self.topics.process,
        }
    }

    pub fn node_of(&self, stage: StageId) -> &str {
        &self.stage(stage).node
    }

    pub fn stage_of_node(&self, node: &str) -> Option<StageId> {
        StageId::ALL
            .into_iter()
            .find(|s| self.stage(*s).node == node)
    }

    pub fn stage_of_topic(&self, topic: &str) -> Option<StageId> {
        StageId::ALL.into_iter().find(|s| self.topic(*s) == topic)
    }

    /// Physical bucket name for a logical bucket.
    pub fn bucket_name(&self, bucket: Bucket) -> &str {
        match bucket {
            Bucket::Raw => &self.store.raw_bucket,
            Bucket::Processed => &self.store.processed_bucket,
        }
    }
}
