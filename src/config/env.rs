// src/config/env.rs

//! Node environment contract.
//!
//! A [`NodeProfile`] is the static, per-stage part resolved from the config
//! file. At node boot it is turned into a [`NodeEnvironment`] exactly once;
//! the job reads that value for its whole lifetime and never consults the
//! process environment itself.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};

use crate::config::ConfigFile;
use crate::store::{ArtifactLayout, Bucket};
use crate::types::{CorrelationId, StageId};

#[derive(Debug, Clone)]
pub struct NodeProfile {
    pub stage: StageId,
    pub node: String,
    pub region: String,
    pub source_bucket: Bucket,
    pub source_bucket_name: String,
    pub output_prefix: String,
    pub utc_offset: FixedOffset,
    pub input_date: Option<NaiveDate>,
    pub layout: ArtifactLayout,
    pub tunables: BTreeMap<String, String>,
}

impl NodeProfile {
    pub fn from_config(cfg: &ConfigFile, stage: StageId) -> Self {
        let stage_cfg = cfg.stage(stage);
        let source_bucket = stage_cfg.effective_source_bucket();

        Self {
            stage,
            node: stage_cfg.node.clone(),
            region: cfg.pipeline.region.clone(),
            source_bucket,
            source_bucket_name: cfg.bucket_name(source_bucket).to_string(),
            output_prefix: stage_cfg.output_prefix.clone(),
            utc_offset: cfg.pipeline.utc_offset,
            input_date: cfg.input_date,
            layout: ArtifactLayout::from_config(cfg),
            tunables: stage_cfg.tunable_strings(),
        }
    }

    /// Resolve the environment for one activation, dating it by `now`.
    pub fn boot(&self, correlation_id: CorrelationId, now: DateTime<Utc>) -> NodeEnvironment {
        self.boot_for_run(correlation_id, now, None)
    }

    /// Resolve the environment for one activation of a run whose date was
    /// already fixed upstream.
    ///
    /// The configured `input_date` wins, then `run_date`, then the date of
    /// `now` in the pipeline's offset. Both stages of a run must see the
    /// same date or they disagree on artifact keys.
    pub fn boot_for_run(
        &self,
        correlation_id: CorrelationId,
        now: DateTime<Utc>,
        run_date: Option<NaiveDate>,
    ) -> NodeEnvironment {
        let run_date = self
            .input_date
            .or(run_date)
            .unwrap_or_else(|| self.date_of(now));

        NodeEnvironment {
            profile: self.clone(),
            correlation_id,
            run_date,
            booted_at: now,
        }
    }

    /// Calendar date of `instant` in the pipeline's offset.
    pub fn date_of(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.utc_offset).date_naive()
    }
}

/// Read-only configuration of one node activation.
#[derive(Debug, Clone)]
pub struct NodeEnvironment {
    profile: NodeProfile,
    correlation_id: CorrelationId,
    run_date: NaiveDate,
    booted_at: DateTime<Utc>,
}

impl NodeEnvironment {
    pub fn stage(&self) -> StageId {
        self.profile.stage
    }

    pub fn node(&self) -> &str {
        &self.profile.node
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn run_date(&self) -> NaiveDate {
        self.run_date
    }

    pub fn booted_at(&self) -> DateTime<Utc> {
        self.booted_at
    }

    pub fn source_bucket(&self) -> Bucket {
        self.profile.source_bucket
    }

    pub fn tunable(&self, name: &str) -> Option<&str> {
        self.profile.tunables.get(name).map(String::as_str)
    }

    pub fn collected_key(&self) -> String {
        self.profile.layout.collected_key(self.run_date)
    }

    pub fn results_key(&self) -> String {
        self.profile.layout.results_key(self.run_date)
    }

    pub fn report_key(&self) -> String {
        self.profile.layout.report_key(self.run_date)
    }

    pub fn cache_key(&self) -> &str {
        &self.profile.layout.cache_key
    }

    /// `produced_by` tag for artifacts written during this activation.
    pub fn producer(&self) -> String {
        format!("{}:{}", self.profile.stage, self.correlation_id)
    }

    /// Environment variables handed to a job process.
    pub fn vars(&self) -> Vec<(String, String)> {
        let p = &self.profile;
        let mut vars = vec![
            ("BATCHRELAY_STAGE".to_string(), p.stage.to_string()),
            ("BATCHRELAY_NODE".to_string(), p.node.clone()),
            ("BATCHRELAY_REGION".to_string(), p.region.clone()),
            (
                "BATCHRELAY_SOURCE_BUCKET".to_string(),
                p.source_bucket_name.clone(),
            ),
            ("BATCHRELAY_OUTPUT_PREFIX".to_string(), p.output_prefix.clone()),
            (
                "BATCHRELAY_CORRELATION_ID".to_string(),
                self.correlation_id.to_string(),
            ),
            (
                "BATCHRELAY_RUN_DATE".to_string(),
                self.run_date.format("%Y-%m-%d").to_string(),
            ),
            (
                "BATCHRELAY_INPUT_CONFIG_KEY".to_string(),
                p.layout.input_config_key.clone(),
            ),
            ("BATCHRELAY_COLLECTED_KEY".to_string(), self.collected_key()),
            ("BATCHRELAY_RESULTS_KEY".to_string(), self.results_key()),
            ("BATCHRELAY_REPORT_KEY".to_string(), self.report_key()),
            ("BATCHRELAY_CACHE_KEY".to_string(), p.layout.cache_key.clone()),
        ];
        vars.extend(p.tunables.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars
    }
}
