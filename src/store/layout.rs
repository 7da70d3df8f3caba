// src/store/layout.rs

use chrono::NaiveDate;

use crate::config::ConfigFile;
use crate::types::StageId;

/// Object keys shared by both stages for one run date.
///
/// The collect stage writes `collected_key`; the process stage reads it and
/// writes `results_key`, `report_key` and updates `cache_key`. Both sides
/// derive the keys from here so they never disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    pub input_config_key: String,
    pub collect_prefix: String,
    pub process_prefix: String,
    pub collected_name: String,
    pub results_name: String,
    pub cache_key: String,
    pub report_prefix: String,
}

impl ArtifactLayout {
    pub fn from_config(cfg: &ConfigFile) -> Self {
        Self {
            input_config_key: cfg.store.input_config_key.clone(),
            collect_prefix: cfg.stage(StageId::Collect).output_prefix.clone(),
            process_prefix: cfg.stage(StageId::Process).output_prefix.clone(),
            collected_name: cfg.store.collected_name.clone(),
            results_name: cfg.store.results_name.clone(),
            cache_key: cfg.store.cache_key.clone(),
            report_prefix: cfg.store.report_prefix.clone(),
        }
    }

    /// Raw bucket: `<collect prefix>/<date>/<collected name>`.
    pub fn collected_key(&self, date: NaiveDate) -> String {
        join(&[&self.collect_prefix, &date_dir(date), &self.collected_name])
    }

    /// Processed bucket: `<process prefix>/<date>/<results name>`.
    pub fn results_key(&self, date: NaiveDate) -> String {
        join(&[&self.process_prefix, &date_dir(date), &self.results_name])
    }

    /// Processed bucket: `<report prefix>/<date>/index.html`.
    pub fn report_key(&self, date: NaiveDate) -> String {
        join(&[&self.report_prefix, &date_dir(date), "index.html"])
    }
}

fn date_dir(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn join(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
