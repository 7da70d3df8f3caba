// src/config/validate.rs

use std::collections::HashSet;
use std::time::Duration;

use chrono::{FixedOffset, NaiveDate, NaiveTime};
use regex::Regex;

use crate::config::model::{ConfigFile, PipelineSettings, RawConfigFile, StageConfig};
use crate::errors::{BatchrelayError, Result};
use crate::types::StageId;

const IDENTIFIER_PATTERN: &str = r"^[A-Za-z0-9._:-]+$";

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = BatchrelayError;

    fn try_from(mut raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        ensure_known_stages(&raw)?;
        let collect = take_stage(&mut raw, StageId::Collect)?;
        let process = take_stage(&mut raw, StageId::Process)?;

        validate_stage(StageId::Collect, &collect)?;
        validate_stage(StageId::Process, &process)?;
        validate_disjoint(&collect, &process)?;
        validate_topics(&raw)?;

        let pipeline = parse_pipeline(&raw)?;
        let input_date = parse_input_date(raw.store.input_date.as_deref())?;

        Ok(ConfigFile::new_unchecked(
            pipeline, raw, input_date, collect, process,
        ))
    }
}

fn ensure_known_stages(raw: &RawConfigFile) -> Result<()> {
    for name in raw.stage.keys() {
        if name.parse::<StageId>().is_err() {
            return Err(BatchrelayError::ConfigError(format!(
                "unknown stage section [stage.{name}] (expected collect or process)"
            )));
        }
    }
    Ok(())
}

fn take_stage(raw: &mut RawConfigFile, stage: StageId) -> Result<StageConfig> {
    raw.stage.remove(stage.as_str()).ok_or_else(|| {
        BatchrelayError::ConfigError(format!(
            "config must contain a [stage.{stage}] section"
        ))
    })
}

fn validate_stage(stage: StageId, cfg: &StageConfig) -> Result<()> {
    ensure_identifier(&format!("stage.{stage}.node"), &cfg.node)?;

    if cfg.cmd.trim().is_empty() {
        return Err(BatchrelayError::ConfigError(format!(
            "[stage.{stage}].cmd must not be empty"
        )));
    }

    for key in cfg.tunables.keys() {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(BatchrelayError::ConfigError(format!(
                "[stage.{stage}.tunables] key '{key}' is not a valid environment variable name"
            )));
        }
    }

    Ok(())
}

/// Controllers of the two stages act concurrently; that is only safe when
/// they never touch the same node or lock.
fn validate_disjoint(collect: &StageConfig, process: &StageConfig) -> Result<()> {
    if collect.node == process.node {
        return Err(BatchrelayError::ConfigError(format!(
            "stages must run on distinct nodes (both use '{}')",
            collect.node
        )));
    }

    let mut paths = HashSet::new();
    paths.insert(collect.effective_lock_path(StageId::Collect));
    if !paths.insert(process.effective_lock_path(StageId::Process)) {
        return Err(BatchrelayError::ConfigError(
            "stages must use distinct lock_path values".to_string(),
        ));
    }

    Ok(())
}

fn validate_topics(raw: &RawConfigFile) -> Result<()> {
    ensure_identifier("topics.collect", &raw.topics.collect)?;
    ensure_identifier("topics.process", &raw.topics.process)?;

    if raw.topics.collect == raw.topics.process {
        return Err(BatchrelayError::ConfigError(format!(
            "[topics] collect and process must differ (both '{}')",
            raw.topics.collect
        )));
    }
    Ok(())
}

fn ensure_identifier(field: &str, value: &str) -> Result<()> {
    let pattern = Regex::new(IDENTIFIER_PATTERN).map_err(anyhow::Error::from)?;
    if pattern.is_match(value) {
        Ok(())
    } else {
        Err(BatchrelayError::ConfigError(format!(
            "{field} = '{value}' must match [A-Za-z0-9._:-]+"
        )))
    }
}

fn parse_pipeline(raw: &RawConfigFile) -> Result<PipelineSettings> {
    let section = &raw.pipeline;

    let schedule = NaiveTime::parse_from_str(section.schedule.trim(), "%H:%M").map_err(|e| {
        BatchrelayError::ConfigError(format!(
            "[pipeline].schedule = '{}' is not HH:MM: {e}",
            section.schedule
        ))
    })?;

    if !(-12..=14).contains(&section.utc_offset_hours) {
        return Err(BatchrelayError::ConfigError(format!(
            "[pipeline].utc_offset_hours must be within -12..=14 (got {})",
            section.utc_offset_hours
        )));
    }
    let utc_offset = FixedOffset::east_opt(section.utc_offset_hours * 3600).ok_or_else(|| {
        BatchrelayError::ConfigError(format!(
            "[pipeline].utc_offset_hours {} is out of range",
            section.utc_offset_hours
        ))
    })?;

    let watchdog_timeout = parse_duration(&section.watchdog_timeout).map_err(|e| {
        BatchrelayError::ConfigError(format!("[pipeline].watchdog_timeout: {e}"))
    })?;
    if watchdog_timeout.is_zero() {
        return Err(BatchrelayError::ConfigError(
            "[pipeline].watchdog_timeout must be greater than zero".to_string(),
        ));
    }

    Ok(PipelineSettings {
        name: section.name.clone(),
        schedule,
        utc_offset,
        watchdog_timeout,
        region: section.region.clone(),
    })
}

fn parse_input_date(value: Option<&str>) -> Result<Option<NaiveDate>> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Some)
            .map_err(|e| {
                BatchrelayError::ConfigError(format!(
                    "[store].input_date = '{s}' is not YYYY-MM-DD: {e}"
                ))
            }),
    }
}

/// Parse durations like `"250ms"`, `"30s"`, `"5m"` or `"2h"`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}
