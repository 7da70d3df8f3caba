// tests/config_validation.rs

use std::time::Duration;

use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};

use batchrelay::config::{NodeProfile, parse_duration, parse_str};
use batchrelay::config::ConfigFile;
use batchrelay::errors::BatchrelayError;
use batchrelay::store::Bucket;
use batchrelay::types::{CorrelationId, StageId};
use batchrelay_test_utils::{ConfigFileBuilder, StageConfigBuilder};

type TestResult = Result<(), Box<dyn std::error::Error>>;

const FULL_CONFIG: &str = r#"
[pipeline]
name = "odds-report"
schedule = "06:00"
utc_offset_hours = -3
watchdog_timeout = "90m"
region = "sa-east-1"

[topics]
collect = "odds-collected"
process = "odds-processed"

[store]
root = "/var/lib/batchrelay"
raw_bucket = "odds-raw"
processed_bucket = "odds-processed"

[node]
start_cmd = "aws ec2 start-instances --instance-ids {node}"
stop_cmd = "aws ec2 stop-instances --instance-ids {node}"

[bus]
publish_cmd = "aws sns publish --topic-arn arn:aws:sns:sa-east-1:1:{topic} --message \"$BATCHRELAY_EVENT\""

[stage.collect]
node = "i-0collect"
cmd = "python3 collect.py"
code_prefix = "code/collect"

[stage.collect.tunables]
MAX_WORKERS = 8
LEAGUES = "premier,laliga"

[stage.process]
node = "i-0process"
cmd = "python3 process.py"
code_prefix = "code/process"
"#;

fn assert_config_error(result: Result<ConfigFile, BatchrelayError>, needle: &str) {
    match result {
        Err(BatchrelayError::ConfigError(msg)) => {
            assert!(msg.contains(needle), "error '{msg}' should mention '{needle}'")
        }
        Err(other) => panic!("expected ConfigError, got {other:?}"),
        Ok(_) => panic!("expected ConfigError mentioning '{needle}'"),
    }
}

#[test]
fn full_config_parses_and_validates() -> TestResult {
    let cfg = ConfigFile::try_from(parse_str(FULL_CONFIG)?)?;

    assert_eq!(cfg.pipeline.name, "odds-report");
    assert_eq!(cfg.pipeline.schedule, NaiveTime::from_hms_opt(6, 0, 0).expect("time"));
    assert_eq!(cfg.pipeline.utc_offset.local_minus_utc(), -3 * 3600);
    assert_eq!(cfg.pipeline.watchdog_timeout, Duration::from_secs(90 * 60));

    assert_eq!(cfg.topic(StageId::Collect), "odds-collected");
    assert_eq!(cfg.node_of(StageId::Process), "i-0process");
    assert_eq!(cfg.stage_of_node("i-0collect"), Some(StageId::Collect));
    assert_eq!(cfg.stage_of_topic("odds-processed"), Some(StageId::Process));
    assert_eq!(cfg.bucket_name(Bucket::Raw), "odds-raw");
    assert!(cfg.bus.subscribe_cmd.is_none());

    let collect = cfg.stage(StageId::Collect);
    assert_eq!(collect.effective_code_bucket(StageId::Collect), Bucket::Raw);
    assert_eq!(
        cfg.stage(StageId::Process).effective_code_bucket(StageId::Process),
        Bucket::Processed
    );
    let tunables = collect.tunable_strings();
    assert_eq!(tunables.get("MAX_WORKERS").map(String::as_str), Some("8"));
    assert_eq!(tunables.get("LEAGUES").map(String::as_str), Some("premier,laliga"));
    Ok(())
}

#[test]
fn defaults_fill_everything_but_the_stages() -> TestResult {
    let cfg = ConfigFileBuilder::new().build();
    assert_eq!(cfg.pipeline.schedule, NaiveTime::from_hms_opt(6, 0, 0).expect("time"));
    assert_eq!(cfg.pipeline.utc_offset.local_minus_utc(), -3 * 3600);
    assert_eq!(cfg.pipeline.watchdog_timeout, Duration::from_secs(2 * 3600));
    assert_eq!(cfg.topic(StageId::Collect), "collect-done");
    assert_eq!(cfg.topic(StageId::Process), "process-done");
    assert!(cfg.input_date.is_none());
    Ok(())
}

#[test]
fn missing_stage_is_rejected() {
    assert_config_error(
        ConfigFileBuilder::new().without_stage(StageId::Process).try_build(),
        "[stage.process]",
    );
}

#[test]
fn unknown_stage_is_rejected() {
    assert_config_error(
        ConfigFileBuilder::new()
            .with_raw_stage("publish", StageConfigBuilder::new("n3", "true").build())
            .try_build(),
        "stage.publish",
    );
}

#[test]
fn stages_must_use_distinct_nodes() {
    assert_config_error(
        ConfigFileBuilder::new()
            .node(StageId::Process, "collector")
            .try_build(),
        "distinct nodes",
    );
}

#[test]
fn stages_must_use_distinct_lock_paths() {
    let dir = std::env::temp_dir().join("shared.lock");
    let builder = ConfigFileBuilder::new()
        .with_stage(
            StageId::Collect,
            StageConfigBuilder::new("collector", "true").lock_path(&dir).build(),
        )
        .with_stage(
            StageId::Process,
            StageConfigBuilder::new("processor", "true").lock_path(&dir).build(),
        );
    assert_config_error(builder.try_build(), "lock_path");
}

#[test]
fn topics_must_differ_and_be_identifiers() {
    assert_config_error(
        ConfigFileBuilder::new().topics("done", "done").try_build(),
        "must differ",
    );
    assert_config_error(
        ConfigFileBuilder::new().topics("collect done", "x").try_build(),
        "topics.collect",
    );
}

#[test]
fn empty_command_is_rejected() {
    assert_config_error(
        ConfigFileBuilder::new().stage_cmd(StageId::Collect, "   ").try_build(),
        "cmd must not be empty",
    );
}

#[test]
fn invalid_node_identifier_is_rejected() {
    assert_config_error(
        ConfigFileBuilder::new().node(StageId::Collect, "bad node").try_build(),
        "stage.collect.node",
    );
}

#[test]
fn tunable_keys_must_be_env_names() {
    assert_config_error(
        ConfigFileBuilder::new()
            .tunable(StageId::Collect, "max-pages", "3")
            .try_build(),
        "not a valid environment variable name",
    );
}

#[test]
fn schedule_offset_and_watchdog_are_checked() {
    assert_config_error(
        ConfigFileBuilder::new().schedule("6am", -3).try_build(),
        "HH:MM",
    );
    assert_config_error(
        ConfigFileBuilder::new().schedule("06:00", 15).try_build(),
        "utc_offset_hours",
    );
    assert_config_error(
        ConfigFileBuilder::new().watchdog("0s").try_build(),
        "greater than zero",
    );
    assert_config_error(
        ConfigFileBuilder::new().watchdog("2 days").try_build(),
        "watchdog_timeout",
    );
}

#[test]
fn input_date_must_be_a_calendar_date() {
    assert_config_error(
        ConfigFileBuilder::new().input_date("14/03/2025").try_build(),
        "YYYY-MM-DD",
    );
}

#[test]
fn unknown_toml_is_a_parse_error() {
    assert!(matches!(
        parse_str("[pipeline\nname = 1"),
        Err(BatchrelayError::TomlError(_))
    ));
}

#[test]
fn durations_parse_with_units() {
    assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
    assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
    assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
    assert_eq!(parse_duration(" 2h "), Ok(Duration::from_secs(7200)));
    assert!(parse_duration("").is_err());
    assert!(parse_duration("10").is_err());
    assert!(parse_duration("3d").is_err());
}

#[test]
fn node_environment_is_resolved_once_from_config() -> TestResult {
    let cfg = ConfigFile::try_from(parse_str(FULL_CONFIG)?)?;
    // 01:30 UTC on the 15th is still the 14th at UTC-3.
    let booted = Utc.with_ymd_and_hms(2025, 3, 15, 1, 30, 0).single().expect("time");
    let env = NodeProfile::from_config(&cfg, StageId::Process)
        .boot(CorrelationId::from("run-9"), booted);

    assert_eq!(env.run_date(), NaiveDate::from_ymd_opt(2025, 3, 14).expect("date"));
    assert_eq!(env.collected_key(), "outputs/2025-03-14/collected.csv");
    assert_eq!(env.results_key(), "outputs/2025-03-14/results.csv");
    assert_eq!(env.report_key(), "site/2025-03-14/index.html");
    assert_eq!(env.producer(), "process:run-9");

    let vars = env.vars();
    let var = |name: &str| {
        vars.iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    };
    assert_eq!(var("BATCHRELAY_STAGE").as_deref(), Some("process"));
    assert_eq!(var("BATCHRELAY_SOURCE_BUCKET").as_deref(), Some("odds-raw"));
    assert_eq!(var("BATCHRELAY_CORRELATION_ID").as_deref(), Some("run-9"));
    assert_eq!(var("BATCHRELAY_RUN_DATE").as_deref(), Some("2025-03-14"));
    assert_eq!(var("BATCHRELAY_REGION").as_deref(), Some("sa-east-1"));
    // Collect tunables are not leaked into the process node.
    assert_eq!(var("MAX_WORKERS"), None);
    Ok(())
}

#[test]
fn input_date_overrides_the_boot_date() -> TestResult {
    let cfg = ConfigFileBuilder::new().input_date("2024-12-31").build();
    let env = NodeProfile::from_config(&cfg, StageId::Collect)
        .boot(CorrelationId::from("rerun"), Utc::now());
    assert_eq!(env.run_date(), NaiveDate::from_ymd_opt(2024, 12, 31).expect("date"));
    assert_eq!(env.collected_key(), "outputs/2024-12-31/collected.csv");
    Ok(())
}

#[test]
fn run_date_fixed_upstream_beats_the_boot_clock() -> TestResult {
    let cfg = ConfigFile::try_from(parse_str(FULL_CONFIG)?)?;
    let profile = NodeProfile::from_config(&cfg, StageId::Process);
    // Collect ran on the 14th; process boots after local midnight.
    let after_midnight = Utc.with_ymd_and_hms(2025, 3, 15, 3, 30, 0).single().expect("time");
    let fixed = NaiveDate::from_ymd_opt(2025, 3, 14);

    assert_eq!(
        profile.date_of(after_midnight),
        NaiveDate::from_ymd_opt(2025, 3, 15).expect("date")
    );
    let env = profile.boot_for_run(CorrelationId::from("run-1"), after_midnight, fixed);
    assert_eq!(Some(env.run_date()), fixed);
    assert_eq!(env.collected_key(), "outputs/2025-03-14/collected.csv");

    // A configured re-run date still wins.
    let rerun = ConfigFileBuilder::new().input_date("2024-12-31").build();
    let env = NodeProfile::from_config(&rerun, StageId::Process).boot_for_run(
        CorrelationId::from("run-1"),
        after_midnight,
        fixed,
    );
    assert_eq!(env.run_date(), NaiveDate::from_ymd_opt(2024, 12, 31).expect("date"));
    Ok(())
}
