// tests/manifest.rs

mod common;

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use labflow::cli::CliArgs;
use labflow::config::{load_and_validate, load_from_str, ConfigFile};
use labflow::connector::ConnectorId;
use labflow::errors::SchedulerError;
use labflow::{Launch, ResourceState, submit_manifest};
use labflow_test_utils::{JobConfigBuilder, ManifestBuilder, init_tracing, with_timeout};
use tempfile::NamedTempFile;

use common::bed;

fn manifest_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{}", contents).unwrap();
    file
}

fn config_error(contents: &str) -> String {
    let raw = load_from_str(contents).expect("manifest parses");
    match ConfigFile::try_from(raw) {
        Err(SchedulerError::ConfigError(msg)) => msg,
        Err(e) => panic!("Expected ConfigError, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn full_manifest_is_loaded_in_submission_order() {
    let file = manifest_file(
        r#"
[scheduler]
workdir = "/srv/lab"
store = "store.json"
poll_interval = "2s"
backoff_base = "100ms"
backoff_max = "1m"

[token.gpu]
limit = 2

[data.corpus]
path = "data/corpus"

[job.train]
path = "jobs/train"
command = ["python", "train.py"]
priority = 10
after = ["prepare"]
exclusive = ["corpus"]
tokens = { gpu = 1 }

[job.prepare]
path = "jobs/prepare"
command = ["python", "prepare.py"]
"#,
    );

    let cfg = load_and_validate(file.path()).unwrap();
    assert_eq!(cfg.scheduler.workdir, PathBuf::from("/srv/lab"));
    assert_eq!(cfg.scheduler.store_path(), Some(PathBuf::from("/srv/lab/store.json")));
    assert_eq!(cfg.scheduler.poll_interval, Duration::from_secs(2));
    assert_eq!(cfg.scheduler.backoff.base, Duration::from_millis(100));
    assert_eq!(cfg.scheduler.backoff.max, Duration::from_secs(60));
    assert!(cfg.data["corpus"].done);
    assert_eq!(cfg.job["train"].tokens["gpu"], 1);

    let entries = cfg.submission_order();
    let order: Vec<&str> = entries.iter().map(|e| e.name()).collect();
    assert_eq!(order, vec!["gpu", "corpus", "prepare", "train"]);
}

#[test]
fn relative_workdir_follows_the_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Labflow.toml");
    fs::write(&path, "[scheduler]\nworkdir = \"work\"\n").unwrap();

    let cfg = load_and_validate(&path).unwrap();
    assert_eq!(cfg.scheduler.workdir, dir.path().join("work"));
    assert!(cfg.scheduler.store_path().is_none());
}

#[test]
fn job_cycle_is_rejected() {
    let msg = config_error(
        r#"
[job.a]
path = "a"
command = ["true"]
after = ["b"]

[job.b]
path = "b"
command = ["true"]
exclusive = ["a"]
"#,
    );
    assert!(msg.contains("cycle detected"));
}

#[test]
fn bad_references_are_rejected() {
    let msg = config_error("[job.a]\npath = \"a\"\ncommand = [\"true\"]\nafter = [\"ghost\"]\n");
    assert!(msg.contains("unknown dependency 'ghost'"));

    let msg = config_error("[job.a]\npath = \"a\"\ncommand = [\"true\"]\ntokens = { gpu = 1 }\n");
    assert!(msg.contains("unknown token 'gpu'"));

    let msg = config_error("[job.a]\npath = \"a\"\ncommand = [\"true\"]\nafter = [\"a\"]\n");
    assert!(msg.contains("cannot depend on itself"));

    let msg = config_error(
        "[data.x]\npath = \"d\"\n[job.x]\npath = \"j\"\ncommand = [\"true\"]\n",
    );
    assert!(msg.contains("name 'x' is used by both"));
}

#[test]
fn bad_values_are_rejected() {
    let msg = config_error("[token.gpu]\nlimit = 0\n");
    assert!(msg.contains("limit >= 1"));

    let msg = config_error("[job.a]\npath = \"a\"\ncommand = []\n");
    assert!(msg.contains("empty command"));

    let msg = config_error(
        "[data.x]\npath = \"same\"\n[job.y]\npath = \"same\"\ncommand = [\"true\"]\n",
    );
    assert!(msg.contains("share the path"));

    let msg = config_error("[scheduler]\npoll_interval = \"soon\"\n");
    assert!(msg.contains("poll_interval"));

    let msg = config_error("[scheduler]\nbackoff_base = \"1m\"\nbackoff_max = \"1s\"\n");
    assert!(msg.contains("larger than backoff_max"));
}

#[test]
fn unreadable_manifests_are_reported() {
    let file = manifest_file("[job.a\npath = ");
    assert!(matches!(
        load_and_validate(file.path()),
        Err(SchedulerError::TomlError(_))
    ));
    assert!(matches!(
        load_and_validate("/definitely/not/here/Labflow.toml"),
        Err(SchedulerError::IoError(_))
    ));
}

#[test]
fn manifest_submission_wires_requirements() {
    let bed = bed();
    let cfg = ManifestBuilder::new()
        .token("gpu", 1)
        .data("corpus", "data/corpus")
        .job("prepare", JobConfigBuilder::new("jobs/prepare", &["prep"]))
        .job(
            "train",
            JobConfigBuilder::new("jobs/train", &["train"])
                .after("prepare")
                .exclusive("corpus")
                .tokens("gpu", 1)
                .priority(4),
        )
        .build();

    let ids = submit_manifest(&bed.scheduler, &cfg, &ConnectorId::local()).unwrap();
    assert_eq!(ids.len(), 4);
    let (prepare, train, gpu) = (ids["prepare"], ids["train"], ids["gpu"]);
    assert_eq!(bed.state(prepare), ResourceState::Ready);
    assert_eq!(bed.state(train), ResourceState::Waiting);
    assert_eq!(bed.details(train).priority, 4);
    assert_eq!(bed.details(train).nb_unsatisfied, 1);
    assert_eq!(
        bed.scheduler
            .find(&ConnectorId::local(), std::path::Path::new("tokens/gpu")),
        Some(gpu)
    );

    assert_eq!(bed.launch(), Launch::Started(prepare));
    bed.finish(prepare, 0);
    assert_eq!(bed.state(train), ResourceState::Ready);

    // Submitting again keeps ids, leaves finished jobs alone and applies
    // the new token limit.
    let cfg = ManifestBuilder::new()
        .token("gpu", 3)
        .data("corpus", "data/corpus")
        .job("prepare", JobConfigBuilder::new("jobs/prepare", &["prep"]))
        .job(
            "train",
            JobConfigBuilder::new("jobs/train", &["train"])
                .after("prepare")
                .exclusive("corpus")
                .tokens("gpu", 1),
        )
        .build();
    let again = submit_manifest(&bed.scheduler, &cfg, &ConnectorId::local()).unwrap();
    assert_eq!(again, ids);
    assert_eq!(bed.state(prepare), ResourceState::Done);
    assert_eq!(bed.state(train), ResourceState::Ready);
    assert_eq!(bed.details(train).priority, 0);
    let limit = bed
        .scheduler
        .resource(gpu)
        .and_then(|r| r.as_token().map(|t| t.limit()));
    assert_eq!(limit, Some(3));
}

fn args(config: &std::path::Path, dry_run: bool) -> CliArgs {
    CliArgs {
        config: config.display().to_string(),
        once: true,
        log_level: None,
        dry_run,
    }
}

#[tokio::test]
async fn binary_entry_point_runs_a_manifest_to_completion() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let manifest = dir.path().join("Labflow.toml");
    fs::write(
        &manifest,
        r#"
[scheduler]
workdir = "work"
store = "store.json"
poll_interval = "100ms"

[job.greet]
path = "jobs/greet"
command = ["echo", "hi"]

[job.shout]
path = "jobs/shout"
command = ["sh", "-c", "tr a-z A-Z < greet.out"]
after = ["greet"]
"#,
    )
    .unwrap();

    labflow::run(args(&manifest, true)).await.unwrap();
    assert!(!dir.path().join("work").exists());

    with_timeout(labflow::run(args(&manifest, false))).await.unwrap();
    let work = dir.path().join("work");
    assert_eq!(fs::read_to_string(work.join("jobs/shout.out")).unwrap(), "HI\n");
    assert!(work.join("jobs/greet.done").exists());
    assert!(work.join("store.json").exists());

    // Everything is done already; the second run has nothing to do.
    with_timeout(labflow::run(args(&manifest, false))).await.unwrap();
}
