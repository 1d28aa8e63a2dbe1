//! End-to-end tests for refinement sessions.
//!
//! A scripted in-process refiner stands in for the external program so the
//! scheduler, retry, resume and manifest behavior can be checked on a real
//! filesystem without spawning Python.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use refine_harness::error::{RunnerError, SchedulerError};
use refine_harness::runner::{
    ProcessOutput, RefineConfig, Refiner, RefinerInvocation, RetryingRunner, UnitRunner,
    UnitStatus,
};
use refine_harness::scheduler::{select_units, BatchScheduler, SessionOutcome};
use refine_harness::session::SessionManifestWriter;

#[derive(Clone)]
enum Behavior {
    Succeed,
    Fail,
    Panic,
    /// Writes this run log; `$RUN` expands to the run directory.
    Log(String),
    /// Leaves a run directory behind without a result channel or `[done]` line.
    Unannounced,
}

struct FakeRefiner {
    behaviors: HashMap<u32, Behavior>,
    delay: Duration,
    delays: HashMap<u32, Duration>,
    calls: Mutex<Vec<u32>>,
    runs: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    manifest_watch: Mutex<Option<PathBuf>>,
    observed: Mutex<Vec<usize>>,
}

impl FakeRefiner {
    fn new() -> Self {
        Self {
            behaviors: HashMap::new(),
            delay: Duration::ZERO,
            delays: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            runs: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            manifest_watch: Mutex::new(None),
            observed: Mutex::new(Vec::new()),
        }
    }

    fn with(mut self, model_id: u32, behavior: Behavior) -> Self {
        self.behaviors.insert(model_id, behavior);
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn with_delay_for(mut self, model_id: u32, delay: Duration) -> Self {
        self.delays.insert(model_id, delay);
        self
    }

    /// Reads the session manifest at every invocation.
    fn watch_manifest(&self, path: PathBuf) {
        *self.manifest_watch.lock().unwrap() = Some(path);
    }

    fn calls(&self) -> Vec<u32> {
        self.calls.lock().unwrap().clone()
    }

    fn sorted_calls(&self) -> Vec<u32> {
        let mut calls = self.calls();
        calls.sort_unstable();
        calls
    }

    fn write_run(&self, inv: &RefinerInvocation, log: Option<&str>) -> std::io::Result<()> {
        let n = self.runs.fetch_add(1, Ordering::SeqCst);
        let run_dir = inv.output_dir.join(format!("run-{n}"));
        fs::create_dir_all(&run_dir)?;
        for k in 1..=3 {
            fs::write(
                run_dir.join(format!("{k}.sysml")),
                format!("part def Model{}Iter{k};", inv.model_id),
            )?;
        }
        let log = match log {
            Some(template) => template.replace("$RUN", &run_dir.to_string_lossy()),
            None => json!([{
                "iteration": 1,
                "iteration_start": "2024-05-01T10:00:00Z",
                "iteration_end": "2024-05-01T10:00:02Z",
                "iteration_duration_seconds": 2.0,
                "success": true,
                "return_code": 0,
                "sysml_path": run_dir.join("1.sysml"),
                "tokens_used_total": 42,
            }])
            .to_string(),
        };
        let run_log = run_dir.join("run_log.json");
        fs::write(&run_log, log)?;
        fs::write(&inv.result_channel, run_log.to_string_lossy().as_bytes())
    }
}

#[async_trait]
impl Refiner for FakeRefiner {
    async fn refine(&self, inv: &RefinerInvocation) -> Result<ProcessOutput, RunnerError> {
        let id = inv.model_id;
        self.calls.lock().unwrap().push(id);
        let watched = self.manifest_watch.lock().unwrap().clone();
        if let Some(path) = watched {
            let manifest: Value = serde_json::from_str(&fs::read_to_string(path)?)?;
            let recorded = manifest["results"].as_array().map_or(0, Vec::len);
            self.observed.lock().unwrap().push(recorded);
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = self.delays.get(&id).copied().unwrap_or(self.delay);
        tokio::time::sleep(delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let behavior = self.behaviors.get(&id).cloned().unwrap_or(Behavior::Succeed);
        let exit_code = match behavior {
            Behavior::Succeed => {
                self.write_run(inv, None)?;
                0
            }
            Behavior::Log(template) => {
                self.write_run(inv, Some(template.as_str()))?;
                0
            }
            Behavior::Unannounced => {
                let run_dir = inv.output_dir.join("20250101-000000");
                fs::create_dir_all(&run_dir)?;
                let sysml = run_dir.join("1.sysml");
                fs::write(&sysml, format!("part def Quiet{id};"))?;
                let log = json!([{"iteration": 1, "success": true, "sysml_path": sysml}]);
                fs::write(run_dir.join("run_log.json"), log.to_string())?;
                0
            }
            Behavior::Fail => 1,
            Behavior::Panic => panic!("boom {id}"),
        };
        Ok(ProcessOutput {
            exit_code,
            stdout: format!("refining {id}\n"),
            stderr: String::new(),
        })
    }
}

struct Workspace {
    _temp: TempDir,
    config: Arc<RefineConfig>,
}

fn workspace(ids: &[u32], configure: impl FnOnce(RefineConfig) -> RefineConfig) -> Workspace {
    let temp = TempDir::new().unwrap();
    let prompts = temp.path().join("nl_prompts");
    for id in ids {
        let dir = prompts.join(id.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("nl.txt"), format!("Prompt {id}")).unwrap();
    }
    let samples = temp.path().join("samples");
    fs::create_dir_all(samples.join("1")).unwrap();
    fs::write(samples.join("1/design.sysml"), "part def Reference;").unwrap();

    let config = RefineConfig::new(temp.path().join("generated"))
        .with_prompts_root(&prompts)
        .with_samples_root(&samples)
        .with_refine_runs_root(temp.path().join("runs"))
        .with_id_retries(0);
    Workspace {
        config: Arc::new(configure(config)),
        _temp: temp,
    }
}

async fn run_session(
    ws: &Workspace,
    refiner: &Arc<FakeRefiner>,
    session_id: &str,
) -> (Result<SessionOutcome, SchedulerError>, SessionManifestWriter) {
    let config = &ws.config;
    let units = select_units(config).unwrap();
    let runner = RetryingRunner::new(
        UnitRunner::new(config.clone(), refiner.clone()),
        config.id_retries,
    );
    let mut writer = SessionManifestWriter::create_with_id(config, units.len(), session_id).unwrap();
    let outcome = BatchScheduler::from_config(config, runner)
        .run(&units, &mut writer)
        .await;
    (outcome, writer)
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn test_successful_session_publishes_artifacts_and_reports() {
    let ws = workspace(&[1, 2, 3], |c| c);
    let refiner = Arc::new(FakeRefiner::new());
    let (outcome, writer) = run_session(&ws, &refiner, "20240501-100000").await;
    let outcome = outcome.unwrap();

    assert_eq!(outcome.total_selected, 3);
    assert_eq!(outcome.counts.ok, 3);
    assert_eq!(refiner.calls(), vec![1, 2, 3]);

    let config = &ws.config;
    assert_eq!(
        fs::read_to_string(config.artifact_path(2)).unwrap(),
        "part def Model2Iter1;"
    );
    assert_eq!(
        fs::read_to_string(config.groundtruth_copy_path(1)).unwrap(),
        "part def Reference;"
    );
    let unit_manifest = read_json(&config.unit_manifest_path(1));
    assert_eq!(unit_manifest["status"], "ok");
    assert_eq!(unit_manifest["final_iteration_success"], true);
    assert_eq!(unit_manifest["tokens_used_total"], 42);

    let manifest = read_json(&outcome.manifest_path);
    assert_eq!(manifest["session_id"], "20240501-100000");
    assert_eq!(manifest["total_selected"], 3);
    assert_eq!(manifest["ok"], 3);
    assert_eq!(manifest["results"].as_array().unwrap().len(), 3);
    assert_eq!(manifest["results"][0]["batch_index"], 1);

    let loops = fs::read_to_string(writer.loop_timings_path()).unwrap();
    let mut lines = loops.lines();
    assert!(lines.next().unwrap().starts_with("model_id,batch_index,status,"));
    assert_eq!(lines.count(), 3);
    let iterations = fs::read_to_string(writer.iteration_timings_path()).unwrap();
    assert_eq!(iterations.lines().count(), 4);
    assert!(iterations.contains("2024-05-01T10:00:00Z"));
}

#[tokio::test]
async fn test_resume_skips_satisfied_units_without_touching_them() {
    let ws = workspace(&[1, 2, 3], |c| c);
    let first = Arc::new(FakeRefiner::new());
    run_session(&ws, &first, "20240501-100000").await.0.unwrap();

    let config = &ws.config;
    let snapshot: Vec<(Vec<u8>, Vec<u8>)> = [1, 2, 3]
        .iter()
        .map(|&id| {
            (
                fs::read(config.artifact_path(id)).unwrap(),
                fs::read(config.unit_manifest_path(id)).unwrap(),
            )
        })
        .collect();

    let second = Arc::new(FakeRefiner::new());
    let (outcome, _writer) = run_session(&ws, &second, "20240501-110000").await;
    let outcome = outcome.unwrap();

    assert!(second.calls().is_empty());
    assert_eq!(outcome.counts.skipped, 3);
    for (i, id) in [1, 2, 3].into_iter().enumerate() {
        assert_eq!(fs::read(config.artifact_path(id)).unwrap(), snapshot[i].0);
        assert_eq!(fs::read(config.unit_manifest_path(id)).unwrap(), snapshot[i].1);
    }
    let manifest = read_json(&outcome.manifest_path);
    assert_eq!(manifest["results"][0]["status"], "skipped");
    assert!(manifest["results"][0]["reason"]
        .as_str()
        .unwrap()
        .starts_with("existing artifact "));
}

#[tokio::test]
async fn test_resume_reruns_units_without_a_trustworthy_manifest() {
    let ws = workspace(&[1, 2, 3, 4], |c| c);
    run_session(&ws, &Arc::new(FakeRefiner::new()), "20240501-100000")
        .await
        .0
        .unwrap();

    let config = &ws.config;
    fs::write(config.unit_manifest_path(1), "{oops").unwrap();
    let mut manifest = read_json(&config.unit_manifest_path(2));
    manifest["status"] = json!("failed");
    fs::write(config.unit_manifest_path(2), manifest.to_string()).unwrap();
    fs::remove_file(config.artifact_path(3)).unwrap();

    let second = Arc::new(FakeRefiner::new());
    let (outcome, _writer) = run_session(&ws, &second, "20240501-110000").await;
    let outcome = outcome.unwrap();

    assert_eq!(second.sorted_calls(), vec![1, 2, 3]);
    assert_eq!(outcome.counts.ok, 3);
    assert_eq!(outcome.counts.skipped, 1);
}

#[tokio::test]
async fn test_overwrite_ignores_existing_results() {
    let ws = workspace(&[1, 2], |c| c);
    run_session(&ws, &Arc::new(FakeRefiner::new()), "20240501-100000")
        .await
        .0
        .unwrap();

    let ws = Workspace {
        config: Arc::new((*ws.config).clone().with_overwrite(true)),
        _temp: ws._temp,
    };
    let second = Arc::new(FakeRefiner::new());
    let outcome = run_session(&ws, &second, "20240501-110000").await.0.unwrap();
    assert_eq!(second.calls(), vec![1, 2]);
    assert_eq!(outcome.counts.ok, 2);
}

#[tokio::test]
async fn test_retries_are_bounded_per_unit() {
    let ws = workspace(&[1, 2, 3], |c| c.with_id_retries(2));
    let refiner = Arc::new(FakeRefiner::new().with(2, Behavior::Fail));
    let (outcome, writer) = run_session(&ws, &refiner, "20240501-100000").await;
    let outcome = outcome.unwrap();

    assert_eq!(refiner.calls(), vec![1, 2, 2, 2, 3]);
    assert_eq!(outcome.counts.ok, 2);
    assert_eq!(outcome.counts.failed, 1);

    let failed = writer
        .results()
        .iter()
        .find(|r| r.model_id == 2)
        .unwrap();
    assert_eq!(failed.status, UnitStatus::Failed);
    assert_eq!(failed.attempts_used, Some(3));
    assert_eq!(failed.attempt, Some(3));
    assert_eq!(failed.reason_text(), "refiner exited with code 1");
}

#[tokio::test]
async fn test_manifest_grows_by_one_result_per_unit() {
    let ws = workspace(&[1, 2, 3, 4], |c| c.with_batch_size(2));
    let refiner = Arc::new(FakeRefiner::new());
    let sid = "20240501-100000";
    refiner.watch_manifest(
        ws.config
            .sessions_root()
            .join(sid)
            .join(format!("_refine_session_{sid}.json")),
    );

    let (outcome, _writer) = run_session(&ws, &refiner, sid).await;
    outcome.unwrap();
    assert_eq!(*refiner.observed.lock().unwrap(), vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_stop_on_error_halts_sequential_session() {
    let ws = workspace(&[1, 2, 3, 4, 5], |c| {
        c.with_batch_size(2).with_stop_on_error(true)
    });
    let refiner = Arc::new(FakeRefiner::new().with(2, Behavior::Fail));
    let (outcome, writer) = run_session(&ws, &refiner, "20240501-100000").await;

    match outcome {
        Err(SchedulerError::StoppedOnError {
            batch_index,
            manifest_path,
        }) => {
            assert_eq!(batch_index, 1);
            assert_eq!(manifest_path, writer.manifest_path());
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("session should stop on the failed unit"),
    }
    assert_eq!(refiner.calls(), vec![1, 2]);

    let manifest = read_json(&writer.manifest_path());
    assert_eq!(manifest["results"].as_array().unwrap().len(), 2);
    assert_eq!(manifest["failed"], 1);
    assert_eq!(manifest["total_selected"], 5);
}

#[tokio::test]
async fn test_stop_on_error_drains_in_flight_parallel_units() {
    let ws = workspace(&[1, 2, 3, 4, 5, 6, 7, 8], |c| {
        c.with_batch_size(6)
            .with_parallelism(2)
            .with_stop_on_error(true)
    });
    let refiner = Arc::new(
        FakeRefiner::new()
            .with(1, Behavior::Fail)
            .with_delay_for(2, Duration::from_millis(100)),
    );
    let (outcome, writer) = run_session(&ws, &refiner, "20240501-100000").await;

    assert!(matches!(
        outcome,
        Err(SchedulerError::StoppedOnError { batch_index: 1, .. })
    ));
    // Unit 2 was already running and finishes; nothing else is dispatched.
    assert_eq!(refiner.sorted_calls(), vec![1, 2]);

    let recorded: Vec<(u32, UnitStatus)> = writer
        .results()
        .iter()
        .map(|r| (r.model_id, r.status))
        .collect();
    assert_eq!(recorded, vec![(1, UnitStatus::Failed), (2, UnitStatus::Ok)]);
    let manifest = read_json(&writer.manifest_path());
    assert_eq!(manifest["results"].as_array().unwrap().len(), 2);
    assert_eq!(manifest["ok"], 1);
    assert_eq!(manifest["failed"], 1);
    assert!(!ws.config.artifact_path(7).exists());
}

#[tokio::test]
async fn test_run_log_found_in_newest_unseen_run_dir() {
    let ws = workspace(&[1], |c| c);
    let refiner = Arc::new(FakeRefiner::new().with(1, Behavior::Unannounced));
    let (outcome, writer) = run_session(&ws, &refiner, "20240501-100000").await;
    assert_eq!(outcome.unwrap().counts.ok, 1);

    let result = &writer.results()[0];
    assert_eq!(result.status, UnitStatus::Ok, "{:?}", result.reason);
    assert!(result.run_dir.as_ref().unwrap().ends_with("20250101-000000"));
    assert_eq!(result.attempts_used, Some(1));
    assert_eq!(
        fs::read_to_string(ws.config.artifact_path(1)).unwrap(),
        "part def Quiet1;"
    );
}

#[tokio::test]
async fn test_last_success_wins_when_final_iteration_fails() {
    let log = r#"[
        {"iteration": 1, "success": false, "sysml_path": "$RUN/1.sysml"},
        {"iteration": 2, "success": true, "sysml_path": "$RUN/2.sysml", "tokens_used_total": 10},
        {"iteration": 3, "success": false, "sysml_path": "$RUN/3.sysml", "tokens_used_total": 25}
    ]"#;
    let ws = workspace(&[1], |c| c);
    let refiner = Arc::new(FakeRefiner::new().with(1, Behavior::Log(log.to_string())));
    let (outcome, writer) = run_session(&ws, &refiner, "20240501-100000").await;
    assert_eq!(outcome.unwrap().counts.ok, 1);

    let result = &writer.results()[0];
    assert_eq!(result.status, UnitStatus::Ok);
    assert_eq!(result.iterations_completed, Some(3));
    assert_eq!(result.final_iteration_success, Some(false));
    assert_eq!(result.tokens_used_total, Some(25));
    assert_eq!(result.iteration_timings.len(), 3);
    assert_eq!(
        fs::read_to_string(ws.config.artifact_path(1)).unwrap(),
        "part def Model1Iter2;"
    );
}

#[tokio::test]
async fn test_parallel_batches_record_every_unit_once() {
    let ws = workspace(&[1, 2, 3, 4, 5, 6, 7, 8], |c| {
        c.with_batch_size(4).with_parallelism(3)
    });
    let refiner = Arc::new(FakeRefiner::new().with_delay(Duration::from_millis(20)));
    let (outcome, writer) = run_session(&ws, &refiner, "20240501-100000").await;
    assert_eq!(outcome.unwrap().counts.ok, 8);

    assert_eq!(refiner.sorted_calls(), (1..=8).collect::<Vec<_>>());
    assert!(refiner.max_in_flight.load(Ordering::SeqCst) <= 3);

    let results = writer.results();
    let mut ids: Vec<u32> = results.iter().map(|r| r.model_id).collect();
    ids.sort_unstable();
    assert_eq!(ids, (1..=8).collect::<Vec<_>>());
    // Batches are barriers: every batch-1 result precedes batch 2.
    let batches: Vec<usize> = results.iter().map(|r| r.batch_index.unwrap()).collect();
    assert_eq!(batches, vec![1, 1, 1, 1, 2, 2, 2, 2]);
    for r in results {
        let expected = if r.model_id <= 4 { 1 } else { 2 };
        assert_eq!(r.batch_index, Some(expected));
    }
}

#[tokio::test]
async fn test_panicking_refiner_becomes_failed_result() {
    let ws = workspace(&[1, 2, 3], |c| c.with_parallelism(2).with_id_retries(1));
    let refiner = Arc::new(FakeRefiner::new().with(2, Behavior::Panic));
    let (outcome, writer) = run_session(&ws, &refiner, "20240501-100000").await;
    let outcome = outcome.unwrap();

    assert_eq!(outcome.counts.ok, 2);
    assert_eq!(outcome.counts.failed, 1);
    let failed = writer
        .results()
        .iter()
        .find(|r| r.model_id == 2)
        .unwrap();
    assert_eq!(failed.reason_text(), "runner exception: boom 2");
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_refiner_runs_script() {
    use refine_harness::runner::{CommandRefiner, SubprocessEnv};

    let ws = workspace(&[1], |c| c);
    let tools = ws._temp.path().join("tools");
    fs::create_dir_all(&tools).unwrap();
    let script = tools.join("refine.sh");
    // $2 is the prompt, $4 the output directory.
    fs::write(
        &script,
        r#"run="$4/run-a"
mkdir -p "$run"
cp "$2" "$run/1.sysml"
printf '[{"iteration": 1, "success": true, "sysml_path": "%s/1.sysml"}]' "$run" > "$run/run_log.json"
echo "[done] run details saved to $run/run_log.json"
"#,
    )
    .unwrap();

    let config = Arc::new(
        (*ws.config)
            .clone()
            .with_python("sh")
            .with_refine_script(&script),
    );
    let refiner = CommandRefiner::from_config(&config, SubprocessEnv::from_process()).unwrap();
    let units = select_units(&config).unwrap();
    let runner = RetryingRunner::new(UnitRunner::new(config.clone(), Arc::new(refiner)), 0);
    let mut writer = SessionManifestWriter::create_with_id(&config, 1, "20240501-100000").unwrap();
    let outcome = BatchScheduler::from_config(&config, runner)
        .run(&units, &mut writer)
        .await
        .unwrap();

    assert_eq!(outcome.counts.ok, 1, "{:?}", writer.results()[0].reason);
    assert_eq!(
        fs::read_to_string(config.artifact_path(1)).unwrap(),
        "Prompt 1"
    );
    assert!(fs::read_to_string(config.stdout_log_path(1))
        .unwrap()
        .contains("[done] run details saved to"));
}
