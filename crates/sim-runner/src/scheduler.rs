//! Work distribution across a fixed-size pool of worker threads. Each worker
//! owns its own [`BehaviorBridge`] (and thus its own embedded interpreter)
//! and executes one run at a time to completion before pulling the next
//! queued request.

use std::collections::{BTreeMap, VecDeque};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};

use sim_core::{apply_overrides, parse_json_src, Manifest};
use sim_plan::ExperimentPlan;

use crate::bridge::BehaviorBridge;
use crate::dataset::DatasetCache;
use crate::runner::{RunRequest, RunnerStatus, SimRunner};

pub const SIMLAB_WORKER_MAX_ENV: &str = "SIMLAB_WORKER_MAX";

/// One run's worth of work: the manifest it should execute (overrides
/// already applied) and its tick budget.
#[derive(Debug, Clone)]
pub struct QueuedRunSpec {
    pub run_id: String,
    pub manifest: Manifest,
    pub num_steps: u64,
    pub interpreter_enabled: bool,
}

struct QueuedRun {
    spec: QueuedRunSpec,
    status_tx: mpsc::Sender<RunnerStatus>,
    completion_tx: mpsc::Sender<RunCompletion>,
}

/// Resolves once, when the run it belongs to reaches a terminal state.
pub struct RunHandle {
    run_id: String,
    rx: mpsc::Receiver<RunnerStatus>,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .finish()
    }
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Block until the run completes. A run that errors still resolves, with
    /// the diagnostic in `runner_error`; an `Err` here means the worker pool
    /// shut down underneath the run.
    pub fn wait(&self) -> Result<RunnerStatus> {
        self.rx
            .recv()
            .map_err(|_| anyhow!("worker pool shut down before run '{}' resolved", self.run_id))
    }
}

#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub run_id: String,
    pub status: RunnerStatus,
}

/// Resolves only once every per-run handle has resolved.
pub struct ExperimentHandle {
    total: usize,
    rx: mpsc::Receiver<RunCompletion>,
}

impl std::fmt::Debug for ExperimentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentHandle")
            .field("total", &self.total)
            .finish()
    }
}

impl ExperimentHandle {
    pub fn run_count(&self) -> usize {
        self.total
    }

    /// Block until every queued run reaches a terminal state, successful or
    /// not. A single run's failure never aborts its siblings.
    pub fn wait(self) -> Result<Vec<RunCompletion>> {
        let mut completions = Vec::with_capacity(self.total);
        for _ in 0..self.total {
            let completion = self.rx.recv().map_err(|_| {
                anyhow!(
                    "worker pool shut down with {} of {} runs unresolved",
                    self.total - completions.len(),
                    self.total
                )
            })?;
            completions.push(completion);
        }
        Ok(completions)
    }
}

#[derive(Debug)]
pub struct ExperimentSubmission {
    pub run_handles: BTreeMap<String, RunHandle>,
    pub experiment: ExperimentHandle,
}

struct SchedulerInner {
    queue: Mutex<VecDeque<QueuedRun>>,
    work_ready: Condvar,
    shutdown: AtomicBool,
    dataset_cache: Arc<DatasetCache>,
}

/// A fixed-size pool of worker threads draining a FIFO queue of run
/// requests. At most one active run per worker at any time; admission is
/// FIFO but completion order across workers is not.
pub struct RunScheduler {
    inner: Arc<SchedulerInner>,
    workers: Vec<JoinHandle<()>>,
}

impl RunScheduler {
    pub fn new(workers: usize, dataset_cache: Arc<DatasetCache>) -> Result<Self> {
        let ceiling = parse_worker_ceiling_from_env()?;
        Self::new_with_ceiling(workers, dataset_cache, ceiling)
    }

    pub fn new_with_ceiling(
        workers: usize,
        dataset_cache: Arc<DatasetCache>,
        ceiling: Option<usize>,
    ) -> Result<Self> {
        if workers == 0 {
            return Err(anyhow!("run scheduler requires at least one worker"));
        }
        let effective = ceiling
            .map(|ceiling| workers.min(ceiling))
            .unwrap_or(workers)
            .max(1);
        if effective < workers {
            warn!(
                requested = workers,
                effective,
                env = SIMLAB_WORKER_MAX_ENV,
                "worker pool ceiling applied"
            );
        }

        let inner = Arc::new(SchedulerInner {
            queue: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            shutdown: AtomicBool::new(false),
            dataset_cache,
        });
        let mut handles = Vec::with_capacity(effective);
        for idx in 0..effective {
            let inner = inner.clone();
            let handle = thread::Builder::new()
                .name(format!("simlab-worker-{}", idx))
                .spawn(move || worker_loop(inner))
                .map_err(|err| anyhow!("failed to spawn worker thread: {}", err))?;
            handles.push(handle);
        }
        Ok(Self {
            inner,
            workers: handles,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Expand a plan against a base manifest and queue one run per variant.
    /// Each run gets its own deep copy of the base global properties with the
    /// variant's overrides applied; the base manifest is never mutated.
    pub fn queue(
        &self,
        manifest: &Manifest,
        plan: &ExperimentPlan,
        interpreter_enabled: bool,
    ) -> Result<ExperimentSubmission> {
        let base = parse_json_src(&manifest.properties_src, "globals.json")
            .context("parsing experiment base properties")?;
        let mut specs = Vec::with_capacity(plan.len());
        for (run_id, planned) in &plan.runs {
            let mut properties = base.clone();
            apply_overrides(&mut properties, &planned.fields);
            let mut run_manifest = manifest.clone();
            run_manifest.properties_src = serde_json::to_string(&properties)
                .context("serializing run properties")?;
            specs.push(QueuedRunSpec {
                run_id: run_id.clone(),
                manifest: run_manifest,
                num_steps: planned.steps,
                interpreter_enabled,
            });
        }
        self.queue_runs(specs)
    }

    /// Queue pre-built run specs directly.
    pub fn queue_runs(&self, specs: Vec<QueuedRunSpec>) -> Result<ExperimentSubmission> {
        let (completion_tx, completion_rx) = mpsc::channel();
        let total = specs.len();
        let mut run_handles = BTreeMap::new();
        {
            let mut queue = self
                .inner
                .queue
                .lock()
                .map_err(|_| anyhow!("scheduler queue lock poisoned"))?;
            for spec in specs {
                let (status_tx, status_rx) = mpsc::channel();
                run_handles.insert(
                    spec.run_id.clone(),
                    RunHandle {
                        run_id: spec.run_id.clone(),
                        rx: status_rx,
                    },
                );
                queue.push_back(QueuedRun {
                    spec,
                    status_tx,
                    completion_tx: completion_tx.clone(),
                });
            }
        }
        self.inner.work_ready.notify_all();
        Ok(ExperimentSubmission {
            run_handles,
            experiment: ExperimentHandle {
                total,
                rx: completion_rx,
            },
        })
    }
}

impl Drop for RunScheduler {
    /// Lets queued work drain, then stops the pool.
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.work_ready.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(inner: Arc<SchedulerInner>) {
    let mut bridge = BehaviorBridge::new();
    loop {
        let next = {
            let mut queue = match inner.queue.lock() {
                Ok(queue) => queue,
                Err(_) => return,
            };
            loop {
                if let Some(run) = queue.pop_front() {
                    break Some(run);
                }
                if inner.shutdown.load(Ordering::SeqCst) {
                    break None;
                }
                queue = match inner.work_ready.wait(queue) {
                    Ok(queue) => queue,
                    Err(_) => return,
                };
            }
        };
        let Some(queued) = next else {
            return;
        };
        let status = execute_run(&inner.dataset_cache, &mut bridge, &queued.spec);
        let _ = queued.status_tx.send(status.clone());
        let _ = queued.completion_tx.send(RunCompletion {
            run_id: queued.spec.run_id.clone(),
            status,
        });
    }
}

fn execute_run(
    cache: &Arc<DatasetCache>,
    bridge: &mut BehaviorBridge,
    spec: &QueuedRunSpec,
) -> RunnerStatus {
    debug!(run_id = %spec.run_id, steps = spec.num_steps, "worker picked up run");
    let mut runner = SimRunner::new(cache.clone());
    let status = runner.handle_request(
        RunRequest::Initialize {
            manifest: spec.manifest.clone(),
            num_steps: spec.num_steps,
            preset_run_id: Some(spec.run_id.clone()),
            embedded_interpreter_enabled: spec.interpreter_enabled,
        },
        bridge,
    );
    if status.runner_error.is_none() {
        runner.handle_request(
            RunRequest::Step {
                num_steps: spec.num_steps,
            },
            bridge,
        );
    }
    runner.full_status(bridge)
}

fn parse_worker_ceiling_from_env() -> Result<Option<usize>> {
    match env::var(SIMLAB_WORKER_MAX_ENV) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let parsed = trimmed.parse::<usize>().map_err(|_| {
                anyhow!(
                    "{} must be a positive integer when set (got: {})",
                    SIMLAB_WORKER_MAX_ENV,
                    raw
                )
            })?;
            if parsed == 0 {
                return Err(anyhow!("{} must be > 0 when set", SIMLAB_WORKER_MAX_ENV));
            }
            Ok(Some(parsed))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed reading {}: {}", SIMLAB_WORKER_MAX_ENV, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use sim_core::{DatasetDescriptor, DatasetFormat, SourceDescriptor};

    use crate::dataset::FetchBytes;

    struct NoFetch;

    impl FetchBytes for NoFetch {
        fn fetch(&self, url: &str) -> Result<String> {
            Err(anyhow!("tests never fetch: {}", url))
        }
    }

    /// Sleeps inside each fetch and records the peak number of overlapping
    /// fetches, so tests can observe how many runs were active at once.
    struct GaugeFetcher {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl FetchBytes for GaugeFetcher {
        fn fetch(&self, _url: &str) -> Result<String> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(40));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok("[1]".to_string())
        }
    }

    fn manifest(properties: &str, behaviors: &[(&str, &str)]) -> Manifest {
        Manifest {
            properties_src: properties.to_string(),
            datasets: Vec::new(),
            initializers: vec![SourceDescriptor {
                filename: "init.json".to_string(),
                source_text: r#"[{"agent_id": "a", "behaviors": ["grow.script"], "energy": 0}]"#
                    .to_string(),
                guest_language: None,
                dependencies: Vec::new(),
            }],
            behaviors: behaviors
                .iter()
                .map(|(filename, source)| SourceDescriptor {
                    filename: filename.to_string(),
                    source_text: source.to_string(),
                    guest_language: None,
                    dependencies: Vec::new(),
                })
                .collect(),
        }
    }

    fn grow_manifest() -> Manifest {
        manifest(
            r#"{"rate": 1}"#,
            &[("grow.script", "state.energy = state.energy + context.globals().rate;")],
        )
    }

    fn values_plan(values: &[i64], steps: u64) -> ExperimentPlan {
        let catalog = serde_json::from_value(json!({
            "sweep": {"type": "values", "field": "rate", "values": values, "steps": steps}
        }))
        .expect("catalog fixture should parse");
        sim_plan::plan("sweep", &catalog).expect("plan should build")
    }

    #[test]
    fn five_runs_on_two_workers_all_resolve_exactly_once() {
        let cache = Arc::new(DatasetCache::with_fetcher(Box::new(NoFetch)));
        let scheduler = RunScheduler::new_with_ceiling(2, cache, None).expect("scheduler");
        let plan = values_plan(&[1, 2, 3, 4, 5], 3);
        let submission = scheduler
            .queue(&grow_manifest(), &plan, true)
            .expect("queue should accept the plan");
        assert_eq!(submission.run_handles.len(), 5);

        for (run_id, handle) in &submission.run_handles {
            let status = handle.wait().expect("run should resolve");
            assert_eq!(status.run_id.as_deref(), Some(run_id.as_str()));
            assert_eq!(status.runner_error, None);
            assert_eq!(status.steps_taken, 3);
        }

        let completions = submission.experiment.wait().expect("experiment resolves");
        let ids: HashSet<String> = completions.iter().map(|c| c.run_id.clone()).collect();
        assert_eq!(ids.len(), 5, "every run completes exactly once");
    }

    #[test]
    fn variant_overrides_reach_each_run() {
        let cache = Arc::new(DatasetCache::with_fetcher(Box::new(NoFetch)));
        let scheduler = RunScheduler::new_with_ceiling(2, cache, None).expect("scheduler");
        let plan = values_plan(&[1, 2, 3], 5);
        let submission = scheduler
            .queue(&grow_manifest(), &plan, true)
            .expect("queue should accept the plan");

        let mut energies: Vec<f64> = submission
            .experiment
            .wait()
            .expect("experiment resolves")
            .iter()
            .map(|completion| {
                let steps = completion
                    .status
                    .accumulated_steps
                    .as_ref()
                    .expect("final status carries accumulated steps");
                steps[&5][0]["energy"].as_f64().expect("numeric energy")
            })
            .collect();
        energies.sort_by(|a, b| a.partial_cmp(b).expect("comparable"));
        assert_eq!(energies, vec![5.0, 10.0, 15.0], "five ticks at rate 1, 2, 3");
    }

    #[test]
    fn active_runs_never_exceed_the_worker_count() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(DatasetCache::with_fetcher(Box::new(GaugeFetcher {
            active: active.clone(),
            peak: peak.clone(),
        })));
        let scheduler = RunScheduler::new_with_ceiling(2, cache, None).expect("scheduler");

        let specs: Vec<QueuedRunSpec> = (0..5)
            .map(|idx| {
                let mut manifest = manifest("{}", &[]);
                manifest.initializers[0].source_text = r#"[{"agent_id": "a"}]"#.to_string();
                manifest.datasets.push(DatasetDescriptor {
                    storage_key: format!("key-{}", idx),
                    shortname: format!("data-{}", idx),
                    format: DatasetFormat::Json,
                    source_url: Some(format!("https://datasets.test/{}", idx)),
                    in_place_data: None,
                });
                QueuedRunSpec {
                    run_id: format!("gauge.{:04}", idx),
                    manifest,
                    num_steps: 1,
                    interpreter_enabled: true,
                }
            })
            .collect();

        let submission = scheduler.queue_runs(specs).expect("queue specs");
        let completions = submission.experiment.wait().expect("experiment resolves");
        assert_eq!(completions.len(), 5);
        assert!(
            peak.load(Ordering::SeqCst) <= 2,
            "more than two runs were active at once: {}",
            peak.load(Ordering::SeqCst)
        );
    }

    #[test]
    fn one_failing_run_does_not_abort_its_siblings() {
        let cache = Arc::new(DatasetCache::with_fetcher(Box::new(NoFetch)));
        let scheduler = RunScheduler::new_with_ceiling(2, cache, None).expect("scheduler");

        let mut bad = manifest(
            "{}",
            &[("bad.script", "let x = 1 + \"oops\";")],
        );
        bad.initializers[0].source_text =
            r#"[{"agent_id": "a", "behaviors": ["bad.script"]}]"#.to_string();
        let specs = vec![
            QueuedRunSpec {
                run_id: "ok.0000".to_string(),
                manifest: grow_manifest(),
                num_steps: 2,
                interpreter_enabled: true,
            },
            QueuedRunSpec {
                run_id: "bad.0000".to_string(),
                manifest: bad,
                num_steps: 2,
                interpreter_enabled: true,
            },
            QueuedRunSpec {
                run_id: "ok.0001".to_string(),
                manifest: grow_manifest(),
                num_steps: 2,
                interpreter_enabled: true,
            },
        ];
        let submission = scheduler.queue_runs(specs).expect("queue specs");
        let completions = submission.experiment.wait().expect("experiment resolves");
        assert_eq!(completions.len(), 3);
        for completion in &completions {
            if completion.run_id == "bad.0000" {
                assert!(completion.status.runner_error.is_some());
            } else {
                assert_eq!(completion.status.runner_error, None);
                assert_eq!(completion.status.steps_taken, 2);
            }
        }
    }

    #[test]
    fn worker_ceiling_clamps_the_requested_pool() {
        let cache = Arc::new(DatasetCache::with_fetcher(Box::new(NoFetch)));
        let scheduler = RunScheduler::new_with_ceiling(8, cache, Some(2)).expect("scheduler");
        assert_eq!(scheduler.worker_count(), 2);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let cache = Arc::new(DatasetCache::with_fetcher(Box::new(NoFetch)));
        assert!(RunScheduler::new_with_ceiling(0, cache, None).is_err());
    }

    #[test]
    fn unparseable_base_properties_fail_before_any_run_starts() {
        let cache = Arc::new(DatasetCache::with_fetcher(Box::new(NoFetch)));
        let scheduler = RunScheduler::new_with_ceiling(1, cache, None).expect("scheduler");
        let mut manifest = grow_manifest();
        manifest.properties_src = "{nope".to_string();
        let err = scheduler
            .queue(&manifest, &values_plan(&[1], 1), true)
            .expect_err("bad base properties must fail fast");
        assert!(err.to_string().contains("base properties"), "got: {}", err);
    }
}
