//! One simulation run's lifecycle: initialize from a manifest, step or play
//! the kernel, accumulate per-step snapshots, and surface status.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use sim_core::{parse_json_src, Diagnostic, Manifest};
use sim_plan::MetricObjective;

use crate::bridge::{BehaviorBridge, InterpreterStatus, LoadKind};
use crate::dataset::{load_manifest_datasets, DatasetCache};
use crate::diag;
use crate::kernel::{scan_for_stop, KernelWrapper, SimulationComponents};

static NEXT_RUN_SEQ: AtomicU64 = AtomicU64::new(1);

/// Requests directed at one simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RunRequest {
    Initialize {
        manifest: Manifest,
        num_steps: u64,
        #[serde(default)]
        preset_run_id: Option<String>,
        embedded_interpreter_enabled: bool,
    },
    Play {
        #[serde(default)]
        properties_src: Option<String>,
    },
    Pause,
    Step {
        num_steps: u64,
    },
    UpdateComponents {
        #[serde(default)]
        properties_src: Option<String>,
    },
    Status,
    GetReadySteps {
        #[serde(default)]
        omit_data: bool,
    },
}

/// The three metric fields are present together or absent together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricReport {
    pub metric_objective: MetricObjective,
    pub metric_outcome: f64,
    pub metric_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerStatus {
    pub run_id: Option<String>,
    pub running: bool,
    pub steps_taken: u64,
    pub interpreter_status: InterpreterStatus,
    pub runner_error: Option<Diagnostic>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accumulated_steps: Option<BTreeMap<u64, Vec<Value>>>,
    pub early_stop: bool,
    pub stop_message: Value,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricReport>,
}

/// Lets another thread clear the running flag; the in-flight tick still
/// completes.
#[derive(Clone)]
pub struct RunnerControl {
    running: Arc<AtomicBool>,
}

impl RunnerControl {
    pub fn pause(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// The per-run state machine. Owned exclusively by the worker executing the
/// run and discarded when the run completes.
pub struct SimRunner {
    run_id: Option<String>,
    dataset_cache: Arc<DatasetCache>,
    components: Option<SimulationComponents>,
    wrapper: Option<KernelWrapper>,
    latest_state: Vec<Value>,
    accumulated: BTreeMap<u64, Vec<Value>>,
    steps_taken: u64,
    steps_left: u64,
    running: Arc<AtomicBool>,
    early_stop: bool,
    stop_message: Value,
    runner_error: Option<Diagnostic>,
}

impl SimRunner {
    pub fn new(dataset_cache: Arc<DatasetCache>) -> Self {
        Self {
            run_id: None,
            dataset_cache,
            components: None,
            wrapper: None,
            latest_state: Vec::new(),
            accumulated: BTreeMap::new(),
            steps_taken: 0,
            steps_left: 0,
            running: Arc::new(AtomicBool::new(false)),
            early_stop: false,
            stop_message: Value::Null,
            runner_error: None,
        }
    }

    pub fn control(&self) -> RunnerControl {
        RunnerControl {
            running: self.running.clone(),
        }
    }

    pub fn handle_request(&mut self, request: RunRequest, bridge: &mut BehaviorBridge) -> RunnerStatus {
        match request {
            RunRequest::Initialize {
                manifest,
                num_steps,
                preset_run_id,
                embedded_interpreter_enabled,
            } => {
                self.initialize(
                    &manifest,
                    num_steps,
                    preset_run_id,
                    embedded_interpreter_enabled,
                    bridge,
                );
                self.status(bridge, None)
            }
            RunRequest::Step { num_steps } => {
                self.step(num_steps, bridge);
                self.status(bridge, None)
            }
            RunRequest::Play { properties_src } => {
                self.play(properties_src.as_deref(), bridge);
                self.status(bridge, None)
            }
            RunRequest::Pause => {
                self.running.store(false, Ordering::SeqCst);
                self.status(bridge, None)
            }
            RunRequest::UpdateComponents { properties_src } => {
                self.update_components(properties_src.as_deref(), bridge);
                self.status(bridge, None)
            }
            RunRequest::Status => self.status(bridge, None),
            RunRequest::GetReadySteps { omit_data } => {
                let drained = std::mem::take(&mut self.accumulated);
                self.status(bridge, if omit_data { None } else { Some(drained) })
            }
        }
    }

    fn status(
        &self,
        bridge: &BehaviorBridge,
        accumulated: Option<BTreeMap<u64, Vec<Value>>>,
    ) -> RunnerStatus {
        RunnerStatus {
            run_id: self.run_id.clone(),
            running: self.running.load(Ordering::SeqCst),
            steps_taken: self.steps_taken,
            interpreter_status: bridge.interpreter_status(),
            runner_error: self.runner_error.clone(),
            accumulated_steps: accumulated,
            early_stop: self.early_stop,
            stop_message: self.stop_message.clone(),
            metrics: None,
        }
    }

    /// A snapshot including everything accumulated so far, for callers that
    /// want the whole run in one status.
    pub fn full_status(&self, bridge: &BehaviorBridge) -> RunnerStatus {
        self.status(bridge, Some(self.accumulated.clone()))
    }

    fn initialize(
        &mut self,
        manifest: &Manifest,
        num_steps: u64,
        preset_run_id: Option<String>,
        embedded_interpreter_enabled: bool,
        bridge: &mut BehaviorBridge,
    ) {
        if let Some(mut wrapper) = self.wrapper.take() {
            wrapper.free();
        }
        bridge.clear_error();

        self.run_id = Some(preset_run_id.unwrap_or_else(generated_run_id));
        self.steps_left = num_steps;
        self.steps_taken = 0;
        self.early_stop = false;
        self.stop_message = Value::Null;
        self.runner_error = None;
        self.accumulated.clear();
        self.latest_state.clear();
        self.components = None;
        self.running.store(false, Ordering::SeqCst);

        let components = match self.resolve_components(manifest, embedded_interpreter_enabled, bridge)
        {
            Ok(components) => components,
            Err(diagnostic) => {
                self.runner_error = Some(diagnostic);
                return;
            }
        };

        if bridge.interpreter_in_use() {
            bridge.refresh_datasets(&components.loaded_datasets);
            bridge.update_globals(&components.properties);
        }

        let init_context = crate::kernel::InitContext {
            globals: &components.properties,
            datasets: &components.datasets,
        };
        let initial = match bridge.invoke_initializer(&components.initializer, &init_context) {
            Ok(agents) => agents,
            Err(err) => {
                self.runner_error = Some(diag::normalize_bridge(&err));
                return;
            }
        };

        let wrapper = KernelWrapper::start_simulation(initial);
        self.latest_state = wrapper.initial_state().to_vec();
        self.accumulated.insert(0, self.latest_state.clone());
        self.wrapper = Some(wrapper);
        self.components = Some(components);
        debug!(run_id = ?self.run_id, "run initialized");
    }

    fn resolve_components(
        &mut self,
        manifest: &Manifest,
        embedded_interpreter_enabled: bool,
        bridge: &mut BehaviorBridge,
    ) -> Result<SimulationComponents, Diagnostic> {
        let properties = parse_json_src(&manifest.properties_src, "globals.json")
            .map_err(|err| diag::normalize_config(&err))?;

        let loaded_datasets = load_manifest_datasets(&self.dataset_cache, &manifest.datasets);
        let mut datasets = serde_json::Map::new();
        for dataset in &loaded_datasets {
            datasets.insert(dataset.shortname.clone(), (*dataset.payload).clone());
        }

        let init_descriptor = manifest
            .initializer()
            .map_err(|err| diag::normalize_config(&err))?;
        let initializer = bridge
            .load(LoadKind::Initializer, init_descriptor, embedded_interpreter_enabled)
            .map_err(|err| diag::normalize_bridge(&err))?;

        let mut behaviors = Vec::with_capacity(manifest.behaviors.len());
        for descriptor in &manifest.behaviors {
            let behavior = bridge
                .load(LoadKind::Behavior, descriptor, embedded_interpreter_enabled)
                .map_err(|err| diag::normalize_bridge(&err))?;
            behaviors.push(behavior);
        }

        Ok(SimulationComponents {
            properties,
            datasets: Value::Object(datasets),
            loaded_datasets,
            initializer,
            behaviors,
        })
    }

    fn step(&mut self, num_steps: u64, bridge: &mut BehaviorBridge) {
        if self.early_stop {
            return;
        }
        if self.wrapper.is_none() {
            self.runner_error = Some(diag::normalize_kernel(
                "step requested before initialize",
                "engine",
            ));
            return;
        }
        self.steps_left = num_steps;
        self.running.store(true, Ordering::SeqCst);
        self.run_sim(bridge);
    }

    fn play(&mut self, properties_src: Option<&str>, bridge: &mut BehaviorBridge) {
        if self.early_stop || self.run_id.is_none() {
            return;
        }
        self.update_components(properties_src, bridge);
        if self.runner_error.is_some() {
            return;
        }
        self.steps_left = u64::MAX;
        self.running.store(true, Ordering::SeqCst);
        self.run_sim(bridge);
    }

    /// The tick loop. Failures are stored as the run's terminal error; they
    /// never propagate out of the worker.
    fn run_sim(&mut self, bridge: &mut BehaviorBridge) {
        while self.steps_left > 0 && self.running.load(Ordering::SeqCst) && !self.early_stop {
            let (wrapper, components) = match (&mut self.wrapper, &self.components) {
                (Some(wrapper), Some(components)) => (wrapper, components),
                _ => break,
            };
            match wrapper.next_state(components, bridge) {
                Ok(new_state) => {
                    let stop = scan_for_stop(&new_state);
                    self.accumulated.insert(self.steps_taken + 1, new_state.clone());
                    self.latest_state = new_state;
                    self.steps_taken += 1;
                    self.steps_left -= 1;
                    if let Some(message) = stop {
                        self.early_stop = true;
                        self.stop_message = message;
                        break;
                    }
                }
                Err(diagnostic) => {
                    self.runner_error = Some(diagnostic);
                    break;
                }
            }
            // Stay cooperative between ticks so the host thread is never
            // starved during long sweeps.
            std::thread::yield_now();
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Swap in new global properties and rebuild the kernel wrapper from the
    /// current agent-state array so the run continues where it left off.
    fn update_components(&mut self, properties_src: Option<&str>, bridge: &mut BehaviorBridge) {
        let Some(components) = &mut self.components else {
            return;
        };
        if let Some(src) = properties_src {
            match parse_json_src(src, "globals.json") {
                Ok(properties) => {
                    components.properties = properties.clone();
                    bridge.update_globals(&properties);
                }
                Err(err) => {
                    self.running.store(false, Ordering::SeqCst);
                    self.runner_error = Some(diag::normalize_config(&err));
                    return;
                }
            }
        }
        if let Some(mut old) = self.wrapper.take() {
            old.free();
        }
        self.wrapper = Some(KernelWrapper::start_simulation(self.latest_state.clone()));
    }
}

fn generated_run_id() -> String {
    let seq = NEXT_RUN_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("run-{}-{}", Utc::now().timestamp_micros(), seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sim_core::{Phase, SourceDescriptor};

    fn manifest(properties: &str, init: (&str, &str), behaviors: &[(&str, &str)]) -> Manifest {
        Manifest {
            properties_src: properties.to_string(),
            datasets: Vec::new(),
            initializers: vec![SourceDescriptor {
                filename: init.0.to_string(),
                source_text: init.1.to_string(),
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

    fn fresh_runner() -> (SimRunner, BehaviorBridge) {
        let cache = Arc::new(DatasetCache::with_fetcher(Box::new(NoFetch)));
        (SimRunner::new(cache), BehaviorBridge::new())
    }

    struct NoFetch;

    impl crate::dataset::FetchBytes for NoFetch {
        fn fetch(&self, url: &str) -> anyhow::Result<String> {
            Err(anyhow::anyhow!("tests never fetch: {}", url))
        }
    }

    fn initialize(
        runner: &mut SimRunner,
        bridge: &mut BehaviorBridge,
        manifest: Manifest,
        num_steps: u64,
    ) -> RunnerStatus {
        runner.handle_request(
            RunRequest::Initialize {
                manifest,
                num_steps,
                preset_run_id: Some("run-under-test".to_string()),
                embedded_interpreter_enabled: true,
            },
            bridge,
        )
    }

    #[test]
    fn initialize_seeds_step_zero() {
        let (mut runner, mut bridge) = fresh_runner();
        let status = initialize(
            &mut runner,
            &mut bridge,
            manifest("{}", ("init.json", "[{\"agent_id\": \"a\"}]"), &[]),
            5,
        );
        assert_eq!(status.runner_error, None);
        assert_eq!(status.steps_taken, 0);
        let status = runner.handle_request(RunRequest::GetReadySteps { omit_data: false }, &mut bridge);
        let steps = status.accumulated_steps.expect("steps present");
        assert_eq!(steps.len(), 1);
        assert!(steps.contains_key(&0));
    }

    #[test]
    fn step_advances_and_accumulates() {
        let (mut runner, mut bridge) = fresh_runner();
        initialize(
            &mut runner,
            &mut bridge,
            manifest(
                "{\"rate\": 1}",
                ("init.json", "[{\"agent_id\": \"a\", \"behaviors\": [\"grow.script\"], \"energy\": 0}]"),
                &[("grow.script", "state.energy = state.energy + context.globals().rate;")],
            ),
            5,
        );
        let status = runner.handle_request(RunRequest::Step { num_steps: 5 }, &mut bridge);
        assert_eq!(status.runner_error, None);
        assert_eq!(status.steps_taken, 5);
        assert!(!status.running);

        let status = runner.handle_request(RunRequest::GetReadySteps { omit_data: false }, &mut bridge);
        let steps = status.accumulated_steps.expect("steps present");
        assert_eq!(steps.len(), 6, "initial state plus five ticks");
        assert_eq!(steps[&5][0]["energy"], json!(5.0));
    }

    #[test]
    fn early_stop_halts_before_budget_and_is_terminal() {
        let (mut runner, mut bridge) = fresh_runner();
        initialize(
            &mut runner,
            &mut bridge,
            manifest(
                "{}",
                ("init.json", "[{\"agent_id\": \"a\", \"behaviors\": [\"halt.script\"]}]"),
                &[(
                    "halt.script",
                    r#"if context.step() == 2 { add_message("hash", "stop", { "reason": "done" }); }"#,
                )],
            ),
            10,
        );
        let status = runner.handle_request(RunRequest::Step { num_steps: 10 }, &mut bridge);
        assert!(status.early_stop);
        assert_eq!(status.steps_taken, 3);
        assert_eq!(status.stop_message["reason"], json!("done"));

        // Terminal: further stepping is refused.
        let status = runner.handle_request(RunRequest::Step { num_steps: 5 }, &mut bridge);
        assert_eq!(status.steps_taken, 3);
        let status = runner.handle_request(RunRequest::GetReadySteps { omit_data: false }, &mut bridge);
        let steps = status.accumulated_steps.expect("steps present");
        assert_eq!(
            steps.keys().max().copied(),
            Some(3),
            "no accumulated steps beyond the stop tick"
        );
    }

    #[test]
    fn pause_from_another_thread_stops_the_unbounded_loop() {
        let (mut runner, mut bridge) = fresh_runner();
        initialize(
            &mut runner,
            &mut bridge,
            manifest(
                "{\"rate\": 1}",
                ("init.json", "[{\"agent_id\": \"a\", \"behaviors\": [\"grow.script\"], \"energy\": 0}]"),
                &[("grow.script", "state.energy = state.energy + context.globals().rate;")],
            ),
            5,
        );
        let control = runner.control();
        let handle = std::thread::spawn(move || {
            let status = runner.handle_request(
                RunRequest::Play {
                    properties_src: None,
                },
                &mut bridge,
            );
            (status, runner, bridge)
        });
        while !control.is_running() {
            std::thread::yield_now();
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
        control.pause();
        let (status, _runner, _bridge) = handle.join().expect("runner thread finishes");
        assert!(!status.running);
        assert_eq!(status.runner_error, None);
        assert!(status.steps_taken > 0, "play made progress before the pause");
        assert!(!status.early_stop);
    }

    #[test]
    fn behavior_failure_becomes_terminal_runner_error() {
        let (mut runner, mut bridge) = fresh_runner();
        initialize(
            &mut runner,
            &mut bridge,
            manifest(
                "{}",
                ("init.json", "[{\"agent_id\": \"a\", \"behaviors\": [\"bad.script\"]}]"),
                &[("bad.script", "let x = 1 + \"oops\";")],
            ),
            5,
        );
        let status = runner.handle_request(RunRequest::Step { num_steps: 5 }, &mut bridge);
        let error = status.runner_error.expect("tick failure is captured");
        assert_eq!(error.phase, Phase::Running);
        assert_eq!(error.context, "bad.script");
        assert_eq!(status.steps_taken, 0);
    }

    #[test]
    fn wrong_initializer_count_fails_before_any_tick() {
        let (mut runner, mut bridge) = fresh_runner();
        let mut bad = manifest("{}", ("init.json", "[]"), &[]);
        bad.initializers.clear();
        let status = initialize(&mut runner, &mut bridge, bad, 5);
        let error = status.runner_error.expect("configuration error surfaces");
        assert!(error.message.contains("exactly one initializer"));
    }

    #[test]
    fn interp_behavior_with_interpreter_disabled_errors_the_run() {
        let (mut runner, mut bridge) = fresh_runner();
        let status = runner.handle_request(
            RunRequest::Initialize {
                manifest: manifest(
                    "{}",
                    ("init.json", "[{\"agent_id\": \"a\"}]"),
                    &[("grow.interp", "state.x = 1;")],
                ),
                num_steps: 5,
                preset_run_id: None,
                embedded_interpreter_enabled: false,
            },
            &mut bridge,
        );
        assert_eq!(status.interpreter_status, InterpreterStatus::Errored);
        let error = status.runner_error.expect("disabled interpreter is fatal");
        assert!(error.message.contains("embedded interpreter"));
    }

    #[test]
    fn update_components_swaps_globals_and_keeps_state() {
        let (mut runner, mut bridge) = fresh_runner();
        initialize(
            &mut runner,
            &mut bridge,
            manifest(
                "{\"rate\": 1}",
                ("init.json", "[{\"agent_id\": \"a\", \"behaviors\": [\"grow.script\"], \"energy\": 0}]"),
                &[("grow.script", "state.energy = state.energy + context.globals().rate;")],
            ),
            10,
        );
        runner.handle_request(RunRequest::Step { num_steps: 2 }, &mut bridge);
        runner.handle_request(
            RunRequest::UpdateComponents {
                properties_src: Some("{\"rate\": 10}".to_string()),
            },
            &mut bridge,
        );
        let status = runner.handle_request(RunRequest::Step { num_steps: 1 }, &mut bridge);
        assert_eq!(status.runner_error, None);
        let status = runner.handle_request(RunRequest::GetReadySteps { omit_data: false }, &mut bridge);
        let steps = status.accumulated_steps.expect("steps present");
        assert_eq!(
            steps[&3][0]["energy"],
            json!(12.0),
            "two ticks at rate 1, one at rate 10, from preserved state"
        );
    }

    #[test]
    fn get_ready_steps_drains_the_accumulator() {
        let (mut runner, mut bridge) = fresh_runner();
        initialize(
            &mut runner,
            &mut bridge,
            manifest("{}", ("init.json", "[{\"agent_id\": \"a\"}]"), &[]),
            2,
        );
        runner.handle_request(RunRequest::Step { num_steps: 2 }, &mut bridge);
        let status = runner.handle_request(RunRequest::GetReadySteps { omit_data: false }, &mut bridge);
        assert_eq!(status.accumulated_steps.expect("first drain").len(), 3);
        let status = runner.handle_request(RunRequest::GetReadySteps { omit_data: false }, &mut bridge);
        assert_eq!(status.accumulated_steps.expect("second drain").len(), 0);
    }

    #[test]
    fn json_initializer_with_bad_json_is_a_parsing_error() {
        let (mut runner, mut bridge) = fresh_runner();
        let status = initialize(
            &mut runner,
            &mut bridge,
            manifest("{}", ("init.json", "{nope"), &[]),
            2,
        );
        let error = status.runner_error.expect("bad init json surfaces");
        assert_eq!(error.phase, Phase::Parsing);
        assert_eq!(error.context, "init.json");
    }
}
