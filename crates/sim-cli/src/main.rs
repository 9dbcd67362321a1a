use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sim_core::{GuestLanguage, Manifest, SourceDescriptor};
use sim_plan::Catalog;
use sim_runner::{
    DatasetCache, ExperimentManifestRecord, JsonlRunSink, RunCompletion, RunScheduler, RunSink,
    RunStatusRow, StepRow,
};

#[derive(Parser)]
#[command(name = "simlab", version = "0.1.0", about = "Agent-based simulation experiment runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an experiment locally and write facts under the output directory
    Run {
        #[arg(long)]
        project: PathBuf,
        #[arg(long)]
        experiment: String,
        #[arg(long, default_value_t = 2)]
        workers: usize,
        /// Override the per-run tick budget from the experiment definition
        #[arg(long)]
        steps: Option<u64>,
        #[arg(long)]
        out: Option<PathBuf>,
        /// Fail any run whose sources need the embedded interpreter
        #[arg(long)]
        no_interpreter: bool,
    },
    /// Print the expanded plan as JSON without running anything
    Plan {
        #[arg(long)]
        project: PathBuf,
        #[arg(long)]
        experiment: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            project,
            experiment,
            workers,
            steps,
            out,
            no_interpreter,
        } => {
            let outcome = run_experiment(RunArgs {
                project,
                experiment,
                workers,
                steps_override: steps,
                out,
                interpreter_enabled: !no_interpreter,
            })?;
            print_summary(&outcome);
            if outcome.any_errored() {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Plan {
            project,
            experiment,
        } => {
            let catalog = load_catalog(&project)?;
            let plan = sim_plan::plan(&experiment, &catalog)?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(())
        }
    }
}

struct RunArgs {
    project: PathBuf,
    experiment: String,
    workers: usize,
    steps_override: Option<u64>,
    out: Option<PathBuf>,
    interpreter_enabled: bool,
}

#[derive(Debug)]
struct RunOutcome {
    experiment: String,
    out_dir: PathBuf,
    worker_count: usize,
    completions: Vec<RunCompletion>,
}

impl RunOutcome {
    fn any_errored(&self) -> bool {
        self.completions
            .iter()
            .any(|completion| completion.status.runner_error.is_some())
    }
}

fn run_experiment(args: RunArgs) -> Result<RunOutcome> {
    let manifest = load_manifest(&args.project)?;
    let catalog = load_catalog(&args.project)?;
    let mut plan = sim_plan::plan(&args.experiment, &catalog)?;
    if let Some(steps) = args.steps_override {
        for run in plan.runs.values_mut() {
            run.steps = steps;
        }
    }
    tracing::info!(
        experiment = %args.experiment,
        runs = plan.len(),
        workers = args.workers,
        "planned experiment"
    );

    let out_dir = args.out.unwrap_or_else(|| {
        args.project.join("runs").join(format!(
            "{}-{}",
            args.experiment,
            Utc::now().format("%Y%m%dT%H%M%SZ")
        ))
    });
    let mut sink = JsonlRunSink::new(&out_dir)?;

    let cache = Arc::new(DatasetCache::new()?);
    let scheduler = RunScheduler::new(args.workers, cache)?;
    let submission = scheduler.queue(&manifest, &plan, args.interpreter_enabled)?;

    sink.write_experiment_manifest(&ExperimentManifestRecord {
        schema_version: "experiment_manifest_v1".to_string(),
        experiment: args.experiment.clone(),
        created_at: Utc::now().to_rfc3339(),
        worker_count: scheduler.worker_count(),
        run_ids: plan.runs.keys().cloned().collect(),
    })?;

    let mut completions = submission.experiment.wait()?;
    completions.sort_by(|a, b| a.run_id.cmp(&b.run_id));
    for completion in &completions {
        let overrides = plan
            .runs
            .get(&completion.run_id)
            .map(|run| Value::Object(run.fields.clone()))
            .unwrap_or_else(|| Value::Object(Default::default()));
        sink.append_run_status(&RunStatusRow::from_status(
            &args.experiment,
            &completion.status,
            overrides,
        ))?;
        sink.append_step_rows(&StepRow::rows_from_status(&completion.status))?;
    }
    sink.flush()?;

    Ok(RunOutcome {
        experiment: args.experiment,
        out_dir,
        worker_count: scheduler.worker_count(),
        completions,
    })
}

fn print_summary(outcome: &RunOutcome) {
    println!("experiment: {}", outcome.experiment);
    println!("runs: {}", outcome.completions.len());
    println!("workers: {}", outcome.worker_count);
    println!("out: {}", outcome.out_dir.display());
    for completion in &outcome.completions {
        let status = &completion.status;
        let outcome_label = if status.runner_error.is_some() {
            "errored"
        } else if status.early_stop {
            "early-stopped"
        } else {
            "completed"
        };
        let mut line = format!(
            "  {}  {}  steps={}",
            completion.run_id, outcome_label, status.steps_taken
        );
        if status.early_stop && !status.stop_message.is_null() {
            line.push_str(&format!("  stop={}", status.stop_message));
        }
        if let Some(error) = &status.runner_error {
            line.push_str(&format!("  {}", error));
        }
        println!("{}", line);
    }
}

fn load_catalog(project: &Path) -> Result<Catalog> {
    let path = project.join("experiments.json");
    let src = fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(sim_plan::parse_catalog(&src)?)
}

/// Load `manifest.json` if the project ships one, otherwise assemble a
/// manifest from the project directory's loose files.
fn load_manifest(project: &Path) -> Result<Manifest> {
    let manifest_path = project.join("manifest.json");
    if manifest_path.exists() {
        let src = fs::read_to_string(&manifest_path)
            .with_context(|| format!("reading {}", manifest_path.display()))?;
        return serde_json::from_str(&src)
            .with_context(|| format!("parsing {}", manifest_path.display()));
    }
    assemble_manifest(project)
}

/// Project layout without a manifest.json: `globals.json` for properties,
/// `datasets.json` for dataset descriptors, `init.*` as the initializer, and
/// every other `.script`/`.interp`/`.rs` file as a behavior.
fn assemble_manifest(project: &Path) -> Result<Manifest> {
    let properties_src = match fs::read_to_string(project.join("globals.json")) {
        Ok(src) => src,
        Err(_) => "{}".to_string(),
    };
    let datasets = match fs::read_to_string(project.join("datasets.json")) {
        Ok(src) => serde_json::from_str(&src).context("parsing datasets.json")?,
        Err(_) => Vec::new(),
    };

    let mut filenames = Vec::new();
    for entry in fs::read_dir(project)
        .with_context(|| format!("reading project directory {}", project.display()))?
    {
        let entry = entry?;
        if !entry.path().is_file() {
            continue;
        }
        let filename = entry
            .file_name()
            .into_string()
            .map_err(|raw| anyhow!("non-utf8 filename in project: {:?}", raw))?;
        filenames.push(filename);
    }
    filenames.sort();

    let mut initializers = Vec::new();
    let mut behaviors = Vec::new();
    for filename in filenames {
        if matches!(
            filename.as_str(),
            "globals.json" | "datasets.json" | "experiments.json" | "manifest.json"
        ) {
            continue;
        }
        let Some(language) = GuestLanguage::from_filename(&filename) else {
            continue;
        };
        let is_initializer = filename
            .split('.')
            .next()
            .map(|stem| stem == "init")
            .unwrap_or(false);
        if language == GuestLanguage::Json && !is_initializer {
            // Loose json files are data, not behaviors.
            continue;
        }
        let path = project.join(&filename);
        let source_text =
            fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let descriptor = SourceDescriptor {
            filename,
            source_text,
            guest_language: None,
            dependencies: Vec::new(),
        };
        if is_initializer {
            initializers.push(descriptor);
        } else {
            behaviors.push(descriptor);
        }
    }

    Ok(Manifest {
        properties_src,
        datasets,
        initializers,
        behaviors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_project(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("simlab_cli_{}_{}", label, nanos));
        fs::create_dir_all(&dir).expect("create project dir");
        dir
    }

    fn write(dir: &Path, filename: &str, contents: &str) {
        fs::write(dir.join(filename), contents).expect("write project file");
    }

    #[test]
    fn manifest_assembles_from_loose_project_files() {
        let dir = temp_project("assemble");
        write(&dir, "globals.json", r#"{"rate": 1}"#);
        write(&dir, "init.json", r#"[{"agent_id": "a"}]"#);
        write(&dir, "grow.script", "state.energy = 1;");
        write(&dir, "diffuse.rs", "fn main() {}");
        write(&dir, "experiments.json", "{}");
        write(&dir, "notes.json", "[]");

        let manifest = assemble_manifest(&dir).expect("manifest assembles");
        assert_eq!(manifest.properties_src, r#"{"rate": 1}"#);
        assert_eq!(manifest.initializers.len(), 1);
        assert_eq!(manifest.initializers[0].filename, "init.json");
        let behavior_names: Vec<&str> = manifest
            .behaviors
            .iter()
            .map(|b| b.filename.as_str())
            .collect();
        assert_eq!(behavior_names, vec!["diffuse.rs", "grow.script"]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn explicit_manifest_json_wins_over_loose_files() {
        let dir = temp_project("explicit");
        write(
            &dir,
            "manifest.json",
            &json!({
                "propertiesSrc": "{\"rate\": 9}",
                "initializers": [{"filename": "init.json", "sourceText": "[]"}],
            })
            .to_string(),
        );
        write(&dir, "globals.json", r#"{"rate": 1}"#);

        let manifest = load_manifest(&dir).expect("manifest loads");
        assert_eq!(manifest.properties_src, "{\"rate\": 9}");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn values_experiment_runs_end_to_end_and_writes_facts() {
        let dir = temp_project("end_to_end");
        write(&dir, "globals.json", r#"{"rate": 1}"#);
        write(
            &dir,
            "init.json",
            r#"[{"agent_id": "a", "behaviors": ["grow.script"], "energy": 0}]"#,
        );
        write(
            &dir,
            "grow.script",
            "state.energy = state.energy + context.globals().rate;",
        );
        write(
            &dir,
            "experiments.json",
            r#"{"sweep": {"type": "values", "field": "rate", "values": [1, 2, 3], "steps": 5}}"#,
        );

        let out_dir = dir.join("out");
        let outcome = run_experiment(RunArgs {
            project: dir.clone(),
            experiment: "sweep".to_string(),
            workers: 2,
            steps_override: None,
            out: Some(out_dir.clone()),
            interpreter_enabled: true,
        })
        .expect("experiment runs");

        assert_eq!(outcome.completions.len(), 3);
        assert!(!outcome.any_errored());
        let mut energies: Vec<f64> = outcome
            .completions
            .iter()
            .map(|completion| {
                assert_eq!(completion.status.steps_taken, 5);
                let steps = completion
                    .status
                    .accumulated_steps
                    .as_ref()
                    .expect("steps accumulated");
                steps[&5][0]["energy"].as_f64().expect("numeric energy")
            })
            .collect();
        energies.sort_by(|a, b| a.partial_cmp(b).expect("comparable"));
        assert_eq!(energies, vec![5.0, 10.0, 15.0]);

        let facts_dir = out_dir.join("facts");
        assert!(facts_dir.join("experiment_manifest.json").exists());
        assert_eq!(
            fs::read_to_string(facts_dir.join("run_statuses.jsonl"))
                .expect("statuses written")
                .lines()
                .count(),
            3
        );
        assert_eq!(
            fs::read_to_string(facts_dir.join("steps.jsonl"))
                .expect("steps written")
                .lines()
                .count(),
            18,
            "three runs, each with the initial state plus five ticks"
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn steps_override_replaces_the_definition_budget() {
        let dir = temp_project("override");
        write(&dir, "globals.json", "{}");
        write(&dir, "init.json", r#"[{"agent_id": "a"}]"#);
        write(
            &dir,
            "experiments.json",
            r#"{"sweep": {"type": "values", "field": "rate", "values": [1], "steps": 10}}"#,
        );

        let outcome = run_experiment(RunArgs {
            project: dir.clone(),
            experiment: "sweep".to_string(),
            workers: 1,
            steps_override: Some(2),
            out: Some(dir.join("out")),
            interpreter_enabled: true,
        })
        .expect("experiment runs");
        assert_eq!(outcome.completions[0].status.steps_taken, 2);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_experiment_name_fails_before_running() {
        let dir = temp_project("missing");
        write(&dir, "globals.json", "{}");
        write(&dir, "init.json", "[]");
        write(&dir, "experiments.json", "{}");

        let err = run_experiment(RunArgs {
            project: dir.clone(),
            experiment: "absent".to_string(),
            workers: 1,
            steps_override: None,
            out: Some(dir.join("out")),
            interpreter_enabled: true,
        })
        .expect_err("unknown experiment must fail");
        assert!(err.to_string().contains("absent"), "got: {}", err);
        let _ = fs::remove_dir_all(dir);
    }
}
