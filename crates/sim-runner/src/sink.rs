use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use sim_core::Diagnostic;

use crate::bridge::InterpreterStatus;
use crate::runner::RunnerStatus;

const FACTS_DIR: &str = "facts";
const FACTS_RUN_STATUSES_FILE: &str = "run_statuses.jsonl";
const FACTS_STEPS_FILE: &str = "steps.jsonl";
const FACTS_EXPERIMENT_MANIFEST_FILE: &str = "experiment_manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentManifestRecord {
    pub schema_version: String,
    pub experiment: String,
    pub created_at: String,
    pub worker_count: usize,
    pub run_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatusRow {
    pub experiment: String,
    pub run_id: String,
    pub recorded_at: String,
    pub outcome: String,
    pub steps_taken: u64,
    pub early_stop: bool,
    pub stop_message: Value,
    pub interpreter_status: InterpreterStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Diagnostic>,
    pub overrides: Value,
}

impl RunStatusRow {
    pub fn from_status(experiment: &str, status: &RunnerStatus, overrides: Value) -> Self {
        let outcome = if status.runner_error.is_some() {
            "errored"
        } else if status.early_stop {
            "early-stopped"
        } else {
            "completed"
        };
        Self {
            experiment: experiment.to_string(),
            run_id: status.run_id.clone().unwrap_or_default(),
            recorded_at: Utc::now().to_rfc3339(),
            outcome: outcome.to_string(),
            steps_taken: status.steps_taken,
            early_stop: status.early_stop,
            stop_message: status.stop_message.clone(),
            interpreter_status: status.interpreter_status,
            error: status.runner_error.clone(),
            overrides,
        }
    }
}

/// One recorded tick: the full agent-state array at a step index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRow {
    pub run_id: String,
    pub step: u64,
    pub agents: Vec<Value>,
}

impl StepRow {
    /// Rows for every accumulated snapshot a terminal status carries.
    pub fn rows_from_status(status: &RunnerStatus) -> Vec<StepRow> {
        let run_id = status.run_id.clone().unwrap_or_default();
        status
            .accumulated_steps
            .as_ref()
            .map(|steps| {
                steps
                    .iter()
                    .map(|(step, agents)| StepRow {
                        run_id: run_id.clone(),
                        step: *step,
                        agents: agents.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub trait RunSink {
    fn write_experiment_manifest(&mut self, record: &ExperimentManifestRecord) -> Result<()>;
    fn append_run_status(&mut self, row: &RunStatusRow) -> Result<()>;
    fn append_step_rows(&mut self, rows: &[StepRow]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

pub struct JsonlRunSink {
    experiment_manifest_path: PathBuf,
    statuses_writer: BufWriter<File>,
    steps_writer: BufWriter<File>,
}

impl JsonlRunSink {
    pub fn new(out_dir: &Path) -> Result<Self> {
        let facts_dir = out_dir.join(FACTS_DIR);
        fs::create_dir_all(&facts_dir)?;

        Ok(Self {
            experiment_manifest_path: facts_dir.join(FACTS_EXPERIMENT_MANIFEST_FILE),
            statuses_writer: open_append(facts_dir.join(FACTS_RUN_STATUSES_FILE))?,
            steps_writer: open_append(facts_dir.join(FACTS_STEPS_FILE))?,
        })
    }
}

impl RunSink for JsonlRunSink {
    fn write_experiment_manifest(&mut self, record: &ExperimentManifestRecord) -> Result<()> {
        fs::write(
            &self.experiment_manifest_path,
            serde_json::to_vec_pretty(record)?,
        )?;
        Ok(())
    }

    fn append_run_status(&mut self, row: &RunStatusRow) -> Result<()> {
        append_row(&mut self.statuses_writer, row)
    }

    fn append_step_rows(&mut self, rows: &[StepRow]) -> Result<()> {
        for row in rows {
            append_row(&mut self.steps_writer, row)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.statuses_writer.flush()?;
        self.steps_writer.flush()?;
        Ok(())
    }
}

fn open_append(path: PathBuf) -> Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

fn append_row<T: Serialize>(writer: &mut BufWriter<File>, row: &T) -> Result<()> {
    serde_json::to_writer(&mut *writer, row)?;
    writer.write_all(b"\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_root(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        std::env::temp_dir().join(format!("simlab_sink_{}_{}", label, nanos))
    }

    fn status(run_id: &str, steps_taken: u64) -> RunnerStatus {
        let mut accumulated = BTreeMap::new();
        for step in 0..=steps_taken {
            accumulated.insert(step, vec![json!({"agent_id": "a", "energy": step})]);
        }
        RunnerStatus {
            run_id: Some(run_id.to_string()),
            running: false,
            steps_taken,
            interpreter_status: InterpreterStatus::Unused,
            runner_error: None,
            accumulated_steps: Some(accumulated),
            early_stop: false,
            stop_message: Value::Null,
            metrics: None,
        }
    }

    #[test]
    fn jsonl_sink_appends_status_and_step_rows() {
        let out_dir = temp_root("append");
        fs::create_dir_all(&out_dir).expect("create out dir");
        let mut sink = JsonlRunSink::new(&out_dir).expect("sink should initialize");

        sink.write_experiment_manifest(&ExperimentManifestRecord {
            schema_version: "experiment_manifest_v1".to_string(),
            experiment: "sweep".to_string(),
            created_at: "2026-08-04T00:00:00Z".to_string(),
            worker_count: 2,
            run_ids: vec!["sweep.0000".to_string(), "sweep.0001".to_string()],
        })
        .expect("manifest should write");

        let status = status("sweep.0000", 2);
        sink.append_run_status(&RunStatusRow::from_status(
            "sweep",
            &status,
            json!({"rate": 1}),
        ))
        .expect("status row should append");
        sink.append_step_rows(&StepRow::rows_from_status(&status))
            .expect("step rows should append");
        sink.flush().expect("flush should succeed");

        let facts_dir = out_dir.join("facts");
        assert!(facts_dir.join("experiment_manifest.json").exists());
        let statuses = fs::read_to_string(facts_dir.join("run_statuses.jsonl"))
            .expect("statuses file should exist");
        assert_eq!(statuses.lines().count(), 1);
        assert!(statuses.contains("\"outcome\":\"completed\""));
        assert_eq!(
            fs::read_to_string(facts_dir.join("steps.jsonl"))
                .expect("steps file should exist")
                .lines()
                .count(),
            3,
            "initial state plus two ticks"
        );
        let _ = fs::remove_dir_all(out_dir);
    }

    #[test]
    fn errored_status_rows_carry_the_diagnostic() {
        let mut errored = status("sweep.0001", 0);
        errored.accumulated_steps = None;
        errored.runner_error = Some(Diagnostic {
            phase: sim_core::Phase::Running,
            message: "boom".to_string(),
            context: "grow.script".to_string(),
            line: Some(3),
            column: None,
        });
        let row = RunStatusRow::from_status("sweep", &errored, json!({}));
        assert_eq!(row.outcome, "errored");
        assert_eq!(
            row.error.as_ref().map(|e| e.context.as_str()),
            Some("grow.script")
        );
        assert!(StepRow::rows_from_status(&errored).is_empty());
    }

    #[test]
    fn early_stop_outcome_is_distinct() {
        let mut stopped = status("sweep.0002", 3);
        stopped.early_stop = true;
        stopped.stop_message = json!({"reason": "converged"});
        let row = RunStatusRow::from_status("sweep", &stopped, json!({}));
        assert_eq!(row.outcome, "early-stopped");
        assert_eq!(row.stop_message["reason"], json!("converged"));
    }
}
