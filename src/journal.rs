//! Run journal: a per-run filesystem directory recording the complete
//! trace of a run for replay and debugging.
//!
//! The single-writer `Mutex<BufWriter<File>>` for `trace.jsonl` flushes
//! after every event so an interrupted run leaves a valid partial trace.
//! The `runs_index.json` maintained alongside individual run directories
//! supports the CLI's `--history`/`--stats` surfaces without re-scanning
//! every run directory on disk.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use orch_types::dag::Dag;
use orch_types::events::{EngineEvent, RunStats};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("failed to create journal directory {path}: {source}")]
    CreateDir { path: PathBuf, source: std::io::Error },
    #[error("failed to write journal file {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
    #[error("failed to read journal file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to serialize journal data: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One entry in `runs_index.json`, enough to list and summarize past runs
/// without opening their `trace.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIndexEntry {
    pub run_id: String,
    pub input_preview: String,
    pub task_count: usize,
    pub total_cost: f64,
    pub total_latency_ms: u64,
    pub dir: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RunsIndex {
    runs: Vec<RunIndexEntry>,
}

/// Opens (creating as needed) `run_<unix-ms>/` under `root` and exposes the
/// input, plan, trace, output, and stats files for one run. One journal
/// instance per run.
pub struct Journal {
    run_id: String,
    dir: PathBuf,
    trace_writer: Mutex<BufWriter<File>>,
}

impl Journal {
    pub fn open(root: impl AsRef<Path>, run_id: impl Into<String>) -> Result<Self, JournalError> {
        let run_id = run_id.into();
        let dir = root.as_ref().join(format!("run_{}", run_id));
        fs::create_dir_all(&dir).map_err(|source| JournalError::CreateDir { path: dir.clone(), source })?;

        let trace_path = dir.join("trace.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&trace_path)
            .map_err(|source| JournalError::Write { path: trace_path.clone(), source })?;

        Ok(Self {
            run_id,
            dir,
            trace_writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_input(&self, input: &str) -> Result<(), JournalError> {
        let path = self.dir.join("input.txt");
        fs::write(&path, input).map_err(|source| JournalError::Write { path, source })
    }

    pub fn write_plan(&self, dag: &Dag) -> Result<(), JournalError> {
        let path = self.dir.join("plan.json");
        let json = serde_json::to_string_pretty(dag)?;
        fs::write(&path, json).map_err(|source| JournalError::Write { path, source })
    }

    /// Appends one event as a line of JSON and flushes immediately, so a
    /// crash mid-run leaves every event written so far intact and parseable.
    pub fn record_event(&self, event: &EngineEvent) -> Result<(), JournalError> {
        let line = serde_json::to_string(event)?;
        let path = self.dir.join("trace.jsonl");
        let mut writer = self.trace_writer.lock().unwrap();
        writeln!(writer, "{line}").map_err(|source| JournalError::Write { path: path.clone(), source })?;
        writer.flush().map_err(|source| JournalError::Write { path, source })
    }

    pub fn write_output(&self, output: &str) -> Result<(), JournalError> {
        let path = self.dir.join("output.txt");
        fs::write(&path, output).map_err(|source| JournalError::Write { path, source })
    }

    pub fn write_stats(&self, stats: &RunStats) -> Result<(), JournalError> {
        let path = self.dir.join("stats.json");
        let json = serde_json::to_string_pretty(stats)?;
        fs::write(&path, json).map_err(|source| JournalError::Write { path, source })
    }

    /// Reads back every event recorded so far, tolerating a partial final
    /// line left by an interrupted run.
    pub fn read_trace(&self) -> Result<Vec<EngineEvent>, JournalError> {
        read_trace_file(&self.dir.join("trace.jsonl"))
    }

    /// Appends this run to `runs_index.json` under `root`. Call once at
    /// finalization, after `write_stats`.
    pub fn append_to_index(&self, root: impl AsRef<Path>, input: &str, task_count: usize, stats: &RunStats) -> Result<(), JournalError> {
        let index_path = root.as_ref().join("runs_index.json");
        let mut index = load_index(&index_path)?;

        let preview = if input.chars().count() > 100 {
            format!("{}...", input.chars().take(100).collect::<String>())
        } else {
            input.to_string()
        };

        index.runs.push(RunIndexEntry {
            run_id: self.run_id.clone(),
            input_preview: preview,
            task_count,
            total_cost: stats.total_cost,
            total_latency_ms: stats.total_latency_ms,
            dir: self.dir.clone(),
        });

        save_index(&index_path, &index)
    }
}

fn read_trace_file(path: &Path) -> Result<Vec<EngineEvent>, JournalError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path).map_err(|source| JournalError::Read { path: path.to_path_buf(), source })?;
    let mut events = Vec::new();
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(event) => events.push(event),
            Err(_) => break, // truncated final line from an interrupted run
        }
    }
    Ok(events)
}

fn load_index(path: &Path) -> Result<RunsIndex, JournalError> {
    if !path.exists() {
        return Ok(RunsIndex::default());
    }
    let contents = fs::read_to_string(path).map_err(|source| JournalError::Read { path: path.to_path_buf(), source })?;
    Ok(serde_json::from_str(&contents)?)
}

fn save_index(path: &Path, index: &RunsIndex) -> Result<(), JournalError> {
    let json = serde_json::to_string_pretty(index)?;
    fs::write(path, json).map_err(|source| JournalError::Write { path: path.to_path_buf(), source })
}

/// Lists the most recent runs from `runs_index.json`, newest last.
pub fn list_recent(root: impl AsRef<Path>, limit: usize) -> Result<Vec<RunIndexEntry>, JournalError> {
    let index = load_index(&root.as_ref().join("runs_index.json"))?;
    let mut runs = index.runs;
    let start = runs.len().saturating_sub(limit);
    Ok(runs.split_off(start))
}

/// Aggregate stats across every recorded run, for the CLI's `--stats`
/// surface (generalized from the original journal's `get_stats`).
#[derive(Debug, Serialize)]
pub struct JournalStats {
    pub total_runs: usize,
    pub total_cost: f64,
    pub avg_cost_per_run: f64,
    pub avg_latency_ms: f64,
}

pub fn aggregate_stats(root: impl AsRef<Path>) -> Result<JournalStats, JournalError> {
    let index = load_index(&root.as_ref().join("runs_index.json"))?;
    let total_runs = index.runs.len();
    if total_runs == 0 {
        return Ok(JournalStats { total_runs: 0, total_cost: 0.0, avg_cost_per_run: 0.0, avg_latency_ms: 0.0 });
    }

    let total_cost: f64 = index.runs.iter().map(|r| r.total_cost).sum();
    let total_latency: u64 = index.runs.iter().map(|r| r.total_latency_ms).sum();

    Ok(JournalStats {
        total_runs,
        total_cost,
        avg_cost_per_run: total_cost / total_runs as f64,
        avg_latency_ms: total_latency as f64 / total_runs as f64,
    })
}

/// Loads a completed run's events, plan, and output back for the CLI's
/// `--replay` surface.
pub struct ReplayedRun {
    pub input: String,
    pub plan: Dag,
    pub events: Vec<EngineEvent>,
    pub output: String,
    pub stats: HashMap<String, serde_json::Value>,
}

pub fn replay(dir: impl AsRef<Path>) -> Result<ReplayedRun, JournalError> {
    let dir = dir.as_ref();
    let input = fs::read_to_string(dir.join("input.txt")).unwrap_or_default();
    let output = fs::read_to_string(dir.join("output.txt")).unwrap_or_default();

    let plan_path = dir.join("plan.json");
    let plan_contents = fs::read_to_string(&plan_path).map_err(|source| JournalError::Read { path: plan_path, source })?;
    let plan: Dag = serde_json::from_str(&plan_contents)?;

    let events = read_trace_file(&dir.join("trace.jsonl"))?;

    let stats_path = dir.join("stats.json");
    let stats = if stats_path.exists() {
        let contents = fs::read_to_string(&stats_path).map_err(|source| JournalError::Read { path: stats_path, source })?;
        serde_json::from_str(&contents)?
    } else {
        HashMap::new()
    };

    Ok(ReplayedRun { input, plan, events, output, stats })
}

#[cfg(test)]
mod tests {
    use super::*;
    use orch_types::task::{Task, TaskKind};

    fn sample_dag() -> Dag {
        Dag::new(vec![Task::new("t1", "do a thing", TaskKind::Generate)], vec![])
    }

    #[test]
    fn writes_and_reads_back_trace_events() {
        let temp = tempfile::tempdir().unwrap();
        let journal = Journal::open(temp.path(), "1234").unwrap();

        journal.write_input("do the thing").unwrap();
        journal.write_plan(&sample_dag()).unwrap();
        journal
            .record_event(&EngineEvent::TaskStart { task_id: "t1".to_string(), description: "do a thing".to_string() })
            .unwrap();
        journal.record_event(&EngineEvent::Final { output: "done".to_string() }).unwrap();
        journal.write_output("done").unwrap();

        let stats = RunStats { total_cost: 0.01, total_latency_ms: 500, task_count: 1, completed: 1, failed: 0, skipped: 0 };
        journal.write_stats(&stats).unwrap();

        let events = journal.read_trace().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], EngineEvent::TaskStart { .. }));

        assert!(temp.path().join("run_1234/input.txt").exists());
        assert!(temp.path().join("run_1234/plan.json").exists());
    }

    #[test]
    fn index_round_trips_through_disk() {
        let temp = tempfile::tempdir().unwrap();
        let journal = Journal::open(temp.path(), "5678").unwrap();
        journal.write_input("hello").unwrap();

        let stats = RunStats { total_cost: 0.02, total_latency_ms: 1000, task_count: 2, completed: 2, failed: 0, skipped: 0 };
        journal.append_to_index(temp.path(), "hello", 2, &stats).unwrap();

        let recent = list_recent(temp.path(), 10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].run_id, "5678");

        let aggregate = aggregate_stats(temp.path()).unwrap();
        assert_eq!(aggregate.total_runs, 1);
        assert!((aggregate.total_cost - 0.02).abs() < 1e-9);
    }

    #[test]
    fn truncated_final_line_is_tolerated() {
        let temp = tempfile::tempdir().unwrap();
        let journal = Journal::open(temp.path(), "9999").unwrap();
        journal.record_event(&EngineEvent::Final { output: "ok".to_string() }).unwrap();

        let trace_path = temp.path().join("run_9999/trace.jsonl");
        let mut file = OpenOptions::new().append(true).open(&trace_path).unwrap();
        write!(file, "{{\"kind\":\"final\",\"out").unwrap();

        let events = read_trace_file(&trace_path).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn replay_reconstructs_input_plan_and_output() {
        let temp = tempfile::tempdir().unwrap();
        let journal = Journal::open(temp.path(), "42").unwrap();
        journal.write_input("replay me").unwrap();
        journal.write_plan(&sample_dag()).unwrap();
        journal.write_output("replayed output").unwrap();
        let stats = RunStats { total_cost: 0.0, total_latency_ms: 0, task_count: 1, completed: 1, failed: 0, skipped: 0 };
        journal.write_stats(&stats).unwrap();

        let replayed = replay(journal.dir()).unwrap();
        assert_eq!(replayed.input, "replay me");
        assert_eq!(replayed.output, "replayed output");
        assert_eq!(replayed.plan.tasks.len(), 1);
    }
}
