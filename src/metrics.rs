use chrono::Utc;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Serialize)]
struct ScalarEvent<'a> {
    tag: &'a str,
    value: f64,
    step: usize,
    timestamp: String,
}

#[derive(Serialize)]
pub struct EpochLogEntry {
    pub epoch: usize,
    pub mean_loss: f64,
    pub batches: usize,
}

#[derive(Serialize)]
pub struct TrainingRunLog {
    pub run_name: String,
    pub started_at: String,
    pub finished_at: String,
    pub device: String,
    pub epochs_requested: usize,
    pub epochs_completed: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub noise_steps: usize,
    pub image_size: usize,
    pub epoch_metrics: Vec<EpochLogEntry>,
}

/// Append-only scalar log: one JSON object per line in `<dir>/metrics.jsonl`.
pub struct MetricsWriter {
    dir: PathBuf,
    file: File,
}

impl MetricsWriter {
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("metrics.jsonl"))?;
        Ok(Self { dir, file })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join("metrics.jsonl")
    }

    pub fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        let event = ScalarEvent {
            tag,
            value,
            step,
            timestamp: Utc::now().to_rfc3339(),
        };
        let line = serde_json::to_string(&event)?;
        writeln!(self.file, "{}", line)?;
        Ok(())
    }

    pub fn persist_run_summary(&self, run_log: &TrainingRunLog) -> Result<PathBuf> {
        let path = self.dir.join("summary.json");
        let writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(writer, run_log)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars_are_json_lines() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut writer = MetricsWriter::create(dir.path())?;
        writer.add_scalar("MSE", 0.5, 0)?;
        writer.add_scalar("MSE", 0.25, 1)?;

        let content = std::fs::read_to_string(writer.path())?;
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["tag"], "MSE");
        assert_eq!(lines[1]["step"], 1);
        assert_eq!(lines[1]["value"], 0.25);
        Ok(())
    }

    #[test]
    fn test_run_summary_written() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = MetricsWriter::create(dir.path())?;
        let log = TrainingRunLog {
            run_name: "unit".to_string(),
            started_at: Utc::now().to_rfc3339(),
            finished_at: Utc::now().to_rfc3339(),
            device: "cpu".to_string(),
            epochs_requested: 1,
            epochs_completed: 1,
            batch_size: 2,
            learning_rate: 3e-4,
            noise_steps: 10,
            image_size: 8,
            epoch_metrics: vec![EpochLogEntry { epoch: 1, mean_loss: 0.9, batches: 3 }],
        };
        let path = writer.persist_run_summary(&log)?;
        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path)?).unwrap();
        assert_eq!(value["run_name"], "unit");
        assert_eq!(value["epoch_metrics"][0]["batches"], 3);
        Ok(())
    }
}
