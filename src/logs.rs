// llmlb — log capture
//
// Two sinks besides stderr: an in-memory ring of recent lines backing
// /api/nodes/:id/logs, and (when LLM_LOG_DIR is set) daily JSON-lines files
// llmlb.jsonl.YYYY-MM-DD with a retention sweep at rollover.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing_subscriber::fmt::MakeWriter;

const RING_CAPACITY: usize = 2_000;

#[derive(Debug, Clone, serde::Serialize)]
pub struct LogLine {
    pub ts: String,
    pub line: String,
}

/// Bounded ring of recent log lines.
pub struct LogBuffer {
    inner: Mutex<VecDeque<LogLine>>,
}

impl LogBuffer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
        })
    }

    pub fn push(&self, line: String) {
        let mut ring = self.inner.lock().expect("log ring");
        if ring.len() == RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(LogLine {
            ts: Utc::now().to_rfc3339(),
            line,
        });
    }

    /// Most recent lines, newest last, optionally substring-filtered.
    pub fn recent(&self, limit: usize, search: Option<&str>) -> Vec<LogLine> {
        let ring = self.inner.lock().expect("log ring");
        let mut out: Vec<LogLine> = ring
            .iter()
            .rev()
            .filter(|l| search.is_none_or(|s| l.line.contains(s)))
            .take(limit)
            .cloned()
            .collect();
        out.reverse();
        out
    }
}

/// `MakeWriter` that tees formatted log lines into the ring and, when
/// configured, into the daily JSONL file.
#[derive(Clone)]
pub struct LogTee {
    buffer: Arc<LogBuffer>,
    file: Option<Arc<Mutex<DailyFile>>>,
}

struct DailyFile {
    dir: PathBuf,
    day: String,
    file: Option<File>,
    retention_days: u32,
}

impl LogTee {
    pub fn new(buffer: Arc<LogBuffer>, dir: Option<PathBuf>, retention_days: u32) -> Self {
        let file = dir.map(|dir| {
            Arc::new(Mutex::new(DailyFile {
                dir,
                day: String::new(),
                file: None,
                retention_days,
            }))
        });
        Self { buffer, file }
    }
}

pub struct TeeWriter {
    buffer: Arc<LogBuffer>,
    file: Option<Arc<Mutex<DailyFile>>>,
}

impl std::io::Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        for line in text.lines().filter(|l| !l.is_empty()) {
            self.buffer.push(line.to_string());
        }
        if let Some(daily) = &self.file {
            let mut daily = daily.lock().expect("daily log file");
            daily.write_all(buf);
        }
        std::io::stderr().write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()
    }
}

impl<'a> MakeWriter<'a> for LogTee {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter {
            buffer: Arc::clone(&self.buffer),
            file: self.file.clone(),
        }
    }
}

impl DailyFile {
    fn write_all(&mut self, buf: &[u8]) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if self.day != today || self.file.is_none() {
            self.rotate(&today);
        }
        if let Some(f) = &mut self.file {
            let _ = f.write_all(buf);
        }
    }

    fn rotate(&mut self, today: &str) {
        if std::fs::create_dir_all(&self.dir).is_err() {
            return;
        }
        let path = self.dir.join(format!("llmlb.jsonl.{today}"));
        self.file = OpenOptions::new().create(true).append(true).open(path).ok();
        self.day = today.to_string();
        self.sweep_retention();
    }

    /// Delete files older than the retention window.
    fn sweep_retention(&self) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.retention_days));
        let cutoff = cutoff.format("%Y-%m-%d").to_string();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(date) = name.strip_prefix("llmlb.jsonl.") {
                if date < cutoff.as_str() {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_keeps_recent_lines() {
        let buffer = LogBuffer::new();
        for i in 0..RING_CAPACITY + 10 {
            buffer.push(format!("line {i}"));
        }
        let recent = buffer.recent(5, None);
        assert_eq!(recent.len(), 5);
        assert!(recent.last().unwrap().line.ends_with(&format!("{}", RING_CAPACITY + 9)));
    }

    #[test]
    fn recent_filters_by_substring() {
        let buffer = LogBuffer::new();
        buffer.push("probe ok".to_string());
        buffer.push("probe failed".to_string());
        buffer.push("model sync complete".to_string());
        let hits = buffer.recent(10, Some("probe"));
        assert_eq!(hits.len(), 2);
    }
}
