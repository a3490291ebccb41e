use crate::events::{Event, EventLog};
use crate::types::RunId;
use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use walkdir::WalkDir;

/// Buffered events per run are flushed once this many accumulate
const FLUSH_THRESHOLD: usize = 64;

/// Event log written as gzip-compressed JSON Lines, one file per run and day.
///
/// Layout: `<base>/YYYY/MM/DD/<run_id>.jsonl.gz`. Events are buffered per run and flushed
/// when the buffer fills, when a run emits its terminal event, or before a read.
pub struct JsonlEventLog {
    base_path: PathBuf,
    // Held for the whole read-modify-write of a day file and for reads
    buffers: Mutex<HashMap<RunId, Vec<Event>>>,
}

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).context("Failed to create event log directory")?;
        Ok(Self {
            base_path,
            buffers: Mutex::new(HashMap::new()),
        })
    }

    fn event_log_path(&self, run_id: &RunId, date: NaiveDate) -> PathBuf {
        self.base_path
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
            .join(format!("{}.jsonl.gz", run_id))
    }

    /// Write a run's buffered events to disk. Callers hold the buffers lock.
    async fn flush(&self, buffers: &mut HashMap<RunId, Vec<Event>>, run_id: &RunId) -> Result<()> {
        let pending = match buffers.remove(run_id) {
            Some(events) if !events.is_empty() => events,
            _ => return Ok(()),
        };

        let mut by_date: BTreeMap<NaiveDate, Vec<Event>> = BTreeMap::new();
        for event in pending {
            by_date
                .entry(event.timestamp.date_naive())
                .or_default()
                .push(event);
        }

        let writes: Vec<(PathBuf, Vec<Event>)> = by_date
            .into_iter()
            .map(|(date, events)| (self.event_log_path(run_id, date), events))
            .collect();

        tokio::task::spawn_blocking(move || {
            for (path, events) in writes {
                append_day_file(&path, events)?;
            }
            Ok(())
        })
        .await
        .context("Event log writer panicked")?
    }
}

/// Gzip members cannot be appended to in place, so the day's file is rewritten
fn append_day_file(path: &Path, events: Vec<Event>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create event log directory")?;
    }

    let mut all_events = if path.exists() {
        read_jsonl_gz(path)?
    } else {
        Vec::new()
    };
    all_events.extend(events);

    let compressed = encode_jsonl_gz(&all_events)?;
    std::fs::write(path, compressed).context("Failed to write event log file")
}

/// All day files holding events of a run
fn log_files(base_path: &Path, run_id: &RunId) -> Vec<PathBuf> {
    let filename = format!("{}.jsonl.gz", run_id);
    WalkDir::new(base_path)
        .min_depth(4)
        .max_depth(4)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && entry.file_name() == filename.as_str())
        .map(|entry| entry.into_path())
        .collect()
}

fn read_run_events(base_path: &Path, run_id: &RunId) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    for file in log_files(base_path, run_id) {
        events.extend(read_jsonl_gz(&file)?);
    }
    Ok(events)
}

fn read_jsonl_gz(path: &Path) -> Result<Vec<Event>> {
    let file = std::fs::File::open(path).context("Failed to open event log")?;
    let reader = std::io::BufReader::new(GzDecoder::new(file));

    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read line from event log")?;
        if line.is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line).context("Failed to parse event")?;
        events.push(event);
    }

    Ok(events)
}

fn encode_jsonl_gz(events: &[Event]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());

    for event in events {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        encoder
            .write_all(json.as_bytes())
            .context("Failed to write event")?;
        encoder.write_all(b"\n").context("Failed to write newline")?;
    }

    encoder.finish().context("Failed to finish compression")
}

#[async_trait::async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        let run_id = event.run_id;
        let mut buffers = self.buffers.lock().await;

        let buffer = buffers.entry(run_id).or_default();
        let terminal = event.event_type.is_terminal();
        buffer.push(event);

        if terminal || buffer.len() >= FLUSH_THRESHOLD {
            self.flush(&mut buffers, &run_id).await?;
        }

        Ok(())
    }

    async fn get_run_events(&self, run_id: RunId) -> Result<Vec<Event>> {
        let mut buffers = self.buffers.lock().await;
        self.flush(&mut buffers, &run_id).await?;

        let base_path = self.base_path.clone();
        let mut all_events = tokio::task::spawn_blocking(move || read_run_events(&base_path, &run_id))
            .await
            .context("Event log reader panicked")??;
        drop(buffers);

        // Stable sort keeps emission order for equal timestamps
        all_events.sort_by_key(|e| e.timestamp);

        Ok(all_events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use crate::types::{StepId, WorkflowId};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_jsonl_event_log_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let log = JsonlEventLog::new(temp_dir.path().to_path_buf()).unwrap();

        let run_id = RunId::new();
        let created = Event::new(
            run_id,
            EventType::RunCreated {
                workflow_id: WorkflowId::new("greeting"),
                workflow_version: 1,
            },
        );
        let started = Event::new(
            run_id,
            EventType::StepStarted {
                step_id: StepId::new("greet"),
                attempt: 1,
            },
        );

        log.append(created.clone()).await.unwrap();
        log.append(started.clone()).await.unwrap();

        // Nothing is on disk until a flush
        assert!(log_files(&log.base_path, &run_id).is_empty());

        let events = log.get_run_events(run_id).await.unwrap();
        assert_eq!(events, vec![created, started]);
        assert_eq!(log_files(&log.base_path, &run_id).len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_event_flushes_and_appends() {
        let temp_dir = TempDir::new().unwrap();
        let log = JsonlEventLog::new(temp_dir.path().to_path_buf()).unwrap();
        let run_id = RunId::new();

        log.append(Event::new(run_id, EventType::RunStarted { planned_steps: vec![] }))
            .await
            .unwrap();
        {
            let mut buffers = log.buffers.lock().await;
            log.flush(&mut buffers, &run_id).await.unwrap();
        }

        log.append(Event::new(run_id, EventType::RunSucceeded { duration_ms: 12 }))
            .await
            .unwrap();
        assert_eq!(log_files(&log.base_path, &run_id).len(), 1);

        let events = log.get_run_events(run_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[1].event_type.is_terminal());

        let other = log.get_run_events(RunId::new()).await.unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_read_and_terminal_append_keep_all_events() {
        let temp_dir = TempDir::new().unwrap();
        let log = std::sync::Arc::new(JsonlEventLog::new(temp_dir.path().to_path_buf()).unwrap());

        let mut runs = Vec::new();
        for _ in 0..100 {
            let run_id = RunId::new();
            for attempt in 1..=20 {
                log.append(Event::new(
                    run_id,
                    EventType::StepStarted {
                        step_id: StepId::new("greet"),
                        attempt,
                    },
                ))
                .await
                .unwrap();
            }
            runs.push(run_id);
        }

        let mut tasks = Vec::new();
        for &run_id in &runs {
            let reader = log.clone();
            tasks.push(tokio::spawn(async move {
                reader.get_run_events(run_id).await.map(|_| ())
            }));
            let writer = log.clone();
            tasks.push(tokio::spawn(async move {
                writer
                    .append(Event::new(run_id, EventType::RunSucceeded { duration_ms: 1 }))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        for run_id in runs {
            let events = log.get_run_events(run_id).await.unwrap();
            assert_eq!(events.len(), 21, "run {} lost events", run_id);
            assert!(events.iter().any(|e| e.event_type.is_terminal()));
        }
    }
}
