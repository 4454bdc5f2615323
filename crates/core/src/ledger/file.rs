use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{EventFilter, LedgerBackend, LedgerError, LedgerResult};
use crate::event::{EventBody, LedgerEvent};

/// Append-only JSON-lines ledger for local development.
///
/// Any number of processes may open the same file. Before every call the ledger reads whatever
/// complete lines were appended since its last offset, so each instance sees appends made by
/// other processes. Appends hold an exclusive lock on the file while they catch up, assign
/// sequences and write, so concurrent writers never reuse a sequence. A partially written
/// trailing line is left for the next read.
/// Sequences must be contiguous from 1; anything else is reported as corruption.
#[derive(Debug)]
pub struct FileLedger {
    path: PathBuf,
    state: Mutex<FileState>,
}

#[derive(Debug, Default)]
struct FileState {
    events: Vec<LedgerEvent>,
    offset: u64,
}

impl FileLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(FileState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn refresh(&self, state: &mut FileState) -> LedgerResult<()> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(LedgerError::Unavailable(e.to_string())),
        };
        self.read_from(&mut file, state).await
    }

    /// Opens the file for appending and takes an exclusive advisory lock on it.
    ///
    /// The lock is held until the returned handle is dropped, so writers in other processes
    /// serialize their read-assign-write cycle on it.
    async fn lock_for_append(&self) -> LedgerResult<tokio::fs::File> {
        let path = self.path.clone();
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&path)?;
            FileExt::lock_exclusive(&file)?;
            Ok(file)
        })
        .await
        .map_err(|e| LedgerError::Unavailable(format!("lock task failed: {}", e)))?
        .map_err(|e| {
            LedgerError::Unavailable(format!("{}: cannot lock: {}", self.path.display(), e))
        })?;
        Ok(tokio::fs::File::from_std(file))
    }

    async fn read_from(
        &self,
        file: &mut tokio::fs::File,
        state: &mut FileState,
    ) -> LedgerResult<()> {
        file.seek(SeekFrom::Start(state.offset))
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        let complete = match buf.iter().rposition(|b| *b == b'\n') {
            Some(pos) => pos + 1,
            None => return Ok(()),
        };

        let mut parsed = Vec::new();
        for line in buf[..complete].split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let event: LedgerEvent = serde_json::from_slice(line).map_err(|e| {
                LedgerError::Corrupt(format!("{}: unreadable entry: {}", self.path.display(), e))
            })?;
            let expected = (state.events.len() + parsed.len()) as u64 + 1;
            if event.sequence != expected {
                return Err(LedgerError::Corrupt(format!(
                    "{}: expected sequence {}, found {}",
                    self.path.display(),
                    expected,
                    event.sequence
                )));
            }
            parsed.push(event);
        }
        state.events.extend(parsed);
        state.offset += complete as u64;
        Ok(())
    }
}

#[async_trait]
impl LedgerBackend for FileLedger {
    async fn append(&self, batch: Vec<EventBody>) -> LedgerResult<Vec<LedgerEvent>> {
        let mut state = self.state.lock().await;
        // Nothing has been written if locking or reading fails, so those cases are safe to retry.
        let mut file = self.lock_for_append().await?;
        self.read_from(&mut file, &mut state).await?;

        let start = state.events.len() as u64 + 1;
        let recorded: Vec<LedgerEvent> = batch
            .into_iter()
            .enumerate()
            .map(|(i, body)| LedgerEvent {
                sequence: start + i as u64,
                body,
            })
            .collect();

        let mut out = Vec::new();
        for event in &recorded {
            serde_json::to_writer(&mut out, event)
                .map_err(|e| LedgerError::Rejected(e.to_string()))?;
            out.push(b'\n');
        }

        // A failed or partial write leaves the outcome unknown; never report it as retryable.
        file.write_all(&out)
            .await
            .map_err(|e| LedgerError::Rejected(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| LedgerError::Rejected(e.to_string()))?;
        file.sync_data()
            .await
            .map_err(|e| LedgerError::Rejected(e.to_string()))?;
        drop(file);

        state.offset += out.len() as u64;
        state.events.extend(recorded.iter().cloned());
        Ok(recorded)
    }

    async fn range(
        &self,
        from: u64,
        to: u64,
        filter: &EventFilter,
    ) -> LedgerResult<Vec<LedgerEvent>> {
        if from == 0 || from > to {
            return Err(LedgerError::Rejected(format!(
                "invalid range {}..={}",
                from, to
            )));
        }
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await?;

        let len = state.events.len() as u64;
        if from > len {
            return Ok(Vec::new());
        }
        Ok(state.events[(from - 1) as usize..to.min(len) as usize]
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }

    async fn head(&self) -> LedgerResult<u64> {
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await?;
        Ok(state.events.len() as u64)
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::granted;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_is_an_empty_ledger() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::new(dir.path().join("ledger.jsonl"));
        assert_eq!(ledger.head().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_second_instance_sees_appends_from_first() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let writer = FileLedger::new(&path);
        let reader = FileLedger::new(&path);

        writer
            .append(vec![granted("P1", "Q1"), granted("P1", "Q2")])
            .await
            .unwrap();
        assert_eq!(reader.head().await.unwrap(), 2);

        writer.append(vec![granted("P2", "Q1")]).await.unwrap();
        let tail = reader.range(3, 3, &EventFilter::default()).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].sequence, 3);
    }

    #[tokio::test]
    async fn test_partial_trailing_line_is_deferred() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let writer = FileLedger::new(&path);
        writer.append(vec![granted("P1", "Q1")]).await.unwrap();

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        file.write_all(b"{\"sequence\":2,").await.unwrap();
        file.flush().await.unwrap();

        let reader = FileLedger::new(&path);
        assert_eq!(reader.head().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sequence_gap_is_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let mut event = serde_json::to_string(&LedgerEvent {
            sequence: 2,
            body: granted("P1", "Q1"),
        })
        .unwrap();
        event.push('\n');
        tokio::fs::write(&path, event).await.unwrap();

        let ledger = FileLedger::new(&path);
        assert!(matches!(
            ledger.head().await,
            Err(LedgerError::Corrupt(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_never_reuse_a_sequence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let writers = [
            std::sync::Arc::new(FileLedger::new(&path)),
            std::sync::Arc::new(FileLedger::new(&path)),
        ];

        let mut handles = Vec::new();
        for (w, writer) in writers.iter().enumerate() {
            for i in 0..25 {
                let writer = writer.clone();
                let provider = format!("Q{}x{}", w, i);
                handles.push(tokio::spawn(async move {
                    writer.append(vec![granted("P1", &provider)]).await
                }));
            }
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let fresh = FileLedger::new(&path);
        assert_eq!(fresh.head().await.unwrap(), 50);
        let all = fresh.range(1, 50, &EventFilter::default()).await.unwrap();
        let sequences: Vec<u64> = all.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (1..=50).collect::<Vec<u64>>());
    }
}
