use async_trait::async_trait;
use parking_lot::RwLock;

use super::{EventFilter, LedgerBackend, LedgerError, LedgerResult};
use crate::event::{EventBody, LedgerEvent};

/// In-process ordered log.
///
/// Used by tests and by embedders that supply their own durability. Sequences start at 1; the
/// event with sequence `n` lives at index `n - 1`.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    events: RwLock<Vec<LedgerEvent>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

#[async_trait]
impl LedgerBackend for MemoryLedger {
    async fn append(&self, batch: Vec<EventBody>) -> LedgerResult<Vec<LedgerEvent>> {
        let mut events = self.events.write();
        let start = events.len() as u64 + 1;
        let recorded: Vec<LedgerEvent> = batch
            .into_iter()
            .enumerate()
            .map(|(i, body)| LedgerEvent {
                sequence: start + i as u64,
                body,
            })
            .collect();
        events.extend(recorded.iter().cloned());
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
        let events = self.events.read();
        let len = events.len() as u64;
        if from > len {
            return Ok(Vec::new());
        }
        let start = (from - 1) as usize;
        let end = to.min(len) as usize;
        Ok(events[start..end]
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }

    async fn head(&self) -> LedgerResult<u64> {
        Ok(self.events.read().len() as u64)
    }

    fn describe(&self) -> String {
        "memory".to_owned()
    }
}
