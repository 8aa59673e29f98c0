use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use runway::{HistorySink, JobId, RunOutcome};

/// History store kept in memory. Clones share storage.
#[derive(Clone, Default)]
pub struct InMemoryHistory {
    saved: Arc<Mutex<HashMap<JobId, Vec<RunOutcome>>>>,
    saves: Arc<Mutex<u32>>,
    failing: bool,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose `save` always errors; saves are still counted.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn saved(&self, job_id: JobId) -> Option<Vec<RunOutcome>> {
        self.saved.lock().get(&job_id).cloned()
    }

    pub fn save_count(&self) -> u32 {
        *self.saves.lock()
    }
}

#[async_trait]
impl HistorySink for InMemoryHistory {
    async fn save(&self, job_id: JobId, outcomes: &[RunOutcome]) -> anyhow::Result<()> {
        *self.saves.lock() += 1;
        if self.failing {
            bail!("history store unavailable");
        }
        self.saved.lock().insert(job_id, outcomes.to_vec());
        Ok(())
    }

    async fn load(&self, job_id: JobId) -> anyhow::Result<Option<Vec<RunOutcome>>> {
        Ok(self.saved(job_id))
    }
}
