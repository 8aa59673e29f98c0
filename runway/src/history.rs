use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::run::{JobId, ModelReference, RunId, RunKind, RunParameters, RunResult};
use crate::state::{Job, RunStatus};

/// Export record of one terminal run, shaped like a saved evaluation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub run_id: RunId,
    pub name: String,
    pub kind: RunKind,
    pub model: ModelReference,
    pub status: RunStatus,
    /// Parameters of the last attempt, after any mitigation.
    pub parameters: RunParameters,
    pub requested_metrics: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RunResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub mitigation_attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// One outcome per terminal run, in run order. Pending runs are skipped.
    pub fn outcomes(&self) -> Vec<RunOutcome> {
        self.runs
            .iter()
            .filter(|slot| slot.state.status().is_terminal())
            .map(|slot| RunOutcome {
                run_id: slot.config.id.clone(),
                name: slot.config.name.clone(),
                kind: slot.config.kind,
                model: slot.config.model.clone(),
                status: slot.state.status(),
                parameters: slot
                    .applied
                    .as_ref()
                    .map_or(slot.config.parameters, |request| request.parameters),
                requested_metrics: slot.config.requested_metrics.clone(),
                result: slot.state.result().cloned(),
                error_message: slot.state.error_message().map(str::to_string),
                mitigation_attempts: slot.state.mitigation_attempts(),
                started_at: slot.state.started_at(),
                finished_at: slot.state.finished_at(),
            })
            .collect()
    }
}

/// Where finished jobs are handed for durable storage.
#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn save(&self, job_id: JobId, outcomes: &[RunOutcome]) -> anyhow::Result<()>;

    async fn load(&self, job_id: JobId) -> anyhow::Result<Option<Vec<RunOutcome>>>;
}
