use serde::Serialize;

use crate::{Artifact, EaselError};

/// Outcome of one item in a batch. A failure carries the reason and the
/// error code, never aborts the batch.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Success { artifact: Artifact },
    Failure { reason: String, code: &'static str },
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    /// Scheduler name or input file name.
    pub label: String,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

/// Per-item outcomes in request order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchResult {
    pub items: Vec<BatchItem>,
}

impl BatchResult {
    pub fn push_success(&mut self, label: impl Into<String>, artifact: Artifact) {
        self.items.push(BatchItem {
            label: label.into(),
            outcome: ItemOutcome::Success { artifact },
        });
    }

    pub fn push_failure(&mut self, label: impl Into<String>, err: &EaselError) {
        self.items.push(BatchItem {
            label: label.into(),
            outcome: ItemOutcome::Failure {
                reason: err.to_string(),
                code: err.code(),
            },
        });
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.artifacts().count()
    }

    pub fn failed(&self) -> usize {
        self.len() - self.succeeded()
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.items.iter().filter_map(|item| match &item.outcome {
            ItemOutcome::Success { artifact } => Some(artifact),
            ItemOutcome::Failure { .. } => None,
        })
    }
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Success { .. })
    }
}
