use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{FailureReason, RecordFailure, SourceError};
use crate::model::{ContentKind, WriteAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KindState {
    NotStarted,
    FetchingPage,
    MappingBatch,
    ResolvingRelations,
    WritingBatch,
    Completed,
    CompletedWithErrors,
}

impl KindState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::FetchingPage => "fetching_page",
            Self::MappingBatch => "mapping_batch",
            Self::ResolvingRelations => "resolving_relations",
            Self::WritingBatch => "writing_batch",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::CompletedWithErrors)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    CompletedWithErrors,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindProgress {
    pub state: KindState,
    pub pages_fetched: u32,
    pub imported: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl Default for KindProgress {
    fn default() -> Self {
        Self {
            state: KindState::NotStarted,
            pages_fetched: 0,
            imported: 0,
            skipped: 0,
            failed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutcomeEntry {
    pub kind: Option<ContentKind>,
    pub external_id: Option<u64>,
    pub description: String,
    pub message: String,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarningEntry {
    pub kind: ContentKind,
    pub external_id: u64,
    pub description: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationOutcome {
    pub status: RunStatus,
    pub imported: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<OutcomeEntry>,
    pub warnings: Vec<WarningEntry>,
    pub kinds: BTreeMap<ContentKind, KindProgress>,
    pub cancellation_requested: bool,
}

impl MigrationOutcome {
    fn new(kinds: &[ContentKind]) -> Self {
        Self {
            status: RunStatus::Pending,
            imported: 0,
            created: 0,
            updated: 0,
            unchanged: 0,
            skipped: 0,
            failed: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            kinds: kinds
                .iter()
                .map(|kind| (*kind, KindProgress::default()))
                .collect(),
            cancellation_requested: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.errors.is_empty()
    }

    pub fn errors_with_reason(&self, reason: FailureReason) -> usize {
        self.errors
            .iter()
            .filter(|entry| entry.reason == reason)
            .count()
    }

    pub fn kind_state(&self, kind: ContentKind) -> Option<KindState> {
        self.kinds.get(&kind).map(|progress| progress.state)
    }
}

#[derive(Debug)]
struct ReporterState {
    outcome: MigrationOutcome,
    finished: bool,
}

/// Cloneable handle onto the outcome of one run. Safe to poll while writes are in flight.
#[derive(Debug, Clone)]
pub struct ResultReporter {
    inner: Arc<Mutex<ReporterState>>,
}

impl ResultReporter {
    pub fn new(kinds: &[ContentKind]) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ReporterState {
                outcome: MigrationOutcome::new(kinds),
                finished: false,
            })),
        }
    }

    pub fn start(&self) {
        self.mutate(|outcome| outcome.status = RunStatus::Running);
    }

    pub fn set_state(&self, kind: ContentKind, state: KindState) {
        self.mutate(|outcome| {
            outcome.kinds.entry(kind).or_default().state = state;
        });
    }

    pub fn page_fetched(&self, kind: ContentKind, page: u32, records: usize) {
        info!("{kind} page {page}: fetched {records} records");
        self.mutate(|outcome| {
            outcome.kinds.entry(kind).or_default().pages_fetched += 1;
        });
    }

    pub fn record_imported(&self, kind: ContentKind, action: WriteAction) {
        self.mutate(|outcome| {
            outcome.imported += 1;
            match action {
                WriteAction::Created => outcome.created += 1,
                WriteAction::Updated => outcome.updated += 1,
                WriteAction::Unchanged => outcome.unchanged += 1,
            }
            outcome.kinds.entry(kind).or_default().imported += 1;
        });
    }

    pub fn record_skipped(&self, kind: ContentKind) {
        self.mutate(|outcome| {
            outcome.skipped += 1;
            outcome.kinds.entry(kind).or_default().skipped += 1;
        });
    }

    pub fn record_failure(&self, failure: RecordFailure) {
        error!(
            reason = failure.reason.as_str(),
            "{}: {}", failure.description, failure.message
        );
        self.mutate(|outcome| {
            outcome.failed += 1;
            outcome.kinds.entry(failure.kind).or_default().failed += 1;
            outcome.errors.push(OutcomeEntry {
                kind: Some(failure.kind),
                external_id: failure.external_id,
                description: failure.description,
                message: failure.message,
                reason: failure.reason,
            });
        });
    }

    pub fn record_warning(
        &self,
        kind: ContentKind,
        external_id: u64,
        description: impl Into<String>,
        message: impl Into<String>,
    ) {
        let description = description.into();
        let message = message.into();
        warn!("{description}: {message}");
        self.mutate(|outcome| {
            outcome.warnings.push(WarningEntry {
                kind,
                external_id,
                description,
                message,
            });
        });
    }

    /// A page that could not be fetched. Counts as an error, not as a failed record.
    pub fn record_page_failure(&self, kind: ContentKind, page: u32, source_error: &SourceError) {
        let description = format!("{kind} page {page}");
        error!(
            reason = source_error.reason().as_str(),
            "{description}: {source_error}"
        );
        self.mutate(|outcome| {
            outcome.errors.push(OutcomeEntry {
                kind: Some(kind),
                external_id: None,
                description,
                message: source_error.to_string(),
                reason: source_error.reason(),
            });
        });
    }

    pub fn record_cancellation(&self, kind: Option<ContentKind>) {
        let description = match kind {
            Some(kind) => format!("{kind} import"),
            None => "migration run".to_string(),
        };
        warn!("{description}: cancellation requested");
        self.mutate(|outcome| {
            if outcome.cancellation_requested {
                return;
            }
            outcome.cancellation_requested = true;
            outcome.errors.push(OutcomeEntry {
                kind,
                external_id: None,
                description,
                message: "cancellation requested; no further pages fetched".to_string(),
                reason: FailureReason::CancellationRequested,
            });
        });
    }

    /// Seal the outcome. Later mutations are ignored.
    pub fn finish(&self) -> MigrationOutcome {
        let mut state = self.lock();
        if !state.finished {
            state.finished = true;
            let outcome = &mut state.outcome;
            outcome.status = if outcome.cancellation_requested {
                RunStatus::Cancelled
            } else if outcome.is_success() {
                RunStatus::Completed
            } else {
                RunStatus::CompletedWithErrors
            };
            info!(
                status = outcome.status.as_str(),
                imported = outcome.imported,
                skipped = outcome.skipped,
                failed = outcome.failed,
                "migration finished"
            );
        }
        state.outcome.clone()
    }

    pub fn snapshot(&self) -> MigrationOutcome {
        self.lock().outcome.clone()
    }

    fn mutate<F>(&self, apply: F)
    where
        F: FnOnce(&mut MigrationOutcome),
    {
        let mut state = self.lock();
        if state.finished {
            return;
        }
        apply(&mut state.outcome);
    }

    fn lock(&self) -> MutexGuard<'_, ReporterState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate_per_kind() {
        let reporter = ResultReporter::new(&[ContentKind::Tag, ContentKind::Post]);
        reporter.start();
        reporter.record_imported(ContentKind::Tag, WriteAction::Created);
        reporter.record_imported(ContentKind::Post, WriteAction::Unchanged);
        reporter.record_skipped(ContentKind::Post);

        let outcome = reporter.finish();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.imported, 2);
        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.unchanged, 1);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.kinds[&ContentKind::Post].imported, 1);
        assert_eq!(outcome.kinds[&ContentKind::Post].skipped, 1);
        assert!(outcome.is_success());
    }

    #[test]
    fn failures_and_page_errors_break_success() {
        let reporter = ResultReporter::new(&[ContentKind::Post]);
        reporter.record_failure(RecordFailure::new(
            ContentKind::Post,
            Some(4),
            "post 4 (Broken)",
            FailureReason::MappingError,
            "required field `date` is missing",
        ));
        reporter.record_page_failure(ContentKind::Post, 2, &SourceError::unavailable("HTTP 503"));

        let outcome = reporter.finish();
        assert_eq!(outcome.status, RunStatus::CompletedWithErrors);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.errors.len(), 2);
        assert_eq!(outcome.errors[0].description, "post 4 (Broken)");
        assert_eq!(outcome.errors[1].reason, FailureReason::SourceUnavailable);
        assert!(!outcome.is_success());
    }

    #[test]
    fn cancellation_is_recorded_once() {
        let reporter = ResultReporter::new(&[ContentKind::Post]);
        reporter.record_cancellation(Some(ContentKind::Post));
        reporter.record_cancellation(Some(ContentKind::Post));

        let outcome = reporter.finish();
        assert!(outcome.cancellation_requested);
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(
            outcome.errors_with_reason(FailureReason::CancellationRequested),
            1
        );
    }

    #[test]
    fn finished_outcome_is_terminal() {
        let reporter = ResultReporter::new(&[ContentKind::Tag]);
        let sealed = reporter.finish();
        reporter.record_imported(ContentKind::Tag, WriteAction::Created);
        reporter.set_state(ContentKind::Tag, KindState::Completed);
        assert_eq!(reporter.snapshot(), sealed);
        assert_eq!(sealed.kind_state(ContentKind::Tag), Some(KindState::NotStarted));
    }

    #[test]
    fn clones_share_state() {
        let reporter = ResultReporter::new(&[ContentKind::Author]);
        let handle = reporter.clone();
        reporter.record_warning(ContentKind::Author, 1, "author 1 (Ada)", "avatar missing");
        assert_eq!(handle.snapshot().warnings.len(), 1);
        assert!(handle.snapshot().is_success());
    }
}
