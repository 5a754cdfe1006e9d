use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ImportConfig;
use crate::error::{FailureReason, RecordFailure, SourceError, WriteError};
use crate::identity::{IdentityMap, IdentitySnapshot};
use crate::mapper::normalize;
use crate::model::{
    ContentKind, DestinationId, NormalizedRecord, ResolvedRelations, SourceRecord, UpsertResult,
    WriteAction,
};
use crate::report::{KindState, MigrationOutcome, ResultReporter};
use crate::source::{MediaFetcher, SourceClient, clamp_page_size};
use crate::store::TargetWriter;

pub const MAX_WORKERS: usize = 16;

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    /// Kinds to import. Empty means everything except media.
    pub kinds: Vec<ContentKind>,
    pub page_size: usize,
    pub workers: usize,
    pub fetch_timeout: Duration,
    pub write_timeout: Duration,
    pub fetch_attempts: u32,
    pub retry_delay: Duration,
    pub author_required: bool,
    pub import_media: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            kinds: Vec::new(),
            page_size: 100,
            workers: 4,
            fetch_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            fetch_attempts: 3,
            retry_delay: Duration::from_millis(500),
            author_required: true,
            import_media: false,
        }
    }
}

impl MigrationOptions {
    pub fn from_config(config: &ImportConfig) -> Result<Self> {
        let defaults = Self::default();
        let section = &config.migration;
        Ok(Self {
            kinds: section.content_kinds()?,
            page_size: config.page_size(),
            workers: section.workers.unwrap_or(defaults.workers),
            fetch_timeout: Duration::from_millis(config.http_timeout_ms()),
            write_timeout: section
                .write_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.write_timeout),
            fetch_attempts: section.fetch_attempts.unwrap_or(defaults.fetch_attempts),
            retry_delay: section
                .retry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_delay),
            author_required: section.author_required.unwrap_or(defaults.author_required),
            import_media: section.import_media.unwrap_or(defaults.import_media),
        })
    }

    /// Requested kinds, deduplicated and in dependency order.
    pub fn planned_kinds(&self) -> Vec<ContentKind> {
        let mut kinds: Vec<ContentKind> = if self.kinds.is_empty() {
            ContentKind::ALL
                .into_iter()
                .filter(|kind| *kind != ContentKind::Media)
                .collect()
        } else {
            self.kinds.clone()
        };
        if self.import_media {
            kinds.push(ContentKind::Media);
        }
        kinds.sort_by_key(|kind| kind.dependency_rank());
        kinds.dedup();
        kinds
    }

    pub fn worker_count(&self) -> usize {
        self.workers.clamp(1, MAX_WORKERS)
    }
}

/// Drives one migration run: pages in, records normalized, relations resolved, items written.
pub struct MigrationOrchestrator {
    source: Arc<dyn SourceClient>,
    writer: Arc<dyn TargetWriter>,
    media: Option<Arc<dyn MediaFetcher>>,
    identities: Arc<IdentityMap>,
    reporter: ResultReporter,
    options: MigrationOptions,
    kinds: Vec<ContentKind>,
    cancel: CancellationToken,
}

impl MigrationOrchestrator {
    pub fn new(
        source: Arc<dyn SourceClient>,
        writer: Arc<dyn TargetWriter>,
        options: MigrationOptions,
    ) -> Self {
        let kinds = options.planned_kinds();
        Self {
            source,
            writer,
            media: None,
            identities: Arc::new(IdentityMap::new()),
            reporter: ResultReporter::new(&kinds),
            options,
            kinds,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_media_fetcher(mut self, fetcher: Arc<dyn MediaFetcher>) -> Self {
        self.media = Some(fetcher);
        self
    }

    /// Seed the run with identities from an earlier checkpoint.
    pub fn with_identity_map(mut self, identities: IdentityMap) -> Self {
        self.identities = Arc::new(identities);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn reporter(&self) -> ResultReporter {
        self.reporter.clone()
    }

    pub fn identities(&self) -> &IdentityMap {
        &self.identities
    }

    pub fn planned_kinds(&self) -> &[ContentKind] {
        &self.kinds
    }

    pub async fn run(&self) -> MigrationOutcome {
        self.reporter.start();
        info!(
            kinds = ?self.kinds,
            workers = self.options.worker_count(),
            "starting migration"
        );

        for kind in &self.kinds {
            if self.cancel.is_cancelled() {
                self.reporter.record_cancellation(None);
                break;
            }
            let state = self.run_kind(*kind).await;
            self.reporter.set_state(*kind, state);
            info!("{kind} finished: {}", state.as_str());
        }
        if self.cancel.is_cancelled() {
            self.reporter.record_cancellation(None);
        }

        self.reporter.finish()
    }

    async fn run_kind(&self, kind: ContentKind) -> KindState {
        let page_size = clamp_page_size(self.options.page_size);
        let mut had_errors = false;
        let mut page = 1u32;

        loop {
            if self.cancel.is_cancelled() {
                self.reporter.record_cancellation(Some(kind));
                return KindState::CompletedWithErrors;
            }

            self.reporter.set_state(kind, KindState::FetchingPage);
            let records = match self.fetch_with_retry(kind, page, page_size).await {
                Ok(records) => records,
                Err(PageFetchError::Cancelled) => {
                    self.reporter.record_cancellation(Some(kind));
                    return KindState::CompletedWithErrors;
                }
                Err(PageFetchError::Source(error)) => {
                    self.reporter.record_page_failure(kind, page, &error);
                    return KindState::CompletedWithErrors;
                }
            };
            if records.is_empty() {
                break;
            }

            self.reporter.page_fetched(kind, page, records.len());
            if self.process_page(kind, records).await {
                had_errors = true;
            }
            page = page.saturating_add(1);
        }

        if had_errors {
            KindState::CompletedWithErrors
        } else {
            KindState::Completed
        }
    }

    async fn fetch_with_retry(
        &self,
        kind: ContentKind,
        page: u32,
        page_size: usize,
    ) -> Result<Vec<SourceRecord>, PageFetchError> {
        let attempts = self.options.fetch_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            let fetched = timeout(
                self.options.fetch_timeout,
                self.source.fetch_page(kind, page, page_size),
            )
            .await
            .unwrap_or_else(|_| {
                Err(SourceError::timed_out(format!(
                    "{kind} page {page}: timed out after {}ms",
                    self.options.fetch_timeout.as_millis()
                )))
            });

            match fetched {
                Ok(records) => return Ok(records),
                Err(error) if error.is_retryable() && attempt + 1 < attempts => {
                    let delay = backoff_delay(self.options.retry_delay, attempt);
                    warn!(
                        "{kind} page {page}: {error}; retrying in {}ms (attempt {}/{attempts})",
                        delay.as_millis(),
                        attempt + 2
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(PageFetchError::Cancelled),
                        _ = sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(error) => return Err(PageFetchError::Source(error)),
            }
        }
    }

    /// Map, resolve and write one page. Returns `true` when any record failed.
    async fn process_page(&self, kind: ContentKind, records: Vec<SourceRecord>) -> bool {
        let mut had_failures = false;

        self.reporter.set_state(kind, KindState::MappingBatch);
        let start_snapshot = self.identities.snapshot();
        let mut seen = HashSet::new();
        let mut pending = Vec::with_capacity(records.len());
        for record in records {
            let external_id = record.external_id();
            if start_snapshot.contains_key(&(kind, external_id)) || !seen.insert(external_id) {
                self.reporter.record_skipped(kind);
                continue;
            }
            match normalize(kind, &record) {
                Ok(normalized) => pending.push(normalized),
                Err(error) => {
                    had_failures = true;
                    self.reporter.record_failure(RecordFailure::mapping(
                        kind,
                        external_id,
                        record.describe(),
                        &error,
                    ));
                }
            }
        }

        // Items that depend on a same-page item of their own kind wait for a later wave.
        while !pending.is_empty() {
            self.reporter.set_state(kind, KindState::ResolvingRelations);
            let snapshot = self.identities.snapshot();
            let page_ids: HashSet<u64> = pending.iter().map(NormalizedRecord::external_id).collect();
            let (mut deferred, mut wave): (Vec<_>, Vec<_>) = pending.into_iter().partition(|record| {
                same_kind_dependency(record).is_some_and(|parent| {
                    parent != record.external_id()
                        && page_ids.contains(&parent)
                        && !snapshot.contains_key(&(kind, parent))
                })
            });
            if wave.is_empty() {
                wave = std::mem::take(&mut deferred);
            }

            let mut ready = Vec::with_capacity(wave.len());
            for record in wave {
                match resolve_relations(&record, &snapshot, self.options.author_required) {
                    Ok(resolution) => {
                        for message in resolution.warnings {
                            self.reporter.record_warning(
                                kind,
                                record.external_id(),
                                record.describe(),
                                message,
                            );
                        }
                        ready.push((record, resolution.relations));
                    }
                    Err(failure) => {
                        had_failures = true;
                        self.reporter.record_failure(failure);
                    }
                }
            }

            self.reporter.set_state(kind, KindState::WritingBatch);
            if self.write_batch(kind, ready).await {
                had_failures = true;
            }
            pending = deferred;
        }

        had_failures
    }

    async fn write_batch(
        &self,
        kind: ContentKind,
        batch: Vec<(NormalizedRecord, ResolvedRelations)>,
    ) -> bool {
        let semaphore = Arc::new(Semaphore::new(self.options.worker_count()));
        let mut tasks = JoinSet::new();
        for (record, relations) in batch {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let writer = Arc::clone(&self.writer);
            let media = self.media.clone();
            let identities = Arc::clone(&self.identities);
            let reporter = self.reporter.clone();
            let write_timeout = self.options.write_timeout;
            tasks.spawn(async move {
                let _permit = permit;
                match write_record(
                    writer.as_ref(),
                    media.as_deref(),
                    &record,
                    &relations,
                    write_timeout,
                )
                .await
                {
                    Ok(result) => {
                        identities.insert(kind, record.external_id(), result.id);
                        reporter.record_imported(kind, result.action);
                        false
                    }
                    Err(failure) => {
                        reporter.record_failure(failure);
                        true
                    }
                }
            });
        }

        let mut had_failures = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(failed) => had_failures |= failed,
                Err(error) => {
                    had_failures = true;
                    self.reporter.record_failure(RecordFailure::new(
                        kind,
                        None,
                        format!("{kind} write task"),
                        FailureReason::WriteRejected,
                        error.to_string(),
                    ));
                }
            }
        }
        had_failures
    }
}

enum PageFetchError {
    Source(SourceError),
    /// Cancelled while waiting to retry.
    Cancelled,
}

struct Resolution {
    relations: ResolvedRelations,
    warnings: Vec<String>,
}

fn resolve_relations(
    record: &NormalizedRecord,
    snapshot: &IdentitySnapshot,
    author_required: bool,
) -> Result<Resolution, RecordFailure> {
    let mut relations = ResolvedRelations::default();
    let mut warnings = Vec::new();
    let optional = |kind: ContentKind, external_id: u64, warnings: &mut Vec<String>| {
        let found = snapshot.get(&(kind, external_id)).copied();
        if found.is_none() {
            warnings.push(format!("{kind} {external_id} was not imported; reference omitted"));
        }
        found
    };

    match record {
        NormalizedRecord::Post(post) => {
            relations.author = match post.author {
                Some(author) => match snapshot.get(&(ContentKind::Author, author)) {
                    Some(id) => Some(*id),
                    None if author_required => {
                        return Err(dependency_missing(
                            record,
                            format!("author {author} was not imported"),
                        ));
                    }
                    None => {
                        warnings.push(format!("author {author} was not imported; reference omitted"));
                        None
                    }
                },
                None if author_required => {
                    return Err(dependency_missing(record, "post has no author".to_string()));
                }
                None => None,
            };
            relations.featured_media = post
                .featured_media
                .and_then(|media| optional(ContentKind::Media, media, &mut warnings));
            relations.categories = collect_ids(&post.categories, |id| {
                optional(ContentKind::Category, id, &mut warnings)
            });
            relations.tags =
                collect_ids(&post.tags, |id| optional(ContentKind::Tag, id, &mut warnings));
        }
        NormalizedRecord::Category(term) => {
            relations.parent = term
                .parent
                .filter(|parent| *parent != term.external_id)
                .and_then(|parent| optional(ContentKind::Category, parent, &mut warnings));
        }
        NormalizedRecord::Author(_) | NormalizedRecord::Tag(_) | NormalizedRecord::Media(_) => {}
    }

    Ok(Resolution {
        relations,
        warnings,
    })
}

fn collect_ids<F>(external_ids: &[u64], mut resolve: F) -> Vec<DestinationId>
where
    F: FnMut(u64) -> Option<DestinationId>,
{
    external_ids.iter().filter_map(|id| resolve(*id)).collect()
}

fn dependency_missing(record: &NormalizedRecord, message: String) -> RecordFailure {
    RecordFailure::new(
        record.kind(),
        Some(record.external_id()),
        record.describe(),
        FailureReason::DependencyMissing,
        message,
    )
}

fn same_kind_dependency(record: &NormalizedRecord) -> Option<u64> {
    match record {
        NormalizedRecord::Category(term) => term.parent,
        _ => None,
    }
}

async fn write_record(
    writer: &dyn TargetWriter,
    media: Option<&dyn MediaFetcher>,
    record: &NormalizedRecord,
    relations: &ResolvedRelations,
    write_timeout: Duration,
) -> Result<UpsertResult, RecordFailure> {
    let fail = |error: WriteError| {
        RecordFailure::write(record.kind(), record.external_id(), record.describe(), &error)
    };
    let describe = record.describe();

    let NormalizedRecord::Media(item) = record else {
        return retry_on_conflict(&describe, || {
            with_write_timeout(write_timeout, writer.upsert(record, relations))
        })
        .await
        .map_err(fail);
    };

    if writer.supports_key_lookup()
        && let Some(id) = with_write_timeout(write_timeout, writer.lookup(&record.natural_key()))
            .await
            .map_err(fail)?
    {
        return Ok(UpsertResult {
            id,
            action: WriteAction::Unchanged,
        });
    }
    let Some(fetcher) = media else {
        return Err(fail(WriteError::rejected("no media fetcher configured")));
    };
    retry_on_conflict(&describe, || {
        with_write_timeout(write_timeout, writer.upsert_media(item, fetcher))
    })
    .await
    .map_err(fail)
}

async fn retry_on_conflict<T, F, Fut>(describe: &str, mut attempt: F) -> Result<T, WriteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, WriteError>>,
{
    match attempt().await {
        Err(error) if error.is_conflict() => {
            warn!("{describe}: {error}; retrying once");
            attempt().await
        }
        other => other,
    }
}

async fn with_write_timeout<T, Fut>(limit: Duration, write: Fut) -> Result<T, WriteError>
where
    Fut: Future<Output = Result<T, WriteError>>,
{
    timeout(limit, write).await.unwrap_or_else(|_| {
        Err(WriteError::timed_out(format!(
            "no response within {}ms",
            limit.as_millis()
        )))
    })
}

/// `base * 2^attempt` plus up to 99ms of jitter. Zero base means no wait.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    if base.is_zero() {
        return Duration::ZERO;
    }
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let scaled = base_ms.saturating_mul(2u64.saturating_pow(attempt.min(16)));
    let jitter = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| u64::from(duration.subsec_millis() % 100))
        .unwrap_or(0);
    Duration::from_millis(scaled.saturating_add(jitter))
}
