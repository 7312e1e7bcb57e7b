use super::lock::ProcessingLock;
use super::{system_clock, Clock};
use crate::batch::{artifact_stem, artifacts, Batch, BatchError, Record};
use crate::config::types::{BatchConfig, Config};
use crate::dispatch::{
    DispatchQueue, DispatchResult, DispatchSummary, OutboundMessage, Provider,
    STATUS_RENDER_FAILED,
};
use crate::render::{Renderer, Template};
use crate::schedule::{plan_with_margin, SendPlan, SendingWindow};
use crate::storage::{
    ArtifactInfo, ArtifactStore, CheckpointManager, CheckpointStore, StorageError, TemplateStore,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Errors that fail a whole cycle. Anything that goes wrong inside one batch
/// is reported on that batch instead.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("failed to acquire processing lock: {0}")]
    Lock(#[source] StorageError),

    #[error("failed to list pending batches: {0}")]
    Listing(#[source] StorageError),
}

#[derive(Debug, Error)]
enum BatchFailure {
    #[error("store error: {0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Batch(#[from] BatchError),

    #[error("artifact '{0}' already exists, refusing to overwrite it")]
    Conflict(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Another cycle holds the processing lock; nothing was done
    Busy,
    Completed(CycleReport),
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub checked_at: DateTime<Utc>,
    pub batches: Vec<BatchReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub name: String,
    #[serde(flatten)]
    pub disposition: BatchDisposition,
}

/// Keys written for one dispatched batch. Every run gets its own tag, so a
/// batch name that comes back later never replaces earlier results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchArtifacts {
    pub archive: String,
    pub failed: String,
    pub summary: String,
    pub results: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum BatchDisposition {
    /// Every record was attempted and the source archived
    Sent {
        summary: DispatchSummary,
        artifacts: BatchArtifacts,
    },
    /// A prefix was attempted; the rest was queued as a new pending batch
    Split {
        summary: DispatchSummary,
        artifacts: BatchArtifacts,
        remainder: String,
        remainder_records: usize,
    },
    /// Nothing sent this cycle; the batch stays pending
    Deferred { plan: SendPlan, seconds_remaining: i64 },
    /// The batch could not be processed and stays pending
    Failed { error: String },
}

impl BatchDisposition {
    fn completes_batch(&self) -> bool {
        matches!(self, BatchDisposition::Sent { .. } | BatchDisposition::Split { .. })
    }
}

/// Drives dispatch cycles: lists pending batches, plans each against the
/// sending window, sends the planned records and moves the batch artifacts
/// to their next state.
pub struct Dispatcher {
    artifacts: Arc<dyn ArtifactStore>,
    templates: Arc<dyn TemplateStore>,
    checkpoints: CheckpointManager,
    lock: ProcessingLock,
    queue: DispatchQueue,
    renderer: Renderer,
    window: SendingWindow,
    batches: BatchConfig,
    tps: u32,
    safety_factor: f64,
    concurrency: usize,
    clock: Clock,
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        artifacts: Arc<dyn ArtifactStore>,
        templates: Arc<dyn TemplateStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        provider: Arc<dyn Provider>,
    ) -> Self {
        let clock = system_clock();
        let checkpoints = CheckpointManager::new(checkpoints);
        let lock = ProcessingLock::new(
            checkpoints.clone(),
            config.lock.lease,
            config.lock.keep_alive,
            clock.clone(),
        );

        Self {
            artifacts,
            templates,
            checkpoints,
            lock,
            queue: DispatchQueue::new(
                provider,
                config.dispatch.tps,
                config.dispatch.max_throttle_retries,
            ),
            renderer: Renderer::new(
                config.batches.columns.clone(),
                config.rendering.missing_field,
            ),
            window: SendingWindow::from_config(&config.window),
            batches: config.batches.clone(),
            tps: config.dispatch.tps,
            safety_factor: config.window.safety_factor,
            concurrency: config.dispatch.concurrency.max(1),
            clock,
        }
    }

    /// Replace the wall clock used for window decisions, checkpoints and leases
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.lock = self.lock.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub fn lock(&self) -> &ProcessingLock {
        &self.lock
    }

    pub fn templates(&self) -> Arc<dyn TemplateStore> {
        self.templates.clone()
    }

    /// Run one dispatch cycle.
    ///
    /// Returns [`CycleOutcome::Busy`] without doing anything when another
    /// cycle holds the lock. Fails only when the lock or the pending listing
    /// cannot be read.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, CycleError> {
        let Some(guard) = self.lock.try_acquire().await.map_err(CycleError::Lock)? else {
            info!("Dispatch cycle already in progress, skipping");
            return Ok(CycleOutcome::Busy);
        };

        let result = self.run_locked().await;

        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release processing lock");
        }

        result.map(CycleOutcome::Completed)
    }

    async fn run_locked(&self) -> Result<CycleReport, CycleError> {
        let checked_at = (self.clock)();
        // Every pending batch is unsent, so unreadable state only widens the candidates
        let (last_check, mut deferred) = match self.read_checkpoints().await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Failed to read checkpoint state, considering every pending batch");
                (None, BTreeSet::new())
            }
        };

        let listed = self
            .artifacts
            .list(&self.batches.pending_prefix)
            .await
            .map_err(CycleError::Listing)?;

        let listed_names: HashSet<&str> = listed.iter().map(|a| a.name.as_str()).collect();
        deferred.retain(|name| listed_names.contains(name.as_str()));

        let candidates: Vec<ArtifactInfo> = listed
            .iter()
            .filter(|a| is_batch_file(&a.name))
            .filter(|a| {
                deferred.contains(&a.name)
                    || last_check.map_or(true, |last| a.last_modified > last)
            })
            .cloned()
            .collect();

        deferred.extend(candidates.iter().map(|a| a.name.clone()));
        // The last check only moves once every candidate is in the stored deferred set
        match self.checkpoints.set_deferred(&deferred).await {
            Ok(()) => {
                if let Err(e) = self.checkpoints.set_last_check(checked_at).await {
                    warn!(error = %e, "Failed to store last check time");
                }
            }
            Err(e) => warn!(error = %e, "Failed to persist deferred batches, keeping last check time"),
        }

        info!(
            listed = listed.len(),
            candidates = candidates.len(),
            "Listed pending batches"
        );

        let mut reports = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            let disposition = self.process_batch(candidate).await;

            if disposition.completes_batch() {
                deferred.remove(&candidate.name);
            }
            if let BatchDisposition::Split { remainder, .. } = &disposition {
                deferred.insert(remainder.clone());
            }

            reports.push(BatchReport {
                name: candidate.name.clone(),
                disposition,
            });
        }

        if let Err(e) = self.checkpoints.set_deferred(&deferred).await {
            warn!(error = %e, "Failed to persist deferred batches");
        }

        Ok(CycleReport {
            checked_at,
            batches: reports,
        })
    }

    async fn read_checkpoints(
        &self,
    ) -> Result<(Option<DateTime<Utc>>, BTreeSet<String>), StorageError> {
        let last_check = self.checkpoints.last_check().await?;
        let deferred = self.checkpoints.deferred().await?;
        Ok((last_check, deferred))
    }

    async fn process_batch(&self, info: &ArtifactInfo) -> BatchDisposition {
        let batch = match self.load_batch(info).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(batch = %info.name, error = %e, "Failed to load batch, leaving it pending");
                return BatchDisposition::Failed {
                    error: e.to_string(),
                };
            }
        };

        let seconds_remaining = self.window.seconds_remaining((self.clock)());
        let plan = plan_with_margin(batch.len(), self.tps, seconds_remaining, self.safety_factor);
        if plan.defers_everything() {
            info!(
                batch = %batch.name,
                records = batch.len(),
                seconds_remaining,
                "No sending time left, deferring batch"
            );
            return BatchDisposition::Deferred {
                plan,
                seconds_remaining,
            };
        }

        let templates = match self.load_templates(&batch).await {
            Ok(templates) => templates,
            Err(e) => {
                error!(batch = %batch.name, error = %e, "Failed to load templates, leaving batch pending");
                return BatchDisposition::Failed {
                    error: e.to_string(),
                };
            }
        };

        let tag = run_tag((self.clock)());
        let artifacts = self.artifact_names(&batch.name, &tag);
        let total = batch.len();
        let count = plan.send_count(total);
        let (attempted, remainder) = if count < total {
            let name = remainder_name(&self.batches.pending_prefix, &batch.name, &tag);
            let (attempted, remainder) = batch.split_at(count, name);
            (attempted, Some(remainder))
        } else {
            (batch, None)
        };

        info!(
            batch = %attempted.name,
            sending = attempted.len(),
            deferred = remainder.as_ref().map_or(0, Batch::len),
            seconds_remaining,
            "Dispatching batch"
        );

        let started_at = (self.clock)();
        let results = self.dispatch_records(&attempted, &templates).await;
        let summary = DispatchSummary::from_results(&results, started_at, (self.clock)());

        if let Err(e) = self
            .persist(&attempted, remainder.as_ref(), &artifacts, &results, &summary)
            .await
        {
            error!(batch = %attempted.name, error = %e, "Failed to store batch results");
            return BatchDisposition::Failed {
                error: e.to_string(),
            };
        }

        info!(
            batch = %attempted.name,
            successful = summary.succeeded,
            failed = summary.failed,
            "Batch dispatched"
        );

        match remainder {
            Some(remainder) => BatchDisposition::Split {
                summary,
                artifacts,
                remainder_records: remainder.len(),
                remainder: remainder.name,
            },
            None => BatchDisposition::Sent { summary, artifacts },
        }
    }

    async fn load_batch(&self, info: &ArtifactInfo) -> Result<Batch, BatchFailure> {
        let content = self.artifacts.get_content(&info.name).await?;
        let columns = &self.batches.columns;
        let batch = Batch::parse(
            &info.name,
            &content,
            self.delimiter(),
            &[
                columns.template_id.as_str(),
                columns.phone.as_str(),
                columns.reference.as_str(),
            ],
            info.last_modified,
        )?;
        Ok(batch)
    }

    /// Every template the batch refers to, loaded once per batch
    async fn load_templates(
        &self,
        batch: &Batch,
    ) -> Result<HashMap<String, Template>, StorageError> {
        let ids: BTreeSet<&str> = batch
            .records
            .iter()
            .filter_map(|r| r.get(&self.batches.columns.template_id))
            .collect();

        let mut templates = HashMap::with_capacity(ids.len());
        for id in ids {
            match self.templates.get_template(id).await? {
                Some(template) => {
                    templates.insert(id.to_string(), template);
                }
                None => warn!(batch = %batch.name, template_id = id, "Template not found"),
            }
        }
        Ok(templates)
    }

    /// Results come back in record order however many sends are in flight
    async fn dispatch_records(
        &self,
        batch: &Batch,
        templates: &HashMap<String, Template>,
    ) -> Vec<DispatchResult> {
        let sends: Vec<_> = batch
            .records
            .iter()
            .map(|record| self.dispatch_record(record, templates, &batch.name))
            .collect();
        stream::iter(sends)
            .buffered(self.concurrency)
            .collect()
            .await
    }

    async fn dispatch_record(
        &self,
        record: &Record,
        templates: &HashMap<String, Template>,
        batch_name: &str,
    ) -> DispatchResult {
        let columns = &self.batches.columns;
        let reference = record.get(&columns.reference).unwrap_or_default().to_string();
        let template = record
            .get(&columns.template_id)
            .and_then(|id| templates.get(id));

        match self.renderer.render(record, template) {
            Ok(message) => {
                let outbound = OutboundMessage {
                    from: message.sender_id,
                    to: message.recipient,
                    text: message.body,
                    client_ref: reference,
                    account_ref: batch_name.to_string(),
                };
                self.queue.dispatch(&outbound).await
            }
            Err(e) => {
                debug!(batch = %batch_name, reference = %reference, error = %e, "Record not rendered");
                let recipient = record
                    .get(&columns.phone)
                    .unwrap_or_default()
                    .replace('+', "");
                DispatchResult::failed(reference, recipient, STATUS_RENDER_FAILED, e.to_string())
            }
        }
    }

    /// Write the remainder first, then outputs and the archive, then drop the
    /// source. A failure after the remainder went up takes the remainder back
    /// down so the pending prefix never holds both.
    async fn persist(
        &self,
        attempted: &Batch,
        remainder: Option<&Batch>,
        artifacts: &BatchArtifacts,
        results: &[DispatchResult],
        summary: &DispatchSummary,
    ) -> Result<(), BatchFailure> {
        if let Some(remainder) = remainder {
            if remainder.name == attempted.name {
                return Err(BatchFailure::Conflict(remainder.name.clone()));
            }
            let content = remainder.to_csv(self.delimiter())?;
            self.put_new(&remainder.name, &content).await?;
            debug!(remainder = %remainder.name, records = remainder.len(), "Queued remainder batch");
        }

        let outputs = self
            .write_outputs(attempted, remainder.is_some(), artifacts, results, summary)
            .await;
        if let (Err(_), Some(remainder)) = (&outputs, remainder) {
            if let Err(e) = self.artifacts.remove(&remainder.name).await {
                warn!(remainder = %remainder.name, error = %e, "Failed to roll back remainder batch");
            }
        }
        outputs
    }

    async fn write_outputs(
        &self,
        attempted: &Batch,
        split: bool,
        keys: &BatchArtifacts,
        results: &[DispatchResult],
        summary: &DispatchSummary,
    ) -> Result<(), BatchFailure> {
        let delimiter = self.delimiter();

        self.put_new(&keys.failed, &artifacts::failed_csv(results, delimiter)?)
            .await?;
        self.put_new(&keys.summary, &artifacts::summary_csv(summary, delimiter)?)
            .await?;
        self.put_new(&keys.results, &artifacts::results_csv(results, delimiter)?)
            .await?;

        if split {
            self.put_new(&keys.archive, &attempted.to_csv(delimiter)?)
                .await?;
            self.artifacts.remove(&attempted.name).await?;
        } else {
            if self.artifacts.exists(&keys.archive).await? {
                return Err(BatchFailure::Conflict(keys.archive.clone()));
            }
            self.artifacts
                .rename(&attempted.name, &keys.archive)
                .await?;
        }
        Ok(())
    }

    async fn put_new(&self, name: &str, content: &[u8]) -> Result<(), BatchFailure> {
        if self.artifacts.exists(name).await? {
            return Err(BatchFailure::Conflict(name.to_string()));
        }
        self.artifacts.put(name, content).await?;
        Ok(())
    }

    /// `send/mahnung.csv` run under `tag` is archived as
    /// `processed/mahnung_<tag>.csv` and reported as `output/mahnung_<tag>_*.csv`
    fn artifact_names(&self, name: &str, tag: &str) -> BatchArtifacts {
        let stem = artifact_stem(name);
        let output = |kind: &str| {
            format!("{}{}_{}_{}.csv", self.batches.output_prefix, stem, tag, kind)
        };

        BatchArtifacts {
            archive: format!("{}{}_{}.csv", self.batches.archive_prefix, stem, tag),
            failed: output("failed"),
            summary: output("summary"),
            results: output("results"),
        }
    }

    fn delimiter(&self) -> u8 {
        u8::try_from(self.batches.delimiter).unwrap_or(b';')
    }
}

fn is_batch_file(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".csv")
}

/// `20240515T155958_1f0c2a9e`: the run time plus a random suffix
fn run_tag(at: DateTime<Utc>) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}_{}", at.format("%Y%m%dT%H%M%S"), &id[..8])
}

/// `send/mahnung.csv` becomes `send/mahnung_remainder_<tag>.csv`; a remainder
/// that is split again keeps the original stem
fn remainder_name(pending_prefix: &str, name: &str, tag: &str) -> String {
    let stem = artifact_stem(name);
    let base = stem.split("_remainder_").next().unwrap_or(stem);
    format!("{}{}_remainder_{}.csv", pending_prefix, base, tag)
}
