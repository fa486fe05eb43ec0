//! The single entry point report surfaces call: fetch when stale, fall back to
//! the last snapshot, or report that no data exists.

use std::sync::Arc;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use sdp_core::{PipelineError, SnapshotSummary, SpeciesSummary, Table};
use sdp_storage::{fetch_all, HttpPageSource, PageSource, SnapshotMetadata, SnapshotStore};
use sdp_transform::{
    aggregate_species, filter_completed, filter_date_range, prepare, summarize, Denylist,
    SummaryColumns,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::AppConfig;

/// What `status` reports without touching the network.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub data_dir: String,
    pub stale: bool,
    pub max_age_hours: u64,
    pub snapshot: Option<SnapshotMetadata>,
}

pub struct DataService {
    config: AppConfig,
    source: Box<dyn PageSource>,
    store: SnapshotStore,
    denylist: Denylist,
    summary_columns: SummaryColumns,
    refresh_lock: Mutex<()>,
}

impl DataService {
    /// Service backed by the HTTP feed described in `config`.
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let source = HttpPageSource::new(
            config.endpoint.submissions_url(),
            config.credentials.clone(),
            config.pagination,
            config.http_client_config(),
        )
        .context("building feed client")?;
        Ok(Self::with_source(config, Box::new(source)))
    }

    pub fn with_source(config: AppConfig, source: Box<dyn PageSource>) -> Self {
        let store = SnapshotStore::new(config.data_dir.clone());
        let denylist = config.settings.denylist();
        let summary_columns = config.settings.summary_columns();
        Self {
            config,
            source,
            store,
            denylist,
            summary_columns,
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Fetch, prepare and persist a fresh snapshot. Returns the processed table.
    pub async fn refresh(&self) -> Result<Arc<Table>, PipelineError> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> Result<Arc<Table>, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("refresh", %run_id);
        async move {
            let records = fetch_all(self.source.as_ref(), self.config.page_size).await?;
            let prepared = prepare(&records, &self.denylist);
            let summary = summarize(
                &prepared.raw,
                &prepared.processed,
                &self.summary_columns,
                run_id,
                Utc::now(),
            );
            self.store
                .save(&prepared.raw, &prepared.processed, &summary)
                .await?;
            info!(
                records = records.len(),
                completed = summary.completed_rows,
                "refresh complete"
            );
            Ok::<_, PipelineError>(Arc::new(prepared.processed))
        }
        .instrument(span)
        .await
    }

    /// The processed table, refreshed first when `force` is set or the snapshot is stale.
    ///
    /// A failed refresh falls back to the last snapshot. When there is none either,
    /// the error is `NoDataAvailable` carrying the refresh failure.
    pub async fn ensure_available(&self, force: bool) -> Result<Arc<Table>, PipelineError> {
        let max_age = self.config.max_age_hours;
        if force || self.store.is_stale(max_age).await {
            let _guard = self.refresh_lock.lock().await;
            // Another caller may have refreshed while this one waited.
            if force || self.store.is_stale(max_age).await {
                match self.refresh_locked().await {
                    Ok(table) => return Ok(table),
                    Err(refresh_err) => {
                        warn!(error = %refresh_err, "refresh failed, falling back to last snapshot");
                        return self.store.load_processed().await.map(Arc::new).map_err(
                            |cache_err| {
                                error!(error = %cache_err, "no usable snapshot to fall back to");
                                PipelineError::no_data(format!(
                                    "refresh failed ({refresh_err}) and no snapshot could be loaded ({cache_err})"
                                ))
                            },
                        );
                    }
                }
            }
        }
        self.store.load_processed().await.map(Arc::new)
    }

    /// Consented rows, optionally limited to an inclusive date range.
    pub async fn completed(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Table, PipelineError> {
        let processed = self.ensure_available(false).await?;
        let completed = filter_completed(&processed);
        Ok(filter_date_range(&completed, from, to))
    }

    pub async fn species(&self) -> Result<Vec<SpeciesSummary>, PipelineError> {
        let completed = self.completed(None, None).await?;
        Ok(aggregate_species(&completed))
    }

    pub async fn summary(&self) -> Result<SnapshotSummary, PipelineError> {
        self.ensure_available(false).await?;
        self.store.load_summary().await
    }

    pub async fn status(&self) -> anyhow::Result<ServiceStatus> {
        Ok(ServiceStatus {
            data_dir: self.store.root().display().to_string(),
            stale: self.store.is_stale(self.config.max_age_hours).await,
            max_age_hours: self.config.max_age_hours,
            snapshot: self.store.current().await?,
        })
    }
}

/// Cron-driven forced refresh, or `None` when the scheduler is disabled.
pub async fn maybe_build_scheduler(service: Arc<DataService>) -> anyhow::Result<Option<JobScheduler>> {
    if !service.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = service.config.refresh_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let service = service.clone();
        Box::pin(async move {
            match service.ensure_available(true).await {
                Ok(table) => info!(rows = table.len(), "scheduled refresh finished"),
                Err(err) => warn!(error = %err, "scheduled refresh failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
