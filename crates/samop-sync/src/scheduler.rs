use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::resolver::RawParams;
use crate::workflow::Workflow;

/// `None` when the scheduler is disabled in config.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    workflow: Arc<Workflow>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(workflow, &config.sync_cron).await.map(Some)
}

/// One cron job running the workflow with default parameters.
pub async fn build_scheduler(workflow: Arc<Workflow>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let workflow = Arc::clone(&workflow);
        Box::pin(async move {
            info!("scheduled sam fetch triggered");
            let response = workflow.run(RawParams::default()).await;
            if response.success {
                info!(
                    run_id = %response.run_id,
                    returned = response.opportunities.len(),
                    partial = response.partial_success,
                    "scheduled sam fetch complete"
                );
            } else {
                warn!(
                    run_id = %response.run_id,
                    error = response.error.as_deref().unwrap_or("unknown"),
                    "scheduled sam fetch failed"
                );
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SearchDefaults;
    use crate::fetcher::{MultiPartitionFetcher, MutexRng};
    use crate::resolver::ParameterResolver;
    use samop_adapters::SamGovAdapter;
    use samop_storage::{HttpClientConfig, HttpFetcher, PartitionCache, StateStore, TokioSleeper};
    use tempfile::tempdir;

    fn workflow(state: &std::path::Path) -> Arc<Workflow> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let fetcher = MultiPartitionFetcher::new(
            Arc::new(SamGovAdapter::new(http, "http://127.0.0.1:9/search")),
            PartitionCache::in_memory(),
            Arc::new(TokioSleeper),
            Arc::new(MutexRng::new()),
        );
        Arc::new(Workflow::new(
            ParameterResolver::new(SearchDefaults::default()),
            fetcher,
            StateStore::new(state),
            None,
        ))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disabled_scheduler_is_not_built() {
        let dir = tempdir().expect("tempdir");
        let mut config = SyncConfig::from_env();
        config.scheduler_enabled = false;
        assert!(maybe_build_scheduler(&config, workflow(dir.path())).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_cron_is_rejected() {
        let dir = tempdir().expect("tempdir");
        match build_scheduler(workflow(dir.path()), "not a cron").await {
            Ok(_) => panic!("invalid cron accepted"),
            Err(err) => assert!(err.to_string().contains("not a cron")),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn twice_daily_cron_builds() {
        let dir = tempdir().expect("tempdir");
        let mut config = SyncConfig::from_env();
        config.scheduler_enabled = true;
        config.sync_cron = "0 0 6,18 * * *".into();
        assert!(maybe_build_scheduler(&config, workflow(dir.path())).await.unwrap().is_some());
    }
}
