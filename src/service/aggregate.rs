//! Assembly of the multi-machine read view.

use super::blocking;
use crate::config::RetentionConfig;
use crate::db::{AggregateView, MachineRecord, Store, StoreError};

use chrono::Utc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;

#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("aggregate read exceeded {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Read side of the dashboard: one call per poll.
#[derive(Clone)]
pub struct AggregateService {
    store: Store,
    retention: RetentionConfig,
    read_timeout: Duration,
}

impl AggregateService {
    pub fn new(store: Store, retention: RetentionConfig, read_timeout: Duration) -> Self {
        Self {
            store,
            retention,
            read_timeout,
        }
    }

    /// Build the aggregate view as of now, within the read deadline.
    pub async fn get_aggregate(&self) -> Result<AggregateView, AggregateError> {
        let now = Utc::now().timestamp();
        tokio::time::timeout(self.read_timeout, self.assemble(now))
            .await
            .map_err(|_| AggregateError::Timeout(self.read_timeout))?
    }

    async fn assemble(&self, now: i64) -> Result<AggregateView, AggregateError> {
        let machines = blocking(&self.store, |store| store.get_machines()).await?;

        let history_max = self.retention.history_max;
        let mut reads = JoinSet::new();
        for machine_id in machines {
            let store = self.store.clone();
            reads.spawn_blocking(move || {
                let current = store.get_current(&machine_id, now)?;
                let mut history = store.get_history(&machine_id, history_max)?;
                history.reverse();
                Ok::<_, StoreError>((machine_id, MachineRecord { current, history }))
            });
        }

        let alerts_max = self.retention.alerts_max;
        let (alerts, monitoring_since) = tokio::join!(
            blocking(&self.store, move |store| store.get_alerts(alerts_max)),
            blocking(&self.store, |store| store.get_monitoring_since()),
        );

        let mut view = AggregateView {
            alerts: alerts?,
            monitoring_since: monitoring_since?,
            ..Default::default()
        };

        while let Some(joined) = reads.join_next().await {
            let (machine_id, record) = joined.map_err(StoreError::from)??;
            view.machines.insert(machine_id, record);
        }

        tracing::debug!(
            machines = view.machines.len(),
            alerts = view.alerts.len(),
            "aggregate assembled"
        );

        Ok(view)
    }
}
