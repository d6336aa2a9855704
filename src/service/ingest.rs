//! Ingestion of scout pushes.

use super::blocking;
use super::validate::{validate, ValidatedPush, ValidationError};
use crate::config::RetentionConfig;
use crate::db::{AlertEvent, Store, StoreError, WriteOp};

use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("no API key configured")]
    Misconfigured,
    #[error("bad or missing credentials")]
    Unauthorized,
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Acknowledgment of an applied push.
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    pub machine_id: String,
    pub cpu_temp: Option<f64>,
    pub push_count: i64,
    pub sampled: bool,
    pub alerts: usize,
}

/// Accepts snapshots from scouts and writes them to the store.
#[derive(Clone)]
pub struct IngestService {
    store: Store,
    api_key: Option<Arc<str>>,
    retention: RetentionConfig,
}

impl IngestService {
    pub fn new(store: Store, api_key: Option<String>, retention: RetentionConfig) -> Self {
        Self {
            store,
            api_key: api_key.filter(|k| !k.is_empty()).map(Arc::from),
            retention,
        }
    }

    /// Check an `Authorization` header value against the shared secret.
    ///
    /// Fails closed when no secret is configured.
    pub fn authorize(&self, authorization: Option<&str>) -> Result<(), IngestError> {
        let key = self.api_key.as_deref().ok_or(IngestError::Misconfigured)?;
        let presented = authorization
            .and_then(|h| h.strip_prefix("Bearer "))
            .ok_or(IngestError::Unauthorized)?;

        if presented != key {
            return Err(IngestError::Unauthorized);
        }
        Ok(())
    }

    /// Authorize, validate and apply one push.
    pub async fn ingest(
        &self,
        authorization: Option<&str>,
        body: &[u8],
    ) -> Result<Accepted, IngestError> {
        self.authorize(authorization)?;
        let push = validate(body)?;

        let machine_id = push.snapshot.machine_id().to_string();
        let cpu_temp = push.snapshot.cpu_temp();
        let alerts = push.alerts.len();
        let ops = self.plan(push, Utc::now());

        let outcome = blocking(&self.store, move |store| store.apply(&ops)).await?;

        Ok(Accepted {
            machine_id,
            cpu_temp,
            push_count: outcome.push_count.unwrap_or_default(),
            sampled: outcome.sampled,
            alerts,
        })
    }

    /// Translate a validated push into the store writes that apply it.
    fn plan(&self, push: ValidatedPush, now: DateTime<Utc>) -> Vec<WriteOp> {
        let ValidatedPush { snapshot, alerts } = push;
        let machine_id = snapshot.machine_id().to_string();
        let mut ops = Vec::with_capacity(alerts.len() + 5);

        ops.push(WriteOp::SetCurrent {
            snapshot: snapshot.clone(),
            expires_at: now.timestamp() + self.retention.current_ttl_secs,
        });
        ops.push(WriteOp::RegisterMachine {
            machine_id: machine_id.clone(),
        });
        ops.push(WriteOp::CountAndSample {
            snapshot,
            every: self.retention.sample_every,
            max_len: self.retention.history_max,
        });

        if !alerts.is_empty() {
            ops.extend(alerts.into_iter().map(|raw| WriteOp::PushAlert {
                alert: AlertEvent::enrich(raw, &machine_id),
            }));
            ops.push(WriteOp::TrimAlerts {
                max_len: self.retention.alerts_max,
            });
        }

        ops.push(WriteOp::MarkMonitoringSince {
            value: now.to_rfc3339_opts(SecondsFormat::Millis, true),
        });

        ops
    }
}
