//! Transactional outbox.
//!
//! Rows are written with [`enqueue`] on the same connection or transaction as
//! the business write, so an event exists if and only if its write committed.
//! [`start_worker`] drains pending rows and hands them to an
//! [`OutboxDispatcher`], retrying failures with exponential backoff.
//!
//! A claim moves the row to `processing` and pushes `available_at` out by
//! [`CLAIM_LEASE_SECS`]. A row whose worker died before recording the outcome
//! becomes due again once that lease runs out.

use crate::entities::outbox_event::{self, OutboxStatus};
use crate::errors::ServiceError;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const MAX_ATTEMPTS: i32 = 8;
const BASE_BACKOFF_SECS: i64 = 2;
const BATCH_SIZE: u64 = 50;
/// How long a claimed row stays reserved for the worker that claimed it
pub const CLAIM_LEASE_SECS: i64 = 300;

/// Receives drained outbox rows.
#[async_trait]
pub trait OutboxDispatcher: Send + Sync {
    async fn dispatch(&self, event_type: &str, payload: &serde_json::Value)
        -> Result<(), ServiceError>;
}

/// Enqueue an event into the outbox table. Pass the open transaction to make
/// the event atomic with the surrounding write.
pub async fn enqueue<C, P>(
    db: &C,
    aggregate_type: &str,
    aggregate_id: Option<Uuid>,
    event_type: &str,
    payload: &P,
) -> Result<Uuid, ServiceError>
where
    C: ConnectionTrait,
    P: Serialize,
{
    let id = Uuid::new_v4();
    let now = Utc::now();
    let row = outbox_event::ActiveModel {
        id: Set(id),
        aggregate_type: Set(aggregate_type.to_string()),
        aggregate_id: Set(aggregate_id),
        event_type: Set(event_type.to_string()),
        payload: Set(serde_json::to_string(payload)?),
        status: Set(OutboxStatus::Pending),
        attempts: Set(0),
        available_at: Set(now),
        created_at: Set(now),
        processed_at: Set(None),
        error_message: Set(None),
    };
    row.insert(db).await.map_err(ServiceError::db_error)?;

    debug!(
        outbox_id = %id,
        event_type,
        aggregate_type,
        "enqueued outbox event"
    );
    Ok(id)
}

/// Background worker to poll and dispatch outbox events.
pub fn start_worker(
    db: Arc<DatabaseConnection>,
    dispatcher: Arc<dyn OutboxDispatcher>,
    poll_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    info!(?poll_interval, "starting outbox worker");
    tokio::spawn(async move {
        loop {
            if let Err(e) = drain_once(&db, dispatcher.as_ref()).await {
                error!("outbox worker error: {}", e);
            }
            sleep(poll_interval).await;
        }
    })
}

/// Summary of one drain pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
}

/// Claims and dispatches one batch of due rows.
pub async fn drain_once(
    db: &DatabaseConnection,
    dispatcher: &dyn OutboxDispatcher,
) -> Result<DrainReport, ServiceError> {
    let now = Utc::now();
    let due = outbox_event::Entity::find()
        .filter(
            outbox_event::Column::Status.is_in([OutboxStatus::Pending, OutboxStatus::Processing]),
        )
        .filter(outbox_event::Column::AvailableAt.lte(now))
        .order_by_asc(outbox_event::Column::CreatedAt)
        .limit(BATCH_SIZE)
        .all(db)
        .await
        .map_err(ServiceError::db_error)?;

    let mut report = DrainReport::default();
    for row in due {
        if row.status == OutboxStatus::Processing {
            warn!(outbox_id = %row.id, attempts = row.attempts, "reclaiming outbox row with expired lease");
        }
        // Conditional claim: a concurrent worker sees the pushed-out lease and skips the row.
        let claimed = outbox_event::Entity::update_many()
            .col_expr(
                outbox_event::Column::Status,
                Expr::value(OutboxStatus::Processing),
            )
            .col_expr(
                outbox_event::Column::Attempts,
                Expr::col(outbox_event::Column::Attempts).add(1),
            )
            .col_expr(
                outbox_event::Column::AvailableAt,
                Expr::value(now + ChronoDuration::seconds(CLAIM_LEASE_SECS)),
            )
            .filter(outbox_event::Column::Id.eq(row.id))
            .filter(
                outbox_event::Column::Status.is_in([OutboxStatus::Pending, OutboxStatus::Processing]),
            )
            .filter(outbox_event::Column::AvailableAt.lte(now))
            .exec(db)
            .await
            .map_err(ServiceError::db_error)?;
        if claimed.rows_affected != 1 {
            continue;
        }
        let attempts = row.attempts + 1;

        let outcome = match serde_json::from_str::<serde_json::Value>(&row.payload) {
            Ok(payload) => dispatcher.dispatch(&row.event_type, &payload).await,
            Err(e) => Err(ServiceError::SerializationError(e.to_string())),
        };

        match outcome {
            Ok(()) => {
                mark(db, row.id, OutboxStatus::Delivered, None, None).await;
                counter!("arfind.outbox.delivered", 1);
                report.delivered += 1;
            }
            Err(err) if attempts < MAX_ATTEMPTS => {
                let retry_at = Utc::now() + backoff_for(attempts);
                warn!(
                    outbox_id = %row.id,
                    event_type = %row.event_type,
                    attempts,
                    error = %err,
                    "outbox dispatch failed; scheduling retry"
                );
                mark(
                    db,
                    row.id,
                    OutboxStatus::Pending,
                    Some(retry_at),
                    Some(err.to_string()),
                )
                .await;
                report.retried += 1;
            }
            Err(err) => {
                error!(
                    outbox_id = %row.id,
                    event_type = %row.event_type,
                    attempts,
                    error = %err,
                    "outbox dispatch exhausted retries"
                );
                mark(
                    db,
                    row.id,
                    OutboxStatus::Failed,
                    None,
                    Some(format!("max attempts exceeded: {}", err)),
                )
                .await;
                counter!("arfind.outbox.failed", 1);
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

/// Exponential backoff with sub-second jitter derived from the clock.
fn backoff_for(attempts: i32) -> ChronoDuration {
    let secs = BASE_BACKOFF_SECS.saturating_pow(attempts.max(1) as u32);
    let jitter_ms = Utc::now().timestamp_subsec_millis() as i64;
    ChronoDuration::seconds(secs) + ChronoDuration::milliseconds(jitter_ms)
}

async fn mark(
    db: &DatabaseConnection,
    id: Uuid,
    status: OutboxStatus,
    available_at: Option<chrono::DateTime<Utc>>,
    error_message: Option<String>,
) {
    let mut update = outbox_event::ActiveModel {
        id: Set(id),
        status: Set(status),
        error_message: Set(error_message),
        ..Default::default()
    };
    if status == OutboxStatus::Delivered {
        update.processed_at = Set(Some(Utc::now()));
    }
    if let Some(at) = available_at {
        update.available_at = Set(at);
    }
    if let Err(e) = update.update(db).await {
        warn!("failed updating outbox {}: {}", id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially() {
        let first = backoff_for(1).num_seconds();
        let third = backoff_for(3).num_seconds();
        assert_eq!(first, 2);
        assert_eq!(third, 8);
        assert!(backoff_for(7).num_seconds() >= 128);
    }
}
