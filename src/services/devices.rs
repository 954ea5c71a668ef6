use crate::{
    db::DbPool,
    entities::device,
    errors::ServiceError,
    events::{Event, EventSender},
    services::{catalog::find_product, non_blank, plans::find_plan, require_any_field},
};
use chrono::Utc;
use rand::{distributions::Alphanumeric, Rng};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

pub const INVITE_CODE_LEN: usize = 8;
const INVITE_CODE_ATTEMPTS: usize = 3;

/// Demo route through Puerto Madero walked by the location simulator.
pub const SIMULATION_ROUTE: [(f64, f64); 8] = [
    (-34.6081, -58.3681),
    (-34.6076, -58.3674),
    (-34.6071, -58.3667),
    (-34.6066, -58.3658),
    (-34.6061, -58.3651),
    (-34.6056, -58.3644),
    (-34.6050, -58.3637),
    (-34.6045, -58.3630),
];

/// Position for `step` and the step that follows it.
pub fn simulation_point(step: i32) -> ((f64, f64), i32) {
    let len = SIMULATION_ROUTE.len() as i32;
    let idx = step.rem_euclid(len);
    (SIMULATION_ROUTE[idx as usize], (idx + 1) % len)
}

pub fn generate_invite_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(INVITE_CODE_LEN)
        .map(char::from)
        .collect()
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateDeviceRequest {
    #[validate(length(min = 6, max = 32, message = "Invalid phone number"))]
    pub phone_number: String,
    pub product_id: Uuid,
    #[validate(length(max = 80))]
    pub nickname: Option<String>,
}

/// Admin update. Only the fields present are written.
#[derive(Debug, Default, Serialize, Deserialize, Validate)]
pub struct UpdateDeviceRequest {
    pub owner_id: Option<String>,
    pub plan_id: Option<Uuid>,
    pub invited_users: Option<Vec<String>>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[validate(length(max = 80))]
    pub nickname: Option<String>,
}

impl UpdateDeviceRequest {
    fn has_any_field(&self) -> bool {
        self.owner_id.is_some()
            || self.plan_id.is_some()
            || self.invited_users.is_some()
            || self.latitude.is_some()
            || self.longitude.is_some()
            || self.nickname.is_some()
    }
}

/// Candidates fetched per reservation round
const RESERVE_BATCH: u64 = 5;
const RESERVE_ROUNDS: usize = 3;

/// Reserves the oldest unowned device of `product_id` for `user_id`.
///
/// Must run inside the caller's transaction. Each claim is a compare-and-set on
/// `owner_id IS NULL`; a device taken by a concurrent order is skipped in favor
/// of the next-oldest one. `OutOfStock` only when no unowned device remains.
#[instrument(skip(txn))]
pub async fn reserve_device<C: ConnectionTrait>(
    txn: &C,
    product_id: Uuid,
    plan_id: Uuid,
    user_id: &str,
) -> Result<device::Model, ServiceError> {
    for round in 1..=RESERVE_ROUNDS {
        let candidates = unowned_devices(txn, product_id, RESERVE_BATCH).await?;
        if candidates.is_empty() {
            warn!(%product_id, "No unowned device available");
            return Err(ServiceError::OutOfStock(format!(
                "No device in stock for product {}",
                product_id
            )));
        }
        if let Some(device) = claim_first(txn, candidates, plan_id, user_id).await? {
            return Ok(device);
        }
        debug!(%product_id, round, "Every candidate was claimed concurrently");
    }

    Err(ServiceError::Conflict(format!(
        "Could not reserve a device for product {} under contention",
        product_id
    )))
}

/// Oldest first, then by id.
async fn unowned_devices<C: ConnectionTrait>(
    db: &C,
    product_id: Uuid,
    limit: u64,
) -> Result<Vec<device::Model>, ServiceError> {
    device::Entity::find()
        .filter(device::Column::ProductId.eq(product_id))
        .filter(device::Column::OwnerId.is_null())
        .order_by_asc(device::Column::CreatedAt)
        .order_by_asc(device::Column::Id)
        .limit(limit)
        .all(db)
        .await
        .map_err(ServiceError::db_error)
}

/// Claims the first of `candidates` still unowned, in order. `None` when every
/// one of them was taken since it was read.
async fn claim_first<C: ConnectionTrait>(
    db: &C,
    candidates: Vec<device::Model>,
    plan_id: Uuid,
    user_id: &str,
) -> Result<Option<device::Model>, ServiceError> {
    for candidate in candidates {
        let now = Utc::now();
        let claimed = device::Entity::update_many()
            .col_expr(device::Column::OwnerId, Expr::value(user_id.to_string()))
            .col_expr(device::Column::PlanId, Expr::value(plan_id))
            .col_expr(device::Column::UpdatedAt, Expr::value(now))
            .filter(device::Column::Id.eq(candidate.id))
            .filter(device::Column::OwnerId.is_null())
            .exec(db)
            .await
            .map_err(ServiceError::db_error)?;

        if claimed.rows_affected == 1 {
            debug!(device_id = %candidate.id, "Device reserved");
            return Ok(Some(device::Model {
                owner_id: Some(user_id.to_string()),
                plan_id: Some(plan_id),
                updated_at: now,
                ..candidate
            }));
        }
        debug!(device_id = %candidate.id, "Device taken by a concurrent order");
    }
    Ok(None)
}

#[derive(Clone)]
pub struct DeviceService {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
}

impl DeviceService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: EventSender) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    pub async fn list_devices(&self) -> Result<Vec<device::Model>, ServiceError> {
        device::Entity::find()
            .order_by_asc(device::Column::CreatedAt)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn get_device(&self, id: Uuid) -> Result<device::Model, ServiceError> {
        device::Entity::find_by_id(id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Device {} not found", id)))
    }

    /// Devices owned by or shared with `user_id`; empty is reported as not found.
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<device::Model>, ServiceError> {
        let devices: Vec<device::Model> = device::Entity::find()
            .filter(device::Column::OwnerId.is_not_null())
            .order_by_asc(device::Column::CreatedAt)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .into_iter()
            .filter(|d| d.is_accessible_by(user_id))
            .collect();

        if devices.is_empty() {
            return Err(ServiceError::NotFound("No devices for this user".to_string()));
        }
        Ok(devices)
    }

    #[instrument(skip(self, request), fields(product_id = %request.product_id))]
    pub async fn create_device(
        &self,
        request: CreateDeviceRequest,
    ) -> Result<device::Model, ServiceError> {
        request.validate()?;
        find_product(&*self.db_pool, request.product_id).await?;

        let nickname = non_blank(request.nickname);
        let mut last_err = None;
        for _ in 0..INVITE_CODE_ATTEMPTS {
            let now = Utc::now();
            let model = device::ActiveModel {
                id: Set(Uuid::new_v4()),
                phone_number: Set(request.phone_number.trim().to_string()),
                product_id: Set(request.product_id),
                owner_id: Set(None),
                plan_id: Set(None),
                invited_users: Set(json!([])),
                nickname: Set(nickname.clone()),
                invite_code: Set(generate_invite_code()),
                latitude: Set(None),
                longitude: Set(None),
                simulation_step: Set(0),
                created_at: Set(now),
                updated_at: Set(now),
            };
            match model.insert(&*self.db_pool).await {
                Ok(created) => {
                    info!(device_id = %created.id, "Device created");
                    return Ok(created);
                }
                Err(e) if crate::errors::is_unique_violation(&e) => {
                    warn!("Invite code collision, regenerating");
                    last_err = Some(e);
                }
                Err(e) => return Err(ServiceError::db_error(e)),
            }
        }
        Err(last_err
            .map(ServiceError::db_error)
            .unwrap_or_else(|| ServiceError::InternalError("Invite code generation failed".into())))
    }

    #[instrument(skip(self, request))]
    pub async fn update_device(
        &self,
        id: Uuid,
        request: UpdateDeviceRequest,
    ) -> Result<device::Model, ServiceError> {
        require_any_field(request.has_any_field())?;
        request.validate()?;
        if let Some(plan_id) = request.plan_id {
            find_plan(&*self.db_pool, plan_id).await?;
        }

        let existing = self.get_device(id).await?;
        let mut active: device::ActiveModel = existing.into();
        if let Some(owner_id) = request.owner_id {
            active.owner_id = Set(non_blank(Some(owner_id)));
        }
        if let Some(plan_id) = request.plan_id {
            active.plan_id = Set(Some(plan_id));
        }
        if let Some(invited) = request.invited_users {
            active.invited_users = Set(json!(invited));
        }
        if let Some(lat) = request.latitude {
            active.latitude = Set(Some(lat));
        }
        if let Some(lon) = request.longitude {
            active.longitude = Set(Some(lon));
        }
        if let Some(nickname) = request.nickname {
            active.nickname = Set(non_blank(Some(nickname)));
        }
        active.updated_at = Set(Utc::now());

        active
            .update(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    #[instrument(skip(self))]
    pub async fn delete_device(&self, id: Uuid) -> Result<(), ServiceError> {
        let result = device::Entity::delete_by_id(id)
            .exec(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!("Device {} not found", id)));
        }
        info!(device_id = %id, "Device deleted");
        Ok(())
    }

    async fn owned_device(&self, id: Uuid, user_id: &str) -> Result<device::Model, ServiceError> {
        let device = self.get_device(id).await?;
        if !device.is_owned_by(user_id) {
            return Err(ServiceError::Forbidden(
                "Only the device owner can do this".to_string(),
            ));
        }
        Ok(device)
    }

    /// Owner gives the device up: owner, plan and invitations are cleared.
    #[instrument(skip(self))]
    pub async fn unsubscribe(&self, id: Uuid, user_id: &str) -> Result<device::Model, ServiceError> {
        let device = self.owned_device(id, user_id).await?;
        let mut active: device::ActiveModel = device.into();
        active.owner_id = Set(None);
        active.plan_id = Set(None);
        active.invited_users = Set(json!([]));
        active.updated_at = Set(Utc::now());
        let released = active
            .update(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;

        if let Err(e) = self.event_sender.send(Event::DeviceReleased(id)).await {
            warn!(error = %e, "Failed to publish DeviceReleased");
        }
        Ok(released)
    }

    #[instrument(skip(self))]
    pub async fn rename(
        &self,
        id: Uuid,
        user_id: &str,
        nickname: String,
    ) -> Result<device::Model, ServiceError> {
        let nickname = non_blank(Some(nickname))
            .ok_or_else(|| ServiceError::ValidationError("Nickname is required".to_string()))?;
        if nickname.chars().count() > 80 {
            return Err(ServiceError::ValidationError("Nickname is too long".to_string()));
        }
        let device = self.owned_device(id, user_id).await?;
        let mut active: device::ActiveModel = device.into();
        active.nickname = Set(Some(nickname));
        active.updated_at = Set(Utc::now());
        active
            .update(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Adds `user_id` to the invited users of the device holding `invite_code`,
    /// bounded by the plan's shared-user quota.
    #[instrument(skip(self, invite_code))]
    pub async fn join(&self, user_id: &str, invite_code: &str) -> Result<device::Model, ServiceError> {
        let device = device::Entity::find()
            .filter(device::Column::InviteCode.eq(invite_code.trim()))
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound("Invite code not found".to_string()))?;

        if device.is_accessible_by(user_id) {
            return Ok(device);
        }
        let plan_id = match (&device.owner_id, device.plan_id) {
            (Some(_), Some(plan_id)) => plan_id,
            _ => {
                return Err(ServiceError::Conflict(
                    "Device has no active subscription".to_string(),
                ))
            }
        };
        let plan = find_plan(&*self.db_pool, plan_id).await?;

        let mut invited = device.invited_user_ids();
        if invited.len() >= plan.shared_user_quota.max(0) as usize {
            return Err(ServiceError::Conflict(format!(
                "Plan {} allows {} shared user(s)",
                plan.name, plan.shared_user_quota
            )));
        }
        invited.push(user_id.to_string());

        let mut active: device::ActiveModel = device.into();
        active.invited_users = Set(json!(invited));
        active.updated_at = Set(Utc::now());
        let updated = active
            .update(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        info!(device_id = %updated.id, "User joined device");
        Ok(updated)
    }

    /// Moves the device one step along the demo route and stores the position.
    #[instrument(skip(self))]
    pub async fn simulate_step(
        &self,
        id: Uuid,
        user_id: &str,
        is_admin: bool,
    ) -> Result<device::Model, ServiceError> {
        let device = self.get_device(id).await?;
        if !is_admin && !device.is_accessible_by(user_id) {
            return Err(ServiceError::Forbidden("No access to this device".to_string()));
        }

        let ((lat, lon), next) = simulation_point(device.simulation_step);
        let mut active: device::ActiveModel = device.into();
        active.latitude = Set(Some(lat));
        active.longitude = Set(Some(lon));
        active.simulation_step = Set(next);
        active.updated_at = Set(Utc::now());
        let updated = active
            .update(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        debug!(device_id = %id, lat, lon, "Simulated location stored");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, (-34.6081, -58.3681), 1)]
    #[case(3, (-34.6066, -58.3658), 4)]
    #[case(7, (-34.6045, -58.3630), 0)]
    #[case(9, (-34.6076, -58.3674), 2)]
    fn simulation_walks_route_and_wraps(
        #[case] step: i32,
        #[case] point: (f64, f64),
        #[case] next: i32,
    ) {
        assert_eq!(simulation_point(step), (point, next));
    }

    #[test]
    fn invite_codes_are_alphanumeric() {
        let code = generate_invite_code();
        assert_eq!(code.len(), INVITE_CODE_LEN);
        assert!(code.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn empty_admin_update_is_detected() {
        assert!(!UpdateDeviceRequest::default().has_any_field());
    }

    async fn memory_db() -> DbPool {
        let pool = crate::db::establish_connection_with_config(&crate::db::DbConfig {
            url: "sqlite::memory:".into(),
            max_connections: 1,
            ..Default::default()
        })
        .await
        .expect("connect");
        crate::db::run_migrations(&pool).await.expect("migrations");
        pool
    }

    async fn stock_device(db: &DbPool, product_id: Uuid, minutes_ago: i64) -> device::Model {
        let created_at = Utc::now() - chrono::Duration::minutes(minutes_ago);
        device::ActiveModel {
            id: Set(Uuid::new_v4()),
            phone_number: Set("1155550000".to_string()),
            product_id: Set(product_id),
            owner_id: Set(None),
            plan_id: Set(None),
            invited_users: Set(json!([])),
            nickname: Set(None),
            invite_code: Set(generate_invite_code()),
            latitude: Set(None),
            longitude: Set(None),
            simulation_step: Set(0),
            created_at: Set(created_at),
            updated_at: Set(created_at),
        }
        .insert(db)
        .await
        .expect("insert device")
    }

    async fn owner_of(db: &DbPool, id: Uuid) -> Option<String> {
        device::Entity::find_by_id(id)
            .one(db)
            .await
            .expect("query device")
            .expect("device exists")
            .owner_id
    }

    #[tokio::test]
    async fn reserves_oldest_unowned_device() {
        let db = memory_db().await;
        let product_id = Uuid::new_v4();
        let newer = stock_device(&db, product_id, 5).await;
        let oldest = stock_device(&db, product_id, 30).await;
        stock_device(&db, Uuid::new_v4(), 60).await;

        let reserved = reserve_device(&db, product_id, Uuid::new_v4(), "buyer")
            .await
            .unwrap();
        assert_eq!(reserved.id, oldest.id);
        assert_eq!(owner_of(&db, oldest.id).await.as_deref(), Some("buyer"));
        assert_eq!(owner_of(&db, newer.id).await, None);
    }

    #[tokio::test]
    async fn device_taken_after_read_falls_through_to_next_oldest() {
        let db = memory_db().await;
        let product_id = Uuid::new_v4();
        let plan_id = Uuid::new_v4();
        let oldest = stock_device(&db, product_id, 30).await;
        let next = stock_device(&db, product_id, 10).await;

        let snapshot = unowned_devices(&db, product_id, RESERVE_BATCH).await.unwrap();
        assert_eq!(snapshot.len(), 2);

        // A concurrent order claims the oldest device after our read.
        let rival = claim_first(&db, vec![snapshot[0].clone()], plan_id, "rival")
            .await
            .unwrap();
        assert_eq!(rival.map(|d| d.id), Some(oldest.id));

        let ours = claim_first(&db, snapshot, plan_id, "buyer")
            .await
            .unwrap()
            .expect("next-oldest device is claimed");
        assert_eq!(ours.id, next.id);
        assert_eq!(ours.owner_id.as_deref(), Some("buyer"));
        assert_eq!(owner_of(&db, oldest.id).await.as_deref(), Some("rival"));
    }

    #[tokio::test]
    async fn fully_claimed_snapshot_yields_none_and_reservation_reports_out_of_stock() {
        let db = memory_db().await;
        let product_id = Uuid::new_v4();
        let plan_id = Uuid::new_v4();
        let only = stock_device(&db, product_id, 30).await;

        let snapshot = unowned_devices(&db, product_id, RESERVE_BATCH).await.unwrap();
        reserve_device(&db, product_id, plan_id, "rival").await.unwrap();

        let lost = claim_first(&db, snapshot, plan_id, "buyer").await.unwrap();
        assert!(lost.is_none());
        assert_eq!(owner_of(&db, only.id).await.as_deref(), Some("rival"));

        let err = reserve_device(&db, product_id, plan_id, "buyer")
            .await
            .unwrap_err();
        assert_matches::assert_matches!(err, ServiceError::OutOfStock(_));
    }
}
