use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Physical tracker unit. `owner_id` is NULL while the unit sits in stock.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "devices")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub phone_number: String,
    pub product_id: Uuid,
    pub owner_id: Option<String>,
    pub plan_id: Option<Uuid>,
    /// JSON array of invited user ids
    #[sea_orm(column_type = "Json")]
    pub invited_users: Json,
    pub nickname: Option<String>,
    #[sea_orm(unique)]
    pub invite_code: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub simulation_step: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    pub fn invited_user_ids(&self) -> Vec<String> {
        self.invited_users
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner_id.as_deref() == Some(user_id)
    }

    /// Owner or invited user
    pub fn is_accessible_by(&self, user_id: &str) -> bool {
        self.is_owned_by(user_id) || self.invited_user_ids().iter().any(|u| u == user_id)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::product::Entity",
        from = "Column::ProductId",
        to = "super::product::Column::Id"
    )]
    Product,
    #[sea_orm(
        belongs_to = "super::plan::Entity",
        from = "Column::PlanId",
        to = "super::plan::Column::Id"
    )]
    Plan,
}

impl Related<super::product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Product.def()
    }
}

impl Related<super::plan::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Plan.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
