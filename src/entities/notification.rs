use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "notifications")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub user_id: String,
    pub device_id: Option<Uuid>,
    pub notification_type_id: String,
    #[sea_orm(column_type = "Text")]
    pub message: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::notification_type::Entity",
        from = "Column::NotificationTypeId",
        to = "super::notification_type::Column::Id"
    )]
    NotificationType,
}

impl Related<super::notification_type::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::NotificationType.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
