use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Parent row of the polymorphic query model; `completion_query` and
/// `chat_query` extend it one-to-one.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(schema_name = "public", table_name = "meta_query")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub meta_query_id: Uuid,
    pub query_type: String,
    pub user_id: Option<Uuid>,
    pub session_id: Uuid,
    pub project_id: Uuid,
    pub context_id: Option<Uuid>,
    pub contextual_telemetry_id: Option<Uuid>,
    pub behavioral_telemetry_id: Option<Uuid>,
    pub context_change_index: Option<i64>,
    pub total_serving_time: i64,
    pub server_version_id: Option<i64>,
    pub deadline_fired: bool,
    /// The originating connection was already gone when the request closed.
    pub orphaned: bool,
    pub timestamp: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
