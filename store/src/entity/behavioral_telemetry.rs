use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(schema_name = "public", table_name = "behavioral_telemetry")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub behavioral_telemetry_id: Uuid,
    pub time_since_last_shown: Option<i64>,
    pub time_since_last_accepted: Option<i64>,
    pub typing_speed: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
