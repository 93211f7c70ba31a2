use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Append-only record of what the user actually typed after a completion.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(schema_name = "public", table_name = "ground_truth")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub completion_query_id: Uuid,
    #[sea_orm(primary_key, auto_increment = false)]
    pub truth_timestamp: String,
    #[sea_orm(column_type = "Text")]
    pub ground_truth: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
