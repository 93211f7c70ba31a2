use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One model's output for one query. Composite identity keeps retried
/// persistence writes from duplicating rows.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(schema_name = "public", table_name = "had_generation")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub meta_query_id: Uuid,
    #[sea_orm(primary_key, auto_increment = false)]
    pub model_id: i64,
    #[sea_orm(column_type = "Text")]
    pub completion: String,
    pub generation_time: i64,
    pub shown_at: Json,
    pub was_accepted: bool,
    pub confidence: f64,
    pub logprobs: Json,
    #[sea_orm(column_type = "Text", nullable)]
    pub error: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
