use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(schema_name = "public", table_name = "project")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub project_id: Uuid,
    pub project_name: String,
    /// Final multi-file context map, JSON encoded.
    #[sea_orm(column_type = "Text", nullable)]
    pub multi_file_contexts: Option<String>,
    /// Tail of the change log at flush time, JSON encoded.
    #[sea_orm(column_type = "Text", nullable)]
    pub multi_file_context_changes: Option<String>,
    /// Highest change index reflected in the stored context; makes the
    /// flush idempotent per (project, index).
    pub context_last_index: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
