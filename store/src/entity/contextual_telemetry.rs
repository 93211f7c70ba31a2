use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(schema_name = "public", table_name = "contextual_telemetry")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub contextual_telemetry_id: Uuid,
    pub version_id: i64,
    pub trigger_type_id: i64,
    pub language_id: i64,
    pub file_path: Option<String>,
    pub caret_line: Option<i32>,
    pub document_char_length: Option<i64>,
    pub relative_document_position: Option<f64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
