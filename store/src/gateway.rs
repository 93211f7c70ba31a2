use crate::entity;
use async_trait::async_trait;
use chrono::Utc;
use common::interface::PersistenceGateway;
use common::model::frame::{BehavioralTelemetry, ContextualTelemetry};
use common::model::record::{
    ContextFlushRecord, GenerationRecord, GroundTruthRecord, MetaQueryRecord, QueryKind, UserRow,
};
use common::model::token::UserPreferences;
use errors::error::OrmError;
use errors::Result;
use log::warn;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter,
};
use uuid::Uuid;

fn db_err(e: DbErr) -> errors::Error {
    match &e {
        DbErr::Conn(_) | DbErr::ConnectionAcquire(_) => {
            OrmError::ConnectionError(Box::new(e)).into()
        }
        _ => OrmError::QueryExecutionError(Box::new(e)).into(),
    }
}

/// Deterministic child-row ids derived from the request id, so a redelivered
/// persist task recreates the same rows instead of new ones.
fn derived_id(request_id: &Uuid, label: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{label}:{request_id}").as_bytes())
}

/// Postgres implementation of the persistence gateway over sea-orm. Every
/// write is idempotent on its identity key; redelivery is expected.
pub struct SeaOrmGateway {
    db: DatabaseConnection,
}

impl SeaOrmGateway {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PersistenceGateway for SeaOrmGateway {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<UserRow>> {
        let row = entity::user::Entity::find_by_id(user_id)
            .one(&self.db)
            .await
            .map_err(db_err)?;

        Ok(row.map(|user| {
            let preferences: UserPreferences = serde_json::from_str(&user.preference)
                .unwrap_or_else(|e| {
                    warn!("Unparseable preference blob for {}: {}", user.user_id, e);
                    UserPreferences::default()
                });
            UserRow {
                user_id: user.user_id,
                email: user.email,
                name: user.name,
                verified: user.verified,
                preferences,
                config_id: user.config_id,
            }
        }))
    }

    async fn load_config(&self, config_id: i64) -> Result<Option<String>> {
        let row = entity::config::Entity::find_by_id(config_id)
            .one(&self.db)
            .await
            .map_err(db_err)?;
        Ok(row.map(|c| c.config_data))
    }

    async fn upsert_user(&self, user: &UserRow) -> Result<()> {
        let preference =
            serde_json::to_string(&user.preferences).unwrap_or_else(|_| "{}".to_string());
        let model = entity::user::ActiveModel {
            user_id: Set(user.user_id),
            email: Set(user.email.clone()),
            name: Set(user.name.clone()),
            verified: Set(user.verified),
            preference: Set(preference),
            config_id: Set(user.config_id),
            joined_at: Set(Utc::now()),
        };

        entity::user::Entity::insert(model)
            .on_conflict(
                OnConflict::column(entity::user::Column::UserId)
                    .update_columns([
                        entity::user::Column::Email,
                        entity::user::Column::Name,
                        entity::user::Column::Verified,
                        entity::user::Column::Preference,
                        entity::user::Column::ConfigId,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn create_meta_query(&self, record: &MetaQueryRecord) -> Result<()> {
        // Child rows first so the parent's references resolve; all idempotent
        // via derived ids and do-nothing conflicts.
        let context_id = match &record.context {
            Some(context) => {
                let id = derived_id(&record.request_id, "context");
                let model = entity::context::ActiveModel {
                    context_id: Set(id),
                    prefix: Set(context.prefix.clone()),
                    suffix: Set(context.suffix.clone()),
                    file_name: Set(context.file_name.clone()),
                    selected_text: Set(context.selected_text.clone()),
                };
                entity::context::Entity::insert(model)
                    .on_conflict(
                        OnConflict::column(entity::context::Column::ContextId)
                            .do_nothing()
                            .to_owned(),
                    )
                    .exec_without_returning(&self.db)
                    .await
                    .map_err(db_err)?;
                Some(id)
            }
            None => None,
        };

        let contextual_telemetry_id = match &record.contextual_telemetry {
            Some(telemetry) => {
                let id = derived_id(&record.request_id, "contextual");
                let model = entity::contextual_telemetry::ActiveModel {
                    contextual_telemetry_id: Set(id),
                    version_id: Set(telemetry.version_id),
                    trigger_type_id: Set(telemetry.trigger_type_id),
                    language_id: Set(telemetry.language_id),
                    file_path: Set(telemetry.file_path.clone()),
                    caret_line: Set(telemetry.caret_line.map(|l| l as i32)),
                    document_char_length: Set(telemetry.document_char_length.map(|l| l as i64)),
                    relative_document_position: Set(telemetry.relative_document_position),
                };
                entity::contextual_telemetry::Entity::insert(model)
                    .on_conflict(
                        OnConflict::column(
                            entity::contextual_telemetry::Column::ContextualTelemetryId,
                        )
                        .do_nothing()
                        .to_owned(),
                    )
                    .exec_without_returning(&self.db)
                    .await
                    .map_err(db_err)?;
                Some(id)
            }
            None => None,
        };

        let behavioral_telemetry_id = match &record.behavioral_telemetry {
            Some(telemetry) => {
                let id = derived_id(&record.request_id, "behavioral");
                let model = entity::behavioral_telemetry::ActiveModel {
                    behavioral_telemetry_id: Set(id),
                    time_since_last_shown: Set(telemetry.time_since_last_shown.map(|v| v as i64)),
                    time_since_last_accepted: Set(telemetry
                        .time_since_last_accepted
                        .map(|v| v as i64)),
                    typing_speed: Set(telemetry.typing_speed.map(|v| v as i64)),
                };
                entity::behavioral_telemetry::Entity::insert(model)
                    .on_conflict(
                        OnConflict::column(
                            entity::behavioral_telemetry::Column::BehavioralTelemetryId,
                        )
                        .do_nothing()
                        .to_owned(),
                    )
                    .exec_without_returning(&self.db)
                    .await
                    .map_err(db_err)?;
                Some(id)
            }
            None => None,
        };

        let query_type = match record.kind {
            QueryKind::Completion => "completion",
            QueryKind::Chat => "chat",
        };

        let meta = entity::meta_query::ActiveModel {
            meta_query_id: Set(record.request_id),
            query_type: Set(query_type.to_string()),
            user_id: Set(Some(record.user_id)),
            session_id: Set(record.session_id),
            project_id: Set(record.project_id),
            context_id: Set(context_id),
            contextual_telemetry_id: Set(contextual_telemetry_id),
            behavioral_telemetry_id: Set(behavioral_telemetry_id),
            context_change_index: Set(record.context_change_index.map(|i| i as i64)),
            total_serving_time: Set(record.total_serving_time_ms as i64),
            server_version_id: Set(record.server_version_id),
            deadline_fired: Set(record.deadline_fired),
            orphaned: Set(record.orphaned),
            timestamp: Set(Utc::now()),
        };
        entity::meta_query::Entity::insert(meta)
            .on_conflict(
                OnConflict::column(entity::meta_query::Column::MetaQueryId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
            .map_err(db_err)?;

        match record.kind {
            QueryKind::Completion => {
                let child = entity::completion_query::ActiveModel {
                    meta_query_id: Set(record.request_id),
                };
                entity::completion_query::Entity::insert(child)
                    .on_conflict(
                        OnConflict::column(entity::completion_query::Column::MetaQueryId)
                            .do_nothing()
                            .to_owned(),
                    )
                    .exec_without_returning(&self.db)
                    .await
                    .map_err(db_err)?;
            }
            QueryKind::Chat => {
                let child = entity::chat_query::ActiveModel {
                    meta_query_id: Set(record.request_id),
                    chat_id: Set(record.chat_id.unwrap_or_else(Uuid::nil)),
                };
                entity::chat_query::Entity::insert(child)
                    .on_conflict(
                        OnConflict::column(entity::chat_query::Column::MetaQueryId)
                            .do_nothing()
                            .to_owned(),
                    )
                    .exec_without_returning(&self.db)
                    .await
                    .map_err(db_err)?;
            }
        }

        Ok(())
    }

    async fn create_generation(&self, row: &GenerationRecord) -> Result<bool> {
        let model = entity::generation::ActiveModel {
            meta_query_id: Set(row.request_id),
            model_id: Set(row.model_id),
            completion: Set(row.completion.clone()),
            generation_time: Set(row.generation_time_ms as i64),
            shown_at: Set(serde_json::json!(row.shown_at)),
            was_accepted: Set(row.was_accepted),
            confidence: Set(row.confidence),
            logprobs: Set(serde_json::json!(row.logprobs)),
            error: Set(row.error.clone()),
        };

        let inserted = entity::generation::Entity::insert(model)
            .on_conflict(
                OnConflict::columns([
                    entity::generation::Column::MetaQueryId,
                    entity::generation::Column::ModelId,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
            .map_err(db_err)?;

        Ok(inserted > 0)
    }

    async fn update_generation_acceptance(
        &self,
        request_id: Uuid,
        model_id: i64,
        was_accepted: bool,
        shown_at: &[String],
    ) -> Result<bool> {
        let existing = entity::generation::Entity::find_by_id((request_id, model_id))
            .one(&self.db)
            .await
            .map_err(db_err)?;

        let Some(row) = existing else {
            return Ok(false);
        };

        // Feedback replays carry identical payloads; skip the write when
        // nothing would change.
        let mut shown: Vec<String> =
            serde_json::from_value(row.shown_at.clone()).unwrap_or_default();
        let mut changed = row.was_accepted != was_accepted;
        for stamp in shown_at {
            if !shown.contains(stamp) {
                shown.push(stamp.clone());
                changed = true;
            }
        }
        if !changed {
            return Ok(true);
        }

        let mut model: entity::generation::ActiveModel = row.into();
        model.was_accepted = Set(was_accepted);
        model.shown_at = Set(serde_json::json!(shown));
        model.update(&self.db).await.map_err(db_err)?;
        Ok(true)
    }

    async fn append_ground_truth(&self, row: &GroundTruthRecord) -> Result<bool> {
        let model = entity::ground_truth::ActiveModel {
            completion_query_id: Set(row.request_id),
            truth_timestamp: Set(row.truth_timestamp.clone()),
            ground_truth: Set(row.ground_truth.clone()),
        };

        let inserted = entity::ground_truth::Entity::insert(model)
            .on_conflict(
                OnConflict::columns([
                    entity::ground_truth::Column::CompletionQueryId,
                    entity::ground_truth::Column::TruthTimestamp,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
            .map_err(db_err)?;

        Ok(inserted > 0)
    }

    async fn upsert_telemetry(
        &self,
        request_id: Uuid,
        contextual: Option<&ContextualTelemetry>,
        behavioral: Option<&BehavioralTelemetry>,
    ) -> Result<()> {
        if let Some(telemetry) = contextual {
            let model = entity::contextual_telemetry::ActiveModel {
                contextual_telemetry_id: Set(derived_id(&request_id, "contextual")),
                version_id: Set(telemetry.version_id),
                trigger_type_id: Set(telemetry.trigger_type_id),
                language_id: Set(telemetry.language_id),
                file_path: Set(telemetry.file_path.clone()),
                caret_line: Set(telemetry.caret_line.map(|l| l as i32)),
                document_char_length: Set(telemetry.document_char_length.map(|l| l as i64)),
                relative_document_position: Set(telemetry.relative_document_position),
            };
            entity::contextual_telemetry::Entity::insert(model)
                .on_conflict(
                    OnConflict::column(
                        entity::contextual_telemetry::Column::ContextualTelemetryId,
                    )
                    .do_nothing()
                    .to_owned(),
                )
                .exec_without_returning(&self.db)
                .await
                .map_err(db_err)?;
        }

        if let Some(telemetry) = behavioral {
            let model = entity::behavioral_telemetry::ActiveModel {
                behavioral_telemetry_id: Set(derived_id(&request_id, "behavioral")),
                time_since_last_shown: Set(telemetry.time_since_last_shown.map(|v| v as i64)),
                time_since_last_accepted: Set(telemetry
                    .time_since_last_accepted
                    .map(|v| v as i64)),
                typing_speed: Set(telemetry.typing_speed.map(|v| v as i64)),
            };
            entity::behavioral_telemetry::Entity::insert(model)
                .on_conflict(
                    OnConflict::column(
                        entity::behavioral_telemetry::Column::BehavioralTelemetryId,
                    )
                    .do_nothing()
                    .to_owned(),
                )
                .exec_without_returning(&self.db)
                .await
                .map_err(db_err)?;
        }

        Ok(())
    }

    async fn flush_project_context(&self, record: &ContextFlushRecord) -> Result<bool> {
        let last_index = record.last_index.map(|i| i as i64);
        let existing = entity::project::Entity::find_by_id(record.project_id)
            .one(&self.db)
            .await
            .map_err(db_err)?;

        let contexts = serde_json::to_string(&record.context).map_err(errors::Error::from)?;
        let changes = serde_json::to_string(&record.changes).map_err(errors::Error::from)?;

        match existing {
            Some(row) => {
                // Idempotency per (project, index): an equal-or-newer flush
                // already landed.
                if row.context_last_index.is_some() && row.context_last_index >= last_index {
                    return Ok(false);
                }
                let mut model: entity::project::ActiveModel = row.into();
                model.multi_file_contexts = Set(Some(contexts));
                model.multi_file_context_changes = Set(Some(changes));
                model.context_last_index = Set(last_index);
                model.update(&self.db).await.map_err(db_err)?;
            }
            None => {
                let model = entity::project::ActiveModel {
                    project_id: Set(record.project_id),
                    project_name: Set(String::new()),
                    multi_file_contexts: Set(Some(contexts)),
                    multi_file_context_changes: Set(Some(changes)),
                    context_last_index: Set(last_index),
                };
                entity::project::Entity::insert(model)
                    .on_conflict(
                        OnConflict::column(entity::project::Column::ProjectId)
                            .do_nothing()
                            .to_owned(),
                    )
                    .exec_without_returning(&self.db)
                    .await
                    .map_err(db_err)?;
            }
        }
        Ok(true)
    }

    async fn close_session(&self, session_id: Uuid, end_time: &str) -> Result<()> {
        let parsed = chrono::DateTime::parse_from_rfc3339(end_time)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        let existing = entity::session::Entity::find_by_id(session_id)
            .one(&self.db)
            .await
            .map_err(db_err)?;

        match existing {
            Some(row) => {
                if row.end_time.is_some() {
                    return Ok(());
                }
                let mut model: entity::session::ActiveModel = row.into();
                model.end_time = Set(Some(parsed));
                model.update(&self.db).await.map_err(db_err)?;
            }
            None => {
                let model = entity::session::ActiveModel {
                    session_id: Set(session_id),
                    user_id: Set(None),
                    start_time: Set(parsed),
                    end_time: Set(Some(parsed)),
                };
                entity::session::Entity::insert(model)
                    .on_conflict(
                        OnConflict::column(entity::session::Column::SessionId)
                            .do_nothing()
                            .to_owned(),
                    )
                    .exec_without_returning(&self.db)
                    .await
                    .map_err(db_err)?;
            }
        }
        Ok(())
    }

    async fn query_owner(&self, request_id: Uuid) -> Result<Option<Uuid>> {
        let row = entity::meta_query::Entity::find()
            .filter(entity::meta_query::Column::MetaQueryId.eq(request_id))
            .one(&self.db)
            .await
            .map_err(db_err)?;
        Ok(row.and_then(|r| r.user_id))
    }
}
