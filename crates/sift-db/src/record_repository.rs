use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres, Transaction};
use uuid::Uuid;

use sift_core::error::AppError;
use sift_core::merge::{merge_record, new_record};
use sift_core::models::{CanonicalRecord, RecordDraft, RecordStatus, SignalBundle};
use sift_core::traits::{RecordStore, UpsertOutcome};

use crate::database::db_error;

/// Canonical records with merge-upsert serialized per `record_key`.
#[derive(Clone)]
pub struct RecordRepository {
    pool: Pool<Postgres>,
}

impl RecordRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert(
        tx: &mut Transaction<'_, Postgres>,
        record: &CanonicalRecord,
    ) -> Result<CanonicalRecord, AppError> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            INSERT INTO canonical_records (
                id, record_key, source_id, natural_key, native_id, link, pointer_observed_at,
                title, description, location_text, rate_text, schedule_text, signals,
                parse_quality, status, first_observed, last_observed, bumped_at,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            RETURNING *
            "#,
        )
        .bind(record.id)
        .bind(&record.record_key)
        .bind(&record.source_id)
        .bind(&record.natural_key)
        .bind(&record.native_id)
        .bind(&record.link)
        .bind(record.pointer_observed_at)
        .bind(&record.title)
        .bind(&record.description)
        .bind(&record.location_text)
        .bind(&record.rate_text)
        .bind(&record.schedule_text)
        .bind(Json(&record.signals))
        .bind(record.parse_quality)
        .bind(record.status.as_str())
        .bind(record.first_observed)
        .bind(record.last_observed)
        .bind(record.bumped_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_error)?;

        Ok(row.into())
    }

    /// Group columns are owned by the group store and left untouched.
    async fn update(
        tx: &mut Transaction<'_, Postgres>,
        record: &CanonicalRecord,
    ) -> Result<CanonicalRecord, AppError> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            UPDATE canonical_records
            SET natural_key = $2,
                native_id = $3,
                link = $4,
                pointer_observed_at = $5,
                title = $6,
                description = $7,
                location_text = $8,
                rate_text = $9,
                schedule_text = $10,
                signals = $11,
                parse_quality = $12,
                status = $13,
                first_observed = $14,
                last_observed = $15,
                bumped_at = $16,
                updated_at = $17
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(record.id)
        .bind(&record.natural_key)
        .bind(&record.native_id)
        .bind(&record.link)
        .bind(record.pointer_observed_at)
        .bind(&record.title)
        .bind(&record.description)
        .bind(&record.location_text)
        .bind(&record.rate_text)
        .bind(&record.schedule_text)
        .bind(Json(&record.signals))
        .bind(record.parse_quality)
        .bind(record.status.as_str())
        .bind(record.first_observed)
        .bind(record.last_observed)
        .bind(record.bumped_at)
        .bind(record.updated_at)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_error)?;

        Ok(row.into())
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct RecordRow {
    id: Uuid,
    record_key: String,
    source_id: String,
    natural_key: Option<String>,
    native_id: Option<String>,
    link: Option<String>,
    pointer_observed_at: Option<DateTime<Utc>>,
    title: Option<String>,
    description: Option<String>,
    location_text: Option<String>,
    rate_text: Option<String>,
    schedule_text: Option<String>,
    signals: Json<SignalBundle>,
    parse_quality: f32,
    status: String,
    first_observed: DateTime<Utc>,
    last_observed: DateTime<Utc>,
    bumped_at: Option<DateTime<Utc>>,
    duplicate_group_id: Option<Uuid>,
    is_primary_in_group: bool,
    duplicate_confidence_score: Option<f32>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RecordRow> for CanonicalRecord {
    fn from(row: RecordRow) -> Self {
        CanonicalRecord {
            id: row.id,
            record_key: row.record_key,
            source_id: row.source_id,
            natural_key: row.natural_key,
            native_id: row.native_id,
            link: row.link,
            pointer_observed_at: row.pointer_observed_at,
            title: row.title,
            description: row.description,
            location_text: row.location_text,
            rate_text: row.rate_text,
            schedule_text: row.schedule_text,
            signals: row.signals.0,
            parse_quality: row.parse_quality,
            status: row.status.parse().unwrap_or(RecordStatus::Open),
            first_observed: row.first_observed,
            last_observed: row.last_observed,
            bumped_at: row.bumped_at,
            duplicate_group_id: row.duplicate_group_id,
            is_primary_in_group: row.is_primary_in_group,
            duplicate_confidence_score: row.duplicate_confidence_score,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

impl RecordStore for RecordRepository {
    async fn upsert(&self, draft: &RecordDraft) -> Result<UpsertOutcome, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error)?;

        // Serializes first inserts for the same key, which FOR UPDATE alone
        // cannot do when no row exists yet.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&draft.record_key)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        let existing = sqlx::query_as::<_, RecordRow>(
            r#"SELECT * FROM canonical_records WHERE record_key = $1 FOR UPDATE"#,
        )
        .bind(&draft.record_key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;

        let now = Utc::now();
        let outcome = match existing {
            Some(row) => {
                let current: CanonicalRecord = row.into();
                let merged = merge_record(&current, draft, now);
                UpsertOutcome {
                    record: Self::update(&mut tx, &merged).await?,
                    created: false,
                    previous_status: Some(current.status),
                }
            }
            None => UpsertOutcome {
                record: Self::insert(&mut tx, &new_record(draft, now)).await?,
                created: true,
                previous_status: None,
            },
        };

        tx.commit()
            .await
            .map_err(db_error)?;

        tracing::debug!(
            record_key = %outcome.record.record_key,
            created = outcome.created,
            status = %outcome.record.status,
            "Record upserted"
        );
        Ok(outcome)
    }

    async fn get(&self, id: Uuid) -> Result<Option<CanonicalRecord>, AppError> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"SELECT * FROM canonical_records WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(Into::into))
    }

    async fn find_by_key(&self, record_key: &str) -> Result<Option<CanonicalRecord>, AppError> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"SELECT * FROM canonical_records WHERE record_key = $1"#,
        )
        .bind(record_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(Into::into))
    }

    async fn find_by_pointer(
        &self,
        source_id: &str,
        native_id: &str,
    ) -> Result<Option<CanonicalRecord>, AppError> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT * FROM canonical_records
            WHERE source_id = $1 AND native_id = $2
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(source_id)
        .bind(native_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(Into::into))
    }

    async fn recent_candidates(
        &self,
        exclude_source: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, AppError> {
        let rows = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT * FROM canonical_records
            WHERE status = 'open'
              AND source_id <> $1
              AND last_observed >= $2
            ORDER BY last_observed DESC
            LIMIT $3
            "#,
        )
        .bind(exclude_source)
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<CanonicalRecord>, AppError> {
        let rows = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT * FROM canonical_records
            ORDER BY last_observed DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}
