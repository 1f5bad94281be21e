use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use sift_core::error::AppError;
use sift_core::models::{NewRawUnit, RawUnit};
use sift_core::traits::RawUnitStore;

use crate::database::db_error;

/// Captured source units keyed by `(source_id, native_id)`.
#[derive(Clone)]
pub struct RawUnitRepository {
    pool: Pool<Postgres>,
}

impl RawUnitRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_native(
        &self,
        source_id: &str,
        native_id: &str,
    ) -> Result<Option<RawUnit>, AppError> {
        let row = sqlx::query_as::<_, RawUnitRow>(
            r#"SELECT * FROM raw_units WHERE source_id = $1 AND native_id = $2"#,
        )
        .bind(source_id)
        .bind(native_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(Into::into))
    }
}

#[derive(sqlx::FromRow)]
struct RawUnitRow {
    id: Uuid,
    source_id: String,
    native_id: String,
    text: String,
    captured_at: DateTime<Utc>,
    edited_at: Option<DateTime<Utc>>,
    deleted: bool,
    forwarded: bool,
    link: Option<String>,
    content_hash: String,
}

impl From<RawUnitRow> for RawUnit {
    fn from(row: RawUnitRow) -> Self {
        RawUnit {
            id: row.id,
            source_id: row.source_id,
            native_id: row.native_id,
            text: row.text,
            captured_at: row.captured_at,
            edited_at: row.edited_at,
            deleted: row.deleted,
            forwarded: row.forwarded,
            link: row.link,
            content_hash: row.content_hash,
        }
    }
}

impl RawUnitStore for RawUnitRepository {
    async fn upsert(&self, unit: &NewRawUnit) -> Result<(RawUnit, bool), AppError> {
        // The conflict branch only fires when something observable changed,
        // so an empty RETURNING means the stored row is current.
        let written = sqlx::query_as::<_, RawUnitRow>(
            r#"
            INSERT INTO raw_units
                (source_id, native_id, text, captured_at, edited_at, deleted, forwarded, link, content_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (source_id, native_id) DO UPDATE
            SET text = EXCLUDED.text,
                edited_at = EXCLUDED.edited_at,
                deleted = EXCLUDED.deleted,
                forwarded = EXCLUDED.forwarded,
                link = EXCLUDED.link,
                content_hash = EXCLUDED.content_hash,
                updated_at = NOW()
            WHERE raw_units.content_hash IS DISTINCT FROM EXCLUDED.content_hash
               OR raw_units.deleted IS DISTINCT FROM EXCLUDED.deleted
               OR raw_units.edited_at IS DISTINCT FROM EXCLUDED.edited_at
               OR raw_units.link IS DISTINCT FROM EXCLUDED.link
            RETURNING *
            "#,
        )
        .bind(&unit.source_id)
        .bind(&unit.native_id)
        .bind(&unit.text)
        .bind(unit.captured_at)
        .bind(unit.edited_at)
        .bind(unit.deleted)
        .bind(unit.forwarded)
        .bind(&unit.link)
        .bind(unit.content_hash())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        if let Some(row) = written {
            return Ok((row.into(), true));
        }

        let existing = self
            .find_by_native(&unit.source_id, &unit.native_id)
            .await?
            .ok_or_else(|| {
                AppError::StoreError(format!(
                    "raw unit {}:{} vanished during upsert",
                    unit.source_id, unit.native_id
                ))
            })?;
        Ok((existing, false))
    }

    async fn get(&self, id: Uuid) -> Result<Option<RawUnit>, AppError> {
        let row = sqlx::query_as::<_, RawUnitRow>(r#"SELECT * FROM raw_units WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(row.map(Into::into))
    }
}
