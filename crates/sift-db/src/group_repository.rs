use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres, Transaction};
use uuid::Uuid;

use sift_core::error::AppError;
use sift_core::models::{CanonicalRecord, DuplicateGroup, GroupStatus};
use sift_core::traits::{GroupCreation, GroupMember, GroupStore};

use crate::database::db_error;
use crate::record_repository::RecordRow;

/// Duplicate groups and the membership columns on `canonical_records`.
///
/// Every mutation runs in one transaction holding the group row lock, so
/// concurrent joins to the same group see each other's members.
#[derive(Clone)]
pub struct GroupRepository {
    pool: Pool<Postgres>,
}

impl GroupRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_group(
        tx: &mut Transaction<'_, Postgres>,
        group_id: Uuid,
    ) -> Result<(), AppError> {
        let locked: Option<(Uuid,)> =
            sqlx::query_as(r#"SELECT id FROM duplicate_groups WHERE id = $1 FOR UPDATE"#)
                .bind(group_id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(db_error)?;

        locked
            .map(|_| ())
            .ok_or_else(|| AppError::NotFound(format!("duplicate group {group_id}")))
    }

    async fn attach(
        tx: &mut Transaction<'_, Postgres>,
        group_id: Uuid,
        member: GroupMember,
        is_primary: bool,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE canonical_records
            SET duplicate_group_id = $1,
                is_primary_in_group = $2,
                duplicate_confidence_score = $3,
                updated_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(group_id)
        .bind(is_primary)
        .bind(member.score)
        .bind(member.record_id)
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("record {}", member.record_id)));
        }
        Ok(())
    }

    /// Recompute `member_count` and `avg_confidence` from the members.
    async fn refresh(
        tx: &mut Transaction<'_, Postgres>,
        group_id: Uuid,
    ) -> Result<DuplicateGroup, AppError> {
        let row = sqlx::query_as::<_, GroupRow>(
            r#"
            UPDATE duplicate_groups g
            SET member_count = stats.member_count,
                avg_confidence = stats.avg_confidence,
                updated_at = NOW()
            FROM (
                SELECT COUNT(*)::INTEGER AS member_count,
                       COALESCE(AVG(duplicate_confidence_score), 0)::REAL AS avg_confidence
                FROM canonical_records
                WHERE duplicate_group_id = $1
            ) stats
            WHERE g.id = $1
            RETURNING g.*
            "#,
        )
        .bind(group_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_error)?;

        Ok(row.into())
    }
}

#[derive(sqlx::FromRow)]
struct GroupRow {
    id: Uuid,
    primary_record_id: Uuid,
    member_count: i32,
    avg_confidence: f32,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<GroupRow> for DuplicateGroup {
    fn from(row: GroupRow) -> Self {
        DuplicateGroup {
            id: row.id,
            primary_record_id: row.primary_record_id,
            member_count: row.member_count.max(0) as u32,
            avg_confidence: row.avg_confidence,
            status: row.status.parse().unwrap_or(GroupStatus::Active),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

impl GroupStore for GroupRepository {
    async fn create_group(
        &self,
        primary_record_id: Uuid,
        members: &[GroupMember],
    ) -> Result<GroupCreation, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error)?;

        let ids: Vec<Uuid> = members.iter().map(|m| m.record_id).collect();

        // Lock in id order so overlapping creations queue instead of deadlocking.
        let current: Vec<(Uuid, Option<Uuid>)> = sqlx::query_as(
            r#"
            SELECT id, duplicate_group_id
            FROM canonical_records
            WHERE id = ANY($1)
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error)?;

        let previous: Vec<Uuid> = current.iter().filter_map(|(_, g)| *g).collect();
        let active: Vec<(Uuid,)> = sqlx::query_as(
            r#"SELECT id FROM duplicate_groups WHERE id = ANY($1) AND status = 'active'"#,
        )
        .bind(&previous)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error)?;

        let existing = ids.iter().find_map(|id| {
            current
                .iter()
                .find(|(record_id, _)| record_id == id)
                .and_then(|(_, group_id)| *group_id)
                .filter(|group_id| active.iter().any(|(a,)| a == group_id))
        });
        if let Some(group_id) = existing {
            tx.rollback()
                .await
                .map_err(db_error)?;
            tracing::debug!(%group_id, "Group creation lost to an existing group");
            return Ok(GroupCreation::AlreadyGrouped(group_id));
        }

        let (group_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO duplicate_groups (primary_record_id, status)
            VALUES ($1, 'active')
            RETURNING id
            "#,
        )
        .bind(primary_record_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;

        for member in members {
            Self::attach(
                &mut tx,
                group_id,
                *member,
                member.record_id == primary_record_id,
            )
            .await?;
        }
        let group = Self::refresh(&mut tx, group_id).await?;

        // Members taken from resolved or invalid groups leave those counts stale.
        let mut released = previous;
        released.sort();
        released.dedup();
        for old in released {
            Self::refresh(&mut tx, old).await?;
        }

        tx.commit()
            .await
            .map_err(db_error)?;

        tracing::info!(
            group_id = %group.id,
            members = group.member_count,
            avg_confidence = group.avg_confidence,
            "Duplicate group created"
        );
        Ok(GroupCreation::Created(group))
    }

    async fn add_member(
        &self,
        group_id: Uuid,
        member: GroupMember,
    ) -> Result<DuplicateGroup, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error)?;

        Self::lock_group(&mut tx, group_id).await?;
        Self::attach(&mut tx, group_id, member, false).await?;
        let group = Self::refresh(&mut tx, group_id).await?;

        tx.commit()
            .await
            .map_err(db_error)?;

        Ok(group)
    }

    async fn set_primary(
        &self,
        group_id: Uuid,
        record_id: Uuid,
    ) -> Result<DuplicateGroup, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error)?;

        Self::lock_group(&mut tx, group_id).await?;

        sqlx::query(
            r#"
            UPDATE canonical_records
            SET is_primary_in_group = (id = $2), updated_at = NOW()
            WHERE duplicate_group_id = $1
            "#,
        )
        .bind(group_id)
        .bind(record_id)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        let row = sqlx::query_as::<_, GroupRow>(
            r#"
            UPDATE duplicate_groups
            SET primary_record_id = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(group_id)
        .bind(record_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit()
            .await
            .map_err(db_error)?;

        Ok(row.into())
    }

    async fn set_status(&self, group_id: Uuid, status: GroupStatus) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE duplicate_groups
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(group_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("duplicate group {group_id}")));
        }
        Ok(())
    }

    async fn get_group(&self, group_id: Uuid) -> Result<Option<DuplicateGroup>, AppError> {
        let row = sqlx::query_as::<_, GroupRow>(
            r#"SELECT * FROM duplicate_groups WHERE id = $1"#,
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(Into::into))
    }

    async fn list_members(&self, group_id: Uuid) -> Result<Vec<CanonicalRecord>, AppError> {
        let rows = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT * FROM canonical_records
            WHERE duplicate_group_id = $1
            ORDER BY first_observed ASC
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}
