use sift_core::AppError;
use sift_core::job::RetryConfig;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::DatabaseConfig;
use crate::group_repository::GroupRepository;
use crate::job_repository::ExtractionJobRepository;
use crate::raw_unit_repository::RawUnitRepository;
use crate::record_repository::RecordRepository;

/// Map a sqlx error onto the error taxonomy.
///
/// Data exceptions (SQLSTATE class 22) and integrity violations (class 23)
/// fail the same way on every retry, so they become
/// [`AppError::DataRejected`] rather than a store outage.
pub(crate) fn db_error(e: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(db) = &e
        && db
            .code()
            .is_some_and(|code| code.starts_with("22") || code.starts_with("23"))
    {
        return AppError::DataRejected(db.message().to_string());
    }
    AppError::StoreError(e.to_string())
}

/// Owns the connection pool, runs migrations and hands out repositories.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::StoreError(format!("Failed to connect: {e}")))?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::StoreError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    pub fn job_repo(&self, retry: RetryConfig) -> ExtractionJobRepository {
        ExtractionJobRepository::new(self.pool.clone()).with_retry_config(retry)
    }

    pub fn raw_unit_repo(&self) -> RawUnitRepository {
        RawUnitRepository::new(self.pool.clone())
    }

    pub fn record_repo(&self) -> RecordRepository {
        RecordRepository::new(self.pool.clone())
    }

    pub fn group_repo(&self) -> GroupRepository {
        GroupRepository::new(self.pool.clone())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
