pub mod config;
pub mod database;
pub mod group_repository;
pub mod job_repository;
pub mod raw_unit_repository;
pub mod record_repository;

pub use config::DatabaseConfig;
pub use database::Database;
pub use group_repository::GroupRepository;
pub use job_repository::ExtractionJobRepository;
pub use raw_unit_repository::RawUnitRepository;
pub use record_repository::RecordRepository;

