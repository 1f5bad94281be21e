use chrono::{DateTime, TimeDelta, Utc};
use sift_core::models::{NewRawUnit, RecordDraft, SignalBundle};
use sift_db::Database;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

/// Spins up a PostgreSQL container, applies the workspace migrations and
/// returns a connected pool.
///
/// Keep the `ContainerAsync` alive for the whole test; dropping it stops
/// the container.
pub async fn setup_test_db() -> (PgPool, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "sift_test")
        .start()
        .await
        .expect("Failed to start PostgreSQL container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");

    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/sift_test");

    // The server logs readiness once before its init restart
    const MAX_RETRIES: u32 = 30;
    let mut retries = 0;
    let pool = loop {
        match PgPoolOptions::new()
            .max_connections(10)
            .connect(&connection_string)
            .await
        {
            Ok(pool) => break pool,
            Err(e) => {
                retries += 1;
                if retries >= MAX_RETRIES {
                    panic!("Failed to connect to database after {MAX_RETRIES} retries: {e}");
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    };

    Database::from_pool(pool.clone())
        .migrate()
        .await
        .expect("Failed to run migrations");

    (pool, container)
}

pub fn new_unit(source: &str, native: &str, text: &str) -> NewRawUnit {
    NewRawUnit {
        source_id: source.to_string(),
        native_id: native.to_string(),
        text: text.to_string(),
        captured_at: Utc::now() - TimeDelta::minutes(5),
        edited_at: None,
        deleted: false,
        forwarded: false,
        link: Some(format!("https://t.me/{source}/{native}")),
    }
}

pub fn draft(source: &str, native: &str, code: &str, observed_at: DateTime<Utc>) -> RecordDraft {
    RecordDraft {
        record_key: format!("{source}:code:{code}"),
        source_id: source.to_string(),
        natural_key: Some(code.to_string()),
        native_id: native.to_string(),
        link: Some(format!("https://t.me/{source}/{native}")),
        observed_at,
        title: Some("Sec 3 Math tuition".to_string()),
        description: None,
        location_text: Some("Bedok".to_string()),
        rate_text: Some("$40-50/h".to_string()),
        schedule_text: None,
        signals: SignalBundle {
            subjects: ["Math".to_string()].into(),
            levels: ["Secondary".to_string()].into(),
            ..Default::default()
        },
        parse_quality: 0.6,
        status_signal: None,
    }
}

/// Insert a raw unit and return its id, for tests that only need a job target.
pub async fn seed_raw_unit(pool: &PgPool, native: &str) -> uuid::Uuid {
    use sift_core::traits::RawUnitStore;

    let (unit, _) = sift_db::RawUnitRepository::new(pool.clone())
        .upsert(&new_unit("tutors_sg", native, "D2388 Sec 3 Math @ Bedok"))
        .await
        .expect("Failed to seed raw unit");
    unit.id
}
