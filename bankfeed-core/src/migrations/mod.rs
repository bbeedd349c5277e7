//! Database migrations - embedded SQL files
//!
//! Migrations are compiled into the binary at build time using include_str!.
//! Each migration is a tuple of (name, sql_content).
//! Migrations are sorted by name and applied in order.

/// All migrations, embedded at compile time.
/// Format: (filename, sql_content)
///
/// When adding a migration, create NNN_description.sql and list it here in order.
pub const MIGRATIONS: &[(&str, &str)] = &[
    ("000_migrations.sql", include_str!("000_migrations.sql")),
    ("001_initial_schema.sql", include_str!("001_initial_schema.sql")),
    ("002_ingestion_jobs.sql", include_str!("002_ingestion_jobs.sql")),
    ("003_notification_outbox.sql", include_str!("003_notification_outbox.sql")),
    ("004_sync_job_row_errors.sql", include_str!("004_sync_job_row_errors.sql")),
];
