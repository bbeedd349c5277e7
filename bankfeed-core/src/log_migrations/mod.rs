//! Embedded migrations for logs.duckdb
//!
//! Kept apart from the main schema so the event log can be cleared or
//! deleted without touching transaction data.

/// Log migrations in apply order: (filename, sql_content)
pub const LOG_MIGRATIONS: &[(&str, &str)] = &[
    ("000_migrations.sql", include_str!("000_migrations.sql")),
    ("001_initial_schema.sql", include_str!("001_initial_schema.sql")),
];
