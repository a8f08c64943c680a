//! Connection plumbing shared by the ledger and the cache.
//!
//! Both stores live in the same SQLite file. Startup runs the embedded
//! migrations and then checks that every column the stores read is present;
//! a mismatch is a fatal [`VesperError::Schema`].

use std::path::Path;

use diesel::prelude::*;
use diesel::sql_types::Text;
use diesel::sqlite::SqliteConnection;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use crate::error::{Result, VesperError};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

pub(crate) type SqliteAsyncConn = SyncConnectionWrapper<SqliteConnection>;
pub(crate) type SqlitePool = Pool<SqliteAsyncConn>;
pub(crate) type SqlitePooledConn<'a> = PooledConnection<'a, SqliteAsyncConn>;

const REQUIRED_COLUMNS: &[(&str, &[&str])] = &[
    (
        "conversations",
        &["id", "title", "status", "created_at", "updated_at"],
    ),
    (
        "messages",
        &[
            "id",
            "conversation_id",
            "role",
            "content",
            "created_at",
            "processed",
            "is_error",
            "parent_message_id",
            "content_fingerprint",
        ],
    ),
    (
        "search_cache",
        &[
            "key",
            "raw_query",
            "payload",
            "source",
            "written_at",
            "ttl_minutes",
        ],
    ),
];

#[derive(QueryableByName)]
struct ColumnName {
    #[diesel(sql_type = Text)]
    name: String,
}

/// Creates the parent directory, applies pending migrations and verifies the
/// resulting schema.
pub async fn prepare_database(sqlite_path: &str) -> Result<()> {
    ensure_parent_dir(sqlite_path)?;
    let database_url = sqlite_path.to_string();
    tokio::task::spawn_blocking(move || {
        let mut conn = open_connection_sync(&database_url)?;
        diesel::connection::SimpleConnection::batch_execute(
            &mut conn,
            "PRAGMA journal_mode = WAL;",
        )
        .map_err(|e| VesperError::Schema(e.to_string()))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| VesperError::Schema(e.to_string()))?;
        verify_schema_sync(&mut conn)
    })
    .await
    .map_err(|e| VesperError::Runtime(e.to_string()))??;
    Ok(())
}

pub fn open_connection_sync(database_url: &str) -> Result<SqliteConnection> {
    let mut conn = SqliteConnection::establish(database_url)
        .map_err(|e| VesperError::Storage(e.to_string()))?;
    diesel::connection::SimpleConnection::batch_execute(&mut conn, "PRAGMA busy_timeout = 5000;")
        .map_err(|e| VesperError::Storage(e.to_string()))?;
    Ok(conn)
}

fn verify_schema_sync(conn: &mut SqliteConnection) -> Result<()> {
    for (table, required) in REQUIRED_COLUMNS {
        let query = format!("SELECT name FROM pragma_table_info('{table}')");
        let columns: Vec<ColumnName> = diesel::RunQueryDsl::load(diesel::sql_query(query), conn)
            .map_err(|e| VesperError::Schema(e.to_string()))?;
        if columns.is_empty() {
            return Err(VesperError::Schema(format!("missing table `{table}`")));
        }
        for column in *required {
            if !columns.iter().any(|found| found.name == *column) {
                return Err(VesperError::Schema(format!(
                    "table `{table}` is missing required column `{column}`"
                )));
            }
        }
    }
    Ok(())
}

pub(crate) async fn build_pool(sqlite_path: &str, max_size: u32) -> Result<SqlitePool> {
    let manager = AsyncDieselConnectionManager::<SqliteAsyncConn>::new(sqlite_path);
    Pool::builder()
        .max_size(max_size.max(1))
        .build(manager)
        .await
        .map_err(|e| VesperError::Storage(e.to_string()))
}

/// Checks a connection out of the pool for the duration of one operation.
pub(crate) async fn checkout(pool: &SqlitePool) -> Result<SqlitePooledConn<'_>> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| VesperError::Storage(e.to_string()))?;
    diesel_async::RunQueryDsl::execute(diesel::sql_query("PRAGMA busy_timeout = 5000"), &mut conn)
        .await
        .map_err(|e| VesperError::Storage(e.to_string()))?;
    Ok(conn)
}

#[derive(QueryableByName)]
struct RowId {
    #[diesel(sql_type = diesel::sql_types::Integer)]
    id: i32,
}

/// Row id of the last insert made on this connection.
pub(crate) async fn last_insert_id(conn: &mut SqlitePooledConn<'_>) -> Result<i32> {
    let row: RowId = diesel_async::RunQueryDsl::get_result(
        diesel::sql_query("SELECT last_insert_rowid() AS id"),
        conn,
    )
    .await
    .map_err(|e| VesperError::Storage(e.to_string()))?;
    Ok(row.id)
}

fn ensure_parent_dir(path: &str) -> Result<()> {
    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| VesperError::Storage(e.to_string()))?;
        }
    }
    Ok(())
}
