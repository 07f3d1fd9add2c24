//! Database error types.

use thiserror::Error;

const FOREIGN_KEY_VIOLATION: &str = "23503";
const UNIQUE_VIOLATION: &str = "23505";

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}. Last error: {last_error}")]
    MigrationDirNotFound { tried: String, last_error: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// The (server, port, protocol) triple is already allocated.
    #[error("port {port}/{protocol} on server {server_id} is already allocated")]
    PortConflict {
        server_id: i64,
        port: u16,
        protocol: String,
    },

    /// The row is referenced, or violates a uniqueness constraint.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A stored value could not be decoded.
    #[error("invalid stored value: {0}")]
    Decode(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    /// Maps a query error, turning constraint violations into [`DbError::Conflict`].
    pub fn from_query(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if matches!(
                db.code().as_deref(),
                Some(FOREIGN_KEY_VIOLATION) | Some(UNIQUE_VIOLATION)
            ) {
                return DbError::Conflict(db.message().to_string());
            }
        }
        DbError::Query(err)
    }

    pub fn not_found(entity: &'static str, id: impl Into<i64>) -> Self {
        DbError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Returns true when retrying the operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::Connect(_) => true,
            DbError::Query(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Tls(_)
            ),
            _ => false,
        }
    }
}
