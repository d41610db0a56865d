use thiserror::Error;

/// Failures raised by the persistence layer.
#[derive(Debug, Error)]
pub enum DataError {
    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A requested column migration is not on the additive whitelist.
    /// Fatal at startup: the whitelist is the injection guard.
    #[error("column migration {table}.{column} is not whitelisted")]
    MigrationNotWhitelisted {
        /// Table the migration targeted.
        table: String,
        /// Column the migration targeted.
        column: String,
    },
    /// A persisted blob could not be decoded.
    #[error("corrupt persisted value for {context}: {reason}")]
    Corrupt {
        /// What was being decoded.
        context: &'static str,
        /// Decoder failure detail.
        reason: String,
    },
}
