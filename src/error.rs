use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("cannot create cycle {requested} for patient {patient_id}: cycle {missing} does not exist")]
    SequenceGap {
        patient_id: Uuid,
        requested: i32,
        missing: i32,
    },

    #[error("invalid cycle number: {0}")]
    InvalidCycle(i32),

    #[error("eGFR is required for classification")]
    MissingEgfr,

    #[error("invalid {field} value: {value}")]
    InvalidLabValue { field: &'static str, value: f64 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt stored value: {0}")]
    Corrupt(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Storage-side failures a caller may retry. The engine itself never does.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
