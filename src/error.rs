use thiserror::Error;

/// Errors raised by the evaluation core (stores, rubric, scenario resolution)
#[derive(Error, Debug)]
pub enum EvalError {
    /// SQLite operation failed
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// JSON column could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error while preparing a store location
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store handle cannot be used (poisoned lock)
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A criterion name that is not part of the rubric
    #[error("Unknown rubric criterion: {0}")]
    UnknownCriterion(String),

    /// Rubric weights or criteria are inconsistent
    #[error("Invalid rubric: {0}")]
    InvalidRubric(String),

    /// Scenario definition is missing a required field
    #[error("Invalid scenario: {0}")]
    InvalidScenario(String),

    /// A stored row holds a value we cannot interpret
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),
}

pub type Result<T> = std::result::Result<T, EvalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EvalError::UnknownCriterion("tone".to_string());
        assert_eq!(err.to_string(), "Unknown rubric criterion: tone");
    }

    #[test]
    fn test_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: EvalError = json_err.into();
        assert!(matches!(err, EvalError::Serialization(_)));
    }
}
