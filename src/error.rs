use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueryError>;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Declaration error: {0}")]
    Declaration(String),

    #[error("Filter error: {0}")]
    Filter(String),

    #[error("Merge error: Given {0} option is invalid!")]
    Merge(String),

    #[error("View error: {0}")]
    View(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Model not registered: {0}")]
    ModelNotRegistered(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_error_names_option() {
        let err = QueryError::Merge("order".to_string());
        assert_eq!(err.to_string(), "Merge error: Given order option is invalid!");
    }

    #[test]
    fn test_json_error_conversion() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: QueryError = parse.unwrap_err().into();
        assert!(matches!(err, QueryError::Json(_)));
    }
}
