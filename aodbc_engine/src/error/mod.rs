use thiserror::Error;

/// Error taxonomy of the driver core. Native diagnostic records are
/// surfaced verbatim through [`AodbcError::Driver`], labeled with the
/// calling context that detected them.
#[derive(Error, Debug, Clone)]
pub enum AodbcError {
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Operation already completed: {0}")]
    AlreadyCompleted(&'static str),

    #[error("Allocation failed: {0}")]
    Allocation(&'static str),

    #[error("Configuration failed: {0}")]
    Configuration(&'static str),

    #[error("Timeout after {elapsed_secs:.1}s while polling {operation}")]
    Timeout {
        operation: &'static str,
        elapsed_secs: f64,
    },

    #[error("Driver error ({context}) {}: {native_code}: {message}", sqlstate_str(.sqlstate))]
    Driver {
        context: String,
        sqlstate: [u8; 5],
        native_code: i32,
        message: String,
    },

    #[error("The query takes {expected} parameters, but {given} were given")]
    ParameterCountMismatch { expected: usize, given: usize },

    #[error("The type of parameter {position} is not supported for passing to SQL")]
    UnsupportedParameterType { position: usize },

    #[error("The number of executing statements on one connection can't exceed max concurrent activities ({limit})")]
    ConcurrencyLimit { limit: u16 },

    #[error("Memory error: {0}")]
    Memory(&'static str),
}

fn sqlstate_str(sqlstate: &[u8; 5]) -> String {
    String::from_utf8_lossy(sqlstate).into_owned()
}

impl AodbcError {
    pub fn sqlstate(&self) -> [u8; 5] {
        match self {
            AodbcError::Driver { sqlstate, .. } => *sqlstate,
            _ => [0u8; 5],
        }
    }

    pub fn native_code(&self) -> i32 {
        match self {
            AodbcError::Driver { native_code, .. } => *native_code,
            _ => 0,
        }
    }

    /// True for errors that end the in-flight operation but leave the
    /// owning session or statement usable.
    pub fn is_operation_local(&self) -> bool {
        matches!(
            self,
            AodbcError::Timeout { .. }
                | AodbcError::Driver { .. }
                | AodbcError::ParameterCountMismatch { .. }
                | AodbcError::UnsupportedParameterType { .. }
                | AodbcError::ConcurrencyLimit { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, AodbcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_message() {
        let err = AodbcError::InvalidState("the connection isn't established".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid state: the connection isn't established"
        );
    }

    #[test]
    fn test_driver_error_carries_diagnostic_fields() {
        let err = AodbcError::Driver {
            context: "connect::SQLDriverConnectW".to_string(),
            sqlstate: *b"08001",
            native_code: 17,
            message: "Login failed".to_string(),
        };
        assert_eq!(err.sqlstate(), *b"08001");
        assert_eq!(err.native_code(), 17);
        let text = err.to_string();
        assert!(text.contains("connect::SQLDriverConnectW"));
        assert!(text.contains("08001"));
        assert!(text.contains("17"));
        assert!(text.contains("Login failed"));
    }

    #[test]
    fn test_non_driver_error_defaults() {
        let err = AodbcError::Memory("parameter buffer");
        assert_eq!(err.sqlstate(), [0u8; 5]);
        assert_eq!(err.native_code(), 0);
    }

    #[test]
    fn test_parameter_count_mismatch_reports_both_counts() {
        let err = AodbcError::ParameterCountMismatch {
            expected: 3,
            given: 1,
        };
        let text = err.to_string();
        assert!(text.contains('3'));
        assert!(text.contains('1'));
    }

    #[test]
    fn test_concurrency_limit_names_limit() {
        let err = AodbcError::ConcurrencyLimit { limit: 4 };
        assert!(err.to_string().contains("(4)"));
    }

    #[test]
    fn test_unsupported_parameter_type_is_one_based() {
        let err = AodbcError::UnsupportedParameterType { position: 2 };
        assert!(err.to_string().contains("parameter 2"));
    }

    #[test]
    fn test_operation_local_classification() {
        assert!(AodbcError::Timeout {
            operation: "execute",
            elapsed_secs: 6.0
        }
        .is_operation_local());
        assert!(!AodbcError::Allocation("SQL_HANDLE_ENV").is_operation_local());
        assert!(!AodbcError::AlreadyCompleted("connect").is_operation_local());
    }
}
