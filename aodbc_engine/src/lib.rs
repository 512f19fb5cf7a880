pub mod codec;
pub mod config;
pub mod driver;
pub mod engine;
mod error;
pub mod signal;

pub use codec::{Date, Time, Timestamp, Value};
pub use config::Settings;
pub use engine::{
    connect, connect_with_settings, drive, CloseFuture, ConnectFuture, ExecuteFuture, PollState,
    Row, Session, Statement,
};
pub use error::{AodbcError, Result};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::{ScriptedCell, ScriptedColumn, ScriptedDriver};
    use crate::driver::SharedDriver;
    use std::sync::Arc;

    #[test]
    fn test_connect_query_disconnect() {
        let raw = Arc::new(ScriptedDriver::new());
        raw.set_result(
            vec![ScriptedColumn::integer("a")],
            vec![vec![ScriptedCell::Int(42)]],
        );
        let driver: SharedDriver = raw.clone();

        let mut pending = connect(driver, "DSN=test", 5).unwrap();
        let session = drive(|| pending.poll()).unwrap();

        let mut statement = session.cursor().unwrap();
        {
            let mut executing = statement.execute("SELECT a FROM t", &[], 5).unwrap();
            drive(|| executing.poll()).unwrap();
        }
        let rows = statement.fetch_all().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("a"), Some(&Value::Int(42)));

        statement.close().unwrap();
        let mut closing = session.close().unwrap();
        drive(|| closing.poll()).unwrap();
        assert_eq!(raw.live_handles(), 0);
    }

    #[test]
    fn test_error_values_are_displayable() {
        let err = AodbcError::ParameterCountMismatch {
            expected: 2,
            given: 1,
        };
        assert!(!err.to_string().is_empty());
    }
}
