//! Statement lifecycle: execute, fetch and close on one cursor.

use crate::codec::bind::{bind_parameters, check_parameter_count, Parameter};
use crate::codec::decode::decode_column;
use crate::codec::Value;
use crate::config::{validate_timeout, Settings};
use crate::driver::{
    driver_error, to_wide, ColumnDescription, NativeHandle, SharedDriver, SqlReturn, StmtHandle,
};
use crate::engine::operation::{AsyncOp, OpPoll};
use crate::engine::session::{lock_core, SessionCore};
use crate::engine::PollState;
use crate::error::{AodbcError, Result};
use crate::signal::{CompletionSignal, WorkerSignal};
use log::{debug, warn};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

/// Cursor lifecycle. `Opened` and `Executed` alternate across the life of
/// the statement; the other states are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatementState {
    Closed,
    ToOpen,
    Opened,
    ToExecute,
    Executed,
}

/// One fetched row: column values in result-set order, keyed by name.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    entries: Vec<(String, Value)>,
}

impl Row {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries
            .iter()
            .map(|(column, value)| (column.as_str(), value))
    }
}

/// A cursor under a session. The session must outlive the statement's use;
/// operations on a statement whose session is gone fail with an invalid
/// state error.
pub struct Statement {
    session: Weak<Mutex<SessionCore>>,
    driver: SharedDriver,
    settings: Settings,
    stmt: StmtHandle,
    state: StatementState,
    op: Option<AsyncOp>,
    /// Parameter buffers pinned for the duration of an execute.
    bound: Vec<Parameter>,
}

impl Statement {
    pub(crate) fn new(
        session: Weak<Mutex<SessionCore>>,
        driver: SharedDriver,
        settings: Settings,
        stmt: StmtHandle,
    ) -> Self {
        let mut statement = Self {
            session,
            driver,
            settings,
            stmt,
            state: StatementState::ToOpen,
            op: None,
            bound: Vec::new(),
        };
        // The session allocated the native handle before construction, so
        // the open transition completes immediately.
        statement.state = StatementState::Opened;
        statement
    }

    /// Launch an execute. Checks run in order: the statement must be
    /// `Opened`, the placeholder count must match, and the session must be
    /// connected with a free statement slot, all before anything touches
    /// the driver. A timeout of zero waits indefinitely.
    pub fn execute<'a>(
        &'a mut self,
        query: &str,
        params: &[Value],
        timeout_secs: i64,
    ) -> Result<ExecuteFuture<'a>> {
        validate_timeout(timeout_secs)?;
        match self.state {
            StatementState::Opened => {}
            StatementState::ToExecute => {
                return Err(AodbcError::InvalidState(
                    "an execute is already in flight".to_string(),
                ))
            }
            StatementState::Executed => {
                return Err(AodbcError::InvalidState(
                    "the previous result set hasn't been fetched".to_string(),
                ))
            }
            StatementState::Closed | StatementState::ToOpen => {
                return Err(AodbcError::InvalidState(
                    "the statement isn't opened".to_string(),
                ))
            }
        }
        check_parameter_count(query, params.len())?;
        self.with_session(|core| core.acquire_execute_slot())?;

        // From here on, a failure hands the slot back.
        let bound = match bind_parameters(self.driver.as_ref(), self.stmt, params) {
            Ok(bound) => bound,
            Err(err) => {
                self.driver.reset_parameters(self.stmt);
                self.release_slot();
                return Err(err);
            }
        };
        if !self
            .driver
            .set_query_timeout(self.stmt, timeout_secs)
            .succeeded()
        {
            self.driver.reset_parameters(self.stmt);
            self.release_slot();
            return Err(AodbcError::Configuration(
                "setting the query timeout failed",
            ));
        }

        let query_wide = to_wide(query);
        let signal = match self.launch_execute(query_wide) {
            Ok(signal) => signal,
            Err(err) => {
                self.driver.reset_parameters(self.stmt);
                self.release_slot();
                return Err(err);
            }
        };
        debug!(
            "statement {} execute launched, {} parameters, timeout {timeout_secs}s",
            self.stmt.0,
            params.len()
        );
        self.bound = bound;
        self.state = StatementState::ToExecute;
        self.op = Some(AsyncOp::new(signal, self.settings, timeout_secs, "execute"));
        Ok(ExecuteFuture { statement: self })
    }

    fn launch_execute(&self, query: Vec<u16>) -> Result<CompletionSignal> {
        if let Some(event) = self.driver.statement_event(self.stmt)? {
            let rc = self.driver.execute(self.stmt, &query);
            if !rc.accepted() {
                return Err(driver_error(
                    self.driver.as_ref(),
                    NativeHandle::Stmt(self.stmt),
                    "execute::SQLExecDirectW",
                ));
            }
            Ok(CompletionSignal::Native {
                event,
                handle: NativeHandle::Stmt(self.stmt),
            })
        } else {
            let driver = Arc::clone(&self.driver);
            let stmt = self.stmt;
            Ok(CompletionSignal::Worker(WorkerSignal::spawn(move || {
                driver.execute(stmt, &query)
            })))
        }
    }

    /// Drive a launched execute one step.
    pub fn poll_execution(&mut self) -> Result<PollState<()>> {
        match self.state {
            StatementState::Executed => return Err(AodbcError::AlreadyCompleted("execute")),
            StatementState::Opened => {
                return Err(AodbcError::InvalidState(
                    "no execute is in flight".to_string(),
                ))
            }
            StatementState::Closed | StatementState::ToOpen => {
                return Err(AodbcError::InvalidState(
                    "the statement isn't opened".to_string(),
                ))
            }
            StatementState::ToExecute => {}
        }
        let outcome = match self.op.as_mut() {
            Some(op) => op.poll(self.driver.as_ref())?,
            None => {
                return Err(AodbcError::InvalidState(
                    "no execute is in flight".to_string(),
                ))
            }
        };
        match outcome {
            OpPoll::Pending => Ok(PollState::Pending),
            OpPoll::Complete(rc) => {
                self.op = None;
                self.bound.clear();
                if !self.driver.reset_parameters(self.stmt).succeeded() {
                    warn!("resetting statement {} parameters failed", self.stmt.0);
                }
                if rc.succeeded() {
                    self.state = StatementState::Executed;
                    debug!("statement {} executed", self.stmt.0);
                    Ok(PollState::Ready(()))
                } else {
                    let err = driver_error(
                        self.driver.as_ref(),
                        NativeHandle::Stmt(self.stmt),
                        "execute::SQLExecDirectW",
                    );
                    self.state = StatementState::Opened;
                    self.release_slot();
                    Err(err)
                }
            }
        }
    }

    /// Fetch and decode every row of the current result set. The statement
    /// returns to `Opened` and its execute slot is handed back whether the
    /// fetch succeeds or fails.
    pub fn fetch_all(&mut self) -> Result<Vec<Row>> {
        if self.state != StatementState::Executed {
            return Err(AodbcError::InvalidState(
                "the statement hasn't been executed".to_string(),
            ));
        }
        let result = self.collect_rows();
        self.state = StatementState::Opened;
        self.release_slot();
        result
    }

    fn collect_rows(&self) -> Result<Vec<Row>> {
        let driver = self.driver.as_ref();
        let cols = driver.num_result_cols(self.stmt);
        if !cols.rc.succeeded() {
            return Err(driver_error(
                driver,
                NativeHandle::Stmt(self.stmt),
                "fetch_all::SQLNumResultCols",
            ));
        }
        if cols.value <= 0 {
            // No result set, e.g. a data-modification statement.
            return Ok(Vec::new());
        }
        let count = cols.value as u16;
        // Describe each column once; the descriptions hold for every row.
        let mut descriptions: Vec<ColumnDescription> = Vec::with_capacity(count as usize);
        for column_number in 1..=count {
            descriptions.push(driver.describe_col(self.stmt, column_number)?);
        }

        let mut rows = Vec::new();
        loop {
            let rc = driver.fetch(self.stmt);
            if rc == SqlReturn::NoData {
                break;
            }
            if !rc.succeeded() {
                return Err(driver_error(
                    driver,
                    NativeHandle::Stmt(self.stmt),
                    "fetch_all::SQLFetch",
                ));
            }
            let mut entries = Vec::with_capacity(count as usize);
            for (index, description) in descriptions.iter().enumerate() {
                let column_number = (index + 1) as u16;
                let value = decode_column(driver, self.stmt, column_number, description)?;
                entries.push((description.name.clone(), value));
            }
            rows.push(Row { entries });
        }
        debug!("statement {} fetched {} rows", self.stmt.0, rows.len());
        Ok(rows)
    }

    /// Release the native statement handle.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            StatementState::Opened | StatementState::Executed => {
                if self.state == StatementState::Executed {
                    self.release_slot();
                }
                self.bound.clear();
                let rc = self.driver.free_stmt(self.stmt);
                self.state = StatementState::Closed;
                if !rc.succeeded() {
                    return Err(driver_error(
                        self.driver.as_ref(),
                        NativeHandle::Stmt(self.stmt),
                        "close::SQLFreeHandle",
                    ));
                }
                debug!("statement {} closed", self.stmt.0);
                Ok(())
            }
            StatementState::ToExecute => Err(AodbcError::InvalidState(
                "cancel of an in-flight execute is not implemented".to_string(),
            )),
            StatementState::Closed | StatementState::ToOpen => Err(AodbcError::InvalidState(
                "the statement isn't opened".to_string(),
            )),
        }
    }

    fn with_session<T>(&self, f: impl FnOnce(&mut SessionCore) -> Result<T>) -> Result<T> {
        let core = self.session.upgrade().ok_or_else(|| {
            AodbcError::InvalidState("the session is gone".to_string())
        })?;
        let mut guard = lock_core(&core)?;
        f(&mut guard)
    }

    fn release_slot(&self) {
        if let Some(core) = self.session.upgrade() {
            if let Ok(mut guard) = lock_core(&core) {
                guard.release_execute_slot();
            }
        }
    }
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement")
            .field("stmt", &self.stmt)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        match self.state {
            StatementState::Opened | StatementState::Executed => {
                if self.state == StatementState::Executed {
                    self.release_slot();
                }
                if !self.driver.free_stmt(self.stmt).succeeded() {
                    warn!("freeing statement {} on drop failed", self.stmt.0);
                }
            }
            // A worker may still write through the handle; leaking it is
            // safer than freeing under it.
            StatementState::ToExecute => {
                warn!("statement {} dropped with an execute in flight", self.stmt.0);
            }
            StatementState::Closed | StatementState::ToOpen => {}
        }
    }
}

/// Pending execute on a borrowed statement.
pub struct ExecuteFuture<'a> {
    statement: &'a mut Statement,
}

impl ExecuteFuture<'_> {
    pub fn poll(&mut self) -> Result<PollState<()>> {
        self.statement.poll_execution()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::{ScriptedCell, ScriptedColumn, ScriptedDriver};
    use crate::engine::session::connect;
    use crate::engine::{drive, Session};

    fn connected(raw: Arc<ScriptedDriver>) -> Session {
        let driver: SharedDriver = raw;
        let mut fut = connect(driver, "DSN=test", 0).expect("launch failed");
        drive(|| fut.poll()).expect("connect failed")
    }

    fn run_execute(statement: &mut Statement, query: &str, params: &[Value]) -> Result<()> {
        let mut fut = statement.execute(query, params, 0)?;
        drive(|| fut.poll())
    }

    #[test]
    fn test_execute_and_fetch_all() {
        let raw = Arc::new(ScriptedDriver::new());
        raw.set_result(
            vec![ScriptedColumn::integer("n"), ScriptedColumn::wide_text("s")],
            vec![
                vec![ScriptedCell::Int(1), ScriptedCell::Text("one".into())],
                vec![ScriptedCell::Int(2), ScriptedCell::Text("two".into())],
            ],
        );
        let session = connected(Arc::clone(&raw));
        let mut statement = session.cursor().unwrap();
        run_execute(&mut statement, "SELECT n, s FROM t", &[]).unwrap();
        let rows = statement.fetch_all().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("n"), Some(&Value::Int(1)));
        assert_eq!(rows[0].get("s"), Some(&Value::Text("one".into())));
        assert_eq!(rows[1].get("n"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_parameter_count_mismatch_reaches_no_native_call() {
        let raw = Arc::new(ScriptedDriver::new());
        let session = connected(Arc::clone(&raw));
        let mut statement = session.cursor().unwrap();
        let err = statement
            .execute("SELECT ?, ?", &[Value::Int(1)], 0)
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(
            err,
            AodbcError::ParameterCountMismatch {
                expected: 2,
                given: 1
            }
        ));
        assert_eq!(raw.calls_named("bind_parameter"), 0);
        assert_eq!(raw.calls_named("execute"), 0);
    }

    #[test]
    fn test_fetch_before_execute_is_invalid() {
        let raw = Arc::new(ScriptedDriver::new());
        let session = connected(raw);
        let mut statement = session.cursor().unwrap();
        assert!(matches!(
            statement.fetch_all().unwrap_err(),
            AodbcError::InvalidState(_)
        ));
    }

    #[test]
    fn test_poll_without_execute_is_invalid() {
        let raw = Arc::new(ScriptedDriver::new());
        let session = connected(raw);
        let mut statement = session.cursor().unwrap();
        assert!(matches!(
            statement.poll_execution().unwrap_err(),
            AodbcError::InvalidState(_)
        ));
    }

    #[test]
    fn test_poll_after_execute_completion_is_already_completed() {
        let raw = Arc::new(ScriptedDriver::new());
        let session = connected(raw);
        let mut statement = session.cursor().unwrap();
        run_execute(&mut statement, "SELECT 1", &[]).unwrap();
        assert!(matches!(
            statement.poll_execution().unwrap_err(),
            AodbcError::AlreadyCompleted("execute")
        ));
    }

    #[test]
    fn test_statement_cycles_between_opened_and_executed() {
        let raw = Arc::new(ScriptedDriver::new());
        raw.set_result(
            vec![ScriptedColumn::narrow_text("s")],
            vec![vec![ScriptedCell::Text("x".repeat(5000))]],
        );
        let session = connected(Arc::clone(&raw));
        let mut statement = session.cursor().unwrap();
        // Two full cycles decode identically, long text included.
        for _ in 0..2 {
            run_execute(&mut statement, "SELECT s FROM t", &[]).unwrap();
            let rows = statement.fetch_all().unwrap();
            assert_eq!(rows[0].get("s"), Some(&Value::Text("x".repeat(5000))));
        }
    }

    #[test]
    fn test_concurrency_limit_bounds_executes() {
        let raw = Arc::new(ScriptedDriver::new());
        raw.set_max_concurrent(Some(1));
        raw.hang_execute();
        let session = connected(Arc::clone(&raw));
        let mut first = session.cursor().unwrap();
        let mut second = session.cursor().unwrap();
        // First execute occupies the only slot.
        let _pending = first.execute("SELECT 1", &[], 0).unwrap();
        let err = second.execute("SELECT 1", &[], 0).map(|_| ()).unwrap_err();
        assert!(matches!(err, AodbcError::ConcurrencyLimit { limit: 1 }));
    }

    #[test]
    fn test_slot_returns_after_fetch() {
        let raw = Arc::new(ScriptedDriver::new());
        raw.set_max_concurrent(Some(1));
        let session = connected(Arc::clone(&raw));
        let mut first = session.cursor().unwrap();
        run_execute(&mut first, "SELECT 1", &[]).unwrap();
        first.fetch_all().unwrap();
        // The slot freed by the fetch admits the next execute.
        let mut second = session.cursor().unwrap();
        run_execute(&mut second, "SELECT 1", &[]).unwrap();
    }

    #[test]
    fn test_execute_failure_returns_statement_to_opened() {
        let raw = Arc::new(ScriptedDriver::new());
        raw.fail_execute();
        let session = connected(Arc::clone(&raw));
        let mut statement = session.cursor().unwrap();
        let err = run_execute(&mut statement, "SELECT 1", &[]).unwrap_err();
        assert!(matches!(err, AodbcError::Driver { .. }));
        // The statement is reusable after the failure.
        raw.clear_failures();
        run_execute(&mut statement, "SELECT 1", &[]).unwrap();
    }

    #[test]
    fn test_bind_failure_releases_slot_and_resets() {
        let raw = Arc::new(ScriptedDriver::new());
        raw.set_max_concurrent(Some(1));
        raw.fail_bind_at(1);
        let session = connected(Arc::clone(&raw));
        let mut statement = session.cursor().unwrap();
        let err = statement
            .execute("SELECT ?", &[Value::Int(1)], 0)
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, AodbcError::Driver { .. }));
        assert_eq!(raw.calls_named("execute"), 0);
        assert!(raw.calls_named("reset_parameters") >= 1);
        // The refused execute did not keep the slot.
        raw.clear_failures();
        run_execute(&mut statement, "SELECT ?", &[Value::Int(1)]).unwrap();
    }

    #[test]
    fn test_close_during_execute_is_refused() {
        let raw = Arc::new(ScriptedDriver::new());
        raw.hang_execute();
        let session = connected(Arc::clone(&raw));
        let mut statement = session.cursor().unwrap();
        let pending = statement.execute("SELECT 1", &[], 0).unwrap();
        // Dropping the future abandons the poll, not the in-flight call.
        drop(pending);
        let err = statement.close().unwrap_err();
        match err {
            AodbcError::InvalidState(msg) => assert!(msg.contains("in-flight")),
            other => panic!("expected InvalidState, got {other:?}"),
        }
    }

    #[test]
    fn test_close_frees_the_statement_handle() {
        let raw = Arc::new(ScriptedDriver::new());
        let session = connected(Arc::clone(&raw));
        let before = raw.live_handles();
        let mut statement = session.cursor().unwrap();
        assert_eq!(raw.live_handles(), before + 1);
        statement.close().unwrap();
        assert_eq!(raw.live_handles(), before);
        // A second close is an error, not a double free.
        assert!(statement.close().is_err());
    }

    #[test]
    fn test_drop_closes_an_open_statement() {
        let raw = Arc::new(ScriptedDriver::new());
        let session = connected(Arc::clone(&raw));
        let before = raw.live_handles();
        {
            let _statement = session.cursor().unwrap();
            assert_eq!(raw.live_handles(), before + 1);
        }
        assert_eq!(raw.live_handles(), before);
    }

    #[test]
    fn test_statement_debug_shows_state() {
        let raw = Arc::new(ScriptedDriver::new());
        let session = connected(raw);
        let statement = session.cursor().unwrap();
        assert!(format!("{statement:?}").contains("Opened"));
    }

    #[test]
    fn test_row_lookup() {
        let row = Row {
            entries: vec![
                ("a".to_string(), Value::Int(1)),
                ("b".to_string(), Value::Null),
            ],
        };
        assert_eq!(row.get("a"), Some(&Value::Int(1)));
        assert_eq!(row.get("b"), Some(&Value::Null));
        assert_eq!(row.get("c"), None);
        assert_eq!(row.len(), 2);
        let names: Vec<&str> = row.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
